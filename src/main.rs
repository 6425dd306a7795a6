use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use danibot_zenoh_runtime::config::{Config, ConfigError};
use danibot_zenoh_runtime::motor::Protocol;

#[derive(Parser, Debug)]
#[command(name = "danibot-runtime", about = "Motor control runtime for the DaniBot base")]
struct Args {
    /// JSON config file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port of the motor adapter
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Wire protocol spoken on the port
    #[arg(long, value_enum)]
    protocol: Option<Protocol>,
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::with_default_groups(),
    };
    if let Some(port) = &args.port {
        config.transport.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.transport.baud_rate = baud;
    }
    if let Some(protocol) = args.protocol {
        config.transport.protocol = protocol;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=debug for frame-level logs)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = danibot_zenoh_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
