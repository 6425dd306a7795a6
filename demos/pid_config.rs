// PID config: write PID gains to every configured motor
//
// Usage: cargo run --example pid_config -- --mode vfoc --kp 220 --ki 100 --kd 270 --kv 320
//
// Gains are written as two frames per motor (kp/ki, then kd/kv).

use clap::Parser;
use danibot_zenoh_runtime::config::Config;
use danibot_zenoh_runtime::motor::{
    LinkSession, PidGains, PidMode, Protocol, SerialConnector, MotorError,
};

#[derive(Parser, Debug)]
#[command(about = "Write PID gains to the DaniBot motors")]
struct Args {
    /// JSON config file listing the motor groups
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Serial port, overrides the config file
    #[arg(short, long)]
    port: Option<String>,

    #[arg(long, value_enum)]
    protocol: Option<Protocol>,

    /// Only these motor addresses (default: every configured motor)
    #[arg(long, value_delimiter = ',')]
    ids: Vec<u16>,

    /// Loop to tune: vfoc or close
    #[arg(long, default_value = "vfoc")]
    mode: PidMode,

    #[arg(long, default_value_t = 220)]
    kp: u16,
    #[arg(long, default_value_t = 100)]
    ki: u16,
    #[arg(long, default_value_t = 270)]
    kd: u16,
    #[arg(long, default_value_t = 320)]
    kv: u16,
}

fn describe(ack: Option<bool>) -> &'static str {
    match ack {
        Some(true) => "✓ ok",
        Some(false) => "✗ rejected",
        None => "? no reply",
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::with_default_groups(),
    };
    if let Some(port) = &args.port {
        config.transport.port = port.clone();
    }
    if let Some(protocol) = args.protocol {
        config.transport.protocol = protocol;
    }
    config.validate()?;

    let ids: Vec<u16> = if args.ids.is_empty() {
        config
            .groups
            .iter()
            .flat_map(|g| g.addresses.iter().copied())
            .collect()
    } else {
        args.ids.clone()
    };
    let gains = PidGains {
        kp: args.kp,
        ki: args.ki,
        kd: args.kd,
        kv: args.kv,
    };

    println!(
        "Writing {:?} gains {:?} to motors {:?} on {}",
        args.mode, gains, ids, config.transport.port
    );

    let connector = SerialConnector::new(&config.transport.port, config.transport.baud_rate);
    let mut link = LinkSession::new(
        config.transport.protocol,
        Box::new(connector),
        config.link_timing(),
    );
    link.open()?;

    let mut failures = 0;
    for &id in &ids {
        match link.set_pid_gains(id, args.mode, gains) {
            Ok([kp_ki, kd_kv]) => {
                println!(
                    "  Motor {}: kp/ki {}, kd/kv {}",
                    id,
                    describe(kp_ki),
                    describe(kd_kv)
                );
                if kp_ki == Some(false) || kd_kv == Some(false) {
                    failures += 1;
                }
            }
            Err(e @ MotorError::InvalidArgument(_)) => {
                println!("  Motor {}: {}", id, e);
                failures += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if failures > 0 {
        println!("{} motor(s) did not accept the gains", failures);
    } else {
        println!("Done");
    }
    Ok(())
}
