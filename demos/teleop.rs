// Keyboard teleop: W/S forward, A/D turn, E enable toggle, 1/2/3 speed, Space stop, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use danibot_zenoh_runtime::config::TOPIC_CMD_DRIVE;
use danibot_zenoh_runtime::messages::{DriveCommand, EnableRequest};
use danibot_zenoh_runtime::motor::SpeedMode;
use std::time::{Duration, Instant};
use tracing::info;

const STICK: f32 = 0.6; // stick deflection per key press
const INPUT_TIMEOUT_MS: u64 = 100; // Reset stick after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_DRIVE).await?;

    info!("Controls: W/S=forward, A/D=turn, E=enable toggle, 1/2/3=slow/normal/fast, Space=disable, Q=quit");
    info!("Motors start disabled; press E to enable");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut cmd = DriveCommand::stop();
    let mut last_movement_input = Instant::now();

    loop {
        // Button presses go out once, on the next sample only
        let mut enable = None;

        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('w') if pressed => {
                        cmd.forward = STICK;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        cmd.forward = -STICK;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        cmd.turn = -1.0;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        cmd.turn = 1.0;
                        last_movement_input = Instant::now();
                    }

                    // Enable/disable
                    KeyCode::Char('e') if kind == KeyEventKind::Press => {
                        enable = Some(EnableRequest::Toggle);
                        info!("Enable toggle");
                    }
                    KeyCode::Char(' ') if kind == KeyEventKind::Press => {
                        enable = Some(EnableRequest::Disable);
                        info!("Disable");
                    }

                    // Speed mode
                    KeyCode::Char('1') if pressed => set_speed(&mut cmd, SpeedMode::Slow),
                    KeyCode::Char('2') if pressed => set_speed(&mut cmd, SpeedMode::Normal),
                    KeyCode::Char('3') if pressed => set_speed(&mut cmd, SpeedMode::Fast),

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        // Release the stick if no movement input for INPUT_TIMEOUT_MS
        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            cmd.forward = 0.0;
            cmd.turn = 0.0;
        }

        // Always publish at ~50Hz; the runtime watchdog expects a steady stream
        let sample = DriveCommand { enable, ..cmd.clone() };
        publisher.put(serde_json::to_string(&sample)?).await?;
    }

    // Leave the motors disabled
    let stop = DriveCommand {
        enable: Some(EnableRequest::Disable),
        ..DriveCommand::stop()
    };
    publisher.put(serde_json::to_string(&stop)?).await?;

    Ok(())
}

fn set_speed(cmd: &mut DriveCommand, speed: SpeedMode) {
    cmd.speed = speed;
    info!("Speed: {:?}", speed);
}
