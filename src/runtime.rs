// Zenoh I/O around the 50 Hz motor control loop
// Note: the control loop runs on its own blocking thread and is the only code that
// touches the serial port. Zenoh samples reach it through a single-slot mailbox,
// status comes back through a watch channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval; // tokio is an async runtime for Rust
use tracing::{debug, error, info, warn};

// local imports
use crate::config::{Config, STATUS_HZ};
use crate::messages::{DriveCommand, DriverStatus, EnableRequest};
use crate::motor::MotorDriver;

/// Newest input sample waiting for the control loop
#[derive(Debug, Default)]
pub struct InputSlot {
    latest: Option<(DriveCommand, Instant)>,
    // Survives newer samples so a button press is never coalesced away
    enable: Option<EnableRequest>,
    received: u64,
}

impl InputSlot {
    pub fn put(&mut self, cmd: DriveCommand, received_at: Instant) {
        if let Some(request) = cmd.enable {
            self.enable = Some(request);
        }
        self.latest = Some((cmd, received_at));
        self.received += 1;
    }

    /// Take the newest sample with any pending enable request folded in
    pub fn take(&mut self) -> Option<(DriveCommand, Instant)> {
        let (mut cmd, received_at) = self.latest.take()?;
        cmd.enable = self.enable.take();
        Some((cmd, received_at))
    }

    /// Samples accepted since start
    pub fn received(&self) -> u64 {
        self.received
    }
}

pub type SharedInput = Arc<Mutex<InputSlot>>;

/// Parse one JSON payload into the slot
pub fn accept_sample(input: &SharedInput, payload: &[u8]) {
    match serde_json::from_slice::<DriveCommand>(payload) {
        Ok(cmd) => {
            debug!("Received command: {:?}", &cmd);
            input
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(cmd, Instant::now());
        }
        Err(e) => {
            warn!("Failed to parse command: {}", e);
        }
    }
}

/// Fixed-period control loop. Runs until `stop` is set, then stops the motors.
pub fn control_loop(
    mut driver: MotorDriver,
    input: SharedInput,
    status: watch::Sender<DriverStatus>,
    stop: Arc<AtomicBool>,
    period: Duration,
    shutdown_budget: Duration,
) {
    let mut next = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        // 1. Latest input (non-blocking)
        let sample = input.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((cmd, received_at)) = sample {
            driver.on_command(&cmd, received_at);
        }

        // 2. Watchdog, state machines, velocity
        status.send_replace(driver.tick(Instant::now()));

        next += period;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            // Overran, usually during an enable handshake; restart the schedule
            next = now;
        }
    }

    driver.shutdown(shutdown_budget);
    status.send_replace(driver.status(Instant::now()));
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session
        .declare_subscriber(config.topics.command.clone())
        .await?;
    let pub_status = session
        .declare_publisher(config.topics.status.clone())
        .await?;
    let pub_health = session
        .declare_publisher(config.topics.health.clone())
        .await?;

    let mut driver = MotorDriver::serial(&config);
    if let Err(e) = driver.open() {
        warn!("Motor link not available yet, will keep retrying: {}", e);
    }

    let input: SharedInput = Arc::default();
    let stop = Arc::new(AtomicBool::new(false));
    let (status_tx, status_rx) = watch::channel(driver.status(Instant::now()));

    let period = config.loop_period();
    let shutdown_budget = config.shutdown_timeout();
    let mut control = tokio::task::spawn_blocking({
        let input = input.clone();
        let stop = stop.clone();
        move || control_loop(driver, input, status_tx, stop, period, shutdown_budget)
    });

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout, {:?} on {}",
        config.safety.loop_hz,
        config.safety.watchdog_timeout_ms,
        config.transport.protocol,
        config.transport.port
    );
    info!("Subscribed to: {}", config.topics.command);
    info!(
        "Publishing to: {}, {}",
        config.topics.status, config.topics.health
    );

    let mut publish = interval(Duration::from_millis(1000 / STATUS_HZ));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let control_died = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown requested, stopping motors");
                break false;
            }
            joined = &mut control => {
                match joined {
                    Ok(()) => error!("Control loop stopped unexpectedly"),
                    Err(e) => error!("Control loop failed: {}", e),
                }
                break true;
            }
            sample = subscriber.recv_async() => match sample {
                Ok(sample) => accept_sample(&input, &sample.payload().to_bytes()),
                Err(e) => {
                    error!("Command subscriber closed: {}", e);
                    break false;
                }
            },
            _ = publish.tick() => {
                let status = status_rx.borrow().clone();
                if let Err(e) = publish_status(&status, &pub_status, &pub_health).await {
                    warn!("Failed to publish status: {}", e);
                }
            }
        }
    };

    if control_died {
        return Err("control loop exited, motors may not have been stopped".into());
    }

    // The loop finishes its tick, then runs the shutdown sequence
    stop.store(true, Ordering::Relaxed);
    match tokio::time::timeout(shutdown_budget + period * 4, control).await {
        Ok(Ok(())) => info!("Motors stopped"),
        Ok(Err(e)) => error!("Control loop failed during shutdown: {}", e),
        Err(_) => error!("Shutdown did not finish within {:?}", shutdown_budget),
    }

    let status = status_rx.borrow().clone();
    publish_status(&status, &pub_status, &pub_health).await?;
    Ok(())
}

async fn publish_status(
    status: &DriverStatus,
    pub_status: &zenoh::pubsub::Publisher<'_>,
    pub_health: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let status_json = serde_json::to_string(status)?;
    pub_status.put(status_json).await?;

    let health_json = serde_json::to_string(&status.health)?;
    pub_health.put(health_json).await?;
    Ok(())
}
