// High-level motor driver for the DaniBot base
//
// One control tick, in order:
//   1. reopen the link if it is down and the reopen interval has passed
//   2. watchdog check (stale input -> emergency stop on every active group)
//   3. mixer -> per-group target, state machine step (ramp + velocity when Enabled)
//   4. drain optional replies
// Groups that were forced to Disabled while the link was down resend their
// stop sequence on the tick that reopens the link.
// A transport error anywhere in the tick trips the watchdog in the same tick.

use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::error::Result;
use super::frame::{encode_frame, Direction};
use super::link::{LinkSession, SerialConnector};
use super::mixer::{MixerConfig, WheelSetpoints};
use super::safety::{MotorGroup, MotorState, SequenceConfig};
use super::watchdog::{LinkWatchdog, Trip};
use crate::config::Config;
use crate::messages::{DriveCommand, DriverStatus, EnableRequest, RuntimeHealth};

pub struct MotorDriver {
    link: LinkSession,
    groups: Vec<MotorGroup>,
    watchdog: LinkWatchdog,
    mixer: MixerConfig,
    sequence: SequenceConfig,
    period: Duration,
    reopen_interval: Duration,
    drain_replies: bool,
    input: DriveCommand,
    last_tick: Option<Instant>,
    next_reopen: Option<Instant>,
    last_error: Option<String>,
}

impl MotorDriver {
    /// Build the driver around an existing (possibly closed) link
    pub fn new(link: LinkSession, config: &Config) -> Self {
        let sequence = config.sequence();
        let groups = config
            .groups
            .iter()
            .map(|g| MotorGroup::new(&g.name, g.side, g.addresses.clone(), sequence.max_rate))
            .collect();

        Self {
            link,
            groups,
            watchdog: LinkWatchdog::new(config.watchdog_timeout()),
            mixer: config.drive.mixer,
            sequence,
            period: config.loop_period(),
            reopen_interval: config.reopen_interval(),
            drain_replies: config.drive.drain_replies,
            input: DriveCommand::stop(),
            last_tick: None,
            next_reopen: None,
            last_error: None,
        }
    }

    /// Driver on the configured serial port; the port is opened by [`MotorDriver::open`]
    /// or by the first tick
    pub fn serial(config: &Config) -> Self {
        let transport = &config.transport;
        let mut connector = SerialConnector::new(&transport.port, transport.baud_rate);
        connector.read_timeout = Duration::from_millis(transport.read_timeout_ms);
        let link = LinkSession::new(
            transport.protocol,
            Box::new(connector),
            config.link_timing(),
        );
        Self::new(link, config)
    }

    pub fn open(&mut self) -> Result<()> {
        self.link.open()
    }

    pub fn groups(&self) -> &[MotorGroup] {
        &self.groups
    }

    pub fn link(&self) -> &LinkSession {
        &self.link
    }

    /// Direct link access for tools; bypasses the state machine
    pub fn link_mut(&mut self) -> &mut LinkSession {
        &mut self.link
    }

    /// Accept one input sample. `received_at` is when it arrived, not when it is applied.
    pub fn on_command(&mut self, cmd: &DriveCommand, received_at: Instant) {
        self.watchdog.feed(received_at);
        self.input = DriveCommand {
            enable: None,
            ..cmd.clone()
        };
        if let Some(request) = cmd.enable {
            self.request(request);
        }
    }

    /// Apply an operator enable request to every group
    pub fn request(&mut self, request: EnableRequest) {
        info!("Operator request: {:?}", request);
        let enable = match request {
            EnableRequest::Enable => true,
            EnableRequest::Disable => false,
            // Any group running counts as "on"
            EnableRequest::Toggle => !self
                .groups
                .iter()
                .any(|g| g.state() == MotorState::Enabled),
        };
        for group in &mut self.groups {
            if enable {
                group.request_enable();
            } else {
                group.request_disable();
            }
        }
    }

    /// Run one control tick and return the resulting status
    pub fn tick(&mut self, now: Instant) -> DriverStatus {
        let dt = match self.last_tick.replace(now) {
            Some(prev) => now.saturating_duration_since(prev).min(self.period * 5),
            None => self.period,
        }
        .as_secs_f32();

        self.maintain_link(now);

        if let Some(trip) = self.watchdog.check(now) {
            self.handle_trip(trip, now);
        }

        let wheels = if self.watchdog.is_stale() {
            WheelSetpoints::zero()
        } else {
            self.mixer
                .wheel_rpm(self.input.forward, self.input.turn, self.input.speed)
        };

        let mut transport_error = None;
        for group in &mut self.groups {
            group.set_target(wheels.side(group.side()));
            match group.tick(&mut self.link, dt, now, &self.sequence) {
                Ok(()) => {}
                Err(e) if e.is_transport() => {
                    transport_error.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    error!("Group '{}': {}", group.name(), e);
                    self.last_error = Some(e.to_string());
                }
            }
        }

        if transport_error.is_none() && self.drain_replies && self.link.is_open() {
            if let Err(e) = self.link.drain_replies() {
                transport_error = Some(e.to_string());
            }
        }

        if let Some(e) = transport_error {
            self.watchdog.report_transport_error(&e);
            if let Some(trip) = self.watchdog.check(now) {
                self.handle_trip(trip, now);
            }
        }

        self.status(now)
    }

    pub fn health(&self) -> RuntimeHealth {
        if !self.link.is_open() {
            RuntimeHealth::LinkDown
        } else if self.watchdog.is_stale() {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        }
    }

    pub fn status(&self, now: Instant) -> DriverStatus {
        let protocol = self.link.protocol();
        let last_rx = self.link.last_rx().and_then(|frame| {
            let direction = frame.direction.unwrap_or(Direction::Reply);
            encode_frame(protocol, direction, frame.address, &frame.payload).ok()
        });

        DriverStatus {
            health: self.health(),
            link_open: self.link.is_open(),
            groups: self.groups.iter().map(MotorGroup::status).collect(),
            last_tx: self.link.last_tx().map(hex::encode_upper),
            last_rx: last_rx.map(hex::encode_upper),
            missed_replies: self.link.missed_replies(),
            discarded_bytes: self.link.discarded_bytes(),
            input_age_ms: self
                .watchdog
                .input_age(now)
                .map(|age| age.as_millis() as u64),
            last_error: self.last_error.clone(),
        }
    }

    /// Stop and disable every group that is not already Disabled, then release the link.
    /// Checks `budget` between groups.
    pub fn shutdown(&mut self, budget: Duration) {
        let deadline = Instant::now() + budget;
        info!("Stopping motors before exit");

        if !self.link.is_open() {
            if let Err(e) = self.link.open() {
                error!("Cannot stop motors, link unavailable: {}", e);
                return;
            }
        }

        // One verification query per motor keeps the sequence inside the budget
        let sequence = SequenceConfig {
            enable_retries: 1,
            ..self.sequence.clone()
        };
        for group in &mut self.groups {
            if Instant::now() >= deadline {
                warn!("Shutdown budget spent before group '{}'", group.name());
                break;
            }
            if let Err(e) = group.shutdown(&mut self.link, &sequence) {
                warn!("Group '{}' did not stop cleanly: {}", group.name(), e);
            }
        }
        self.link.close();
    }

    fn maintain_link(&mut self, now: Instant) {
        if self.link.is_open() {
            return;
        }
        if self.next_reopen.is_some_and(|at| now < at) {
            return;
        }
        match self.link.open() {
            Ok(()) => self.next_reopen = None,
            Err(e) => {
                warn!("Motor link unavailable: {}", e);
                self.last_error = Some(e.to_string());
                self.next_reopen = Some(now + self.reopen_interval);
            }
        }
    }

    fn handle_trip(&mut self, trip: Trip, now: Instant) {
        let reason = match &trip {
            Trip::InputStale { age } if *age == Duration::MAX => "no input received".to_string(),
            Trip::InputStale { age } => format!("input stale for {:?}", age),
            Trip::TransportError(e) => format!("transport error: {}", e),
        };
        for group in &mut self.groups {
            group.emergency_stop(now, &reason);
        }

        if let Trip::TransportError(e) = trip {
            self.last_error = Some(e);
            self.link.close();
            self.next_reopen = Some(now + self.reopen_interval);
        }
    }
}

impl Drop for MotorDriver {
    fn drop(&mut self) {
        // Best effort: zero velocity if the link is still up
        if !self.link.is_open() {
            return;
        }
        for group in &self.groups {
            for &address in group.addresses() {
                if let Err(e) = self.link.set_velocity(address, 0, self.sequence.acceleration) {
                    warn!("Failed to stop motor {} on drop: {}", address, e);
                    return;
                }
            }
        }
    }
}
