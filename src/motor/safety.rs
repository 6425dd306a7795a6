// Motor safety state machine, one instance per motor group
//
// Disabled -> Enabling -> Enabled -> Disabling -> Disabled
// Any active state -> EmergencyStop -> Disabled
//
// Every sequence runs synchronously inside one control tick and every retry
// loop is capped, so a tick may be slow during a transition but never unbounded.
// Velocity is only ever sent while Enabled or while decelerating in EmergencyStop.
// A group that reached Disabled without the drives acknowledging the stop frames
// keeps `stop_unconfirmed` set and repeats the stop sequence once the link is up.

use serde::{Deserialize, Serialize};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::command::{PidGains, PidMode, MAX_RPM};
use super::error::{MotorError, Result};
use super::link::LinkSession;
use super::mixer::Side;
use super::ramp::Ramp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
    EmergencyStop,
}

/// One configuration write performed before Enable(true)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum HandshakeStep {
    /// Enable(false), to start from a known state
    Disable,
    WorkingCurrent { milliamps: u32 },
    HoldingCurrent { percent: u8 },
    PidGains {
        mode: PidMode,
        kp: u16,
        ki: u16,
        kd: u16,
        kv: u16,
    },
}

/// Sequencing parameters shared by all groups
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    pub handshake: Vec<HandshakeStep>,
    /// Confirm Enable(true) with a status query, retrying up to `enable_retries`
    pub verify_enable: bool,
    /// Confirm Enable(false) the same way; failure is only logged
    pub verify_disable: bool,
    pub enable_retries: u32,
    /// Wait between a write and its verification query
    pub retry_delay: Duration,
    /// Wait between handshake steps
    pub step_delay: Duration,
    /// Velocity(0) rounds sent before Enable(false), at least 2
    pub stop_repeats: u32,
    /// Acceleration byte carried by every velocity command
    pub acceleration: u8,
    /// Ramp rate while driving, rpm/s
    pub max_rate: f32,
    /// Ramp rate while emergency stopping, rpm/s
    pub estop_decel: f32,
    /// Longest an emergency stop may take before the group is forced to Disabled
    pub estop_deadline: Duration,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            handshake: vec![
                HandshakeStep::Disable,
                HandshakeStep::WorkingCurrent { milliamps: 1600 },
                HandshakeStep::HoldingCurrent { percent: 50 },
            ],
            verify_enable: true,
            verify_disable: true,
            enable_retries: 4,
            retry_delay: Duration::from_millis(40),
            step_delay: Duration::from_millis(20),
            stop_repeats: 2,
            acceleration: 200,
            max_rate: 1500.0,
            estop_decel: 3000.0,
            estop_deadline: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Enable,
    Disable,
}

/// Snapshot for status publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub name: String,
    pub state: MotorState,
    pub addresses: Vec<u16>,
    pub target_rpm: f32,
    pub output_rpm: f32,
    pub emergency_stops: u64,
    /// Stop frames still owed to the drives
    pub stop_unconfirmed: bool,
    pub last_error: Option<String>,
}

pub struct MotorGroup {
    name: String,
    side: Side,
    addresses: Vec<u16>,
    state: MotorState,
    ramp: Ramp,
    target: f32,
    pending: Option<Request>,
    estop_since: Option<Instant>,
    emergency_stops: u64,
    stop_unconfirmed: bool,
    last_error: Option<String>,
}

impl MotorGroup {
    pub fn new(name: &str, side: Side, addresses: Vec<u16>, max_rate: f32) -> Self {
        Self {
            name: name.to_string(),
            side,
            addresses,
            state: MotorState::Disabled,
            ramp: Ramp::new(max_rate),
            target: 0.0,
            pending: None,
            estop_since: None,
            emergency_stops: 0,
            stop_unconfirmed: false,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    pub fn state(&self) -> MotorState {
        self.state
    }

    /// Current ramp output, rpm
    pub fn output(&self) -> f32 {
        self.ramp.value()
    }

    pub fn emergency_stops(&self) -> u64 {
        self.emergency_stops
    }

    /// Disabled in software but the drives never acknowledged the stop sequence
    pub fn stop_unconfirmed(&self) -> bool {
        self.stop_unconfirmed
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            name: self.name.clone(),
            state: self.state,
            addresses: self.addresses.clone(),
            target_rpm: self.target,
            output_rpm: self.ramp.value(),
            emergency_stops: self.emergency_stops,
            stop_unconfirmed: self.stop_unconfirmed,
            last_error: self.last_error.clone(),
        }
    }

    /// Desired wheel speed for the next tick, rpm. Only the latest value counts.
    pub fn set_target(&mut self, rpm: f32) {
        let max = MAX_RPM as f32;
        self.target = rpm.clamp(-max, max);
    }

    /// Ask for the enable handshake on the next tick
    pub fn request_enable(&mut self) {
        match self.state {
            MotorState::Disabled => self.pending = Some(Request::Enable),
            MotorState::EmergencyStop => {
                warn!("Group '{}': enable ignored during emergency stop", self.name)
            }
            other => debug!("Group '{}': enable ignored in {:?}", self.name, other),
        }
    }

    /// Ask for the disable sequence on the next tick
    pub fn request_disable(&mut self) {
        match self.state {
            MotorState::Enabled => self.pending = Some(Request::Disable),
            // Cancels an enable that has not started yet
            MotorState::Disabled => self.pending = None,
            other => debug!("Group '{}': disable ignored in {:?}", self.name, other),
        }
    }

    /// Force an emergency stop. Returns false when already stopped or stopping.
    pub fn emergency_stop(&mut self, now: Instant, reason: &str) -> bool {
        if matches!(self.state, MotorState::Disabled | MotorState::EmergencyStop) {
            return false;
        }
        warn!("Group '{}': emergency stop ({})", self.name, reason);
        self.enter_emergency(now);
        true
    }

    /// Advance the state machine by one control tick
    pub fn tick(
        &mut self,
        link: &mut LinkSession,
        dt: f32,
        now: Instant,
        config: &SequenceConfig,
    ) -> Result<()> {
        match self.state {
            MotorState::Disabled => {
                if self.stop_unconfirmed && link.is_open() {
                    self.repeat_stop(link, config)?;
                }
                match self.pending.take() {
                    Some(Request::Enable) if !link.is_open() => {
                        warn!("Group '{}': enable dropped, motor link is down", self.name);
                        Ok(())
                    }
                    Some(Request::Enable) => self.run_enable(link, now, config),
                    _ => Ok(()),
                }
            }
            MotorState::Enabled => {
                if self.pending.take() == Some(Request::Disable) {
                    return self.run_disable(link, config);
                }
                let rpm = self.ramp.update(self.target, dt);
                self.send_velocity(link, rpm, config)
            }
            MotorState::EmergencyStop => self.run_emergency(link, dt, now, config),
            // Sequences finish within the tick that starts them
            MotorState::Enabling | MotorState::Disabling => {
                self.enter_emergency(now);
                Ok(())
            }
        }
    }

    /// Stop and disable right now, within the caller's time budget
    pub fn shutdown(&mut self, link: &mut LinkSession, config: &SequenceConfig) -> Result<()> {
        if self.state == MotorState::Disabled && !self.stop_unconfirmed {
            return Ok(());
        }
        self.pending = None;
        self.run_disable(link, config)
    }

    fn transition(&mut self, next: MotorState) {
        if self.state != next {
            info!("Group '{}': {:?} -> {:?}", self.name, self.state, next);
            self.state = next;
        }
    }

    fn enter_emergency(&mut self, now: Instant) {
        self.pending = None;
        self.estop_since = Some(now);
        self.emergency_stops += 1;
        self.transition(MotorState::EmergencyStop);
    }

    fn run_enable(
        &mut self,
        link: &mut LinkSession,
        now: Instant,
        config: &SequenceConfig,
    ) -> Result<()> {
        self.transition(MotorState::Enabling);
        match self.enable_sequence(link, config) {
            Ok(()) => {
                self.ramp.reset(0.0);
                self.last_error = None;
                self.transition(MotorState::Enabled);
                Ok(())
            }
            Err(e) if e.is_transport() => {
                // Some motors may already be enabled; stop them once the link is back
                self.last_error = Some(e.to_string());
                self.enter_emergency(now);
                Err(e)
            }
            Err(e) => {
                error!("Group '{}': enable failed: {}", self.name, e);
                for &address in &self.addresses {
                    if let Err(e) = link.set_enabled(address, false) {
                        warn!("Motor {}: fail-safe disable not sent: {}", address, e);
                        self.stop_unconfirmed = true;
                    }
                }
                self.last_error = Some(e.to_string());
                self.transition(MotorState::Disabled);
                Err(e)
            }
        }
    }

    fn enable_sequence(&self, link: &mut LinkSession, config: &SequenceConfig) -> Result<()> {
        for &address in &self.addresses {
            for step in &config.handshake {
                apply_step(link, address, step)?;
                sleep(config.step_delay);
            }
            self.enable_motor(link, address, config)?;
        }
        Ok(())
    }

    fn enable_motor(
        &self,
        link: &mut LinkSession,
        address: u16,
        config: &SequenceConfig,
    ) -> Result<()> {
        if !config.verify_enable {
            return link.set_enabled(address, true);
        }

        let attempts = config.enable_retries.max(1);
        for attempt in 1..=attempts {
            link.set_enabled(address, true)?;
            sleep(config.retry_delay);
            match link.query_enabled(address) {
                Ok(true) => {
                    debug!("Motor {} enabled (attempt {})", address, attempt);
                    return Ok(());
                }
                Ok(false) => warn!(
                    "Motor {} still disabled (attempt {}/{})",
                    address, attempt, attempts
                ),
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => warn!(
                    "Motor {} enable not confirmed (attempt {}/{}): {}",
                    address, attempt, attempts, e
                ),
            }
        }

        Err(MotorError::VerificationFailed {
            group: self.name.clone(),
            address,
            attempts,
        })
    }

    fn run_disable(&mut self, link: &mut LinkSession, config: &SequenceConfig) -> Result<()> {
        self.transition(MotorState::Disabling);
        let result = self.stop_sequence(link, config);
        match &result {
            Ok(()) => self.stop_unconfirmed = false,
            Err(e) => {
                error!("Group '{}': disable sequence interrupted: {}", self.name, e);
                self.last_error = Some(e.to_string());
                self.stop_unconfirmed = true;
            }
        }
        self.ramp.reset(0.0);
        self.transition(MotorState::Disabled);
        result
    }

    /// Resend the stop sequence a Disabled group still owes its drives
    fn repeat_stop(&mut self, link: &mut LinkSession, config: &SequenceConfig) -> Result<()> {
        info!("Group '{}': resending unconfirmed stop", self.name);
        self.stop_sequence(link, config)?;
        self.stop_unconfirmed = false;
        Ok(())
    }

    fn run_emergency(
        &mut self,
        link: &mut LinkSession,
        dt: f32,
        now: Instant,
        config: &SequenceConfig,
    ) -> Result<()> {
        let since = *self.estop_since.get_or_insert(now);
        let overdue = now.saturating_duration_since(since) > config.estop_deadline;
        if !link.is_open() {
            if overdue {
                error!(
                    "Group '{}': motor link down for {:?} of emergency stop, \
                     forcing Disabled until the stop can be sent",
                    self.name, config.estop_deadline
                );
                self.last_error = Some("emergency stop not confirmed by the drives".to_string());
                self.stop_unconfirmed = true;
                self.finish_emergency();
            }
            return Ok(());
        }

        // Decelerate along the ramp first, then run the stop sequence.
        // Past the deadline the ramp is cut short.
        let rpm = if overdue {
            warn!(
                "Group '{}': deceleration exceeded {:?}, stopping at {:.0} rpm",
                self.name,
                config.estop_deadline,
                self.ramp.value()
            );
            self.ramp.reset(0.0);
            0.0
        } else {
            self.ramp.update_with_rate(0.0, dt, config.estop_decel)
        };
        if rpm != 0.0 {
            return self.send_velocity(link, rpm, config);
        }
        self.stop_sequence(link, config)?;
        self.stop_unconfirmed = false;
        self.finish_emergency();
        Ok(())
    }

    fn finish_emergency(&mut self) {
        self.ramp.reset(0.0);
        self.estop_since = None;
        self.transition(MotorState::Disabled);
    }

    /// Velocity(0) at least twice, then Enable(false) with optional verification
    fn stop_sequence(&self, link: &mut LinkSession, config: &SequenceConfig) -> Result<()> {
        for _ in 0..config.stop_repeats.max(2) {
            for &address in &self.addresses {
                link.set_velocity(address, 0, config.acceleration)?;
            }
            sleep(config.retry_delay);
        }
        for &address in &self.addresses {
            self.disable_motor(link, address, config)?;
        }
        Ok(())
    }

    fn disable_motor(
        &self,
        link: &mut LinkSession,
        address: u16,
        config: &SequenceConfig,
    ) -> Result<()> {
        if !config.verify_disable {
            return link.set_enabled(address, false);
        }

        let attempts = config.enable_retries.max(1);
        for attempt in 1..=attempts {
            link.set_enabled(address, false)?;
            sleep(config.retry_delay);
            match link.query_enabled(address) {
                Ok(false) => return Ok(()),
                Ok(true) => debug!("Motor {} still enabled (attempt {})", address, attempt),
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => debug!("Motor {} disable not confirmed: {}", address, e),
            }
        }
        warn!(
            "Motor {} did not confirm disable after {} attempts",
            address, attempts
        );
        Ok(())
    }

    fn send_velocity(
        &self,
        link: &mut LinkSession,
        rpm: f32,
        config: &SequenceConfig,
    ) -> Result<()> {
        let rpm = rpm.round() as i32;
        for &address in &self.addresses {
            link.set_velocity(address, rpm, config.acceleration)?;
        }
        Ok(())
    }
}

fn apply_step(link: &mut LinkSession, address: u16, step: &HandshakeStep) -> Result<()> {
    debug!("Motor {}: handshake {:?}", address, step);
    match *step {
        HandshakeStep::Disable => link.set_enabled(address, false),
        HandshakeStep::WorkingCurrent { milliamps } => {
            link.set_working_current(address, milliamps).map(|_| ())
        }
        HandshakeStep::HoldingCurrent { percent } => {
            link.set_holding_current(address, percent).map(|_| ())
        }
        HandshakeStep::PidGains {
            mode,
            kp,
            ki,
            kd,
            kv,
        } => link
            .set_pid_gains(address, mode, PidGains { kp, ki, kd, kv })
            .map(|_| ()),
    }
}
