// Timeouts, topics, motor configuration
//
// Compile-time defaults below; a JSON file can override any of them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::motor::{
    HandshakeStep, HoldingPercent, LinkTiming, MixerConfig, Protocol, SequenceConfig, Side,
    DEFAULT_BAUDRATE, DEFAULT_READ_TIMEOUT_MS, MAX_RPM,
};

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Status publishing frequency
pub const STATUS_HZ: u64 = 10;

// Zenoh topics
pub const TOPIC_CMD_DRIVE: &str = "danibot/cmd/drive"; // commands
pub const TOPIC_STATE_MOTORS: &str = "danibot/state/motors"; // driver status
pub const TOPIC_HEALTH: &str = "danibot/state/health"; // health status

// Serial port for the USB-CAN adapter
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";

// Left wheels sit on 3/4, right wheels on 1/2
pub const LEFT_MOTOR_IDS: [u16; 2] = [3, 4];
pub const RIGHT_MOTOR_IDS: [u16; 2] = [1, 2];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub groups: Vec<GroupConfig>,
    pub drive: DriveConfig,
    pub safety: SafetyConfig,
    pub topics: TopicsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub port: String,
    pub baud_rate: u32,
    pub protocol: Protocol,
    pub read_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub inter_frame_gap_ms: u64,
    pub reopen_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: MOTOR_PORT.to_string(),
            baud_rate: DEFAULT_BAUDRATE,
            protocol: Protocol::CanSerial,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            response_timeout_ms: 40,
            inter_frame_gap_ms: 0,
            reopen_interval_ms: 500,
        }
    }
}

/// Motors sharing one enable toggle and one mixer output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub side: Side,
    pub addresses: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub mixer: MixerConfig,
    /// Acceleration byte carried by velocity commands
    pub acceleration: u8,
    /// Ramp limit while driving, rpm/s
    pub max_rate_rpm_s: f32,
    /// Read velocity acknowledgements once per tick
    pub drain_replies: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            mixer: MixerConfig::default(),
            acceleration: 200,
            max_rate_rpm_s: 1500.0,
            drain_replies: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub loop_hz: u64,
    pub watchdog_timeout_ms: u64,
    pub enable_retries: u32,
    pub retry_delay_ms: u64,
    pub step_delay_ms: u64,
    pub verify_enable: bool,
    pub verify_disable: bool,
    pub stop_repeats: u32,
    pub estop_decel_rpm_s: f32,
    pub estop_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub handshake: Vec<HandshakeStep>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        let sequence = SequenceConfig::default();
        Self {
            loop_hz: LOOP_HZ,
            watchdog_timeout_ms: CMD_TIMEOUT.as_millis() as u64,
            enable_retries: sequence.enable_retries,
            retry_delay_ms: sequence.retry_delay.as_millis() as u64,
            step_delay_ms: sequence.step_delay.as_millis() as u64,
            verify_enable: sequence.verify_enable,
            verify_disable: sequence.verify_disable,
            stop_repeats: sequence.stop_repeats,
            estop_decel_rpm_s: sequence.estop_decel,
            estop_timeout_ms: sequence.estop_deadline.as_millis() as u64,
            shutdown_timeout_ms: 800,
            handshake: sequence.handshake,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub command: String,
    pub status: String,
    pub health: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            command: TOPIC_CMD_DRIVE.to_string(),
            status: TOPIC_STATE_MOTORS.to_string(),
            health: TOPIC_HEALTH.to_string(),
        }
    }
}

/// Left/right groups on the default addresses
pub fn default_groups() -> Vec<GroupConfig> {
    vec![
        GroupConfig {
            name: "left".to_string(),
            side: Side::Left,
            addresses: LEFT_MOTOR_IDS.to_vec(),
        },
        GroupConfig {
            name: "right".to_string(),
            side: Side::Right,
            addresses: RIGHT_MOTOR_IDS.to_vec(),
        },
    ]
}

impl Config {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse and validate; missing groups fall back to [`default_groups`]
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(text)?;
        if config.groups.is_empty() {
            config.groups = default_groups();
        }
        config.validate()?;
        Ok(config)
    }

    /// Defaults with the standard wheel groups
    pub fn with_default_groups() -> Self {
        Self {
            groups: default_groups(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.groups.is_empty() {
            return invalid("at least one motor group is required".to_string());
        }
        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.addresses.is_empty() {
                return invalid(format!("group '{}' has no motors", group.name));
            }
            for &address in &group.addresses {
                self.transport
                    .protocol
                    .check_address(address)
                    .map_err(|e| ConfigError::Invalid(format!("group '{}': {}", group.name, e)))?;
                if !seen.insert(address) {
                    return invalid(format!("motor address {} is used twice", address));
                }
            }
        }

        let safety = &self.safety;
        if safety.loop_hz == 0 || safety.loop_hz > 1000 {
            return invalid(format!("loop_hz {} out of range 1..=1000", safety.loop_hz));
        }
        if safety.watchdog_timeout_ms == 0 {
            return invalid("watchdog_timeout_ms must be positive".to_string());
        }
        if safety.enable_retries < 1 {
            return invalid("enable_retries must be at least 1".to_string());
        }
        if safety.stop_repeats < 2 {
            return invalid("stop_repeats must be at least 2".to_string());
        }
        for step in &safety.handshake {
            if let HandshakeStep::HoldingCurrent { percent } = *step {
                HoldingPercent::new(percent)
                    .map_err(|e| ConfigError::Invalid(format!("handshake: {}", e)))?;
            }
        }

        if safety.shutdown_timeout_ms == 0 {
            return invalid("shutdown_timeout_ms must be positive".to_string());
        }

        let mixer = &self.drive.mixer;
        let max_rpm = mixer.max_rpm;
        if !(max_rpm > 0.0 && max_rpm <= MAX_RPM as f32) {
            return invalid(format!("max_rpm {} out of range (0, {}]", max_rpm, MAX_RPM));
        }
        for (name, factor) in [
            ("slow_factor", mixer.slow_factor),
            ("fast_factor", mixer.fast_factor),
        ] {
            if !(factor.is_finite() && factor > 0.0) {
                return invalid(format!("{} must be a positive number, got {}", name, factor));
            }
        }
        let rate = self.drive.max_rate_rpm_s;
        if !(rate.is_finite() && rate > 0.0) {
            return invalid(format!("max_rate_rpm_s must be positive, got {}", rate));
        }

        // The emergency ramp has to reach zero from top speed before the deadline
        let decel = safety.estop_decel_rpm_s;
        if !(decel.is_finite() && decel > 0.0) {
            return invalid(format!("estop_decel_rpm_s must be positive, got {}", decel));
        }
        if safety.estop_timeout_ms == 0 {
            return invalid("estop_timeout_ms must be positive".to_string());
        }
        let top_speed = self.top_speed();
        let stop_secs = top_speed / decel;
        if stop_secs > self.estop_timeout().as_secs_f32() {
            return invalid(format!(
                "estop_decel_rpm_s {} needs {:.2} s to stop from {} rpm, more than estop_timeout_ms {}",
                decel, stop_secs, top_speed, safety.estop_timeout_ms
            ));
        }

        if self.transport.baud_rate == 0 {
            return invalid("baud_rate must be positive".to_string());
        }
        if self.transport.response_timeout_ms == 0 {
            return invalid("response_timeout_ms must be positive".to_string());
        }
        Ok(())
    }

    /// Highest wheel speed the mixer can request, rpm
    pub fn top_speed(&self) -> f32 {
        let mixer = &self.drive.mixer;
        let factor = mixer.slow_factor.max(mixer.fast_factor).max(1.0);
        (mixer.max_rpm * factor).min(MAX_RPM as f32)
    }

    pub fn estop_timeout(&self) -> Duration {
        Duration::from_millis(self.safety.estop_timeout_ms)
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.safety.loop_hz.max(1))
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.safety.watchdog_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.safety.shutdown_timeout_ms)
    }

    pub fn reopen_interval(&self) -> Duration {
        Duration::from_millis(self.transport.reopen_interval_ms)
    }

    pub fn link_timing(&self) -> LinkTiming {
        LinkTiming {
            response_timeout: Duration::from_millis(self.transport.response_timeout_ms),
            inter_frame_gap: Duration::from_millis(self.transport.inter_frame_gap_ms),
        }
    }

    pub fn sequence(&self) -> SequenceConfig {
        let safety = &self.safety;
        SequenceConfig {
            handshake: safety.handshake.clone(),
            verify_enable: safety.verify_enable,
            verify_disable: safety.verify_disable,
            enable_retries: safety.enable_retries,
            retry_delay: Duration::from_millis(safety.retry_delay_ms),
            step_delay: Duration::from_millis(safety.step_delay_ms),
            stop_repeats: safety.stop_repeats,
            acceleration: self.drive.acceleration,
            max_rate: self.drive.max_rate_rpm_s,
            estop_decel: safety.estop_decel_rpm_s,
            estop_deadline: self.estop_timeout(),
        }
    }
}
