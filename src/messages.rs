// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::motor::SpeedMode;
pub use crate::motor::GroupStatus;

// Command from teleop/scripts -> runtime
// forward/turn are stick values in [-1, 1]; out-of-range values saturate in the mixer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveCommand {
    pub forward: f32,
    pub turn: f32,
    #[serde(default)]
    pub speed: SpeedMode,
    // Only set on the sample where the operator pressed the button
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<EnableRequest>,
}

impl DriveCommand {
    pub fn stop() -> Self {
        Self {
            forward: 0.0,
            turn: 0.0,
            speed: SpeedMode::Normal,
            enable: None,
        }
    }
}

/// Operator enable button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableRequest {
    Enable,
    Disable,
    Toggle,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    LinkDown,
}

// Status from runtime -> dashboards/scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub health: RuntimeHealth,
    pub link_open: bool,
    pub groups: Vec<GroupStatus>,
    /// Last frame written, upper-case hex
    pub last_tx: Option<String>,
    /// Last reply accepted, upper-case hex
    pub last_rx: Option<String>,
    pub missed_replies: u64,
    pub discarded_bytes: u64,
    pub input_age_ms: Option<u64>,
    pub last_error: Option<String>,
}
