// Skid-steer mixing for the DaniBot base
// Converts a forward/turn stick command into left/right wheel speeds.
//
// Sign convention (fixed):
//   forward > 0 drives the robot forward, turn > 0 turns right (clockwise from above).
//   The left wheels are mounted mirrored, so their output is negated:
//     left  = -clamp(forward + turn, -1, 1)
//     right =  clamp(forward - turn, -1, 1)
//   Driving straight forward therefore yields left = -1, right = +1.

use serde::{Deserialize, Serialize};

/// Normalized or scaled wheel setpoints
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelSetpoints {
    pub left: f32,
    pub right: f32,
}

impl WheelSetpoints {
    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Multiply both wheels by `factor`
    pub fn scaled(self, factor: f32) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }

    pub fn side(&self, side: Side) -> f32 {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }
}

/// Which mixer output a motor group follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

/// Speed multiplier selected by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedMode {
    #[default]
    Normal,
    Slow,
    Fast,
}

/// Input shaping and scaling applied around [`mix`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Wheel speed at full stick, rpm
    pub max_rpm: f32,
    /// Stick magnitudes below this are treated as zero
    pub deadzone: f32,
    /// Turn axis scale before mixing; softens spinning in place
    pub turn_scale: f32,
    pub slow_factor: f32,
    pub fast_factor: f32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            max_rpm: 300.0,
            deadzone: 0.08,
            turn_scale: 0.25,
            slow_factor: 0.4,
            fast_factor: 2.0,
        }
    }
}

impl MixerConfig {
    pub fn factor(&self, mode: SpeedMode) -> f32 {
        match mode {
            SpeedMode::Normal => 1.0,
            SpeedMode::Slow => self.slow_factor,
            SpeedMode::Fast => self.fast_factor,
        }
    }

    /// Raw stick values to wheel rpm: deadzone, turn scaling, mixing, speed scaling
    pub fn wheel_rpm(&self, forward: f32, turn: f32, mode: SpeedMode) -> WheelSetpoints {
        let forward = apply_deadzone(forward, self.deadzone);
        let turn = apply_deadzone(turn, self.deadzone) * self.turn_scale;
        mix(forward, turn).scaled(self.max_rpm * self.factor(mode))
    }
}

/// Zero out small inputs; NaN counts as zero
pub fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.is_nan() || value.abs() < deadzone {
        0.0
    } else {
        value
    }
}

/// Combine forward and turn into normalized wheel commands in [-1, 1]
pub fn mix(forward: f32, turn: f32) -> WheelSetpoints {
    WheelSetpoints {
        left: -(forward + turn).clamp(-1.0, 1.0),
        right: (forward - turn).clamp(-1.0, 1.0),
    }
}
