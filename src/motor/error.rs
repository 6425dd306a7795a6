// Error types for motor communication and sequencing

use super::frame::FrameError;

#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Link is not open")]
    LinkClosed,

    #[error("Frame error: {0}")]
    Frame(FrameError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No response from motor {address} to command 0x{code:02X}")]
    NoResponse { address: u16, code: u8 },

    #[error("Verification failed for motor {address} in group '{group}' after {attempts} attempts")]
    VerificationFailed {
        group: String,
        address: u16,
        attempts: u32,
    },
}

impl MotorError {
    /// Errors that mean the link itself is unusable: trip the watchdog and reopen
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MotorError::Serial(_) | MotorError::Transport(_) | MotorError::LinkClosed
        )
    }
}

impl From<FrameError> for MotorError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::InvalidArgument(msg) => MotorError::InvalidArgument(msg),
            other => MotorError::Frame(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, MotorError>;
