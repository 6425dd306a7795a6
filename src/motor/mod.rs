// Motor control module for the DaniBot base
//
// Provides:
// - CAN-over-serial and RS485 frame codecs with a resynchronizing deframer
// - MKS servo command set on top of an owned link session
// - Velocity ramp, differential mixer, per-group safety state machine and watchdog
// - High-level motor driver running one control tick at a time

pub mod bus;
pub mod command;
pub mod deframer;
mod driver;
pub mod error;
pub mod frame;
pub mod link;
pub mod mixer;
pub mod ramp;
pub mod safety;
pub mod watchdog;

pub use command::{
    decode, decode_response, encode, encode_response, Command, HoldingPercent, PidGains, PidMode,
    Response, ENCODER_COUNTS_PER_REV, MAX_RPM,
};
pub use deframer::Deframer;
pub use driver::MotorDriver;
pub use error::{MotorError, Result};
pub use frame::{Direction, Frame, FrameError, Protocol};
pub use link::{
    Connector, LinkSession, LinkTiming, SerialConnector, Transport, DEFAULT_BAUDRATE,
    DEFAULT_READ_TIMEOUT_MS,
};
pub use mixer::{mix, MixerConfig, Side, SpeedMode, WheelSetpoints};
pub use ramp::Ramp;
pub use safety::{GroupStatus, HandshakeStep, MotorGroup, MotorState, SequenceConfig};
pub use watchdog::{LinkWatchdog, Trip};
