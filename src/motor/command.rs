// MKS SERVO42D command set
//
// Payload layouts are shared by both wire formats; `frame` adds the envelope.
// Numeric arguments are clamped at construction, since most of them come from
// continuous human input and saturating is safer than rejecting.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::frame::{decode_frame, encode_frame, Direction, Frame, FrameError, Protocol};

/// Command codes
pub mod code {
    pub const VELOCITY: u8 = 0xF6;
    pub const ENABLE: u8 = 0xF3;
    pub const WORKING_CURRENT: u8 = 0x83;
    pub const HOLDING_CURRENT: u8 = 0x9B;
    pub const PID_VFOC: u8 = 0x96;
    pub const PID_CLOSE: u8 = 0x97;
    pub const QUERY_ENABLE: u8 = 0x3A;
    pub const READ_ENCODER: u8 = 0x31;
}

/// Velocity magnitude cap (12-bit field, drive limit 3000)
pub const MAX_RPM: u16 = 3000;
pub const MAX_WORKING_CURRENT_MA: u16 = 3000;
pub const MAX_PID_GAIN: u16 = 1024;

/// Encoder counts per motor revolution reported by 0x31
pub const ENCODER_COUNTS_PER_REV: i64 = 16384;

const DIRECTION_BIT: u8 = 0x80;

/// Holding current as a percentage of working current: 10, 20, ..., 90
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldingPercent(u8);

impl HoldingPercent {
    pub fn new(percent: u8) -> Result<Self, FrameError> {
        if percent % 10 != 0 || !(10..=90).contains(&percent) {
            return Err(FrameError::InvalidArgument(format!(
                "holding current {percent}% is not one of 10, 20, ..., 90"
            )));
        }
        Ok(Self(percent))
    }

    fn wire(self) -> u8 {
        self.0 / 10 - 1
    }

    fn from_wire(raw: u8) -> Result<Self, FrameError> {
        if raw > 8 {
            return Err(FrameError::Malformed(format!(
                "holding current index {raw} out of range"
            )));
        }
        Ok(Self((raw + 1) * 10))
    }
}

/// Which PID loop a gains write targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PidMode {
    /// Velocity FOC loop (0x96)
    #[default]
    Vfoc,
    /// Closed-loop position mode (0x97)
    Close,
}

impl PidMode {
    pub fn code(self) -> u8 {
        match self {
            PidMode::Vfoc => code::PID_VFOC,
            PidMode::Close => code::PID_CLOSE,
        }
    }
}

impl FromStr for PidMode {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vfoc" => Ok(PidMode::Vfoc),
            "close" => Ok(PidMode::Close),
            other => Err(FrameError::InvalidArgument(format!(
                "PID mode must be 'vfoc' or 'close', got '{other}'"
            ))),
        }
    }
}

/// Full gain set; written as two frames, see [`PidPair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: u16,
    pub ki: u16,
    pub kd: u16,
    pub kv: u16,
}

impl PidGains {
    /// Split into the two vendor sub-commands
    pub fn pairs(self) -> [PidPair; 2] {
        let clamp = |g: u16| g.min(MAX_PID_GAIN);
        [
            PidPair::KpKi {
                kp: clamp(self.kp),
                ki: clamp(self.ki),
            },
            PidPair::KdKv {
                kd: clamp(self.kd),
                kv: clamp(self.kv),
            },
        ]
    }
}

/// One gains sub-command: selector 0x00 carries kp/ki, 0x01 carries kd/kv
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidPair {
    KpKi { kp: u16, ki: u16 },
    KdKv { kd: u16, kv: u16 },
}

/// Host -> motor command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run at a signed speed; `acceleration` 0 = drive default, 255 = fastest
    Velocity { rpm: i16, acceleration: u8 },
    Enable(bool),
    WorkingCurrent { milliamps: u16 },
    HoldingCurrent(HoldingPercent),
    PidGains { mode: PidMode, pair: PidPair },
    /// Read back the enable state
    StatusQuery,
    ReadEncoder,
}

impl Command {
    /// Velocity command with the magnitude saturated at [`MAX_RPM`]
    pub fn velocity(rpm: i32, acceleration: u8) -> Self {
        let max = MAX_RPM as i32;
        Command::Velocity {
            rpm: rpm.clamp(-max, max) as i16,
            acceleration,
        }
    }

    pub fn working_current(milliamps: u32) -> Self {
        Command::WorkingCurrent {
            milliamps: milliamps.min(MAX_WORKING_CURRENT_MA as u32) as u16,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Command::Velocity { .. } => code::VELOCITY,
            Command::Enable(_) => code::ENABLE,
            Command::WorkingCurrent { .. } => code::WORKING_CURRENT,
            Command::HoldingCurrent(_) => code::HOLDING_CURRENT,
            Command::PidGains { mode, .. } => mode.code(),
            Command::StatusQuery => code::QUERY_ENABLE,
            Command::ReadEncoder => code::READ_ENCODER,
        }
    }

    /// Payload bytes, command code first
    pub fn payload(&self) -> Vec<u8> {
        match *self {
            Command::Velocity { rpm, acceleration } => {
                let speed = rpm.unsigned_abs().min(MAX_RPM);
                let dir = if rpm < 0 { DIRECTION_BIT } else { 0 };
                vec![
                    code::VELOCITY,
                    dir | ((speed >> 8) & 0x0F) as u8,
                    (speed & 0xFF) as u8,
                    acceleration,
                ]
            }
            Command::Enable(on) => vec![code::ENABLE, on as u8],
            Command::WorkingCurrent { milliamps } => {
                let [lo, hi] = milliamps.min(MAX_WORKING_CURRENT_MA).to_le_bytes();
                vec![code::WORKING_CURRENT, lo, hi]
            }
            Command::HoldingCurrent(percent) => vec![code::HOLDING_CURRENT, percent.wire()],
            Command::PidGains { mode, pair } => {
                let (selector, a, b) = match pair {
                    PidPair::KpKi { kp, ki } => (0x00, kp, ki),
                    PidPair::KdKv { kd, kv } => (0x01, kd, kv),
                };
                let [a_lo, a_hi] = a.min(MAX_PID_GAIN).to_le_bytes();
                let [b_lo, b_hi] = b.min(MAX_PID_GAIN).to_le_bytes();
                vec![mode.code(), selector, a_lo, a_hi, b_lo, b_hi]
            }
            Command::StatusQuery => vec![code::QUERY_ENABLE],
            Command::ReadEncoder => vec![code::READ_ENCODER],
        }
    }

    /// Parse a request payload
    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        let (&op, data) = payload
            .split_first()
            .ok_or(FrameError::Truncated { needed: 1, actual: 0 })?;
        let expected = rs485_data_len(Direction::Request, op).ok_or(FrameError::UnknownCommand(op))?;
        if data.len() != expected {
            return Err(FrameError::Malformed(format!(
                "command 0x{op:02X} expects {expected} data bytes, got {}",
                data.len()
            )));
        }

        let command = match op {
            code::VELOCITY => {
                let speed = (((data[0] & 0x0F) as u16) << 8) | data[1] as u16;
                let magnitude = speed as i16;
                Command::Velocity {
                    rpm: if data[0] & DIRECTION_BIT != 0 {
                        -magnitude
                    } else {
                        magnitude
                    },
                    acceleration: data[2],
                }
            }
            code::ENABLE => Command::Enable(parse_flag(data[0])?),
            code::WORKING_CURRENT => Command::WorkingCurrent {
                milliamps: u16::from_le_bytes([data[0], data[1]]),
            },
            code::HOLDING_CURRENT => Command::HoldingCurrent(HoldingPercent::from_wire(data[0])?),
            code::PID_VFOC | code::PID_CLOSE => {
                let mode = if op == code::PID_VFOC {
                    PidMode::Vfoc
                } else {
                    PidMode::Close
                };
                let a = u16::from_le_bytes([data[1], data[2]]);
                let b = u16::from_le_bytes([data[3], data[4]]);
                let pair = match data[0] {
                    0x00 => PidPair::KpKi { kp: a, ki: b },
                    0x01 => PidPair::KdKv { kd: a, kv: b },
                    other => {
                        return Err(FrameError::Malformed(format!(
                            "PID selector 0x{other:02X}"
                        )));
                    }
                };
                Command::PidGains { mode, pair }
            }
            code::QUERY_ENABLE => Command::StatusQuery,
            code::READ_ENCODER => Command::ReadEncoder,
            other => return Err(FrameError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

/// Motor -> host response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Acknowledgement of a write: status 1 = success, 0 = failure
    Status { code: u8, status: u8 },
    /// Answer to [`Command::StatusQuery`]
    EnableState(bool),
    /// Answer to [`Command::ReadEncoder`], counts
    EncoderPosition(i64),
}

impl Response {
    pub fn code(&self) -> u8 {
        match self {
            Response::Status { code, .. } => *code,
            Response::EnableState(_) => code::QUERY_ENABLE,
            Response::EncoderPosition(_) => code::READ_ENCODER,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match *self {
            Response::Status { code, status } => vec![code, status],
            Response::EnableState(on) => vec![code::QUERY_ENABLE, on as u8],
            Response::EncoderPosition(counts) => {
                let be = counts.to_be_bytes();
                let mut payload = vec![code::READ_ENCODER];
                payload.extend_from_slice(&be[2..]);
                payload
            }
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        let (&op, data) = payload
            .split_first()
            .ok_or(FrameError::Truncated { needed: 1, actual: 0 })?;
        let expected = rs485_data_len(Direction::Reply, op).ok_or(FrameError::UnknownCommand(op))?;
        if data.len() != expected {
            return Err(FrameError::Malformed(format!(
                "reply 0x{op:02X} expects {expected} data bytes, got {}",
                data.len()
            )));
        }

        let response = match op {
            code::QUERY_ENABLE => Response::EnableState(parse_flag(data[0])?),
            code::READ_ENCODER => {
                // Sign-extend the 48-bit big-endian value
                let fill = if data[0] & 0x80 != 0 { 0xFF } else { 0x00 };
                let mut be = [fill; 8];
                be[2..].copy_from_slice(data);
                Response::EncoderPosition(i64::from_be_bytes(be))
            }
            _ => Response::Status {
                code: op,
                status: data[0],
            },
        };
        Ok(response)
    }

    /// True for a status reply that reports success
    pub fn is_success(&self) -> bool {
        !matches!(self, Response::Status { status: 0, .. })
    }
}

fn parse_flag(raw: u8) -> Result<bool, FrameError> {
    match raw {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(FrameError::Malformed(format!("flag byte 0x{other:02X}"))),
    }
}

/// Data bytes after the command code (checksum excluded) for each known code.
/// RS485 frames have no length field, so this table drives deframing.
pub fn rs485_data_len(direction: Direction, op: u8) -> Option<usize> {
    let len = match (direction, op) {
        (Direction::Request, code::VELOCITY) => 3,
        (Direction::Request, code::ENABLE) => 1,
        (Direction::Request, code::WORKING_CURRENT) => 2,
        (Direction::Request, code::HOLDING_CURRENT) => 1,
        (Direction::Request, code::PID_VFOC | code::PID_CLOSE) => 5,
        (Direction::Request, code::QUERY_ENABLE | code::READ_ENCODER) => 0,
        (Direction::Reply, code::READ_ENCODER) => 6,
        (
            Direction::Reply,
            code::VELOCITY
            | code::ENABLE
            | code::WORKING_CURRENT
            | code::HOLDING_CURRENT
            | code::PID_VFOC
            | code::PID_CLOSE
            | code::QUERY_ENABLE,
        ) => 1,
        _ => return None,
    };
    Some(len)
}

/// Encode a command for `address`
pub fn encode(protocol: Protocol, address: u16, command: &Command) -> Result<Vec<u8>, FrameError> {
    encode_frame(protocol, Direction::Request, address, &command.payload())
}

/// Decode one complete request frame
pub fn decode(protocol: Protocol, bytes: &[u8]) -> Result<(u16, Command), FrameError> {
    let frame = decode_frame(protocol, bytes)?;
    if frame.direction == Some(Direction::Reply) {
        return Err(FrameError::Malformed("reply frame where a request was expected".to_string()));
    }
    Ok((frame.address, Command::from_payload(&frame.payload)?))
}

/// Encode a response, as a motor would send it
pub fn encode_response(
    protocol: Protocol,
    address: u16,
    response: &Response,
) -> Result<Vec<u8>, FrameError> {
    encode_frame(protocol, Direction::Reply, address, &response.payload())
}

/// Decode one complete reply frame
pub fn decode_response(protocol: Protocol, bytes: &[u8]) -> Result<(u16, Response), FrameError> {
    let frame = decode_frame(protocol, bytes)?;
    response_from_frame(&frame).map(|response| (frame.address, response))
}

/// Interpret a deframed frame as a reply
pub fn response_from_frame(frame: &Frame) -> Result<Response, FrameError> {
    if frame.direction == Some(Direction::Request) {
        return Err(FrameError::Malformed("request frame where a reply was expected".to_string()));
    }
    Response::from_payload(&frame.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_commands() -> Vec<Command> {
        vec![
            Command::velocity(100, 2),
            Command::velocity(-50, 200),
            Command::velocity(0, 0),
            Command::velocity(3000, 255),
            Command::Enable(true),
            Command::Enable(false),
            Command::working_current(1600),
            Command::HoldingCurrent(HoldingPercent::new(50).unwrap()),
            Command::PidGains {
                mode: PidMode::Vfoc,
                pair: PidPair::KpKi { kp: 1000, ki: 0 },
            },
            Command::PidGains {
                mode: PidMode::Close,
                pair: PidPair::KdKv { kd: 12, kv: 1024 },
            },
            Command::StatusQuery,
            Command::ReadEncoder,
        ]
    }

    #[test]
    fn test_roundtrip_both_protocols() {
        for protocol in [Protocol::CanSerial, Protocol::Rs485] {
            for command in all_commands() {
                let bytes = encode(protocol, 7, &command).unwrap();
                assert_eq!(
                    decode(protocol, &bytes).unwrap(),
                    (7, command),
                    "{protocol:?} {command:?}"
                );
            }
        }
    }

    #[test]
    fn test_velocity_payload_forward() {
        assert_eq!(
            Command::velocity(100, 2).payload(),
            vec![0xF6, 0x00, 0x64, 0x02]
        );
    }

    #[test]
    fn test_velocity_payload_reverse_sets_direction_bit() {
        let payload = Command::velocity(-50, 10).payload();
        assert_eq!(payload[1], 0x80);
        assert_eq!(payload[2], 0x32);
    }

    #[test]
    fn test_velocity_clamps_magnitude() {
        assert_eq!(
            Command::velocity(5000, 0),
            Command::Velocity {
                rpm: 3000,
                acceleration: 0
            }
        );
        assert_eq!(
            Command::velocity(-40000, 0),
            Command::Velocity {
                rpm: -3000,
                acceleration: 0
            }
        );
        // 3000 = 0x0BB8
        assert_eq!(Command::velocity(9999, 0).payload()[1..3], [0x0B, 0xB8]);
    }

    #[test]
    fn test_working_current_payload() {
        assert_eq!(
            Command::working_current(1600).payload(),
            vec![0x83, 0x40, 0x06]
        );
        assert_eq!(
            Command::working_current(10_000),
            Command::WorkingCurrent { milliamps: 3000 }
        );
    }

    #[test]
    fn test_holding_current() {
        let percent = HoldingPercent::new(50).unwrap();
        assert_eq!(Command::HoldingCurrent(percent).payload(), vec![0x9B, 0x04]);
        assert!(HoldingPercent::new(45).is_err());
        assert!(HoldingPercent::new(100).is_err());
        assert!(HoldingPercent::new(0).is_err());
    }

    #[test]
    fn test_pid_payload_layout() {
        let gains = PidGains {
            kp: 1000,
            ki: 0,
            kd: 2000,
            kv: 5,
        };
        let [first, second] = gains.pairs();
        assert_eq!(
            Command::PidGains {
                mode: PidMode::Vfoc,
                pair: first
            }
            .payload(),
            vec![0x96, 0x00, 0xE8, 0x03, 0x00, 0x00]
        );
        // kd clamped to 1024 = 0x0400
        assert_eq!(
            Command::PidGains {
                mode: PidMode::Close,
                pair: second
            }
            .payload(),
            vec![0x97, 0x01, 0x00, 0x04, 0x05, 0x00]
        );
    }

    #[test]
    fn test_pid_mode_parse() {
        assert_eq!("vFOC".parse::<PidMode>().unwrap(), PidMode::Vfoc);
        assert_eq!("close".parse::<PidMode>().unwrap(), PidMode::Close);
        assert!(matches!(
            "open".parse::<PidMode>(),
            Err(FrameError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_enable_payload() {
        assert_eq!(Command::Enable(true).payload(), vec![0xF3, 0x01]);
        assert_eq!(Command::Enable(false).payload(), vec![0xF3, 0x00]);
    }

    #[test]
    fn test_response_roundtrip() {
        let responses = [
            Response::Status {
                code: code::ENABLE,
                status: 1,
            },
            Response::EnableState(true),
            Response::EnableState(false),
            Response::EncoderPosition(-ENCODER_COUNTS_PER_REV * 3),
            Response::EncoderPosition(123_456_789),
        ];
        for protocol in [Protocol::CanSerial, Protocol::Rs485] {
            for response in responses {
                let bytes = encode_response(protocol, 4, &response).unwrap();
                assert_eq!(decode_response(protocol, &bytes).unwrap(), (4, response));
            }
        }
    }

    #[test]
    fn test_rs485_direction_is_enforced() {
        let reply = encode_response(Protocol::Rs485, 1, &Response::EnableState(true)).unwrap();
        assert!(matches!(
            decode(Protocol::Rs485, &reply),
            Err(FrameError::Malformed(_))
        ));
        let request = encode(Protocol::Rs485, 1, &Command::StatusQuery).unwrap();
        assert!(decode_response(Protocol::Rs485, &request).is_err());
    }

    #[test]
    fn test_unknown_code_in_can_payload() {
        let bytes = encode_frame(Protocol::CanSerial, Direction::Request, 1, &[0x42, 0x00]).unwrap();
        assert_eq!(
            decode(Protocol::CanSerial, &bytes),
            Err(FrameError::UnknownCommand(0x42))
        );
    }

    #[test]
    fn test_status_reply_success_flag() {
        assert!(Response::Status { code: 0x83, status: 1 }.is_success());
        assert!(!Response::Status { code: 0x83, status: 0 }.is_success());
        assert!(Response::EnableState(false).is_success());
    }
}
