// Wire framing for the two serial protocols spoken by the MKS SERVO42D drives
//
// CAN-over-serial adapter: [0xAA, 0xC0|DLC, ID_LO, ID_HI, data..., CRC, 0x55]
//   DLC counts the data bytes plus the CAN CRC byte, CRC = (ID + sum(data)) & 0xFF
// RS485 direct:            [0xFA|0xFB, ADDR, CMD, data..., CHK]
//   CHK = sum(all preceding bytes) & 0xFF, 0xFA from host, 0xFB from motor
//
// `payload` below always starts with the command code.

use serde::{Deserialize, Serialize};

use super::command::rs485_data_len;

/// CAN adapter start/end markers
pub const CAN_HEADER: u8 = 0xAA;
pub const CAN_TAIL: u8 = 0x55;
const CAN_CTRL_TAG: u8 = 0xC0;
const CAN_CTRL_MASK: u8 = 0xF0;

/// DLC is 4 bits but classic CAN carries at most 8 bytes, one of them the CRC
pub const CAN_MAX_DLC: usize = 8;
pub const CAN_MAX_PAYLOAD: usize = CAN_MAX_DLC - 1;
/// 11-bit standard identifier
pub const CAN_MAX_ID: u16 = 0x7FF;

/// RS485 start bytes
pub const RS485_REQUEST: u8 = 0xFA;
pub const RS485_REPLY: u8 = 0xFB;
pub const RS485_MAX_ADDRESS: u16 = 0xFF;
pub const RS485_MAX_PAYLOAD: usize = 16;

/// Which wire format the serial link carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// USB-CAN adapter in variable-length encapsulation mode
    #[default]
    CanSerial,
    /// Direct addressed protocol over an RS485 bus
    Rs485,
}

impl Protocol {
    pub fn max_address(self) -> u16 {
        match self {
            Protocol::CanSerial => CAN_MAX_ID,
            Protocol::Rs485 => RS485_MAX_ADDRESS,
        }
    }

    pub fn max_payload(self) -> usize {
        match self {
            Protocol::CanSerial => CAN_MAX_PAYLOAD,
            Protocol::Rs485 => RS485_MAX_PAYLOAD,
        }
    }

    /// Motor addresses are 1..=max, 0 is the broadcast address and never assigned
    pub fn check_address(self, address: u16) -> Result<(), FrameError> {
        if address == 0 || address > self.max_address() {
            return Err(FrameError::InvalidArgument(format!(
                "address {address} outside 1..={} for {self:?}",
                self.max_address()
            )));
        }
        Ok(())
    }

    /// Start byte for frames travelling in `direction`; CAN frames do not mark it
    pub fn start_byte(self, direction: Direction) -> Option<u8> {
        match (self, direction) {
            (Protocol::CanSerial, _) => None,
            (Protocol::Rs485, Direction::Request) => Some(RS485_REQUEST),
            (Protocol::Rs485, Direction::Reply) => Some(RS485_REPLY),
        }
    }

    /// Bytes that may start a frame on this link
    fn is_start(self, byte: u8) -> bool {
        match self {
            Protocol::CanSerial => byte == CAN_HEADER,
            Protocol::Rs485 => byte == RS485_REQUEST || byte == RS485_REPLY,
        }
    }
}

/// Host -> motor or motor -> host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Reply,
}

/// One checksum-valid frame, stripped of markers and checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u16,
    /// Only the RS485 format carries the direction on the wire
    pub direction: Option<Direction>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Command code, the first payload byte
    pub fn code(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Codec errors. Everything except `InvalidArgument` is line noise and recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Checksum mismatch for address {address}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { address: u16, expected: u8, actual: u8 },

    #[error("Truncated frame: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Unknown command code 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// What the header at the front of a buffer says about the frame length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCheck {
    /// Not enough bytes to read the header yet
    NeedMore,
    /// The leading byte cannot start a frame of this protocol
    NotAFrame,
    /// Plausible header; the whole frame is this many bytes
    Length(usize),
}

/// CAN adapter checksum: identifier plus data bytes, modulo 256
pub fn can_checksum(id: u16, data: &[u8]) -> u8 {
    data.iter().fold((id & 0xFF) as u8, |acc, &b| acc.wrapping_add(b))
}

/// RS485 checksum: every byte before the checksum, modulo 256
pub fn rs485_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build the wire bytes for one frame
pub fn encode_frame(
    protocol: Protocol,
    direction: Direction,
    address: u16,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    protocol.check_address(address)?;
    if payload.is_empty() {
        return Err(FrameError::InvalidArgument("empty payload".to_string()));
    }
    if payload.len() > protocol.max_payload() {
        return Err(FrameError::InvalidArgument(format!(
            "payload of {} bytes exceeds {} for {protocol:?}",
            payload.len(),
            protocol.max_payload()
        )));
    }

    let frame = match protocol {
        Protocol::CanSerial => {
            let dlc = payload.len() + 1; // + CAN CRC
            let mut frame = Vec::with_capacity(5 + dlc);
            frame.push(CAN_HEADER);
            frame.push(CAN_CTRL_TAG | dlc as u8);
            frame.extend_from_slice(&address.to_le_bytes());
            frame.extend_from_slice(payload);
            frame.push(can_checksum(address, payload));
            frame.push(CAN_TAIL);
            frame
        }
        Protocol::Rs485 => {
            let start = match direction {
                Direction::Request => RS485_REQUEST,
                Direction::Reply => RS485_REPLY,
            };
            let mut frame = Vec::with_capacity(3 + payload.len());
            frame.push(start);
            frame.push(address as u8);
            frame.extend_from_slice(payload);
            frame.push(rs485_checksum(&frame));
            frame
        }
    };
    Ok(frame)
}

/// Inspect the header at the front of `buf`
pub fn check_header(protocol: Protocol, buf: &[u8]) -> HeaderCheck {
    let Some(&first) = buf.first() else {
        return HeaderCheck::NeedMore;
    };
    if !protocol.is_start(first) {
        return HeaderCheck::NotAFrame;
    }

    match protocol {
        Protocol::CanSerial => {
            let Some(&ctrl) = buf.get(1) else {
                return HeaderCheck::NeedMore;
            };
            if ctrl & CAN_CTRL_MASK != CAN_CTRL_TAG {
                return HeaderCheck::NotAFrame;
            }
            let dlc = (ctrl & 0x0F) as usize;
            // Every motor frame has at least a code byte plus the CRC
            if !(2..=CAN_MAX_DLC).contains(&dlc) {
                return HeaderCheck::NotAFrame;
            }
            HeaderCheck::Length(5 + dlc)
        }
        Protocol::Rs485 => {
            let Some(&code) = buf.get(2) else {
                return HeaderCheck::NeedMore;
            };
            let direction = if first == RS485_REQUEST {
                Direction::Request
            } else {
                Direction::Reply
            };
            match rs485_data_len(direction, code) {
                Some(n) => HeaderCheck::Length(4 + n),
                None => HeaderCheck::NotAFrame,
            }
        }
    }
}

/// Validate and strip one complete frame. `bytes` must hold exactly one frame.
pub fn decode_frame(protocol: Protocol, bytes: &[u8]) -> Result<Frame, FrameError> {
    match protocol {
        Protocol::CanSerial => decode_can(bytes),
        Protocol::Rs485 => decode_rs485(bytes),
    }
}

fn check_exact_len(bytes: &[u8], needed: usize) -> Result<(), FrameError> {
    if bytes.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            actual: bytes.len(),
        });
    }
    if bytes.len() > needed {
        return Err(FrameError::Malformed(format!(
            "{} trailing bytes",
            bytes.len() - needed
        )));
    }
    Ok(())
}

fn decode_can(bytes: &[u8]) -> Result<Frame, FrameError> {
    let total = match check_header(Protocol::CanSerial, bytes) {
        HeaderCheck::Length(total) => total,
        HeaderCheck::NeedMore => {
            return Err(FrameError::Truncated {
                needed: 2,
                actual: bytes.len(),
            });
        }
        HeaderCheck::NotAFrame => {
            return Err(FrameError::Malformed(format!(
                "bad CAN header {:02X?}",
                &bytes[..bytes.len().min(2)]
            )));
        }
    };
    check_exact_len(bytes, total)?;

    if bytes[total - 1] != CAN_TAIL {
        return Err(FrameError::Malformed(format!(
            "bad tail byte 0x{:02X}",
            bytes[total - 1]
        )));
    }

    let address = u16::from_le_bytes([bytes[2], bytes[3]]);
    if address > CAN_MAX_ID {
        return Err(FrameError::Malformed(format!(
            "identifier 0x{address:X} exceeds 11 bits"
        )));
    }

    let payload = &bytes[4..total - 2];
    let actual = bytes[total - 2];
    let expected = can_checksum(address, payload);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch {
            address,
            expected,
            actual,
        });
    }

    Ok(Frame {
        address,
        direction: None,
        payload: payload.to_vec(),
    })
}

fn decode_rs485(bytes: &[u8]) -> Result<Frame, FrameError> {
    let direction = match bytes.first() {
        Some(&RS485_REQUEST) => Direction::Request,
        Some(&RS485_REPLY) => Direction::Reply,
        Some(&other) => {
            return Err(FrameError::Malformed(format!(
                "bad RS485 start byte 0x{other:02X}"
            )));
        }
        None => {
            return Err(FrameError::Truncated {
                needed: 4,
                actual: 0,
            });
        }
    };
    if bytes.len() < 4 {
        return Err(FrameError::Truncated {
            needed: 4,
            actual: bytes.len(),
        });
    }

    let code = bytes[2];
    let data_len = rs485_data_len(direction, code).ok_or(FrameError::UnknownCommand(code))?;
    let total = 4 + data_len;
    check_exact_len(bytes, total)?;

    let address = bytes[1] as u16;
    let actual = bytes[total - 1];
    let expected = rs485_checksum(&bytes[..total - 1]);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch {
            address,
            expected,
            actual,
        });
    }

    Ok(Frame {
        address,
        direction: Some(direction),
        payload: bytes[2..total - 1].to_vec(),
    })
}
