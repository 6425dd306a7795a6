// Stream deframer: turns the raw serial byte stream into validated frames
//
// Scan for a start byte, read the header to learn the frame length, wait for
// that many bytes, then validate. Anything that fails costs exactly one byte
// so a false start marker in line noise never swallows the real frame behind it.

use tracing::trace;

use super::frame::{check_header, decode_frame, Direction, Frame, HeaderCheck, Protocol};

/// Receive buffer cap; oldest bytes are dropped beyond this
pub const MAX_BUFFERED: usize = 4096;

pub struct Deframer {
    protocol: Protocol,
    /// Only frames travelling this way are accepted (RS485 only)
    accept: Option<Direction>,
    buf: Vec<u8>,
    discarded: u64,
}

impl Deframer {
    /// Accepts frames in either direction
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            accept: None,
            buf: Vec::with_capacity(256),
            discarded: 0,
        }
    }

    /// Accepts only frames travelling in `direction`. On RS485 a stray
    /// start byte of the other direction is then treated as noise.
    pub fn new_for(protocol: Protocol, direction: Direction) -> Self {
        Self {
            accept: Some(direction),
            ..Self::new(protocol)
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Append received bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_BUFFERED {
            let excess = self.buf.len() - MAX_BUFFERED;
            self.drop_front(excess);
        }
    }

    /// Extract the next complete, valid frame, or `None` until more bytes arrive
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            // Skip to the first byte that can start a frame
            let start = (0..self.buf.len())
                .find(|&i| self.header(&self.buf[i..]) != HeaderCheck::NotAFrame);
            match start {
                Some(0) => {}
                Some(start) => self.drop_front(start),
                None => {
                    let all = self.buf.len();
                    self.drop_front(all);
                    return None;
                }
            }

            let total = match self.header(&self.buf) {
                HeaderCheck::Length(total) => total,
                HeaderCheck::NeedMore => return None,
                HeaderCheck::NotAFrame => {
                    self.drop_front(1);
                    continue;
                }
            };

            if self.buf.len() < total {
                // A complete frame further on proves this start byte was noise
                match self.later_complete_frame() {
                    Some(next) => {
                        trace!("Deframer: skipping {} bytes of false start", next);
                        self.drop_front(next);
                        continue;
                    }
                    None => return None,
                }
            }

            match decode_frame(self.protocol, &self.buf[..total]) {
                Ok(frame) => {
                    self.buf.drain(..total);
                    return Some(frame);
                }
                Err(e) => {
                    trace!("Deframer: resync after {}", e);
                    self.drop_front(1);
                }
            }
        }
    }

    /// Drain every frame currently available
    pub fn frames(&mut self) -> impl Iterator<Item = Frame> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    /// Bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes thrown away while resynchronizing
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn clear(&mut self) {
        let all = self.buf.len();
        self.drop_front(all);
    }

    fn drop_front(&mut self, n: usize) {
        self.buf.drain(..n);
        self.discarded += n as u64;
    }

    fn header(&self, buf: &[u8]) -> HeaderCheck {
        if let (Some(direction), Some(&first)) = (self.accept, buf.first()) {
            if self.protocol.start_byte(direction).is_some_and(|start| start != first) {
                return HeaderCheck::NotAFrame;
            }
        }
        check_header(self.protocol, buf)
    }

    /// Offset of the first later start byte that begins a complete valid frame
    fn later_complete_frame(&self) -> Option<usize> {
        (1..self.buf.len()).find(|&i| {
            let rest = &self.buf[i..];
            match self.header(rest) {
                HeaderCheck::Length(total) if total <= rest.len() => {
                    decode_frame(self.protocol, &rest[..total]).is_ok()
                }
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::command::{encode, encode_response, Command, Response};

    fn can_frame(address: u16, rpm: i32) -> Vec<u8> {
        encode(Protocol::CanSerial, address, &Command::velocity(rpm, 2)).unwrap()
    }

    #[test]
    fn test_single_frame() {
        let mut deframer = Deframer::new(Protocol::CanSerial);
        deframer.feed(&can_frame(1, 100));
        let frame = deframer.next_frame().unwrap();
        assert_eq!(frame.address, 1);
        assert_eq!(frame.payload, vec![0xF6, 0x00, 0x64, 0x02]);
        assert!(deframer.next_frame().is_none());
        assert_eq!(deframer.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let bytes = can_frame(3, -20);
        let mut deframer = Deframer::new(Protocol::CanSerial);
        deframer.feed(&bytes[..4]);
        assert!(deframer.next_frame().is_none());
        assert_eq!(deframer.buffered(), 4);
        deframer.feed(&bytes[4..]);
        assert_eq!(deframer.next_frame().unwrap().address, 3);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut stream = can_frame(1, 10);
        stream.extend(can_frame(2, 20));
        let mut deframer = Deframer::new(Protocol::CanSerial);
        let mut seen = Vec::new();
        for b in stream {
            deframer.feed(&[b]);
            seen.extend(deframer.frames().map(|f| f.address));
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_resync_through_noise() {
        let noise_a = [0x00, 0x13, 0xFF, 0x55, 0xC5, 0x01];
        let noise_b = [0x42, 0x99, 0x55, 0x55, 0x10];
        let mut stream = noise_a.to_vec();
        stream.extend(can_frame(1, 100));
        stream.extend(noise_b);
        stream.extend(can_frame(2, -100));
        stream.extend(noise_a);

        let mut deframer = Deframer::new(Protocol::CanSerial);
        deframer.feed(&stream);
        let frames: Vec<_> = deframer.frames().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].address, 1);
        assert_eq!(frames[1].address, 2);
        assert!(deframer.discarded() > 0);
    }

    #[test]
    fn test_false_start_marker_does_not_hide_frame() {
        // 0xAA 0xC8 claims a 13-byte frame that overlaps the genuine one
        let mut stream = vec![0xAA, 0xC8];
        stream.extend(can_frame(5, 42));
        let mut deframer = Deframer::new(Protocol::CanSerial);
        deframer.feed(&stream);
        let frame = deframer.next_frame().expect("genuine frame recovered");
        assert_eq!(frame.address, 5);
    }

    #[test]
    fn test_corrupt_frame_drops_only_start_byte() {
        let mut corrupt = can_frame(1, 100);
        corrupt[6] ^= 0x01; // break the checksum
        let mut stream = corrupt;
        stream.extend(can_frame(2, 100));
        let mut deframer = Deframer::new(Protocol::CanSerial);
        deframer.feed(&stream);
        let frames: Vec<_> = deframer.frames().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].address, 2);
    }

    #[test]
    fn test_rs485_stream() {
        let mut stream = vec![0x01, 0x02];
        stream.extend(encode(Protocol::Rs485, 1, &Command::StatusQuery).unwrap());
        stream.extend([0xFA, 0x01]); // noise that looks like a start
        stream.extend(encode_response(Protocol::Rs485, 1, &Response::EncoderPosition(-5)).unwrap());
        stream.extend(encode_response(Protocol::Rs485, 2, &Response::EnableState(true)).unwrap());

        let mut deframer = Deframer::new(Protocol::Rs485);
        deframer.feed(&stream);
        let frames: Vec<_> = deframer.frames().collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, vec![0x3A]);
        assert_eq!(frames[1].payload[0], 0x31);
        assert_eq!(frames[2].address, 2);
    }

    #[test]
    fn test_rs485_reply_start_in_noise_does_not_hide_request() {
        // 0xFB followed by this request reads as a checksum-valid 0x97 reply
        let request = encode(Protocol::Rs485, 0x97, &Command::velocity(-512, 2)).unwrap();
        assert_eq!(&request[..4], &[0xFA, 0x97, 0xF6, 0x82]);
        let mut stream = vec![0xFB];
        stream.extend(&request);

        let mut deframer = Deframer::new_for(Protocol::Rs485, Direction::Request);
        deframer.feed(&stream);
        let frame = deframer.next_frame().unwrap();
        assert_eq!(frame.address, 0x97);
        assert_eq!(frame.direction, Some(Direction::Request));
        assert_eq!(frame.payload, Command::velocity(-512, 2).payload());
        assert!(deframer.next_frame().is_none());
    }

    #[test]
    fn test_reply_deframer_skips_requests() {
        let mut stream = encode(Protocol::Rs485, 1, &Command::StatusQuery).unwrap();
        stream.extend(encode_response(Protocol::Rs485, 1, &Response::EnableState(true)).unwrap());

        let mut deframer = Deframer::new_for(Protocol::Rs485, Direction::Reply);
        deframer.feed(&stream);
        let frames: Vec<_> = deframer.frames().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].direction, Some(Direction::Reply));
    }

    #[test]
    fn test_direction_filter_ignored_on_can() {
        let mut deframer = Deframer::new_for(Protocol::CanSerial, Direction::Reply);
        deframer.feed(&can_frame(1, 100));
        assert_eq!(deframer.next_frame().unwrap().address, 1);
    }

    #[test]
    fn test_pure_noise_is_discarded() {
        let mut deframer = Deframer::new(Protocol::CanSerial);
        deframer.feed(&[0x01, 0x02, 0x03, 0x55, 0x00]);
        assert!(deframer.next_frame().is_none());
        assert_eq!(deframer.buffered(), 0);
        assert_eq!(deframer.discarded(), 5);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut deframer = Deframer::new(Protocol::CanSerial);
        // A header that keeps waiting for more bytes
        deframer.feed(&[0xAA, 0xC8]);
        deframer.feed(&vec![0x00; MAX_BUFFERED * 2]);
        assert!(deframer.buffered() <= MAX_BUFFERED);
        assert!(deframer.next_frame().is_none());
    }
}
