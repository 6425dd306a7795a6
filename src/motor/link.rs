// Link session: the one owner of the serial transport
//
// Writes are fire-and-forget; replies are optional on these drives (the CAN
// adapter can be configured to drop them), so every read is bounded by the
// response timeout and a missing reply is reported, never retried here.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::command::{encode, response_from_frame, Command, Response};
use super::deframer::Deframer;
use super::error::{MotorError, Result};
use super::frame::{Direction, Frame, Protocol};

/// Default serial configuration for the USB-CAN adapter
pub const DEFAULT_BAUDRATE: u32 = 2_000_000;
/// Per-read blocking budget; short so the response deadline stays accurate
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5;

const READ_CHUNK: usize = 64;

/// Byte stream the session writes frames to and reads replies from
pub trait Transport: Read + Write + Send {
    /// Discard bytes already received but not yet read
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens (and reopens) the transport
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn Transport>>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}

/// Serial port connector
pub struct SerialConnector {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&mut self) -> Result<Box<dyn Transport>> {
        let port = serialport::new(&self.port, self.baud_rate)
            .timeout(self.read_timeout)
            .open()?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud_rate)
    }
}

/// Timing knobs for one link
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    /// How long to wait for a reply after a request
    pub response_timeout: Duration,
    /// Pause after every write, for buses that need turnaround time
    pub inter_frame_gap: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(40),
            inter_frame_gap: Duration::ZERO,
        }
    }
}

pub struct LinkSession {
    protocol: Protocol,
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    deframer: Deframer,
    timing: LinkTiming,
    last_exchange: Option<Instant>,
    last_tx: Option<Vec<u8>>,
    last_rx: Option<Frame>,
    missed_replies: u64,
}

impl LinkSession {
    /// Create a closed session; call [`LinkSession::open`] before use
    pub fn new(protocol: Protocol, connector: Box<dyn Connector>, timing: LinkTiming) -> Self {
        Self {
            protocol,
            connector,
            transport: None,
            deframer: Deframer::new_for(protocol, Direction::Reply),
            timing,
            last_exchange: None,
            last_tx: None,
            last_rx: None,
            missed_replies: 0,
        }
    }

    /// Open the transport, closing any previous one first
    pub fn open(&mut self) -> Result<()> {
        self.close();
        info!("Opening motor link on {}", self.connector.describe());
        let mut transport = self.connector.connect()?;
        if let Err(e) = transport.clear_input() {
            warn!("Could not flush stale input: {}", e);
        }
        self.transport = Some(transport);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            info!("Closed motor link on {}", self.connector.describe());
        }
        self.deframer.clear();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Encode and write one command
    pub fn send(&mut self, address: u16, command: &Command) -> Result<()> {
        let bytes = encode(self.protocol, address, command)?;
        let transport = self.transport.as_mut().ok_or(MotorError::LinkClosed)?;

        let written = transport.write_all(&bytes).and_then(|_| transport.flush());
        if let Err(e) = written {
            warn!("Write to motor {} failed: {}", address, e);
            self.close();
            return Err(e.into());
        }

        debug!("TX motor {}: {:?} [{}]", address, command, hex::encode_upper(&bytes));
        self.last_tx = Some(bytes);
        self.last_exchange = Some(Instant::now());

        if !self.timing.inter_frame_gap.is_zero() {
            sleep(self.timing.inter_frame_gap);
        }
        Ok(())
    }

    /// Send a command and wait for the matching reply (same address and code)
    pub fn request(&mut self, address: u16, command: &Command) -> Result<Response> {
        let expected = command.code();
        self.discard_input()?;
        self.send(address, command)?;

        let deadline = Instant::now() + self.timing.response_timeout;
        loop {
            while let Some(frame) = self.deframer.next_frame() {
                match response_from_frame(&frame) {
                    Ok(response) if frame.address == address && response.code() == expected => {
                        debug!("RX motor {}: {:?}", address, response);
                        self.last_rx = Some(frame);
                        self.last_exchange = Some(Instant::now());
                        return Ok(response);
                    }
                    Ok(other) => debug!("Ignoring {:?} from motor {}", other, frame.address),
                    Err(e) => debug!("Ignoring frame from motor {}: {}", frame.address, e),
                }
            }

            if Instant::now() >= deadline {
                self.missed_replies += 1;
                return Err(MotorError::NoResponse {
                    address,
                    code: expected,
                });
            }
            self.read_available()?;
        }
    }

    /// Like [`LinkSession::request`] but a missing reply is `Ok(None)`
    pub fn exchange(&mut self, address: u16, command: &Command) -> Result<Option<Response>> {
        match self.request(address, command) {
            Ok(response) => Ok(Some(response)),
            Err(MotorError::NoResponse { address, code }) => {
                debug!("No reply from motor {} to 0x{:02X}", address, code);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Consume whatever replies have arrived (e.g. velocity acks) without waiting for more
    pub fn drain_replies(&mut self) -> Result<usize> {
        self.read_available()?;
        let mut count = 0;
        while let Some(frame) = self.deframer.next_frame() {
            if let Ok(response) = response_from_frame(&frame) {
                if !response.is_success() {
                    warn!("Motor {} reported failure for 0x{:02X}", frame.address, response.code());
                }
                self.last_rx = Some(frame);
                count += 1;
            }
        }
        Ok(count)
    }

    /// Last frame written, wire bytes
    pub fn last_tx(&self) -> Option<&[u8]> {
        self.last_tx.as_deref()
    }

    /// Last reply accepted
    pub fn last_rx(&self) -> Option<&Frame> {
        self.last_rx.as_ref()
    }

    /// Time of the last successful write or matched reply
    pub fn last_exchange(&self) -> Option<Instant> {
        self.last_exchange
    }

    pub fn missed_replies(&self) -> u64 {
        self.missed_replies
    }

    /// Bytes dropped by the deframer while resynchronizing
    pub fn discarded_bytes(&self) -> u64 {
        self.deframer.discarded()
    }

    fn discard_input(&mut self) -> Result<()> {
        self.deframer.clear();
        let transport = self.transport.as_mut().ok_or(MotorError::LinkClosed)?;
        if let Err(e) = transport.clear_input() {
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    /// One bounded read into the deframer
    fn read_available(&mut self) -> Result<usize> {
        let transport = self.transport.as_mut().ok_or(MotorError::LinkClosed)?;
        let mut chunk = [0u8; READ_CHUNK];
        match transport.read(&mut chunk) {
            Ok(n) => {
                self.deframer.feed(&chunk[..n]);
                Ok(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => {
                warn!("Read from motor link failed: {}", e);
                self.close();
                Err(e.into())
            }
        }
    }
}
