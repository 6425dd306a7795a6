// Simulated motor bus behind the crate's Transport/Connector traits
//
// Frames written by the host are parsed with the crate's own deframer and
// answered like MKS drives would: status 1 for writes, the enable flag for
// status queries, a fixed encoder value for encoder reads.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use danibot_zenoh_runtime::config::{Config, GroupConfig};
use danibot_zenoh_runtime::motor::{
    encode_response, Command, Connector, Deframer, Direction, LinkSession, LinkTiming, MotorDriver,
    MotorError, Protocol, Response, Side, Transport,
};

#[derive(Debug, Default)]
pub struct BusState {
    /// Every command received, in order
    pub log: Vec<(u16, Command)>,
    pub enabled: HashMap<u16, bool>,
    /// Bytes waiting to be read by the host
    pub rx: VecDeque<u8>,
    /// Drives acknowledge Enable(true) but stay disabled
    pub ignore_enable: bool,
    /// Drives answer at all
    pub replies: bool,
    pub fail_writes: bool,
    pub refuse_connect: bool,
    /// Garbage sent ahead of every reply
    pub noise: Vec<u8>,
    pub connects: u32,
    pub encoder: i64,
}

#[derive(Clone)]
pub struct SimBus {
    protocol: Protocol,
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new(protocol: Protocol) -> Self {
        let state = BusState {
            replies: true,
            ..BusState::default()
        };
        Self {
            protocol,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut BusState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(SimConnector { bus: self.clone() })
    }

    pub fn link(&self, timing: LinkTiming) -> LinkSession {
        LinkSession::new(self.protocol, self.connector(), timing)
    }

    /// Driver over this bus, already open
    pub fn driver(&self, config: &Config) -> MotorDriver {
        let mut driver = MotorDriver::new(self.link(config.link_timing()), config);
        driver.open().unwrap();
        driver
    }

    pub fn commands(&self) -> Vec<(u16, Command)> {
        self.with_state(|s| s.log.clone())
    }

    pub fn clear_log(&self) {
        self.with_state(|s| s.log.clear());
    }

    pub fn count(&self, address: u16, command: Command) -> usize {
        self.commands()
            .iter()
            .filter(|&&(a, c)| a == address && c == command)
            .count()
    }
}

struct SimConnector {
    bus: SimBus,
}

impl Connector for SimConnector {
    fn connect(&mut self) -> Result<Box<dyn Transport>, MotorError> {
        let refused = self.bus.with_state(|s| {
            if !s.refuse_connect {
                s.connects += 1;
            }
            s.refuse_connect
        });
        if refused {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device").into());
        }
        Ok(Box::new(SimPort {
            deframer: Deframer::new_for(self.bus.protocol, Direction::Request),
            bus: self.bus.clone(),
        }))
    }

    fn describe(&self) -> String {
        "simulated bus".to_string()
    }
}

struct SimPort {
    bus: SimBus,
    deframer: Deframer,
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let protocol = self.bus.protocol;
        let mut state = self.bus.state.lock().unwrap();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }

        self.deframer.feed(buf);
        while let Some(frame) = self.deframer.next_frame() {
            let Ok(command) = Command::from_payload(&frame.payload) else {
                continue;
            };
            let address = frame.address;
            state.log.push((address, command));

            let response = match command {
                Command::Enable(on) => {
                    if !(on && state.ignore_enable) {
                        state.enabled.insert(address, on);
                    }
                    Response::Status {
                        code: command.code(),
                        status: 1,
                    }
                }
                Command::StatusQuery => {
                    Response::EnableState(state.enabled.get(&address).copied().unwrap_or(false))
                }
                Command::ReadEncoder => Response::EncoderPosition(state.encoder),
                _ => Response::Status {
                    code: command.code(),
                    status: 1,
                },
            };
            if state.replies {
                let noise = state.noise.clone();
                state.rx.extend(noise);
                let bytes = encode_response(protocol, address, &response).unwrap();
                state.rx.extend(bytes);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.bus.state.lock().unwrap();
        if state.rx.is_empty() {
            drop(state);
            // Like a serial read timing out
            sleep(Duration::from_millis(1));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Transport for SimPort {
    fn clear_input(&mut self) -> io::Result<()> {
        self.bus.state.lock().unwrap().rx.clear();
        Ok(())
    }
}

/// Default left/right groups with every delay set to zero
pub fn fast_config(protocol: Protocol) -> Config {
    let mut config = Config::with_default_groups();
    config.transport.protocol = protocol;
    config.transport.response_timeout_ms = 5;
    config.transport.reopen_interval_ms = 0;
    config.safety.retry_delay_ms = 0;
    config.safety.step_delay_ms = 0;
    config
}

/// One group with a single motor
pub fn single_motor_config(address: u16) -> Config {
    let mut config = fast_config(Protocol::CanSerial);
    config.groups = vec![GroupConfig {
        name: "solo".to_string(),
        side: Side::Right,
        addresses: vec![address],
    }];
    config
}
