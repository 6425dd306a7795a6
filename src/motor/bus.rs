// Typed motor operations on top of the link session
//
// Configuration writes read their acknowledgement when one arrives; the
// drive answers status 1 on success and 0 on failure.

use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

use super::command::{Command, HoldingPercent, PidGains, PidMode, Response};
use super::error::Result;
use super::frame::FrameError;
use super::link::LinkSession;

/// Gap between the two PID sub-command writes
const PID_WRITE_GAP: Duration = Duration::from_millis(20);

impl LinkSession {
    /// Run at a signed speed; the magnitude saturates at the drive limit
    pub fn set_velocity(&mut self, address: u16, rpm: i32, acceleration: u8) -> Result<()> {
        self.send(address, &Command::velocity(rpm, acceleration))
    }

    /// Write the enable flag without waiting for an acknowledgement
    pub fn set_enabled(&mut self, address: u16, enabled: bool) -> Result<()> {
        self.send(address, &Command::Enable(enabled))
    }

    /// Working current in mA, clamped to 0..=3000.
    /// `Some(success)` when the drive acknowledged, `None` when it stayed silent.
    pub fn set_working_current(&mut self, address: u16, milliamps: u32) -> Result<Option<bool>> {
        self.write_config(address, &Command::working_current(milliamps))
    }

    /// Holding current as a percentage of working current (10, 20, ..., 90)
    pub fn set_holding_current(&mut self, address: u16, percent: u8) -> Result<Option<bool>> {
        let percent = HoldingPercent::new(percent)?;
        self.write_config(address, &Command::HoldingCurrent(percent))
    }

    /// Write kp/ki then kd/kv for the selected loop
    pub fn set_pid_gains(
        &mut self,
        address: u16,
        mode: PidMode,
        gains: PidGains,
    ) -> Result<[Option<bool>; 2]> {
        let [first, second] = gains.pairs();
        let kp_ki = self.write_config(address, &Command::PidGains { mode, pair: first })?;
        sleep(PID_WRITE_GAP);
        let kd_kv = self.write_config(address, &Command::PidGains { mode, pair: second })?;
        Ok([kp_ki, kd_kv])
    }

    /// Read back the enable state. `NoResponse` when the drive does not answer in time.
    pub fn query_enabled(&mut self, address: u16) -> Result<bool> {
        match self.request(address, &Command::StatusQuery)? {
            Response::EnableState(enabled) => Ok(enabled),
            other => Err(FrameError::Malformed(format!("{other:?} answering a status query")).into()),
        }
    }

    /// Read the accumulated encoder position in counts (16384 per revolution)
    pub fn read_encoder(&mut self, address: u16) -> Result<i64> {
        match self.request(address, &Command::ReadEncoder)? {
            Response::EncoderPosition(counts) => Ok(counts),
            other => Err(FrameError::Malformed(format!("{other:?} answering an encoder read")).into()),
        }
    }

    fn write_config(&mut self, address: u16, command: &Command) -> Result<Option<bool>> {
        let ack = self.exchange(address, command)?;
        match ack {
            Some(response) if !response.is_success() => {
                warn!("Motor {} rejected {:?}", address, command);
                Ok(Some(false))
            }
            Some(_) => Ok(Some(true)),
            None => {
                debug!("Motor {} did not acknowledge {:?}", address, command);
                Ok(None)
            }
        }
    }
}
