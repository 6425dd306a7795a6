// Link watchdog
// Note: if teleop crashes or the link drops, nothing else would stop the
// motors; they keep running the last velocity they were given.

use std::time::{Duration, Instant};
use tracing::warn;

/// Why the watchdog wants an emergency stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trip {
    /// No input sample for longer than the timeout
    InputStale { age: Duration },
    /// The transport failed; also reopen it
    TransportError(String),
}

pub struct LinkWatchdog {
    timeout: Duration,
    last_input: Option<Instant>,
    stale: bool,
    transport_fault: Option<String>,
}

impl LinkWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_input: None,
            stale: true, // stale until the first sample
            transport_fault: None,
        }
    }

    /// Record an accepted input sample
    pub fn feed(&mut self, now: Instant) {
        self.last_input = Some(now);
        self.stale = false;
    }

    /// Record a transport failure; reported once by the next [`LinkWatchdog::check`]
    pub fn report_transport_error(&mut self, error: &str) {
        self.transport_fault = Some(error.to_string());
    }

    /// Age of the newest input sample
    pub fn input_age(&self, now: Instant) -> Option<Duration> {
        self.last_input.map(|t| now.saturating_duration_since(t))
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Run once per control tick
    pub fn check(&mut self, now: Instant) -> Option<Trip> {
        if let Some(error) = self.transport_fault.take() {
            return Some(Trip::TransportError(error));
        }

        match self.input_age(now) {
            Some(age) if age <= self.timeout => None,
            Some(age) => {
                if !self.stale {
                    warn!("Input stale ({:?} old), requesting emergency stop", age);
                }
                self.stale = true;
                Some(Trip::InputStale { age })
            }
            None => Some(Trip::InputStale {
                age: Duration::MAX,
            }),
        }
    }
}
