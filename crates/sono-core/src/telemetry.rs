//! Periodic status polling with stale-data and connection-loss tracking.

use crate::frame::AmplifierState;
use crate::link::{AmplifierLink, LinkError, SerialChannel};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TelemetryReading {
    Fresh { state: AmplifierState },
    /// The last poll failed; `last_known` is what the display keeps showing.
    Stale {
        last_known: Option<AmplifierState>,
        failures: u32,
    },
    ConnectionLost {
        last_known: Option<AmplifierState>,
        failures: u32,
    },
}

impl TelemetryReading {
    pub fn state(&self) -> Option<AmplifierState> {
        match *self {
            TelemetryReading::Fresh { state } => Some(state),
            TelemetryReading::Stale { last_known, .. }
            | TelemetryReading::ConnectionLost { last_known, .. } => last_known,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, TelemetryReading::Fresh { .. })
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TelemetryReading::ConnectionLost { .. })
    }
}

#[derive(Debug)]
pub struct TelemetryMonitor {
    threshold: u32,
    failures: u32,
    last_known: Option<AmplifierState>,
    polls: u64,
    failed_polls: u64,
}

impl TelemetryMonitor {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            threshold: failure_threshold.max(1),
            failures: 0,
            last_known: None,
            polls: 0,
            failed_polls: 0,
        }
    }

    pub fn poll<C: SerialChannel>(&mut self, link: &AmplifierLink<C>) -> TelemetryReading {
        self.record(link.poll_state())
    }

    /// Fold one poll result into the monitor.
    pub fn record(&mut self, result: Result<AmplifierState, LinkError>) -> TelemetryReading {
        self.polls += 1;
        match result {
            Ok(state) => {
                if self.failures >= self.threshold {
                    info!(failures = self.failures, "amplifier link recovered");
                }
                self.failures = 0;
                self.last_known = Some(state);
                TelemetryReading::Fresh { state }
            }
            Err(e) => {
                self.failed_polls += 1;
                self.failures = self.failures.saturating_add(1);
                if self.failures >= self.threshold {
                    if self.failures == self.threshold {
                        error!(error = %e, failures = self.failures, "amplifier connection lost");
                    }
                    TelemetryReading::ConnectionLost {
                        last_known: self.last_known,
                        failures: self.failures,
                    }
                } else {
                    warn!(error = %e, failures = self.failures, "status poll failed; keeping last reading");
                    TelemetryReading::Stale {
                        last_known: self.last_known,
                        failures: self.failures,
                    }
                }
            }
        }
    }

    pub fn last_known(&self) -> Option<AmplifierState> {
        self.last_known
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn failed_polls(&self) -> u64 {
        self.failed_polls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn timeout() -> LinkError {
        LinkError::Timeout {
            timeout: Duration::from_millis(10),
            expected: 80,
            received: 0,
        }
    }

    fn state(temperature: f32) -> AmplifierState {
        AmplifierState {
            temperature,
            ..Default::default()
        }
    }

    #[test]
    fn failure_keeps_last_known_state() {
        let mut monitor = TelemetryMonitor::new(3);
        assert!(monitor.record(Ok(state(30.0))).is_fresh());
        let reading = monitor.record(Err(timeout()));
        assert_eq!(
            reading,
            TelemetryReading::Stale {
                last_known: Some(state(30.0)),
                failures: 1
            }
        );
        assert_eq!(reading.state(), Some(state(30.0)));
    }

    #[test]
    fn threshold_escalates_to_connection_lost() {
        let mut monitor = TelemetryMonitor::new(3);
        assert!(!monitor.record(Err(timeout())).is_connection_lost());
        assert!(!monitor.record(Err(timeout())).is_connection_lost());
        assert!(monitor.record(Err(timeout())).is_connection_lost());
        assert!(monitor.record(Err(timeout())).is_connection_lost());
        assert_eq!(monitor.failed_polls(), 4);
    }

    #[test]
    fn success_resets_the_failure_run() {
        let mut monitor = TelemetryMonitor::new(2);
        monitor.record(Err(timeout()));
        monitor.record(Err(timeout()));
        assert_eq!(monitor.consecutive_failures(), 2);
        assert!(monitor.record(Ok(state(26.0))).is_fresh());
        assert_eq!(monitor.consecutive_failures(), 0);
        assert!(!monitor.record(Err(timeout())).is_connection_lost());
    }
}
