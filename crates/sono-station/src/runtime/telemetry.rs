use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use sono_core::{
    AdcChannel, AmplifierLink, ControllerState, ControllerStatus, SerialChannel,
    TelemetryMonitor, TelemetryReading, Thermistor, TimeBase,
};
use sono_io::metrics::{
    init_metrics, serve_metrics, ACTUATION_STATE, AMP_ENABLED, AMP_FREQUENCY, AMP_LOAD_POWER,
    AMP_TEMPERATURE, AMP_VOLTAGE, CONNECTION_LOST, MOTOR_PULSES, MOTOR_RPM, MOTOR_RUNNING,
    SESSION_ELAPSED, STATUS_POLLS, STATUS_POLL_FAILURES, TARGET_VOLTAGE, THERMISTOR_TEMP,
};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().and_then(|addr| {
        info!(addr = %addr, "starting metrics server");
        match serve_metrics(addr.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(addr = %addr, error = %e, "metrics server thread failed to start");
                None
            }
        }
    })
}

/// Latest amplifier and sensor readings, published by the poller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub reading: Option<TelemetryReading>,
    pub bioreactor_c: Option<f64>,
    pub polled_at_s: f64,
    /// Incremented every time the link crosses into the lost state.
    pub lost_events: u64,
}

impl TelemetrySnapshot {
    /// Temperature shown on the trend: the bioreactor probe when fitted,
    /// otherwise the amplifier's own sensor.
    pub fn trend_celsius(&self) -> Option<f64> {
        self.bioreactor_c.or_else(|| {
            self.reading
                .and_then(|r| r.state())
                .map(|s| f64::from(s.temperature))
        })
    }
}

pub struct ThermistorInput {
    pub adc: Box<dyn AdcChannel>,
    pub model: Thermistor,
}

pub fn start_poller<C: SerialChannel + 'static>(
    link: Arc<AmplifierLink<C>>,
    mut monitor: TelemetryMonitor,
    mut thermistor: Option<ThermistorInput>,
    interval: Duration,
    published: Arc<ArcSwap<TelemetrySnapshot>>,
    timebase: TimeBase,
    shutdown: Receiver<()>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("telemetry".to_string())
        .spawn(move || {
            let mut lost_events = 0u64;
            let mut was_lost = false;
            loop {
                let reading = monitor.poll(&link);
                STATUS_POLLS.inc();
                match reading {
                    TelemetryReading::Fresh { state } => {
                        AMP_VOLTAGE.set(f64::from(state.voltage));
                        AMP_FREQUENCY.set(f64::from(state.frequency));
                        AMP_LOAD_POWER.set(f64::from(state.load_power));
                        AMP_TEMPERATURE.set(f64::from(state.temperature));
                        AMP_ENABLED.set(i64::from(state.enabled));
                    }
                    TelemetryReading::Stale { .. } | TelemetryReading::ConnectionLost { .. } => {
                        STATUS_POLL_FAILURES.inc();
                    }
                }
                let lost = reading.is_connection_lost();
                if lost && !was_lost {
                    lost_events += 1;
                    CONNECTION_LOST.inc();
                }
                was_lost = lost;

                let bioreactor_c = thermistor.as_mut().and_then(|input| {
                    match input.model.read(input.adc.as_mut()) {
                        Ok(c) => {
                            THERMISTOR_TEMP.set(c);
                            Some(c)
                        }
                        Err(e) => {
                            warn!(error = %e, "thermistor read failed");
                            None
                        }
                    }
                });

                published.store(Arc::new(TelemetrySnapshot {
                    reading: Some(reading),
                    bioreactor_c,
                    polled_at_s: timebase.elapsed().as_secs_f64(),
                    lost_events,
                }));

                match shutdown.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!(polls = monitor.polls(), failed = monitor.failed_polls(), "telemetry poller stopped");
        })
}

/// Mirror controller state into the gauges. Called on each status tick.
pub fn update_controller_metrics(status: &ControllerStatus, last_pulses: &mut u64) {
    ACTUATION_STATE.set(match status.state {
        ControllerState::Idle => 0,
        ControllerState::RunningContinuous => 1,
        ControllerState::RunningPulsed => 2,
    });
    TARGET_VOLTAGE.set(f64::from(status.target_voltage));
    SESSION_ELAPSED.set(status.elapsed_s);
    if let Some(motor) = status.motor {
        MOTOR_RPM.set(motor.rpm);
        MOTOR_RUNNING.set(i64::from(motor.running));
        if motor.pulses_completed > *last_pulses {
            MOTOR_PULSES.inc_by(motor.pulses_completed - *last_pulses);
            *last_pulses = motor.pulses_completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sono_core::AmplifierState;

    #[test]
    fn trend_prefers_bioreactor_probe() {
        let state = AmplifierState {
            temperature: 31.0,
            ..Default::default()
        };
        let mut snapshot = TelemetrySnapshot {
            reading: Some(TelemetryReading::Fresh { state }),
            ..Default::default()
        };
        assert_eq!(snapshot.trend_celsius(), Some(31.0));
        snapshot.bioreactor_c = Some(37.2);
        assert_eq!(snapshot.trend_celsius(), Some(37.2));
        assert_eq!(TelemetrySnapshot::default().trend_celsius(), None);
    }
}
