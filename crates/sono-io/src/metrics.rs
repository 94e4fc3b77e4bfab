//! Prometheus metrics for the sonication station.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::io;
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).expect("valid gauge definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn int_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

// ============================================================================
// Amplifier
// ============================================================================

pub static AMP_VOLTAGE: LazyLock<Gauge> = LazyLock::new(|| {
    gauge("sono_amplifier_voltage_volts", "Output voltage reported by the amplifier")
});

pub static AMP_FREQUENCY: LazyLock<Gauge> = LazyLock::new(|| {
    gauge("sono_amplifier_frequency_hz", "Drive frequency reported by the amplifier")
});

pub static AMP_LOAD_POWER: LazyLock<Gauge> = LazyLock::new(|| {
    gauge("sono_amplifier_load_power_watts", "Power delivered into the transducer")
});

pub static AMP_TEMPERATURE: LazyLock<Gauge> = LazyLock::new(|| {
    gauge("sono_amplifier_temperature_celsius", "Amplifier heatsink temperature")
});

pub static AMP_ENABLED: LazyLock<IntGauge> = LazyLock::new(|| {
    int_gauge("sono_amplifier_enabled", "Amplifier output stage (1=enabled, 0=disabled)")
});

pub static STATUS_POLLS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("sono_status_polls_total", "Status frames requested from the amplifier")
});

pub static STATUS_POLL_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("sono_status_poll_failures_total", "Status polls that timed out or failed")
});

pub static CONNECTION_LOST: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("sono_connection_lost_total", "Times the amplifier link was declared lost")
});

// ============================================================================
// Actuation
// ============================================================================

pub static ACTUATION_STATE: LazyLock<IntGauge> = LazyLock::new(|| {
    int_gauge(
        "sono_actuation_state",
        "Actuation state (0=idle,1=continuous,2=pulsed)",
    )
});

pub static TARGET_VOLTAGE: LazyLock<Gauge> = LazyLock::new(|| {
    gauge("sono_target_voltage_volts", "Operator target voltage")
});

pub static SESSION_ELAPSED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge("sono_session_elapsed_seconds", "Elapsed time of the current or last session")
});

pub static SESSIONS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("sono_sessions_started_total", "Actuation sessions started")
});

pub static COMMANDS_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("sono_commands_rejected_total", "Operator commands rejected")
});

// ============================================================================
// Motor and sensors
// ============================================================================

pub static MOTOR_RPM: LazyLock<Gauge> =
    LazyLock::new(|| gauge("sono_motor_rpm", "Commanded stepper speed"));

pub static MOTOR_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    int_gauge("sono_motor_running", "Stepper continuous pulsing (1=running)")
});

pub static MOTOR_PULSES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("sono_motor_pulses_total", "Step pulses completed")
});

pub static THERMISTOR_TEMP: LazyLock<Gauge> = LazyLock::new(|| {
    gauge("sono_thermistor_celsius", "Transducer thermistor temperature")
});

/// Lateness of scheduler ticks in microseconds.
pub static TICK_LAG_US: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new("sono_tick_lag_us", "Scheduler tick lateness in microseconds")
            .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 10000.0]),
    )
    .expect("valid histogram definition");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
});

/// Serve `/metrics`, `/health` and `/ready` on a background thread.
pub fn serve_metrics(bind_addr: String) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            let server = match Server::http(&bind_addr) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(addr = %bind_addr, error = %e, "failed to start metrics server");
                    return;
                }
            };

            tracing::info!(addr = %bind_addr, "metrics server listening on /metrics");

            for request in server.incoming_requests() {
                let response = match request.url() {
                    "/metrics" => {
                        let mut buffer = Vec::new();
                        match TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
                            Ok(()) => {
                                let mut response = Response::from_data(buffer);
                                if let Ok(header) = Header::from_bytes(
                                    &b"Content-Type"[..],
                                    &b"text/plain; version=0.0.4"[..],
                                ) {
                                    response = response.with_header(header);
                                }
                                response
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to encode metrics");
                                Response::from_string("Internal Server Error")
                                    .with_status_code(500)
                            }
                        }
                    }
                    "/health" => Response::from_string("OK"),
                    // Ready once the amplifier has answered at least one poll.
                    "/ready" if STATUS_POLLS.get() > STATUS_POLL_FAILURES.get() => {
                        Response::from_string("Ready")
                    }
                    "/ready" => Response::from_string("Not Ready").with_status_code(503),
                    _ => Response::from_string("Not Found").with_status_code(404),
                };
                let _ = request.respond(response);
            }
        })
}

/// Force registration so every series is exported from the first scrape.
pub fn init_metrics() {
    let _ = AMP_VOLTAGE.get();
    let _ = AMP_FREQUENCY.get();
    let _ = AMP_LOAD_POWER.get();
    let _ = AMP_TEMPERATURE.get();
    let _ = AMP_ENABLED.get();
    let _ = STATUS_POLLS.get();
    let _ = STATUS_POLL_FAILURES.get();
    let _ = CONNECTION_LOST.get();
    let _ = ACTUATION_STATE.get();
    let _ = TARGET_VOLTAGE.get();
    let _ = SESSION_ELAPSED.get();
    let _ = SESSIONS_STARTED.get();
    let _ = COMMANDS_REJECTED.get();
    let _ = MOTOR_RPM.get();
    let _ = MOTOR_RUNNING.get();
    let _ = MOTOR_PULSES.get();
    let _ = THERMISTOR_TEMP.get();
    let _ = TICK_LAG_US.get_sample_count();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exports_station_series() {
        init_metrics();
        AMP_VOLTAGE.set(75.0);
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "sono_amplifier_voltage_volts"));
        assert!(names.iter().any(|n| n == "sono_tick_lag_us"));
        assert!(names.iter().any(|n| n == "sono_actuation_state"));
    }
}
