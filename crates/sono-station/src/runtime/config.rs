use clap::Parser;
use serde::Deserialize;
use sono_core::{preset, ActuationConfig, LinkConfig, OperatingMode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Sonication station: ultrasound amplifier and stepper control.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "sono-station")]
#[command(version)]
#[command(about = "Headless control station for an ultrasound amplifier and stepper pump")]
pub struct Args {
    /// Station configuration file (TOML).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Use the built-in simulated amplifier and pins instead of hardware.
    #[arg(long)]
    pub simulate: bool,

    /// Serial device of the amplifier; overrides `serial.port`.
    #[arg(long, value_name = "DEV")]
    pub port: Option<String>,

    /// Exit after this many seconds instead of waiting for `shutdown`.
    #[arg(long, value_name = "N")]
    pub run_seconds: Option<u64>,

    /// Output logs in JSON format.
    #[arg(long)]
    pub json_logs: bool,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9100).
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<String>,

    /// Append audit events to this JSONL file.
    #[arg(long, value_name = "PATH")]
    pub audit_log: Option<PathBuf>,

    /// Print one JSON status line per status tick on stdout.
    #[arg(long)]
    pub status_stream: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub port: String,
    pub baud: u32,
    pub timeout_ms: u64,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActuationSection {
    pub pulse_on_ms: u64,
    pub pulse_off_ms: u64,
    pub assert_interval_ms: u64,
    pub failure_threshold: u32,
    pub initial_preset: String,
    pub mode: OperatingMode,
}

impl Default for ActuationSection {
    fn default() -> Self {
        Self {
            pulse_on_ms: 1000,
            pulse_off_ms: 1000,
            assert_interval_ms: 1000,
            failure_threshold: 3,
            initial_preset: "5 kPa".to_string(),
            mode: OperatingMode::Continuous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotorSection {
    pub pul_pin: u32,
    pub dir_pin: u32,
    #[serde(default)]
    pub ena_pin: Option<u32>,
    #[serde(default = "default_steps_per_rev")]
    pub steps_per_rev: u32,
    #[serde(default = "default_microsteps")]
    pub microsteps: u32,
    #[serde(default = "default_rpm")]
    pub rpm: f64,
}

fn default_steps_per_rev() -> u32 {
    sono_core::pulse::DEFAULT_STEPS_PER_REV
}

fn default_microsteps() -> u32 {
    1
}

fn default_rpm() -> f64 {
    sono_core::pulse::DEFAULT_RPM
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub poll_interval_ms: u64,
    pub history_capacity: usize,
    pub thermistor_raw_path: Option<PathBuf>,
    pub adc_max: u32,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            history_capacity: 3600,
            thermistor_raw_path: None,
            adc_max: 4095,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationSection {
    pub tick_ms: u64,
    pub status_interval_ms: u64,
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            tick_ms: 1,
            status_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationConfig {
    pub serial: SerialSection,
    pub actuation: ActuationSection,
    pub motor: Option<MotorSection>,
    pub telemetry: TelemetrySection,
    pub station: StationSection,
}

impl StationConfig {
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: StationConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        preset::lookup(&self.actuation.initial_preset)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.actuation.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "actuation.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.serial.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "serial.timeout_ms must be positive".to_string(),
            ));
        }
        if self.station.tick_ms == 0 || self.station.status_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "station intervals must be positive".to_string(),
            ));
        }
        if self.telemetry.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.poll_interval_ms must be positive".to_string(),
            ));
        }
        if let Some(motor) = &self.motor {
            if !(motor.rpm.is_finite() && motor.rpm > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "motor.rpm must be positive, got {}",
                    motor.rpm
                )));
            }
        }
        Ok(())
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            port: self.serial.port.clone(),
            baud: self.serial.baud,
            read_timeout: Duration::from_millis(self.serial.timeout_ms),
        }
    }

    pub fn actuation_config(&self) -> ActuationConfig {
        ActuationConfig {
            pulse_on: Duration::from_millis(self.actuation.pulse_on_ms),
            pulse_off: Duration::from_millis(self.actuation.pulse_off_ms),
            assert_interval: Duration::from_millis(self.actuation.assert_interval_ms),
            failure_threshold: self.actuation.failure_threshold,
        }
    }
}

/// Everything the runtime needs: the file configuration plus process flags.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub station: StationConfig,
    pub simulate: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub status_stream: bool,
}

impl RuntimeConfig {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let mut station = match &args.config {
            Some(path) => StationConfig::load(path)?,
            None => StationConfig::default(),
        };
        if let Some(port) = args.port {
            station.serial.port = port;
        }
        Ok(Self {
            station,
            simulate: args.simulate,
            run_seconds: args.run_seconds,
            json_logs: args.json_logs,
            metrics_addr: args.metrics_addr,
            audit_path: args.audit_log,
            status_stream: args.status_stream,
        })
    }
}
