//! Line-delimited JSON operator protocol.
//!
//! Each stdin line is one command, e.g. `{"type":"preset","label":"30 kPa"}`.
//! Each stdout line is one reply or status message.

use serde::{Deserialize, Serialize};
use sono_core::{ControllerStatus, Direction, OperatingMode, PlotWindow, TelemetryReading};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StationCommand {
    Start,
    Stop,
    SetMode {
        mode: OperatingMode,
    },
    SetVoltage {
        volts: f32,
    },
    Preset {
        label: String,
    },
    SetFrequency {
        hz: f32,
    },
    MotorStart {
        #[serde(default)]
        direction: Direction,
    },
    MotorStop,
    MotorRpm {
        rpm: f64,
    },
    MotorDirection {
        direction: Direction,
    },
    /// Blocking move; the scheduler pauses until it completes.
    Rotate {
        degrees: f64,
        #[serde(default)]
        direction: Direction,
    },
    Status,
    Shutdown,
}

impl StationCommand {
    pub fn name(&self) -> &'static str {
        match self {
            StationCommand::Start => "start",
            StationCommand::Stop => "stop",
            StationCommand::SetMode { .. } => "set_mode",
            StationCommand::SetVoltage { .. } => "set_voltage",
            StationCommand::Preset { .. } => "preset",
            StationCommand::SetFrequency { .. } => "set_frequency",
            StationCommand::MotorStart { .. } => "motor_start",
            StationCommand::MotorStop => "motor_stop",
            StationCommand::MotorRpm { .. } => "motor_rpm",
            StationCommand::MotorDirection { .. } => "motor_direction",
            StationCommand::Rotate { .. } => "rotate",
            StationCommand::Status => "status",
            StationCommand::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty command line")]
    Empty,
    #[error("invalid command: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub fn parse_command(line: &str) -> Result<StationCommand, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(line)?)
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusMsg {
    pub uptime_s: f64,
    pub controller: ControllerStatus,
    pub telemetry: Option<TelemetryReading>,
    pub bioreactor_c: Option<f64>,
    pub trend_points: usize,
    pub trend_window: PlotWindow,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StationReply {
    Ack {
        command: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },
    Error {
        command: Option<&'static str>,
        message: String,
    },
    Status(StatusMsg),
}

impl StationReply {
    pub fn ack(command: &StationCommand) -> Self {
        StationReply::Ack {
            command: command.name(),
            detail: None,
        }
    }

    pub fn ack_with(command: &StationCommand, detail: serde_json::Value) -> Self {
        StationReply::Ack {
            command: command.name(),
            detail: Some(detail),
        }
    }

    pub fn error(command: Option<&StationCommand>, message: impl ToString) -> Self {
        StationReply::Error {
            command: command.map(StationCommand::name),
            message: message.to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","command":null,"message":"encode failed: {e}"}}"#)
        })
    }
}
