pub mod actuation;
pub mod frame;
pub mod history;
pub mod link;
pub mod motion;
pub mod preset;
pub mod pulse;
#[cfg(any(test, feature = "simulation"))]
pub mod sim;
pub mod telemetry;
pub mod thermistor;
pub mod timebase;

pub use actuation::{
    ActuationConfig, ActuationController, ControlError, ControllerState, ControllerStatus,
    OperatingMode, SessionOutcome, SessionReport,
};
pub use frame::{decode_state, encode_command, AmplifierState, FrameError, FRAME_LEN};
pub use history::{PlotWindow, Sample, TrendBuffer};
pub use link::{AmplifierLink, LinkConfig, LinkError, SerialChannel};
pub use motion::{AxisHandle, Direction, MotionAxis, MotionError, MotorStatus};
pub use preset::{resolve_preset, Preset, PresetError, PRESETS};
pub use pulse::{DriveMode, MotionConfig, PulseEngine, PulsePins};
pub use telemetry::{TelemetryMonitor, TelemetryReading};
pub use thermistor::{AdcChannel, SensorError, Thermistor};
pub use timebase::{StdDelay, TimeBase};
