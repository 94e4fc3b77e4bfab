mod app;
pub mod config;
mod devices;
mod logging;
mod pulse;
pub mod telemetry;

pub use app::{run, run_from_args, StationError};
pub use config::{Args, ConfigError, RuntimeConfig, StationConfig};
