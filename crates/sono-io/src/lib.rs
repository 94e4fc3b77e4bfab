pub mod adc;
pub mod gpio;
pub mod metrics;
pub mod serial;

pub use adc::IioAdcChannel;
pub use gpio::{GpioError, SysfsGpioPin};
pub use metrics::{init_metrics, serve_metrics};
pub use serial::TermiosSerial;
