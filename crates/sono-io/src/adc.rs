use sono_core::thermistor::{AdcChannel, SensorError};
use std::fs;
use std::path::PathBuf;

/// One channel of a Linux IIO ADC, read from its `in_voltageN_raw` node.
#[derive(Debug, Clone)]
pub struct IioAdcChannel {
    path: PathBuf,
    full_scale: u32,
}

impl IioAdcChannel {
    pub fn new(path: impl Into<PathBuf>, full_scale: u32) -> Self {
        Self {
            path: path.into(),
            full_scale: full_scale.max(1),
        }
    }
}

impl AdcChannel for IioAdcChannel {
    fn read_fraction(&mut self) -> Result<f64, SensorError> {
        let text = fs::read_to_string(&self.path)?;
        let raw: u32 = text
            .trim()
            .parse()
            .map_err(|_| SensorError::Parse(text.trim().to_string()))?;
        Ok(f64::from(raw.min(self.full_scale)) / f64::from(self.full_scale))
    }
}
