//! Sound-pressure presets and their calibrated drive voltages.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Preset {
    pub kilopascal: u32,
    pub voltage: f32,
}

/// Calibration table: acoustic pressure (kPa) to amplifier voltage (Vrms).
pub const PRESETS: &[Preset] = &[
    Preset {
        kilopascal: 5,
        voltage: 10.0,
    },
    Preset {
        kilopascal: 10,
        voltage: 25.0,
    },
    Preset {
        kilopascal: 30,
        voltage: 75.0,
    },
    Preset {
        kilopascal: 50,
        voltage: 100.0,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresetError {
    #[error("unknown sound-pressure preset {0:?}")]
    Unknown(String),
}

impl Preset {
    pub fn label(&self) -> String {
        format!("{} kPa", self.kilopascal)
    }
}

/// Accepts `"30 kPa"`, `"30kPa"` or `"30"`.
pub fn lookup(label: &str) -> Result<Preset, PresetError> {
    let trimmed = label.trim();
    let number = trimmed
        .strip_suffix("kPa")
        .or_else(|| trimmed.strip_suffix("kpa"))
        .unwrap_or(trimmed)
        .trim();
    let kpa: u32 = number
        .parse()
        .map_err(|_| PresetError::Unknown(label.to_string()))?;
    PRESETS
        .iter()
        .copied()
        .find(|p| p.kilopascal == kpa)
        .ok_or_else(|| PresetError::Unknown(label.to_string()))
}

pub fn resolve_preset(label: &str) -> Result<f32, PresetError> {
    lookup(label).map(|p| p.voltage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_calibrated_voltages() {
        assert_eq!(resolve_preset("5 kPa"), Ok(10.0));
        assert_eq!(resolve_preset("10 kPa"), Ok(25.0));
        assert_eq!(resolve_preset("30 kPa"), Ok(75.0));
        assert_eq!(resolve_preset("50kPa"), Ok(100.0));
        assert_eq!(resolve_preset(" 30 "), Ok(75.0));
    }

    #[test]
    fn unknown_label_is_configuration_error() {
        assert_eq!(
            resolve_preset("99 kPa"),
            Err(PresetError::Unknown("99 kPa".to_string()))
        );
        assert!(resolve_preset("loud").is_err());
    }

    #[test]
    fn labels_round_trip() {
        for preset in PRESETS {
            assert_eq!(lookup(&preset.label()), Ok(*preset));
        }
    }
}
