//! NTC thermistor on a voltage divider, read through an ADC.
//!
//! The divider puts the reference resistor on the high side, so the node
//! voltage `V = Vref * R / (R + Rref)` rises with thermistor resistance.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("thermistor open circuit (adc fraction {0:.4})")]
    OpenCircuit(f64),
    #[error("thermistor short circuit (adc fraction {0:.4})")]
    ShortCircuit(f64),
    #[error("adc read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("adc returned unparseable value {0:?}")]
    Parse(String),
}

/// A single-ended ADC input normalised to `0.0..=1.0` of full scale.
pub trait AdcChannel: Send {
    fn read_fraction(&mut self) -> Result<f64, SensorError>;
}

/// Extended Steinhart–Hart fit for a 10 kΩ (B25/85 = 3977) NTC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thermistor {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub r25_ohms: f64,
    pub reference_ohms: f64,
    pub supply_volts: f64,
}

impl Default for Thermistor {
    fn default() -> Self {
        Self {
            a: 3.354016e-3,
            b: 2.56524e-4,
            c: 2.60597e-6,
            d: 6.32926e-8,
            r25_ohms: 10_000.0,
            reference_ohms: 10_000.0,
            supply_volts: 3.3,
        }
    }
}

const RAIL_GUARD: f64 = 0.002;

impl Thermistor {
    pub fn resistance(&self, fraction: f64) -> Result<f64, SensorError> {
        if fraction.is_nan() || fraction <= RAIL_GUARD {
            return Err(SensorError::ShortCircuit(fraction));
        }
        if fraction >= 1.0 - RAIL_GUARD {
            return Err(SensorError::OpenCircuit(fraction));
        }
        let volts = fraction * self.supply_volts;
        Ok(volts * self.reference_ohms / (self.supply_volts - volts))
    }

    pub fn celsius_from_resistance(&self, ohms: f64) -> f64 {
        let ln = (ohms / self.r25_ohms).ln();
        let inv_t = self.a + self.b * ln + self.c * ln.powi(2) + self.d * ln.powi(3);
        1.0 / inv_t - 273.15
    }

    pub fn celsius(&self, fraction: f64) -> Result<f64, SensorError> {
        Ok(self.celsius_from_resistance(self.resistance(fraction)?))
    }

    pub fn read<A: AdcChannel + ?Sized>(&self, adc: &mut A) -> Result<f64, SensorError> {
        self.celsius(adc.read_fraction()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAdc(f64);

    impl AdcChannel for FixedAdc {
        fn read_fraction(&mut self) -> Result<f64, SensorError> {
            Ok(self.0)
        }
    }

    #[test]
    fn midscale_reads_twenty_five_celsius() {
        let t = Thermistor::default();
        assert!((t.resistance(0.5).unwrap() - 10_000.0).abs() < 1e-6);
        assert!((t.read(&mut FixedAdc(0.5)).unwrap() - 25.0).abs() < 0.01);
    }

    #[test]
    fn lower_resistance_is_hotter() {
        let t = Thermistor::default();
        let warm = t.celsius_from_resistance(5_000.0);
        let cold = t.celsius_from_resistance(20_000.0);
        assert!(warm > 25.0 && cold < 25.0);
        assert!((warm - 41.3).abs() < 1.0);
    }

    #[test]
    fn rails_are_reported_as_faults() {
        let t = Thermistor::default();
        assert!(matches!(t.celsius(0.0), Err(SensorError::ShortCircuit(_))));
        assert!(matches!(t.celsius(1.0), Err(SensorError::OpenCircuit(_))));
        assert!(matches!(t.celsius(f64::NAN), Err(SensorError::ShortCircuit(_))));
    }
}
