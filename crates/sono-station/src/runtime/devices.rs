//! Hardware or simulated backends behind one concrete type each, so the
//! controller is built the same way in both modes.

use crate::runtime::config::{MotorSection, StationConfig};
use embedded_hal::digital::{ErrorType, OutputPin};
use sono_core::sim::{SimulatedAmplifier, SimulatedPin};
use sono_core::{
    MotionAxis, MotionConfig, MotionError, PulseEngine, PulsePins, SerialChannel, StdDelay,
};
use sono_io::{GpioError, SysfsGpioPin, TermiosSerial};
use std::io;
use std::time::Duration;
use tracing::info;

pub enum StationChannel {
    Simulated(SimulatedAmplifier),
    Serial(TermiosSerial),
}

impl SerialChannel for StationChannel {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Self::Simulated(c) => c.write_all(bytes),
            Self::Serial(c) => c.write_all(bytes),
        }
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        match self {
            Self::Simulated(c) => c.read(buf, timeout),
            Self::Serial(c) => c.read(buf, timeout),
        }
    }

    fn flush_input(&mut self) -> io::Result<()> {
        match self {
            Self::Simulated(c) => c.flush_input(),
            Self::Serial(c) => c.flush_input(),
        }
    }
}

pub fn open_channel(config: &StationConfig, simulate: bool) -> io::Result<StationChannel> {
    if simulate {
        info!("using simulated amplifier");
        return Ok(StationChannel::Simulated(SimulatedAmplifier::new()));
    }
    Ok(StationChannel::Serial(TermiosSerial::open(
        &config.link_config(),
    )?))
}

pub enum StationPin {
    Simulated(SimulatedPin),
    Sysfs(SysfsGpioPin),
}

impl ErrorType for StationPin {
    type Error = GpioError;
}

impl OutputPin for StationPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        match self {
            Self::Simulated(p) => p.set_low().map_err(|never| match never {}),
            Self::Sysfs(p) => p.set_low(),
        }
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        match self {
            Self::Simulated(p) => p.set_high().map_err(|never| match never {}),
            Self::Sysfs(p) => p.set_high(),
        }
    }
}

fn simulated_pin() -> StationPin {
    let (pin, _probe) = SimulatedPin::new();
    StationPin::Simulated(pin)
}

#[derive(Debug, thiserror::Error)]
pub enum MotorSetupError {
    #[error(transparent)]
    Gpio(#[from] GpioError),
    #[error(transparent)]
    Motion(#[from] MotionError),
}

/// Build the stepper axis. Simulation always gets one so the motor commands
/// can be exercised; hardware only when a `[motor]` section is present.
pub fn build_motor(
    section: Option<&MotorSection>,
    simulate: bool,
) -> Result<Option<Box<dyn MotionAxis>>, MotorSetupError> {
    let pins = match (section, simulate) {
        (_, true) => PulsePins {
            pul: simulated_pin(),
            dir: simulated_pin(),
            ena: Some(simulated_pin()),
        },
        (Some(m), false) => PulsePins {
            pul: StationPin::Sysfs(SysfsGpioPin::output(m.pul_pin)?),
            dir: StationPin::Sysfs(SysfsGpioPin::output(m.dir_pin)?),
            ena: m
                .ena_pin
                .map(SysfsGpioPin::output)
                .transpose()?
                .map(StationPin::Sysfs),
        },
        (None, false) => return Ok(None),
    };

    let (steps, micro, rpm) = section
        .map(|m| (m.steps_per_rev, m.microsteps, m.rpm))
        .unwrap_or((
            sono_core::pulse::DEFAULT_STEPS_PER_REV,
            1,
            sono_core::pulse::DEFAULT_RPM,
        ));
    let mut engine = PulseEngine::new(pins, StdDelay, MotionConfig::new(steps, micro))?;
    engine.set_rpm(rpm)?;
    let motor: Box<dyn MotionAxis> = Box::new(engine);
    Ok(Some(motor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_always_has_a_motor() {
        let motor = build_motor(None, true).unwrap().unwrap();
        assert_eq!(motor.rpm().round(), 60.0);
        assert!(!motor.is_running());
    }

    #[test]
    fn hardware_without_motor_section_has_none() {
        assert!(build_motor(None, false).unwrap().is_none());
    }

    #[test]
    fn simulated_channel_answers_commands() {
        let mut channel = open_channel(&StationConfig::default(), true).unwrap();
        channel.write_all(b"ENABLE\r").unwrap();
        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(&buf[..n], b"ENABLE\r");
    }
}
