//! Digital outputs through the Linux sysfs GPIO interface.

use embedded_hal::digital::{ErrorKind, ErrorType, OutputPin};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// udev may take a moment to hand the freshly exported node to our group.
const EXPORT_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
#[error("gpio{pin}: {source}")]
pub struct GpioError {
    pin: u32,
    #[source]
    source: io::Error,
}

impl embedded_hal::digital::Error for GpioError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

#[derive(Debug)]
pub struct SysfsGpioPin {
    pin: u32,
    root: PathBuf,
    value: File,
    exported_here: bool,
}

impl SysfsGpioPin {
    /// Export `pin` as an output driven low.
    pub fn output(pin: u32) -> Result<Self, GpioError> {
        Self::output_at(SYSFS_GPIO_ROOT, pin)
    }

    pub fn output_at(root: impl AsRef<Path>, pin: u32) -> Result<Self, GpioError> {
        let root = root.as_ref().to_path_buf();
        let err = |source| GpioError { pin, source };
        let dir = root.join(format!("gpio{pin}"));

        let exported_here = if dir.exists() {
            false
        } else {
            fs::write(root.join("export"), pin.to_string()).map_err(err)?;
            true
        };

        let deadline = Instant::now() + EXPORT_SETTLE;
        loop {
            match fs::write(dir.join("direction"), "low") {
                Ok(()) => break,
                Err(e) if Instant::now() < deadline => {
                    debug!(pin, error = %e, "waiting for exported gpio");
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(err(e)),
            }
        }

        let value = OpenOptions::new()
            .write(true)
            .open(dir.join("value"))
            .map_err(err)?;
        debug!(pin, "gpio exported as output");
        Ok(Self {
            pin,
            root,
            value,
            exported_here,
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    fn write_level(&mut self, high: bool) -> Result<(), GpioError> {
        let level: &[u8] = if high { b"1" } else { b"0" };
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.write_all(level))
            .map_err(|source| GpioError {
                pin: self.pin,
                source,
            })
    }
}

impl ErrorType for SysfsGpioPin {
    type Error = GpioError;
}

impl OutputPin for SysfsGpioPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write_level(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write_level(true)
    }
}

impl Drop for SysfsGpioPin {
    fn drop(&mut self) {
        if self.exported_here {
            if let Err(e) = fs::write(self.root.join("unexport"), self.pin.to_string()) {
                warn!(pin = self.pin, error = %e, "failed to unexport gpio");
            }
        }
    }
}
