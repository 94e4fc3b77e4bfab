//! Raw 8N1 serial port on a POSIX tty.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{
    cfmakeraw, cfsetspeed, tcflush, tcgetattr, tcsetattr, BaudRate, ControlFlags, FlushArg,
    SetArg, SpecialCharacterIndices,
};
use sono_core::link::{LinkConfig, SerialChannel};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;
use tracing::info;

pub fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    Ok(match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ))
        }
    })
}

#[derive(Debug)]
pub struct TermiosSerial {
    file: File,
    path: String,
}

impl TermiosSerial {
    pub fn open(config: &LinkConfig) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::fcntl::OFlag::O_NOCTTY.bits())
            .open(&config.port)?;

        let mut tio = tcgetattr(&file)?;
        cfmakeraw(&mut tio);
        cfsetspeed(&mut tio, baud_rate(config.baud)?)?;
        tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD | ControlFlags::CS8;
        tio.control_flags &=
            !(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CRTSCTS);
        // A read waits at most 100 ms for a byte; the link owns the real deadline.
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
        tcsetattr(&file, SetArg::TCSANOW, &tio)?;
        tcflush(&file, FlushArg::TCIOFLUSH)?;

        info!(port = %config.port, baud = config.baud, "serial port opened");
        Ok(Self {
            file,
            path: config.port.clone(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl SerialChannel for TermiosSerial {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.file.flush()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let ready = {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(e) => return Err(e.into()),
            }
        };
        if !ready {
            return Ok(0);
        }
        match self.file.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    fn flush_input(&mut self) -> io::Result<()> {
        tcflush(&self.file, FlushArg::TCIFLUSH)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_common_baud_rates() {
        assert_eq!(baud_rate(9600).unwrap(), BaudRate::B9600);
        assert_eq!(baud_rate(115200).unwrap(), BaudRate::B115200);
        assert_eq!(
            baud_rate(12345).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn missing_device_fails_to_open() {
        let config = LinkConfig {
            port: "/nonexistent/ttyUSB9".to_string(),
            ..Default::default()
        };
        assert!(TermiosSerial::open(&config).is_err());
    }

    #[test]
    fn regular_file_is_not_a_tty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = LinkConfig {
            port: file.path().display().to_string(),
            ..Default::default()
        };
        assert!(TermiosSerial::open(&config).is_err());
    }
}
