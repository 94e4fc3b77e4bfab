//! Request/response exchanges with the serial-attached amplifier.
//!
//! All exchanges go through one mutex so a status poll can never interleave
//! with a command write; callers from different threads queue on the lock.

use crate::frame::{
    decode_state, encode_command, format_value, AmplifierState, FrameError, CMD_DISABLE,
    CMD_ENABLE, CMD_GET_STATE, CMD_SET_FREQUENCY, CMD_SET_VOLTAGE, FRAME_LEN, TERMINATOR,
};
use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Byte stream to the device.
pub trait SerialChannel: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read whatever is available, waiting at most `timeout` for the first
    /// byte. Returns `Ok(0)` when the line stayed silent.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Discard everything received but not yet read.
    fn flush_input(&mut self) -> io::Result<()>;
}

impl<T: SerialChannel + ?Sized> SerialChannel for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read(buf, timeout)
    }

    fn flush_input(&mut self) -> io::Result<()> {
        (**self).flush_input()
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no complete response within {timeout:?} (received {received} of {expected} bytes)")]
    Timeout {
        timeout: Duration,
        expected: usize,
        received: usize,
    },
    #[error("serial I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("amplifier link lost after {failures} consecutive failures")]
    ConnectionLost { failures: u32 },
}

impl LinkError {
    /// Timeouts and I/O hiccups may clear on the next exchange.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::Timeout { .. } | LinkError::Io(_))
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub port: String,
    pub baud: u32,
    pub read_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            read_timeout: Duration::from_secs(1),
        }
    }
}

struct LinkInner<C> {
    channel: C,
    last_voltage: f32,
}

pub struct AmplifierLink<C: SerialChannel> {
    inner: Mutex<LinkInner<C>>,
    read_timeout: Duration,
}

impl<C: SerialChannel> AmplifierLink<C> {
    pub fn new(channel: C, config: &LinkConfig) -> Self {
        Self {
            inner: Mutex::new(LinkInner {
                channel,
                last_voltage: 0.0,
            }),
            read_timeout: config.read_timeout,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn lock(&self) -> MutexGuard<'_, LinkInner<C>> {
        // A panic mid-exchange leaves only stale bytes behind, which the next
        // exchange flushes.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write one command and consume the device's acknowledgement.
    pub fn send_command(&self, name: &str, value: &str) -> Result<(), LinkError> {
        let mut inner = self.lock();
        self.exchange_command(&mut inner.channel, name, value)
    }

    fn exchange_command(&self, channel: &mut C, name: &str, value: &str) -> Result<(), LinkError> {
        channel.flush_input()?;
        channel.write_all(&encode_command(name, value))?;
        let ack = self.read_until_terminator(channel)?;
        trace!(command = name, value, ack_len = ack.len(), "command acknowledged");
        channel.flush_input()?;
        Ok(())
    }

    fn read_until_terminator(&self, channel: &mut C) -> Result<Vec<u8>, LinkError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut ack = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::Timeout {
                    timeout: self.read_timeout,
                    expected: 1,
                    received: 0,
                });
            }
            if channel.read(&mut byte, remaining)? == 1 {
                ack.push(byte[0]);
                if byte[0] == TERMINATOR {
                    return Ok(ack);
                }
            }
        }
    }

    fn read_frame(&self, channel: &mut C) -> Result<[u8; FRAME_LEN], LinkError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut frame = [0u8; FRAME_LEN];
        let mut filled = 0;
        while filled < FRAME_LEN {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::Timeout {
                    timeout: self.read_timeout,
                    expected: FRAME_LEN,
                    received: filled,
                });
            }
            filled += channel.read(&mut frame[filled..], remaining)?;
        }
        Ok(frame)
    }

    /// One full status round-trip. A partial frame is discarded, never decoded.
    pub fn poll_state(&self) -> Result<AmplifierState, LinkError> {
        let mut inner = self.lock();
        let channel = &mut inner.channel;
        channel.flush_input()?;
        channel.write_all(&encode_command(CMD_GET_STATE, ""))?;
        let frame = self.read_frame(channel);
        channel.flush_input()?;
        let state = decode_state(&frame?)?;
        debug!(
            voltage = state.voltage,
            frequency = state.frequency,
            temperature = state.temperature,
            "amplifier state polled"
        );
        Ok(state)
    }

    /// Command a new output voltage and, once acknowledged, remember it as
    /// the operator's target.
    pub fn set_voltage(&self, volts: f32) -> Result<(), LinkError> {
        let mut inner = self.lock();
        self.exchange_command(&mut inner.channel, CMD_SET_VOLTAGE, &format_value(volts))?;
        inner.last_voltage = volts;
        Ok(())
    }

    /// Drive the output without touching the remembered target. The pulsed
    /// loop uses this for its off phase.
    pub fn send_raw_voltage(&self, volts: f32) -> Result<(), LinkError> {
        let mut inner = self.lock();
        self.exchange_command(&mut inner.channel, CMD_SET_VOLTAGE, &format_value(volts))
    }

    pub fn set_frequency(&self, hz: f32) -> Result<(), LinkError> {
        self.send_command(CMD_SET_FREQUENCY, &format_value(hz))
    }

    pub fn enable(&self) -> Result<(), LinkError> {
        self.send_command(CMD_ENABLE, "")
    }

    pub fn disable(&self) -> Result<(), LinkError> {
        self.send_command(CMD_DISABLE, "")
    }

    /// Last voltage passed to [`set_voltage`](Self::set_voltage).
    pub fn last_commanded_voltage(&self) -> f32 {
        self.lock().last_voltage
    }

    pub fn load_power(&self) -> Result<f32, LinkError> {
        Ok(self.poll_state()?.load_power)
    }

    pub fn voltage(&self) -> Result<f32, LinkError> {
        Ok(self.poll_state()?.voltage)
    }

    /// Run `f` with exclusive access to the channel.
    pub fn with_channel<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.lock().channel)
    }
}
