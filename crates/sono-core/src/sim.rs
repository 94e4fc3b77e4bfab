use crate::frame::{
    AmplifierState, CMD_DISABLE, CMD_ENABLE, CMD_GET_STATE, CMD_SET_FREQUENCY, CMD_SET_VOLTAGE,
    TERMINATOR,
};
use crate::link::SerialChannel;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, OutputPin};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct PinTrace {
    high: AtomicBool,
    rising_edges: AtomicU64,
    writes: AtomicU64,
}

/// In-memory digital output.
#[derive(Debug)]
pub struct SimulatedPin {
    trace: Arc<PinTrace>,
}

/// Observer half of a [`SimulatedPin`].
#[derive(Debug, Clone)]
pub struct PinProbe {
    trace: Arc<PinTrace>,
}

impl SimulatedPin {
    pub fn new() -> (Self, PinProbe) {
        let trace = Arc::new(PinTrace::default());
        (
            Self {
                trace: Arc::clone(&trace),
            },
            PinProbe { trace },
        )
    }
}

impl PinProbe {
    pub fn is_high(&self) -> bool {
        self.trace.high.load(Ordering::Acquire)
    }

    pub fn rising_edges(&self) -> u64 {
        self.trace.rising_edges.load(Ordering::Acquire)
    }

    pub fn writes(&self) -> u64 {
        self.trace.writes.load(Ordering::Acquire)
    }
}

impl ErrorType for SimulatedPin {
    type Error = Infallible;
}

impl OutputPin for SimulatedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.trace.writes.fetch_add(1, Ordering::AcqRel);
        self.trace.high.store(false, Ordering::Release);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.trace.writes.fetch_add(1, Ordering::AcqRel);
        if !self.trace.high.swap(true, Ordering::AcqRel) {
            self.trace.rising_edges.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

/// Delay that returns immediately and only accounts the requested time.
#[derive(Debug, Clone, Default)]
pub struct InstantDelay {
    total_ns: Arc<AtomicU64>,
}

impl InstantDelay {
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::Acquire))
    }
}

impl DelayNs for InstantDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns.fetch_add(u64::from(ns), Ordering::AcqRel);
    }
}

const AMBIENT_C: f32 = 25.0;
const THERMAL_TIME_CONSTANT_S: f32 = 120.0;
const HEATING_C_PER_W: f32 = 0.4;
const AMPLIFIER_EFFICIENCY: f32 = 0.9;
const SILENCE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct SimShared {
    commands: Mutex<Vec<String>>,
    silent: AtomicBool,
    noise: Mutex<Vec<u8>>,
}

/// Test-side controls for a [`SimulatedAmplifier`] that has been moved into a link.
#[derive(Debug, Clone)]
pub struct SimAmplifierHandle {
    shared: Arc<SimShared>,
}

impl SimAmplifierHandle {
    /// Every command line received, without the terminator.
    pub fn commands(&self) -> Vec<String> {
        self.shared
            .commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Stop answering, as if the cable were pulled.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::Release);
    }

    /// Queue unsolicited bytes that the device emits before its next reply.
    pub fn inject_noise(&self, bytes: &[u8]) {
        if let Ok(mut noise) = self.shared.noise.lock() {
            noise.extend_from_slice(bytes);
        }
    }
}

/// Amplifier model speaking the device's line protocol.
#[derive(Debug)]
pub struct SimulatedAmplifier {
    state: AmplifierState,
    rx_line: Vec<u8>,
    tx: VecDeque<u8>,
    last_update: Instant,
    shared: Arc<SimShared>,
}

impl SimulatedAmplifier {
    pub fn new() -> Self {
        Self {
            state: AmplifierState {
                frequency: 40_000.0,
                min_frequency: 20_000.0,
                max_frequency: 60_000.0,
                phase_control_gain: 1.0,
                current_control_gain: 1.0,
                power_control_gain: 1.0,
                max_load_power: 100.0,
                temperature: AMBIENT_C,
                impedance: 120.0,
                transformer_turns: 8.0,
                ..Default::default()
            },
            rx_line: Vec::new(),
            tx: VecDeque::new(),
            last_update: Instant::now(),
            shared: Arc::new(SimShared::default()),
        }
    }

    pub fn handle(&self) -> SimAmplifierHandle {
        SimAmplifierHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn advance(&mut self) {
        let dt = self.last_update.elapsed().as_secs_f32();
        self.last_update = Instant::now();

        let s = &mut self.state;
        let output_v = if s.enabled { s.voltage } else { 0.0 };
        s.load_power = if s.impedance > 0.0 {
            (output_v * output_v / s.impedance).min(s.max_load_power)
        } else {
            0.0
        };
        s.amplifier_power = s.load_power / AMPLIFIER_EFFICIENCY;
        s.measured_current = if s.impedance > 0.0 {
            output_v / s.impedance
        } else {
            0.0
        };
        let target = AMBIENT_C + HEATING_C_PER_W * s.load_power;
        let alpha = (dt / THERMAL_TIME_CONSTANT_S).min(1.0);
        s.temperature += (target - s.temperature) * alpha;
    }

    fn handle_line(&mut self, line: &str) {
        if let Ok(mut log) = self.shared.commands.lock() {
            log.push(line.to_string());
        }
        if self.shared.silent.load(Ordering::Acquire) {
            return;
        }
        self.advance();

        if line == CMD_GET_STATE {
            let frame = self.state.to_frame();
            self.tx.extend(frame);
            return;
        }
        let parse = |rest: &str| rest.trim().parse::<f32>().ok();
        if let Some(rest) = line.strip_prefix(CMD_SET_VOLTAGE) {
            if let Some(v) = parse(rest) {
                self.state.voltage = v;
            }
        } else if let Some(rest) = line.strip_prefix(CMD_SET_FREQUENCY) {
            if let Some(hz) = parse(rest) {
                self.state.frequency = hz.clamp(self.state.min_frequency, self.state.max_frequency);
            }
        } else if line == CMD_ENABLE {
            self.state.enabled = true;
        } else if line == CMD_DISABLE {
            self.state.enabled = false;
        }
        self.tx.extend(line.as_bytes());
        self.tx.push_back(TERMINATOR);
    }

    fn take_noise(&mut self) {
        if let Ok(mut noise) = self.shared.noise.lock() {
            self.tx.extend(noise.drain(..));
        }
    }
}

impl Default for SimulatedAmplifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialChannel for SimulatedAmplifier {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.take_noise();
        for &b in bytes {
            if b == TERMINATOR {
                let line = String::from_utf8_lossy(&self.rx_line).into_owned();
                self.rx_line.clear();
                self.handle_line(&line);
            } else {
                self.rx_line.push(b);
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.tx.is_empty() {
            std::thread::sleep(timeout.min(SILENCE_POLL));
            return Ok(0);
        }
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.take_noise();
        self.tx.clear();
        Ok(())
    }
}
