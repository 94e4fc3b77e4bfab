//! Operating-mode state machine for the amplifier, plus the motor peer.
//!
//! ```text
//!            start()                       set_mode()
//!   IDLE ─────────────▶ RUNNING-CONTINUOUS ◀──────────▶ RUNNING-PULSED
//!    ▲                         │                              │
//!    └──────── stop() / connection lost ◀─────────────────────┘
//! ```
//!
//! While a session runs, its worker thread is the only writer of voltage and
//! enable state on the amplifier. Stop ordering is always: clear the run
//! flag, join the worker, then disable the amplifier.

use crate::link::{AmplifierLink, LinkError, SerialChannel};
use crate::motion::{AxisHandle, Direction, MotionAxis, MotionError, MotorStatus};
use crate::preset::{lookup, Preset, PresetError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Continuous,
    Pulsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    RunningContinuous,
    RunningPulsed,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("an actuation session is already running")]
    AlreadyRunning,
    #[error("the actuation session owns the amplifier; stop it first")]
    SessionActive,
    #[error("configuration error: {0}")]
    Configuration(#[from] PresetError),
    #[error("invalid target voltage {0}")]
    InvalidVoltage(f32),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error("no motor is attached to this controller")]
    NoMotor,
    #[error("failed to spawn worker thread: {0}")]
    Worker(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ActuationConfig {
    pub pulse_on: Duration,
    pub pulse_off: Duration,
    /// Pause between re-asserting the target in continuous mode.
    pub assert_interval: Duration,
    /// Consecutive failed exchanges before the link is declared lost.
    pub failure_threshold: u32,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            pulse_on: Duration::from_secs(1),
            pulse_off: Duration::from_secs(1),
            assert_interval: Duration::from_secs(1),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SessionSettings {
    mode: OperatingMode,
    target_voltage: f32,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SessionOutcome {
    Stopped,
    ConnectionLost { failures: u32, disabled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub elapsed_s: f64,
    pub cycles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub mode: OperatingMode,
    pub target_voltage: f32,
    pub last_commanded_voltage: f32,
    pub elapsed_s: f64,
    pub cycles: u64,
    pub consecutive_failures: u32,
    pub faulted: bool,
    pub motor: Option<MotorStatus>,
}

/// Run flag the worker sleeps on, so clearing it cuts a wait short.
#[derive(Debug)]
struct RunFlag {
    running: Mutex<bool>,
    cv: Condvar,
}

impl RunFlag {
    fn new() -> Self {
        Self {
            running: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, bool> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_set(&self) -> bool {
        *self.guard()
    }

    fn clear(&self) {
        *self.guard() = false;
        self.cv.notify_all();
    }

    /// Sleep for `period` unless cleared first. Returns whether still set.
    fn wait(&self, period: Duration) -> bool {
        let guard = self.guard();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, period, |running| *running)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

#[derive(Debug)]
struct SessionShared {
    flag: RunFlag,
    failures: AtomicU32,
    cycles: AtomicU64,
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    worker: JoinHandle<SessionOutcome>,
    started_at: Instant,
}

pub struct ActuationController<C: SerialChannel + 'static> {
    link: Arc<AmplifierLink<C>>,
    config: ActuationConfig,
    settings: Arc<Mutex<SessionSettings>>,
    session: Option<ActiveSession>,
    faulted: bool,
    last_report: Option<SessionReport>,
    motor: Option<AxisHandle>,
}

impl<C: SerialChannel + 'static> ActuationController<C> {
    pub fn new(link: Arc<AmplifierLink<C>>, config: ActuationConfig) -> Self {
        Self {
            link,
            config,
            settings: Arc::new(Mutex::new(SessionSettings {
                mode: OperatingMode::Continuous,
                target_voltage: 0.0,
            })),
            session: None,
            faulted: false,
            last_report: None,
            motor: None,
        }
    }

    pub fn with_motor(mut self, motor: Box<dyn MotionAxis>) -> Self {
        self.motor = Some(AxisHandle::new(motor));
        self
    }

    /// Shared handle for the thread that ticks the motor and for blocking
    /// moves run off the caller's thread.
    pub fn motor_handle(&self) -> Option<AxisHandle> {
        self.motor.clone()
    }

    pub fn link(&self) -> &Arc<AmplifierLink<C>> {
        &self.link
    }

    fn settings(&self) -> SessionSettings {
        *self.settings.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn update_settings(&self, f: impl FnOnce(&mut SessionSettings)) {
        f(&mut self.settings.lock().unwrap_or_else(|p| p.into_inner()));
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.shared.flag.is_set())
    }

    pub fn state(&self) -> ControllerState {
        if !self.is_running() {
            return ControllerState::Idle;
        }
        match self.settings().mode {
            OperatingMode::Continuous => ControllerState::RunningContinuous,
            OperatingMode::Pulsed => ControllerState::RunningPulsed,
        }
    }

    /// Enable the amplifier and launch the session worker. Rejected while a
    /// worker is alive.
    pub fn start(&mut self) -> Result<(), ControlError> {
        if self.session.is_some() {
            warn!("start ignored: actuation session already running");
            return Err(ControlError::AlreadyRunning);
        }

        self.link.enable()?;

        let shared = Arc::new(SessionShared {
            flag: RunFlag::new(),
            failures: AtomicU32::new(0),
            cycles: AtomicU64::new(0),
        });
        let worker = {
            let link = Arc::clone(&self.link);
            let settings = Arc::clone(&self.settings);
            let shared = Arc::clone(&shared);
            let config = self.config.clone();
            thread::Builder::new()
                .name("actuation".to_string())
                .spawn(move || run_session(&link, &settings, &shared, &config))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(disable_err) = self.link.disable() {
                    error!(error = %disable_err, "failed to disable amplifier after spawn failure");
                }
                return Err(ControlError::Worker(e));
            }
        };

        let settings = self.settings();
        info!(
            mode = ?settings.mode,
            target_voltage = settings.target_voltage,
            "actuation session started"
        );
        self.faulted = false;
        self.session = Some(ActiveSession {
            shared,
            worker,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Clear the run flag, join the worker, then disable the amplifier.
    /// Returns `Ok(None)` when no session was running.
    pub fn stop(&mut self) -> Result<Option<SessionReport>, ControlError> {
        let Some(session) = self.session.take() else {
            debug!("stop requested with no active session");
            return Ok(None);
        };

        session.shared.flag.clear();
        let outcome = session.worker.join().unwrap_or_else(|_| {
            error!("actuation worker panicked");
            SessionOutcome::Stopped
        });

        let report = SessionReport {
            outcome,
            elapsed_s: session.started_at.elapsed().as_secs_f64(),
            cycles: session.shared.cycles.load(Ordering::Acquire),
        };
        self.last_report = Some(report);

        let already_disabled = matches!(
            outcome,
            SessionOutcome::ConnectionLost { disabled: true, .. }
        );
        if matches!(outcome, SessionOutcome::ConnectionLost { .. }) {
            self.faulted = true;
        }
        info!(
            outcome = ?outcome,
            elapsed_s = report.elapsed_s,
            cycles = report.cycles,
            "actuation session stopped"
        );
        if !already_disabled {
            self.link.disable()?;
        }
        Ok(Some(report))
    }

    /// Stop because the link was declared lost elsewhere (e.g. by telemetry).
    /// The controller reports itself faulted until the next `start()`.
    pub fn force_stop(&mut self) -> Result<Option<SessionReport>, ControlError> {
        error!("forcing actuation stop after connection loss");
        self.faulted = true;
        self.stop()
    }

    /// Reap a worker that ended on its own. Call from the periodic tick.
    pub fn service(&mut self) -> Option<Result<Option<SessionReport>, ControlError>> {
        let finished = self
            .session
            .as_ref()
            .is_some_and(|s| s.worker.is_finished());
        finished.then(|| self.stop())
    }

    pub fn set_mode(&self, mode: OperatingMode) {
        self.update_settings(|s| s.mode = mode);
        info!(mode = ?mode, "operating mode selected");
    }

    pub fn mode(&self) -> OperatingMode {
        self.settings().mode
    }

    pub fn set_target_voltage(&self, volts: f32) -> Result<(), ControlError> {
        if !volts.is_finite() || volts < 0.0 {
            return Err(ControlError::InvalidVoltage(volts));
        }
        self.update_settings(|s| s.target_voltage = volts);
        debug!(target_voltage = volts, "target voltage set");
        Ok(())
    }

    pub fn target_voltage(&self) -> f32 {
        self.settings().target_voltage
    }

    /// Select a sound-pressure preset. When idle the calibrated voltage is
    /// also commanded right away; while running the worker picks it up on
    /// its next cycle.
    pub fn apply_preset(&self, label: &str) -> Result<Preset, ControlError> {
        let preset = lookup(label)?;
        self.set_target_voltage(preset.voltage)?;
        if !self.is_running() {
            self.link.set_voltage(preset.voltage)?;
        }
        info!(preset = %preset.label(), voltage = preset.voltage, "preset applied");
        Ok(preset)
    }

    /// Operator voltage command outside a session.
    pub fn manual_set_voltage(&self, volts: f32) -> Result<(), ControlError> {
        if self.is_running() {
            return Err(ControlError::SessionActive);
        }
        self.set_target_voltage(volts)?;
        self.link.set_voltage(volts)?;
        Ok(())
    }

    pub fn manual_set_frequency(&self, hz: f32) -> Result<(), ControlError> {
        if self.is_running() {
            return Err(ControlError::SessionActive);
        }
        self.link.set_frequency(hz)?;
        Ok(())
    }

    pub fn last_report(&self) -> Option<SessionReport> {
        self.last_report
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn status(&self) -> ControllerStatus {
        let settings = self.settings();
        let (elapsed_s, cycles, failures) = match &self.session {
            Some(s) => (
                s.started_at.elapsed().as_secs_f64(),
                s.shared.cycles.load(Ordering::Acquire),
                s.shared.failures.load(Ordering::Acquire),
            ),
            None => self
                .last_report
                .map(|r| (r.elapsed_s, r.cycles, 0))
                .unwrap_or_default(),
        };
        ControllerStatus {
            state: self.state(),
            mode: settings.mode,
            target_voltage: settings.target_voltage,
            last_commanded_voltage: self.link.last_commanded_voltage(),
            elapsed_s,
            cycles,
            consecutive_failures: failures,
            faulted: self.faulted,
            motor: self.motor_status(),
        }
    }

    fn motor(&self) -> Result<&AxisHandle, ControlError> {
        self.motor.as_ref().ok_or(ControlError::NoMotor)
    }

    pub fn start_motor(&self, direction: Direction) -> Result<(), ControlError> {
        self.motor()?.with(|m| m.start_continuous(direction))?;
        Ok(())
    }

    pub fn stop_motor(&self) -> Result<(), ControlError> {
        self.motor()?.with(|m| m.stop_continuous())?;
        Ok(())
    }

    pub fn set_motor_rpm(&self, rpm: f64) -> Result<(), ControlError> {
        self.motor()?.with(|m| m.set_rpm(rpm))?;
        Ok(())
    }

    pub fn set_motor_direction(&self, direction: Direction) -> Result<(), ControlError> {
        self.motor()?.with(|m| m.set_direction(direction))?;
        Ok(())
    }

    /// Blocking rotation; occupies the calling thread for the whole move.
    pub fn rotate_motor(&self, angle: f64, direction: Direction) -> Result<u64, ControlError> {
        Ok(self.motor()?.rotate_degrees(angle, direction)?)
    }

    /// Forward a scheduler tick to the motor. A controller without a motor
    /// ignores ticks.
    pub fn tick_motor(&self, now_us: u64) -> Result<bool, ControlError> {
        match &self.motor {
            Some(motor) => Ok(motor.tick(now_us)?),
            None => Ok(false),
        }
    }

    pub fn motor_status(&self) -> Option<MotorStatus> {
        self.motor.as_ref().map(AxisHandle::status)
    }

    /// Stop the session, then park and release the motor outputs.
    pub fn shutdown(&mut self) -> Result<(), ControlError> {
        let stopped = self.stop().map(|_| ());
        if let Some(motor) = &self.motor {
            motor.cleanup()?;
        }
        stopped
    }
}

impl<C: SerialChannel + 'static> Drop for ActuationController<C> {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "failed to stop actuation session on drop");
            }
        }
    }
}

/// Record the result of one exchange. Returns the outcome that ends the
/// session once the failure threshold is reached.
fn note_exchange(
    result: Result<(), LinkError>,
    shared: &SessionShared,
    threshold: u32,
) -> Option<u32> {
    match result {
        Ok(()) => {
            shared.failures.store(0, Ordering::Release);
            None
        }
        Err(e) => {
            let failures = shared.failures.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(error = %e, failures, threshold, "amplifier exchange failed");
            (failures >= threshold.max(1)).then_some(failures)
        }
    }
}

fn run_session<C: SerialChannel>(
    link: &AmplifierLink<C>,
    settings: &Mutex<SessionSettings>,
    shared: &SessionShared,
    config: &ActuationConfig,
) -> SessionOutcome {
    let threshold = config.failure_threshold;
    let lost = |failures: u32| {
        shared.flag.clear();
        error!(failures, "amplifier connection lost; disabling output");
        let disabled = match link.disable() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "disable after connection loss failed");
                false
            }
        };
        SessionOutcome::ConnectionLost { failures, disabled }
    };

    while shared.flag.is_set() {
        let SessionSettings {
            mode,
            target_voltage,
        } = *settings.lock().unwrap_or_else(|p| p.into_inner());

        match mode {
            OperatingMode::Continuous => {
                if let Some(failures) =
                    note_exchange(link.set_voltage(target_voltage), shared, threshold)
                {
                    return lost(failures);
                }
                if !shared.flag.wait(config.assert_interval) {
                    break;
                }
            }
            OperatingMode::Pulsed => {
                if let Some(failures) =
                    note_exchange(link.set_voltage(target_voltage), shared, threshold)
                {
                    return lost(failures);
                }
                if !shared.flag.wait(config.pulse_on) {
                    break;
                }
                if let Some(failures) =
                    note_exchange(link.send_raw_voltage(0.0), shared, threshold)
                {
                    return lost(failures);
                }
                if !shared.flag.wait(config.pulse_off) {
                    break;
                }
            }
        }
        shared.cycles.fetch_add(1, Ordering::AcqRel);
    }
    SessionOutcome::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConfig;
    use crate::sim::{SimAmplifierHandle, SimulatedAmplifier};

    fn controller(config: ActuationConfig) -> (ActuationController<SimulatedAmplifier>, SimAmplifierHandle) {
        let amp = SimulatedAmplifier::new();
        let handle = amp.handle();
        let link = Arc::new(AmplifierLink::new(
            amp,
            &LinkConfig {
                read_timeout: Duration::from_millis(30),
                ..Default::default()
            },
        ));
        (ActuationController::new(link, config), handle)
    }

    fn fast() -> ActuationConfig {
        ActuationConfig {
            pulse_on: Duration::from_millis(20),
            pulse_off: Duration::from_millis(20),
            assert_interval: Duration::from_millis(10),
            failure_threshold: 3,
        }
    }

    #[test]
    fn starts_idle() {
        let (ctl, _) = controller(fast());
        assert_eq!(ctl.state(), ControllerState::Idle);
        assert!(!ctl.is_running());
    }

    #[test]
    fn stop_without_session_is_a_no_op() {
        let (mut ctl, handle) = controller(fast());
        assert!(ctl.stop().unwrap().is_none());
        assert!(handle.commands().is_empty());
    }

    #[test]
    fn second_start_is_rejected() {
        let (mut ctl, handle) = controller(fast());
        ctl.start().unwrap();
        assert!(matches!(ctl.start(), Err(ControlError::AlreadyRunning)));
        ctl.stop().unwrap();
        assert_eq!(handle.count("ENABLE"), 1);
    }

    #[test]
    fn state_tracks_mode_while_running() {
        let (mut ctl, _) = controller(fast());
        ctl.set_mode(OperatingMode::Pulsed);
        ctl.start().unwrap();
        assert_eq!(ctl.state(), ControllerState::RunningPulsed);
        ctl.set_mode(OperatingMode::Continuous);
        assert_eq!(ctl.state(), ControllerState::RunningContinuous);
        ctl.stop().unwrap();
        assert_eq!(ctl.state(), ControllerState::Idle);
    }

    #[test]
    fn invalid_target_is_rejected() {
        let (ctl, _) = controller(fast());
        assert!(matches!(
            ctl.set_target_voltage(-1.0),
            Err(ControlError::InvalidVoltage(_))
        ));
        assert!(matches!(
            ctl.set_target_voltage(f32::NAN),
            Err(ControlError::InvalidVoltage(_))
        ));
    }

    #[test]
    fn unknown_preset_is_configuration_error() {
        let (ctl, handle) = controller(fast());
        assert!(matches!(
            ctl.apply_preset("99 kPa"),
            Err(ControlError::Configuration(_))
        ));
        assert!(handle.commands().is_empty());
    }

    #[test]
    fn idle_preset_commands_voltage_immediately() {
        let (ctl, handle) = controller(fast());
        let preset = ctl.apply_preset("30 kPa").unwrap();
        assert_eq!(preset.voltage, 75.0);
        assert_eq!(ctl.target_voltage(), 75.0);
        assert_eq!(handle.commands(), vec!["setVOLT75"]);
    }

    #[test]
    fn manual_commands_rejected_during_session() {
        let (mut ctl, _) = controller(fast());
        ctl.start().unwrap();
        assert!(matches!(
            ctl.manual_set_voltage(10.0),
            Err(ControlError::SessionActive)
        ));
        assert!(matches!(
            ctl.manual_set_frequency(30_000.0),
            Err(ControlError::SessionActive)
        ));
        ctl.stop().unwrap();
        ctl.manual_set_voltage(10.0).unwrap();
    }

    #[test]
    fn motor_commands_need_a_motor() {
        let (mut ctl, _) = controller(fast());
        assert!(matches!(
            ctl.start_motor(Direction::Clockwise),
            Err(ControlError::NoMotor)
        ));
        assert!(!ctl.tick_motor(1_000).unwrap());
        assert!(ctl.motor_status().is_none());
    }
}
