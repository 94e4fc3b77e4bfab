//! Step/direction pulse generation for a PUL/DIR/ENA stepper driver.
//!
//! Two driving modes share one axis and never overlap:
//! - blocking [`PulseEngine::step`], which owns the calling thread for the
//!   whole pulse train;
//! - non-blocking [`PulseEngine::tick`], which an external scheduler calls
//!   far more often than the half-period and which flips the PUL line only
//!   when its phase has expired.
//!
//! Speed is expressed as a half-period: the time PUL holds one level.
//! `half_period = 60 / (2 * steps_per_rev * microsteps * rpm)`, so one full
//! pulse (one step) takes two half-periods.

use crate::motion::{Direction, MotionAxis, MotionError};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{Error as _, OutputPin};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_STEPS_PER_REV: u32 = 200;
pub const DEFAULT_RPM: f64 = 60.0;

const PROGRESS_EVERY: u64 = 50;

/// Driver lines. ENA is active-low and optional.
pub struct PulsePins<P> {
    pub pul: P,
    pub dir: P,
    pub ena: Option<P>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    Idle,
    Continuous,
    Released,
}

#[derive(Debug, Clone)]
pub struct MotionConfig {
    pub steps_per_rev: u32,
    pub microsteps: u32,
    half_period_s: f64,
    direction: Direction,
    /// Direction held by the last blocking train until stop or reset.
    latched: Option<Direction>,
    enabled: bool,
    mode: DriveMode,
    /// Start of the current pulse cycle in tick mode.
    last_pulse_us: Option<u64>,
    pulse_high: bool,
}

impl MotionConfig {
    pub fn new(steps_per_rev: u32, microsteps: u32) -> Self {
        Self {
            steps_per_rev: steps_per_rev.max(1),
            microsteps: microsteps.max(1),
            half_period_s: half_period_for(DEFAULT_RPM, steps_per_rev.max(1), microsteps.max(1)),
            direction: Direction::Clockwise,
            latched: None,
            enabled: false,
            mode: DriveMode::Idle,
            last_pulse_us: None,
            pulse_high: false,
        }
    }

    pub fn half_period(&self) -> Duration {
        Duration::from_secs_f64(self.half_period_s)
    }

    pub fn half_period_s(&self) -> f64 {
        self.half_period_s
    }

    pub fn pulses_per_rev(&self) -> f64 {
        f64::from(self.steps_per_rev) * f64::from(self.microsteps)
    }

    pub fn rpm(&self) -> f64 {
        60.0 / (2.0 * self.pulses_per_rev() * self.half_period_s)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    pub fn pulse_high(&self) -> bool {
        self.pulse_high
    }

    pub fn steps_for_degrees(&self, angle: f64) -> i64 {
        (angle / 360.0 * self.pulses_per_rev()).round() as i64
    }
}

fn half_period_for(rpm: f64, steps_per_rev: u32, microsteps: u32) -> f64 {
    60.0 / (2.0 * f64::from(steps_per_rev) * f64::from(microsteps) * rpm)
}

pub struct PulseEngine<P, D> {
    pins: Option<PulsePins<P>>,
    delay: D,
    config: MotionConfig,
    pulses: u64,
}

impl<P: OutputPin, D: DelayNs> PulseEngine<P, D> {
    /// Take ownership of the driver lines and park them: driver disabled,
    /// PUL and DIR low.
    pub fn new(pins: PulsePins<P>, delay: D, config: MotionConfig) -> Result<Self, MotionError> {
        let mut engine = Self {
            pins: Some(pins),
            delay,
            config,
            pulses: 0,
        };
        engine.disable()?;
        let pins = engine.pins_mut()?;
        pins.pul.set_low().map_err(pin_error)?;
        pins.dir.set_low().map_err(pin_error)?;
        info!(
            steps_per_rev = engine.config.steps_per_rev,
            microsteps = engine.config.microsteps,
            "stepper outputs initialised"
        );
        Ok(engine)
    }

    fn pins_mut(&mut self) -> Result<&mut PulsePins<P>, MotionError> {
        self.pins.as_mut().ok_or(MotionError::Released)
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn set_rpm(&mut self, rpm: f64) -> Result<(), MotionError> {
        if !(rpm.is_finite() && rpm > 0.0) {
            return Err(MotionError::InvalidSpeed(rpm));
        }
        self.config.half_period_s =
            half_period_for(rpm, self.config.steps_per_rev, self.config.microsteps);
        debug!(rpm, half_period_us = self.config.half_period_s * 1e6, "stepper speed set");
        Ok(())
    }

    pub fn rpm(&self) -> f64 {
        self.config.rpm()
    }

    pub fn enable(&mut self) -> Result<(), MotionError> {
        if let Some(ena) = self.pins_mut()?.ena.as_mut() {
            ena.set_low().map_err(pin_error)?;
        }
        self.config.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), MotionError> {
        if let Some(ena) = self.pins_mut()?.ena.as_mut() {
            ena.set_high().map_err(pin_error)?;
        }
        self.config.enabled = false;
        Ok(())
    }

    fn write_direction(&mut self, direction: Direction) -> Result<(), MotionError> {
        let dir = &mut self.pins_mut()?.dir;
        if direction.dir_level_high() {
            dir.set_high().map_err(pin_error)?;
        } else {
            dir.set_low().map_err(pin_error)?;
        }
        self.config.direction = direction;
        Ok(())
    }

    /// Select a direction explicitly. Also clears a latched blocking
    /// direction. Rejected while continuous pulsing is active.
    pub fn set_direction(&mut self, direction: Direction) -> Result<(), MotionError> {
        if self.config.mode == DriveMode::Continuous && direction != self.config.direction {
            return Err(MotionError::DirectionLocked {
                latched: self.config.direction,
                requested: direction,
            });
        }
        self.write_direction(direction)?;
        self.config.latched = None;
        Ok(())
    }

    fn wait_half_period(&mut self) {
        let ns = self.config.half_period_s * 1e9;
        if ns <= f64::from(u32::MAX) {
            self.delay.delay_ns(ns.round() as u32);
        } else {
            self.delay.delay_us((ns / 1e3).round().min(f64::from(u32::MAX)) as u32);
        }
    }

    /// Blocking pulse train. The sign picks the direction, which stays
    /// latched until [`stop`](Self::stop) or [`set_direction`](Self::set_direction);
    /// a train in the other direction before that is rejected.
    pub fn step(&mut self, count: i64) -> Result<u64, MotionError> {
        match self.config.mode {
            DriveMode::Released => return Err(MotionError::Released),
            DriveMode::Continuous => return Err(MotionError::ModeConflict),
            DriveMode::Idle => {}
        }
        if count == 0 {
            return Ok(0);
        }
        let direction = Direction::from_steps(count);
        if let Some(latched) = self.config.latched {
            if latched != direction {
                return Err(MotionError::DirectionLocked {
                    latched,
                    requested: direction,
                });
            }
        }

        self.enable()?;
        self.write_direction(direction)?;
        self.config.latched = Some(direction);

        let total = count.unsigned_abs();
        debug!(steps = total, direction = ?direction, "stepping");
        for done in 1..=total {
            self.pins_mut()?.pul.set_high().map_err(pin_error)?;
            self.wait_half_period();
            self.pins_mut()?.pul.set_low().map_err(pin_error)?;
            self.wait_half_period();
            self.pulses += 1;
            if done % PROGRESS_EVERY == 0 {
                debug!(done, total, "step progress");
            }
        }
        Ok(total)
    }

    pub fn rotate_degrees(&mut self, angle: f64, direction: Direction) -> Result<u64, MotionError> {
        let steps = self.config.steps_for_degrees(angle);
        let signed = match direction {
            Direction::Clockwise => steps,
            Direction::CounterClockwise => -steps,
        };
        self.step(signed)
    }

    /// Arm tick mode: driver enabled, direction set, PUL low. The first
    /// tick after arming starts the phase clock.
    pub fn start_continuous(&mut self, direction: Direction) -> Result<(), MotionError> {
        match self.config.mode {
            DriveMode::Released => return Err(MotionError::Released),
            DriveMode::Continuous if self.config.direction == direction => return Ok(()),
            DriveMode::Continuous => {
                return Err(MotionError::DirectionLocked {
                    latched: self.config.direction,
                    requested: direction,
                })
            }
            DriveMode::Idle => {}
        }
        self.enable()?;
        self.write_direction(direction)?;
        self.config.latched = None;
        self.pins_mut()?.pul.set_low().map_err(pin_error)?;
        self.config.pulse_high = false;
        self.config.last_pulse_us = None;
        self.config.mode = DriveMode::Continuous;
        info!(rpm = self.rpm(), direction = ?direction, "continuous pulsing started");
        Ok(())
    }

    /// Advance the pulse phase. PUL rises one half-period after the cycle
    /// start and falls one half-period later; only the falling edge moves
    /// the cycle start. Returns whether PUL changed level.
    pub fn tick(&mut self, now_us: u64) -> Result<bool, MotionError> {
        if self.config.mode != DriveMode::Continuous {
            return Ok(false);
        }
        let Some(last) = self.config.last_pulse_us else {
            self.config.last_pulse_us = Some(now_us);
            return Ok(false);
        };

        let half_us = ((self.config.half_period_s * 1e6).round() as u64).max(1);
        let elapsed_us = now_us.saturating_sub(last);

        if !self.config.pulse_high {
            if elapsed_us >= half_us {
                self.pins_mut()?.pul.set_high().map_err(pin_error)?;
                self.config.pulse_high = true;
                return Ok(true);
            }
            return Ok(false);
        }

        if elapsed_us >= 2 * half_us {
            self.pins_mut()?.pul.set_low().map_err(pin_error)?;
            self.config.pulse_high = false;
            self.pulses += 1;
            // Keep the cadence anchored to the schedule unless the caller
            // stalled for longer than a half-period.
            let scheduled = last + 2 * half_us;
            let lag = now_us.saturating_sub(scheduled);
            self.config.last_pulse_us = Some(if lag < half_us { scheduled } else { now_us });
            return Ok(true);
        }
        Ok(false)
    }

    /// Disarm tick mode and park PUL low. The driver stays enabled.
    pub fn stop_continuous(&mut self) -> Result<(), MotionError> {
        if self.config.mode != DriveMode::Continuous {
            return Ok(());
        }
        self.pins_mut()?.pul.set_low().map_err(pin_error)?;
        self.config.pulse_high = false;
        self.config.last_pulse_us = None;
        self.config.mode = DriveMode::Idle;
        info!(pulses = self.pulses, "continuous pulsing stopped");
        Ok(())
    }

    /// Full stop: disarm, disable the driver, clear the direction latch.
    pub fn stop(&mut self) -> Result<(), MotionError> {
        self.stop_continuous()?;
        self.disable()?;
        self.config.latched = None;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.config.mode == DriveMode::Continuous
    }

    pub fn pulses_completed(&self) -> u64 {
        self.pulses
    }

    /// Disable the driver and release the output lines. Safe to call twice.
    pub fn cleanup(&mut self) -> Result<(), MotionError> {
        if self.pins.is_none() {
            return Ok(());
        }
        let parked = self.stop();
        self.pins = None;
        self.config.mode = DriveMode::Released;
        self.config.enabled = false;
        info!("stepper outputs released");
        parked
    }
}

fn pin_error<E: embedded_hal::digital::Error>(err: E) -> MotionError {
    MotionError::Pin(err.kind())
}

impl<P, D> MotionAxis for PulseEngine<P, D>
where
    P: OutputPin + Send,
    D: DelayNs + Send,
{
    fn set_rpm(&mut self, rpm: f64) -> Result<(), MotionError> {
        PulseEngine::set_rpm(self, rpm)
    }

    fn rpm(&self) -> f64 {
        PulseEngine::rpm(self)
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), MotionError> {
        PulseEngine::set_direction(self, direction)
    }

    fn direction(&self) -> Direction {
        self.config.direction()
    }

    fn step(&mut self, count: i64) -> Result<u64, MotionError> {
        PulseEngine::step(self, count)
    }

    fn rotate_degrees(&mut self, angle: f64, direction: Direction) -> Result<u64, MotionError> {
        PulseEngine::rotate_degrees(self, angle, direction)
    }

    fn start_continuous(&mut self, direction: Direction) -> Result<(), MotionError> {
        PulseEngine::start_continuous(self, direction)
    }

    fn stop_continuous(&mut self) -> Result<(), MotionError> {
        PulseEngine::stop_continuous(self)
    }

    fn tick(&mut self, now_us: u64) -> Result<bool, MotionError> {
        PulseEngine::tick(self, now_us)
    }

    fn is_running(&self) -> bool {
        PulseEngine::is_running(self)
    }

    fn pulses_completed(&self) -> u64 {
        PulseEngine::pulses_completed(self)
    }

    fn cleanup(&mut self) -> Result<(), MotionError> {
        PulseEngine::cleanup(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{InstantDelay, PinProbe, SimulatedPin};

    struct Rig {
        engine: PulseEngine<SimulatedPin, InstantDelay>,
        pul: PinProbe,
        dir: PinProbe,
        ena: PinProbe,
        delay: InstantDelay,
    }

    fn rig() -> Rig {
        let (pul, pul_probe) = SimulatedPin::new();
        let (dir, dir_probe) = SimulatedPin::new();
        let (ena, ena_probe) = SimulatedPin::new();
        let delay = InstantDelay::default();
        let engine = PulseEngine::new(
            PulsePins {
                pul,
                dir,
                ena: Some(ena),
            },
            delay.clone(),
            MotionConfig::new(200, 1),
        )
        .unwrap();
        Rig {
            engine,
            pul: pul_probe,
            dir: dir_probe,
            ena: ena_probe,
            delay,
        }
    }

    #[test]
    fn new_parks_outputs() {
        let rig = rig();
        assert!(rig.ena.is_high(), "driver must start disabled");
        assert!(!rig.pul.is_high());
        assert!(!rig.dir.is_high());
    }

    #[test]
    fn rpm_maps_to_half_period() {
        let mut rig = rig();
        rig.engine.set_rpm(60.0).unwrap();
        assert!((rig.engine.config().half_period_s() - 0.0025).abs() < 1e-12);
        assert!((rig.engine.rpm() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_rpm_is_rejected_without_side_effects() {
        let mut rig = rig();
        rig.engine.set_rpm(30.0).unwrap();
        let before = rig.engine.config().half_period_s();
        assert_eq!(rig.engine.set_rpm(0.0), Err(MotionError::InvalidSpeed(0.0)));
        assert_eq!(rig.engine.set_rpm(-5.0), Err(MotionError::InvalidSpeed(-5.0)));
        assert!(matches!(
            rig.engine.set_rpm(f64::NAN),
            Err(MotionError::InvalidSpeed(_))
        ));
        assert_eq!(rig.engine.config().half_period_s(), before);
    }

    #[test]
    fn blocking_step_emits_one_rising_edge_per_step() {
        let mut rig = rig();
        rig.engine.set_rpm(60.0).unwrap();
        assert_eq!(rig.engine.step(10).unwrap(), 10);
        assert_eq!(rig.pul.rising_edges(), 10);
        assert!(!rig.pul.is_high());
        assert!(rig.dir.is_high(), "positive count drives clockwise");
        assert!(!rig.ena.is_high(), "driver enabled while stepping");
        // Twenty half-periods of 2.5 ms.
        assert_eq!(rig.delay.total(), Duration::from_millis(50));
    }

    #[test]
    fn reversing_without_stop_is_rejected() {
        let mut rig = rig();
        rig.engine.step(10).unwrap();
        let err = rig.engine.step(-10).unwrap_err();
        assert_eq!(
            err,
            MotionError::DirectionLocked {
                latched: Direction::Clockwise,
                requested: Direction::CounterClockwise,
            }
        );
        assert_eq!(rig.pul.rising_edges(), 10);

        rig.engine.stop().unwrap();
        assert_eq!(rig.engine.step(-10).unwrap(), 10);
        assert!(!rig.dir.is_high());
    }

    #[test]
    fn explicit_direction_reset_unlatches() {
        let mut rig = rig();
        rig.engine.step(5).unwrap();
        rig.engine.set_direction(Direction::CounterClockwise).unwrap();
        assert_eq!(rig.engine.step(-5).unwrap(), 5);
    }

    #[test]
    fn rotate_degrees_rounds_to_steps() {
        let mut rig = rig();
        assert_eq!(rig.engine.rotate_degrees(90.0, Direction::Clockwise).unwrap(), 50);
        rig.engine.stop().unwrap();
        assert_eq!(
            rig.engine
                .rotate_degrees(1.0, Direction::CounterClockwise)
                .unwrap(),
            1
        );
        assert_eq!(rig.pul.rising_edges(), 51);
    }

    #[test]
    fn tick_holds_each_level_for_one_half_period() {
        let mut rig = rig();
        rig.engine.set_rpm(60.0).unwrap(); // 2500 us half-period
        rig.engine.start_continuous(Direction::Clockwise).unwrap();

        let spacing = 1250;
        let mut flips = Vec::new();
        for i in 0..=40u64 {
            let now = i * spacing;
            if rig.engine.tick(now).unwrap() {
                flips.push((now, rig.pul.is_high()));
            }
        }

        // After warm-up every second call flips, alternating levels.
        for pair in flips.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, 2500);
            assert_ne!(pair[0].1, pair[1].1);
        }
        let falling: Vec<u64> = flips.iter().filter(|f| !f.1).map(|f| f.0).collect();
        for pair in falling.windows(2) {
            assert!((pair[1] - pair[0]).abs_diff(5000) <= spacing);
        }
        assert_eq!(rig.engine.pulses_completed(), falling.len() as u64);
    }

    #[test]
    fn ticks_one_half_period_apart_flip_every_call() {
        let mut rig = rig();
        rig.engine.set_rpm(60.0).unwrap();
        rig.engine.start_continuous(Direction::Clockwise).unwrap();

        let half = 2500;
        assert!(!rig.engine.tick(0).unwrap(), "first tick only sets the baseline");
        let mut falling = Vec::new();
        for i in 1..=20u64 {
            let now = i * half;
            assert!(rig.engine.tick(now).unwrap(), "no flip at {now}");
            assert_eq!(rig.pul.is_high(), i % 2 == 1);
            if !rig.pul.is_high() {
                falling.push(now);
            }
        }
        assert_eq!(falling.len(), 10);
        for pair in falling.windows(2) {
            assert_eq!(pair[1] - pair[0], 2 * half);
        }
        assert_eq!(rig.engine.pulses_completed(), 10);
        assert_eq!(rig.pul.rising_edges(), 10);
    }

    #[test]
    fn coarse_ticks_keep_cadence() {
        let mut rig = rig();
        rig.engine.set_rpm(60.0).unwrap();
        rig.engine.start_continuous(Direction::Clockwise).unwrap();
        // 1 ms scheduler against a 2.5 ms half-period.
        for now in (0..=1_000_000u64).step_by(1000) {
            rig.engine.tick(now).unwrap();
        }
        // 60 rpm at 200 steps/rev is 200 pulses per second.
        let pulses = rig.engine.pulses_completed();
        assert!((199..=200).contains(&pulses), "got {pulses}");
    }

    #[test]
    fn blocking_step_rejected_while_continuous() {
        let mut rig = rig();
        rig.engine.start_continuous(Direction::Clockwise).unwrap();
        assert_eq!(rig.engine.step(3), Err(MotionError::ModeConflict));
        assert!(matches!(
            rig.engine.set_direction(Direction::CounterClockwise),
            Err(MotionError::DirectionLocked { .. })
        ));
        rig.engine.stop_continuous().unwrap();
        assert!(!rig.pul.is_high());
        assert!(!rig.ena.is_high(), "stop_continuous keeps the driver enabled");
        assert_eq!(rig.engine.step(3).unwrap(), 3);
    }

    #[test]
    fn tick_is_inert_when_not_armed() {
        let mut rig = rig();
        assert!(!rig.engine.tick(10_000_000).unwrap());
        assert_eq!(rig.pul.rising_edges(), 0);
    }

    #[test]
    fn cleanup_disables_and_is_idempotent() {
        let mut rig = rig();
        rig.engine.start_continuous(Direction::Clockwise).unwrap();
        rig.engine.cleanup().unwrap();
        assert!(rig.ena.is_high());
        assert!(!rig.pul.is_high());
        rig.engine.cleanup().unwrap();
        assert_eq!(rig.engine.step(1), Err(MotionError::Released));
        assert_eq!(
            rig.engine.start_continuous(Direction::Clockwise),
            Err(MotionError::Released)
        );
    }
}

#[cfg(test)]
mod proptest_rpm {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(2000))]

        // Property: the rpm read back matches the rpm commanded
        #[test]
        fn rpm_round_trips(
            rpm in 0.01f64..5000.0,
            steps in 1u32..=400,
            micro in prop::sample::select(vec![1u32, 2, 4, 8, 16, 32]),
        ) {
            let mut config = MotionConfig::new(steps, micro);
            config.half_period_s = half_period_for(rpm, steps, micro);
            let back = config.rpm();
            prop_assert!(((back - rpm) / rpm).abs() < 1e-9, "rpm={} back={}", rpm, back);
        }
    }
}
