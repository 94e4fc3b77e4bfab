use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use thiserror::Error;

/// Rotation direction of the stepper. Clockwise drives DIR high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Clockwise,
    CounterClockwise,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Clockwise => Direction::CounterClockwise,
            Direction::CounterClockwise => Direction::Clockwise,
        }
    }

    /// Direction implied by the sign of a step count.
    pub fn from_steps(count: i64) -> Self {
        if count >= 0 {
            Direction::Clockwise
        } else {
            Direction::CounterClockwise
        }
    }

    pub fn dir_level_high(self) -> bool {
        matches!(self, Direction::Clockwise)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum MotionError {
    #[error("speed must be a positive finite rpm, got {0}")]
    InvalidSpeed(f64),
    #[error("direction is latched to {latched:?}; stop or reset direction before moving {requested:?}")]
    DirectionLocked {
        latched: Direction,
        requested: Direction,
    },
    #[error("blocking steps and continuous pulsing cannot run together")]
    ModeConflict,
    #[error("digital output failed: {0:?}")]
    Pin(embedded_hal::digital::ErrorKind),
    #[error("motion outputs already released")]
    Released,
    #[error("a blocking move is in progress")]
    Busy,
}

/// Read-only view of a motion axis for display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorStatus {
    pub running: bool,
    pub rpm: f64,
    pub direction: Direction,
    pub pulses_completed: u64,
}

/// Object-safe surface of one stepper axis, driven by the actuation
/// controller and ticked by the station scheduler.
pub trait MotionAxis: Send {
    fn set_rpm(&mut self, rpm: f64) -> Result<(), MotionError>;
    fn rpm(&self) -> f64;
    fn set_direction(&mut self, direction: Direction) -> Result<(), MotionError>;
    fn direction(&self) -> Direction;
    fn step(&mut self, count: i64) -> Result<u64, MotionError>;
    fn rotate_degrees(&mut self, angle: f64, direction: Direction) -> Result<u64, MotionError>;
    fn start_continuous(&mut self, direction: Direction) -> Result<(), MotionError>;
    fn stop_continuous(&mut self) -> Result<(), MotionError>;
    fn tick(&mut self, now_us: u64) -> Result<bool, MotionError>;
    fn is_running(&self) -> bool;
    fn pulses_completed(&self) -> u64;
    fn cleanup(&mut self) -> Result<(), MotionError>;

    fn status(&self) -> MotorStatus {
        MotorStatus {
            running: self.is_running(),
            rpm: self.rpm(),
            direction: self.direction(),
            pulses_completed: self.pulses_completed(),
        }
    }
}

struct AxisShared {
    axis: Mutex<Box<dyn MotionAxis>>,
    moving: AtomicBool,
    /// Status taken when the current blocking move began.
    parked: Mutex<Option<MotorStatus>>,
}

/// Cloneable handle to one axis, shared by the operator side and the pulse
/// thread. While a blocking move runs, other callers get
/// [`MotionError::Busy`] and ticks are skipped rather than queued.
#[derive(Clone)]
pub struct AxisHandle {
    shared: Arc<AxisShared>,
}

impl AxisHandle {
    pub fn new(axis: Box<dyn MotionAxis>) -> Self {
        Self {
            shared: Arc::new(AxisShared {
                axis: Mutex::new(axis),
                moving: AtomicBool::new(false),
                parked: Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn MotionAxis>> {
        self.shared.axis.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_moving(&self) -> bool {
        self.shared.moving.load(Ordering::Acquire)
    }

    /// Run a short operation on the axis. Rejected during a blocking move.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut dyn MotionAxis) -> Result<R, MotionError>,
    ) -> Result<R, MotionError> {
        if self.is_moving() {
            return Err(MotionError::Busy);
        }
        let mut axis = self.lock();
        f(axis.as_mut())
    }

    /// Blocking rotation. Holds the axis for the whole move.
    pub fn rotate_degrees(&self, angle: f64, direction: Direction) -> Result<u64, MotionError> {
        if self
            .shared
            .moving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MotionError::Busy);
        }
        let result = {
            let mut axis = self.lock();
            *self.shared.parked.lock().unwrap_or_else(|p| p.into_inner()) = Some(axis.status());
            axis.rotate_degrees(angle, direction)
        };
        self.shared.moving.store(false, Ordering::Release);
        result
    }

    /// Forward a scheduler tick. Never waits on the axis: a tick that finds
    /// it held reports no flip.
    pub fn tick(&self, now_us: u64) -> Result<bool, MotionError> {
        if self.is_moving() {
            return Ok(false);
        }
        match self.shared.axis.try_lock() {
            Ok(mut axis) => axis.tick(now_us),
            Err(TryLockError::Poisoned(p)) => p.into_inner().tick(now_us),
            Err(TryLockError::WouldBlock) => Ok(false),
        }
    }

    /// Current status; during a blocking move, the status from its start.
    pub fn status(&self) -> MotorStatus {
        let parked = || {
            *self.shared.parked.lock().unwrap_or_else(|p| p.into_inner())
        };
        match self.shared.axis.try_lock() {
            Ok(axis) => axis.status(),
            Err(TryLockError::Poisoned(p)) => p.into_inner().status(),
            Err(TryLockError::WouldBlock) => match parked() {
                Some(status) if self.is_moving() => status,
                _ => self.lock().status(),
            },
        }
    }

    /// Release the outputs, waiting for any blocking move to finish.
    pub fn cleanup(&self) -> Result<(), MotionError> {
        self.lock().cleanup()
    }
}

impl std::fmt::Debug for AxisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxisHandle")
            .field("moving", &self.is_moving())
            .finish_non_exhaustive()
    }
}
