//! Bounded temperature history with an auto-ranging plot window.

use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub t_s: f64,
    pub celsius: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlotWindow {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Default for PlotWindow {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            x_max: 100.0,
            y_min: 35.0,
            y_max: 70.0,
        }
    }
}

const X_LEAD_S: f64 = 20.0;
const X_GROW_S: f64 = 50.0;
const Y_MARGIN_C: f64 = 5.0;
const Y_HEADROOM_C: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct TrendBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
    window: PlotWindow,
    recording: bool,
}

impl TrendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            window: PlotWindow::default(),
            recording: false,
        }
    }

    /// Begin a fresh recording: history and window are reset.
    pub fn start_recording(&mut self) {
        self.clear();
        self.recording = true;
    }

    /// Freeze the history; later points are ignored until the next start.
    pub fn stop_recording(&mut self) {
        self.recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Append a sample, evicting the oldest once full, and widen the window
    /// so the newest point stays in view. The window never shrinks.
    pub fn add_point(&mut self, t_s: f64, celsius: f64) {
        if !self.recording || !t_s.is_finite() || !celsius.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { t_s, celsius });

        let w = &mut self.window;
        if t_s > w.x_max - X_LEAD_S {
            w.x_max = t_s + X_GROW_S;
        }
        if celsius > w.y_max - Y_MARGIN_C {
            w.y_max = celsius + Y_HEADROOM_C;
        }
        if celsius < w.y_min + Y_MARGIN_C {
            w.y_min = celsius - Y_MARGIN_C;
        }
    }

    pub fn window(&self) -> PlotWindow {
        self.window
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.window = PlotWindow::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(capacity: usize) -> TrendBuffer {
        let mut trend = TrendBuffer::new(capacity);
        trend.start_recording();
        trend
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut trend = recording(3);
        for i in 0..5 {
            trend.add_point(f64::from(i), 40.0);
        }
        assert_eq!(trend.len(), 3);
        assert_eq!(trend.samples().next().map(|s| s.t_s), Some(2.0));
        assert_eq!(trend.latest().map(|s| s.t_s), Some(4.0));
    }

    #[test]
    fn time_axis_grows_ahead_of_data() {
        let mut trend = recording(10);
        trend.add_point(50.0, 40.0);
        assert_eq!(trend.window().x_max, 100.0);
        trend.add_point(81.0, 40.0);
        assert_eq!(trend.window().x_max, 131.0);
    }

    #[test]
    fn temperature_axis_keeps_margins() {
        let mut trend = recording(10);
        trend.add_point(1.0, 66.0);
        assert_eq!(trend.window().y_max, 76.0);
        trend.add_point(2.0, 38.0);
        assert_eq!(trend.window().y_min, 33.0);
        trend.add_point(3.0, 50.0);
        let w = trend.window();
        assert_eq!((w.y_min, w.y_max), (33.0, 76.0));
    }

    #[test]
    fn points_outside_a_recording_are_ignored() {
        let mut trend = TrendBuffer::new(8);
        trend.add_point(1.0, 40.0);
        assert!(trend.is_empty());
        trend.start_recording();
        trend.add_point(2.0, 40.0);
        trend.stop_recording();
        trend.add_point(3.0, 41.0);
        assert_eq!(trend.len(), 1);
        assert!(!trend.is_recording());

        trend.start_recording();
        assert!(trend.is_empty());
    }

    #[test]
    fn non_finite_samples_are_dropped() {
        let mut trend = recording(4);
        trend.add_point(1.0, f64::NAN);
        assert!(trend.is_empty());
        assert_eq!(trend.window(), PlotWindow::default());
    }
}
