//! Stepper tick thread. It owns the 1 ms cadence, so link exchanges and
//! blocking moves on the operator side never hold PUL still.

use crossbeam_channel::{select, Receiver};
use sono_core::{AxisHandle, TimeBase};
use sono_io::metrics::TICK_LAG_US;
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub struct PulseThread {
    stop: crossbeam_channel::Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl PulseThread {
    pub fn start(axis: AxisHandle, period: Duration, timebase: TimeBase) -> io::Result<Self> {
        let (stop, shutdown) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("pulse".to_string())
            .spawn(move || run(&axis, period, timebase, &shutdown))?;
        Ok(Self { stop, handle })
    }

    pub fn stop(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            error!("pulse thread panicked");
        }
    }
}

fn run(axis: &AxisHandle, period: Duration, timebase: TimeBase, shutdown: &Receiver<()>) {
    let ticker = crossbeam_channel::tick(period);
    debug!(period_us = period.as_micros() as u64, "pulse thread running");
    loop {
        select! {
            recv(ticker) -> scheduled => {
                if let Ok(scheduled) = scheduled {
                    let lag = Instant::now().saturating_duration_since(scheduled);
                    TICK_LAG_US.observe(lag.as_micros() as f64);
                }
                if let Err(e) = axis.tick(timebase.now_us()) {
                    error!(error = %e, "motor tick failed; stopping motor");
                    if let Err(e) = axis.with(|m| m.stop_continuous()) {
                        error!(error = %e, "motor stop after tick failure failed");
                    }
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
    debug!("pulse thread stopped");
}
