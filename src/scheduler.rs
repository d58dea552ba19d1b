//! Frame cadence driver.
//!
//! The scheduler owns a dedicated thread that calls a tick closure at a target
//! interval, compensating for how long the tick itself took. A failed tick
//! stops the loop; the error surfaces from [`FrameScheduler::stop`]. Stats
//! snapshots from the rolling one-second window are pushed to a sink closure
//! as they roll over.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::foundation::error::{VeilcamError, VeilcamResult};
use crate::stats::{FrameStats, FrameTimings, StatsWindow};

/// Sleep needed after a tick to hold the target cadence. Zero when the tick
/// overran its slot.
pub fn next_delay(target: Duration, elapsed: Duration) -> Duration {
    target.saturating_sub(elapsed)
}

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    /// Interruptible sleep. Returns `true` if a stop was requested.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stop = self.stop.lock().expect("scheduler lock poisoned");
        while !*stop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(stop, deadline - now)
                .expect("scheduler lock poisoned");
            stop = guard;
        }
        true
    }

    fn stop_requested(&self) -> bool {
        *self.stop.lock().expect("scheduler lock poisoned")
    }

    fn request_stop(&self) {
        *self.stop.lock().expect("scheduler lock poisoned") = true;
        self.wake.notify_all();
    }
}

/// Running frame loop. Terminal once stopped: restarting means building a new
/// scheduler.
pub struct FrameScheduler {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<VeilcamResult<()>>>,
}

impl FrameScheduler {
    /// Spawn the frame thread. `tick` renders one frame and returns its
    /// timings; `stats_sink` receives a snapshot roughly once per second.
    pub fn start<T, S>(
        target_interval: Duration,
        mut tick: T,
        mut stats_sink: S,
    ) -> VeilcamResult<Self>
    where
        T: FnMut() -> VeilcamResult<FrameTimings> + Send + 'static,
        S: FnMut(FrameStats) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("veilcam-frames".into())
            .spawn(move || -> VeilcamResult<()> {
                let mut window = StatsWindow::new();
                loop {
                    if thread_shared.stop_requested() {
                        debug!("frame loop stopping");
                        return Ok(());
                    }

                    let started = Instant::now();
                    let timings = match tick() {
                        Ok(timings) => timings,
                        Err(err) => {
                            error!(error = %err, "frame tick failed, stopping loop");
                            return Err(err);
                        }
                    };
                    if let Some(stats) = window.record(&timings) {
                        stats_sink(stats);
                    }

                    let delay = next_delay(target_interval, started.elapsed());
                    if !delay.is_zero() && thread_shared.sleep(delay) {
                        debug!("frame loop stopping");
                        return Ok(());
                    }
                }
            })
            .map_err(|e| VeilcamError::render(format!("failed to spawn frame thread: {e}")))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Signal the frame thread to stop and wait for it. Returns the error
    /// that stopped the loop, if a tick failed before the stop request.
    pub fn stop(mut self) -> VeilcamResult<()> {
        self.shared.request_stop();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| VeilcamError::render("frame thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.shared.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_compensates_for_tick_duration() {
        assert_eq!(
            next_delay(Duration::from_millis(33), Duration::from_millis(5)),
            Duration::from_millis(28)
        );
    }

    #[test]
    fn overrunning_tick_yields_zero_delay() {
        assert_eq!(
            next_delay(Duration::from_millis(33), Duration::from_millis(40)),
            Duration::ZERO
        );
    }
}
