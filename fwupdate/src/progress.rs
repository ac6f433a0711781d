// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Flashing progress reports
 *
 * Copyright (c) 2025 Code Construct
 */

//! Progress timer
//!
//! The flashing script gives no progress of its own, so a fixed schedule
//! is reported while it runs: 20% after one step, 40% after two, and so on
//! up to 99% after five steps. 100% is only reported by the worker once the
//! script has succeeded.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use smol::channel::{Receiver, Sender};
use smol::Timer;

/// `(steps from start, percent complete)`
pub const SCHEDULE: [(u32, u8); 5] =
    [(1, 20), (2, 40), (3, 60), (4, 80), (5, 99)];

/// A running progress schedule.
///
/// Stopping (or dropping) the timer wakes the timer thread immediately
/// and joins it, no further reports are made afterwards.
pub struct ProgressTimer {
    // Closed to stop the timer. Nothing is ever sent.
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ProgressTimer {
    /// Starts reporting, with the schedule measured from `start`.
    ///
    /// Steps whose time has already passed are reported at once.
    pub fn start<F>(
        start: Instant,
        step: Duration,
        report: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut(u8) + Send + 'static,
    {
        let (stop, stopped) = smol::channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("fwupdate-progress".into())
            .spawn(move || {
                smol::block_on(run_schedule(start, step, stopped, report))
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        drop(self.stop.take());
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                warn!("progress reporter panicked");
            }
        }
    }
}

impl Drop for ProgressTimer {
    fn drop(&mut self) {
        self.halt();
    }
}

async fn run_schedule<F>(
    start: Instant,
    step: Duration,
    stopped: Receiver<()>,
    mut report: F,
) where
    F: FnMut(u8),
{
    for (n, percent) in SCHEDULE {
        let deadline = start + step * n;
        let tick = async {
            Timer::at(deadline).await;
            true
        };
        let cancel = async {
            // Err once the sender is dropped
            let _ = stopped.recv().await;
            false
        };

        if !smol::future::or(cancel, tick).await {
            trace!("progress stopped before {percent}%");
            return;
        }
        trace!("progress {percent}%");
        report(percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collect_from(
        start: Instant,
        step: Duration,
    ) -> (ProgressTimer, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let t = ProgressTimer::start(start, step, move |p| {
            s.lock().unwrap().push(p)
        })
        .unwrap();
        (t, seen)
    }

    fn collect(step: Duration) -> (ProgressTimer, Arc<Mutex<Vec<u8>>>) {
        collect_from(Instant::now(), step)
    }

    #[test]
    fn full_schedule() {
        let (t, seen) = collect(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(300));
        t.stop();
        assert_eq!(*seen.lock().unwrap(), vec![20, 40, 60, 80, 99]);
    }

    #[test]
    fn early_stop() {
        let (t, seen) = collect(Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(1500));

        let before = Instant::now();
        t.stop();
        // woken without waiting out the remaining schedule
        assert!(before.elapsed() < Duration::from_millis(500));

        std::thread::sleep(Duration::from_millis(1200));
        assert_eq!(*seen.lock().unwrap(), vec![20]);
    }

    #[test]
    fn measured_from_start() {
        // three steps already spent before the timer started
        let step = Duration::from_secs(1);
        let start = Instant::now() - step * 3 - Duration::from_millis(100);
        let (t, seen) = collect_from(start, step);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(*seen.lock().unwrap(), vec![20, 40, 60]);
        t.stop();
        assert_eq!(*seen.lock().unwrap(), vec![20, 40, 60]);
    }

    #[test]
    fn drop_stops() {
        let (t, seen) = collect(Duration::from_millis(50));
        drop(t);
        std::thread::sleep(Duration::from_millis(300));
        assert!(seen.lock().unwrap().is_empty());
    }
}
