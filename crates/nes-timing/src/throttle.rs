//! Wall-clock frame pacing.
//!
//! A timer thread bumps two counters at the machine's frame rate. The
//! orchestrator drains the throttle counter once per drawn frame: its value
//! is how many frames are owed, which drives both the speed cap and the
//! automatic frameskip. These counters are the only state shared with
//! another thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::CpuUsage;

#[derive(Debug, Default)]
struct Counters {
    throttle: AtomicU32,
    frame_ticks: AtomicU32,
    stop: AtomicBool,
}

impl Counters {
    fn tick(&self) {
        self.throttle.fetch_add(1, Ordering::AcqRel);
        self.frame_ticks.fetch_add(1, Ordering::AcqRel);
    }
}

pub struct Throttle {
    counters: Arc<Counters>,
    timer: Option<JoinHandle<()>>,
    rate_hz: f64,
}

impl Throttle {
    /// Start a timer thread firing at `base_fps * speed_factor / 100` Hz.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn start(base_fps: u32, speed_factor: u32) -> std::io::Result<Self> {
        let rate_hz = f64::from(base_fps) * f64::from(speed_factor.max(1)) / 100.0;
        let counters = Arc::new(Counters::default());
        let period = Duration::from_secs_f64(1.0 / rate_hz);

        let shared = Arc::clone(&counters);
        let timer = thread::Builder::new()
            .name("frame-throttle".into())
            .spawn(move || {
                let mut deadline = Instant::now() + period;
                while !shared.stop.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < deadline {
                        thread::sleep(deadline - now);
                        continue;
                    }
                    shared.tick();
                    deadline += period;
                    // After a long stall, restart the schedule instead of
                    // firing a burst.
                    if now > deadline + period * 4 {
                        deadline = now + period;
                    }
                }
            })?;

        log::debug!("throttle running at {rate_hz:.2} Hz");
        Ok(Self {
            counters,
            timer: Some(timer),
            rate_hz,
        })
    }

    /// A throttle with no timer thread, advanced by [`tick`](Self::tick).
    #[must_use]
    pub fn manual() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            timer: None,
            rate_hz: 0.0,
        }
    }

    /// One timer period elapsed.
    pub fn tick(&self) {
        self.counters.tick();
    }

    #[must_use]
    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Frames owed, and zero them.
    pub fn take(&self) -> u32 {
        self.counters.throttle.swap(0, Ordering::AcqRel)
    }

    #[must_use]
    pub fn peek(&self) -> u32 {
        self.counters.throttle.load(Ordering::Acquire)
    }

    /// Timer periods since the last call, for frame-rate meters.
    pub fn take_frame_ticks(&self) -> u32 {
        self.counters.frame_ticks.swap(0, Ordering::AcqRel)
    }

    /// Block until at least one frame is owed.
    ///
    /// Returns immediately on a manual throttle with nothing owed, since
    /// nothing else could ever advance it.
    pub fn wait(&self, usage: CpuUsage) {
        if self.timer.is_none() {
            return;
        }
        while self.peek() == 0 {
            match usage {
                CpuUsage::Passive => thread::sleep(Duration::from_millis(1)),
                CpuUsage::Normal => thread::yield_now(),
                CpuUsage::Aggressive => std::hint::spin_loop(),
            }
        }
    }

    fn stop(&mut self) {
        self.counters.stop.store(true, Ordering::Release);
        if let Some(timer) = self.timer.take() {
            if timer.join().is_err() {
                log::warn!("throttle timer thread panicked");
            }
        }
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("rate_hz", &self.rate_hz)
            .field("owed", &self.peek())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_ticks_accumulate_and_drain() {
        let throttle = Throttle::manual();
        throttle.tick();
        throttle.tick();
        assert_eq!(throttle.peek(), 2);
        assert_eq!(throttle.take(), 2);
        assert_eq!(throttle.take(), 0);
        assert_eq!(throttle.take_frame_ticks(), 2);
        assert_eq!(throttle.take_frame_ticks(), 0);
    }

    #[test]
    fn frame_ticks_are_independent_of_throttle() {
        let throttle = Throttle::manual();
        throttle.tick();
        let _ = throttle.take();
        assert_eq!(throttle.take_frame_ticks(), 1);
    }

    #[test]
    fn manual_wait_does_not_block() {
        let throttle = Throttle::manual();
        throttle.wait(CpuUsage::Aggressive);
        assert_eq!(throttle.peek(), 0);
    }

    #[test]
    fn timer_thread_advances_counters() {
        let throttle = Throttle::start(1000, 100).expect("spawn");
        assert!(throttle.is_running());
        throttle.wait(CpuUsage::Passive);
        assert!(throttle.take() >= 1);
        thread::sleep(Duration::from_millis(20));
        assert!(throttle.take_frame_ticks() >= 2);
    }

    #[test]
    fn speed_factor_scales_rate() {
        let throttle = Throttle::start(60, 200).expect("spawn");
        assert!((throttle.rate_hz() - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn drop_joins_timer() {
        let throttle = Throttle::start(500, 100).expect("spawn");
        drop(throttle);
    }
}
