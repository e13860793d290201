//! Real-time rewinder.
//!
//! A bounded queue of uncompressed FNSS images. While playing, the
//! orchestrator offers a snapshot every `wait_frames` frames; while the
//! rewind key is held, it pops the newest at the same cadence.

use std::collections::VecDeque;

use crate::config::RewindConfig;
use crate::error::StateError;

#[derive(Debug, Clone)]
pub struct Rewinder {
    enabled: bool,
    frame_rate: f64,
    seconds: u32,
    max_queue: usize,
    /// Frames between captures.
    period: u32,
    wait_frames: u32,
    queue: VecDeque<Vec<u8>>,
}

impl Rewinder {
    #[must_use]
    pub fn new(config: &RewindConfig) -> Self {
        let mut rewinder = Self {
            enabled: false,
            frame_rate: 0.0,
            seconds: 0,
            max_queue: 0,
            period: 1,
            wait_frames: 0,
            queue: VecDeque::new(),
        };
        rewinder.configure(config);
        rewinder
    }

    /// Apply settings, clamped to sane limits. Clears the queue.
    pub fn configure(&mut self, config: &RewindConfig) {
        self.enabled = config.enabled;
        self.frame_rate = config.frame_rate.clamp(f64::EPSILON, 1.0);
        self.seconds = config.seconds.max(1);
        self.max_queue = (60.0 * self.frame_rate * f64::from(self.seconds)).round() as usize;
        self.period = (1.0 / self.frame_rate).round().min(f64::from(u32::MAX)) as u32;
        self.clear();
        log::info!(
            "rewinder {}: {} snapshots, one every {} frames",
            if self.enabled { "enabled" } else { "disabled" },
            self.max_queue,
            self.period
        );
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    #[must_use]
    pub fn period(&self) -> u32 {
        self.period
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.wait_frames = 0;
    }

    /// Count down one frame. True when the frame is due for a snapshot.
    fn frame_due(&mut self) -> bool {
        self.wait_frames = self.wait_frames.saturating_sub(1);
        self.wait_frames == 0
    }

    /// Called once per frame while playing. True when the caller should
    /// capture and [`push_snapshot`](Self::push_snapshot).
    pub fn wants_snapshot(&mut self) -> bool {
        self.enabled && self.max_queue > 0 && self.frame_due()
    }

    /// Queue a capture, dropping the oldest one if full.
    pub fn push_snapshot(&mut self, image: Vec<u8>) {
        if self.max_queue == 0 {
            return;
        }
        while self.queue.len() >= self.max_queue {
            self.queue.pop_front();
        }
        self.queue.push_back(image);
        self.wait_frames = self.period;
    }

    /// Called once per frame while rewinding. `Ok(None)` while waiting out
    /// the capture period.
    ///
    /// # Errors
    ///
    /// [`StateError::Empty`] when there is nothing left to go back to.
    pub fn take_snapshot(&mut self) -> Result<Option<Vec<u8>>, StateError> {
        if !self.enabled {
            return Err(StateError::Empty);
        }
        if !self.frame_due() {
            return Ok(None);
        }
        let image = self.queue.pop_back().ok_or(StateError::Empty)?;
        self.wait_frames = self.period;
        Ok(Some(image))
    }
}
