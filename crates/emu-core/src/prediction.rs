//! Forward prediction windows.

use crate::Ticks;

/// The span of master time a device has promised to be accurate about.
///
/// A device opens a window when it predicts its next interrupt. A register
/// write that changes interrupt timing halfway through asks for the
/// [`remaining`](Self::remaining) part and predicts over that instead, so a
/// reprediction never looks further ahead than the original promise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PredictionWindow {
    timestamp: Ticks,
    horizon: u64,
}

impl PredictionWindow {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timestamp: Ticks::ZERO,
            horizon: 0,
        }
    }

    /// Start a new window of `horizon` master cycles at `now`.
    pub fn open(&mut self, now: Ticks, horizon: u64) {
        self.timestamp = now;
        self.horizon = horizon;
    }

    /// Master cycles of the window still ahead of `now`. Zero once the
    /// window has passed; never negative.
    #[must_use]
    pub fn remaining(&self, now: Ticks) -> u64 {
        self.horizon.saturating_sub(now.since(self.timestamp))
    }

    #[must_use]
    pub const fn timestamp(&self) -> Ticks {
        self.timestamp
    }

    #[must_use]
    pub const fn horizon(&self) -> u64 {
        self.horizon
    }

    /// Restore a saved window.
    pub fn restore(&mut self, timestamp: Ticks, horizon: u64) {
        self.timestamp = timestamp;
        self.horizon = horizon;
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
