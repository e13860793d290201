//! Master clock and divided device clocks.
//!
//! The CPU owns the master timeline. Every other device runs at a fixed
//! integer fraction of it and is only brought up to date when something
//! observes it. [`DeviceClock`] does the bookkeeping for that catch-up: it
//! remembers the last master instant the device saw and the cycles that did
//! not yet add up to a whole local tick.

use crate::Ticks;

/// Master clock configuration for a system.
///
/// Each system has a master crystal that drives all timing. Components may
/// run at divided rates, but everything derives from this frequency.
#[derive(Debug, Clone, Copy)]
pub struct MasterClock {
    /// Crystal frequency in Hz (e.g., `21_477_272` for an NTSC console).
    pub frequency_hz: u64,
}

impl MasterClock {
    #[must_use]
    pub const fn new(frequency_hz: u64) -> Self {
        Self { frequency_hz }
    }

    /// Ticks per frame at the given frame rate (integer division).
    #[must_use]
    pub const fn ticks_per_frame(&self, frames_per_second: u64) -> Ticks {
        Ticks::new(self.frequency_hz / frames_per_second)
    }

    /// Rate in Hz of a device clocked every `divider` master cycles.
    #[must_use]
    pub fn device_hz(&self, divider: u64) -> f64 {
        self.frequency_hz as f64 / divider.max(1) as f64
    }
}

/// Result of one [`DeviceClock::catch_up`] call.
///
/// Local tick `k` (zero based) of the batch happened at master instant
/// [`CatchUp::time_of`]`(k)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    /// Whole local ticks to execute.
    pub ticks: u64,
    first: Ticks,
    divider: u64,
}

impl CatchUp {
    /// Master instant at which local tick `k` of this batch completes.
    #[must_use]
    pub fn time_of(&self, k: u64) -> Ticks {
        self.first + k * self.divider
    }
}

/// A device clock derived from the master clock by an integer divider.
///
/// Invariant: across any sequence of [`catch_up`](Self::catch_up) calls,
/// `ticks_emitted * divider + buffer` equals the master cycles elapsed plus
/// the buffer carried in. No cycle is lost or counted twice, however the
/// calls are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceClock {
    divider: u64,
    counter: Ticks,
    buffer: u64,
}

impl DeviceClock {
    /// A clock ticking once every `divider` master cycles. A zero divider
    /// is treated as one.
    #[must_use]
    pub const fn new(divider: u64) -> Self {
        Self {
            divider: if divider == 0 { 1 } else { divider },
            counter: Ticks::ZERO,
            buffer: 0,
        }
    }

    #[must_use]
    pub const fn divider(&self) -> u64 {
        self.divider
    }

    /// Last master instant this device was synchronised to.
    #[must_use]
    pub const fn counter(&self) -> Ticks {
        self.counter
    }

    /// Master cycles carried toward the next local tick.
    #[must_use]
    pub const fn buffer(&self) -> u64 {
        self.buffer
    }

    /// Consume every master cycle up to `now` and report how many whole
    /// local ticks that makes. The remainder stays in the buffer.
    pub fn catch_up(&mut self, now: Ticks) -> CatchUp {
        let first = self.counter + (self.divider - self.buffer);
        let elapsed = now.since(self.counter) + self.buffer;
        let ticks = elapsed / self.divider;
        self.buffer = elapsed % self.divider;
        self.counter = self.counter.max(now);
        CatchUp {
            ticks,
            first,
            divider: self.divider,
        }
    }

    /// Master instant of local tick `k` counted from the current state,
    /// assuming no further catch-up happens first.
    #[must_use]
    pub fn next_tick_time(&self, k: u64) -> Ticks {
        self.counter + (self.divider - self.buffer) + k * self.divider
    }

    /// Re-anchor the clock on `now` without emitting ticks, keeping the
    /// carried buffer. Used after the master timeline was replaced.
    pub fn rebase(&mut self, now: Ticks) {
        self.counter = now;
    }

    /// Restore a saved counter and buffer.
    pub fn restore(&mut self, counter: Ticks, buffer: u64) {
        self.counter = counter;
        self.buffer = buffer % self.divider;
    }

    /// Change the divider (region switch). Clears the carried buffer.
    pub fn set_divider(&mut self, divider: u64) {
        self.divider = divider.max(1);
        self.buffer = 0;
    }

    pub fn reset(&mut self) {
        self.counter = Ticks::ZERO;
        self.buffer = 0;
    }
}
