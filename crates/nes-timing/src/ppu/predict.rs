//! Scanline position and the side-effect-free `VBlank` predictor.
//!
//! [`ScanlineCounter`] is the only state the frame timing depends on. The
//! synchronizer advances the real one; the predictor advances a copy, so a
//! prediction can never disturb the device.

use crate::timing::{DOTS_PER_LINE, FIRST_LINE, FIRST_VBLANK_LINE, ODD_FRAME_SKIP_DOT, VBLANK_DOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanlineCounter {
    /// -1 (pre-render) to the region's last line.
    pub line: i16,
    /// Dots left in the line, 341 down to 1.
    pub timer: u16,
    pub odd_frame: bool,
}

impl Default for ScanlineCounter {
    fn default() -> Self {
        Self {
            line: FIRST_LINE,
            timer: DOTS_PER_LINE,
            odd_frame: false,
        }
    }
}

impl ScanlineCounter {
    /// Dot within the line, starting at 1.
    #[must_use]
    pub const fn dot(&self) -> u16 {
        DOTS_PER_LINE - self.timer + 1
    }

    /// Start a tick and return the dot it works on.
    ///
    /// On odd frames with the background on, the pre-render line loses its
    /// second-to-last dot: the timer is stolen from, so the next dot runs in
    /// this tick instead.
    pub fn begin_tick(&mut self, background_enabled: bool) -> u16 {
        if background_enabled
            && self.odd_frame
            && self.line == FIRST_LINE
            && self.dot() == ODD_FRAME_SKIP_DOT
        {
            self.timer -= 1;
        }
        self.dot()
    }

    /// Finish a tick. Returns the line that just ended, if one did. Passing
    /// `last_line` wraps to the pre-render line and flips the odd flag.
    pub fn end_tick(&mut self, last_line: i16) -> Option<i16> {
        self.timer -= 1;
        if self.timer > 0 {
            return None;
        }
        self.timer = DOTS_PER_LINE;
        let ended = self.line;
        self.line += 1;
        if self.line > last_line {
            self.line = FIRST_LINE;
            self.odd_frame = !self.odd_frame;
        }
        Some(ended)
    }

    /// Ticks in the frame that starts at the pre-render line.
    #[must_use]
    pub fn frame_ticks(last_line: i16, odd_frame: bool, background_enabled: bool) -> u64 {
        let lines = (last_line - FIRST_LINE + 1) as u64;
        let short = u64::from(odd_frame && background_enabled);
        lines * u64::from(DOTS_PER_LINE) - short
    }
}

/// Run a copy of `counter` for up to `ticks` ticks and return the index of
/// the tick on which `VBlank` begins, if it does.
#[must_use]
pub fn next_vblank(
    mut counter: ScanlineCounter,
    background_enabled: bool,
    last_line: i16,
    ticks: u64,
) -> Option<u64> {
    for k in 0..ticks {
        let dot = counter.begin_tick(background_enabled);
        if counter.line == FIRST_VBLANK_LINE && dot == VBLANK_DOT {
            return Some(k);
        }
        counter.end_tick(last_line);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const NTSC_LAST: i16 = 260;

    fn run(counter: &mut ScanlineCounter, ticks: u64, background: bool) {
        for _ in 0..ticks {
            counter.begin_tick(background);
            counter.end_tick(NTSC_LAST);
        }
    }

    #[test]
    fn one_frame_returns_to_pre_render() {
        let mut counter = ScanlineCounter::default();
        run(&mut counter, 262 * 341, true);
        assert_eq!(counter.line, FIRST_LINE);
        assert_eq!(counter.timer, DOTS_PER_LINE);
        assert!(counter.odd_frame);
    }

    #[test]
    fn odd_frame_is_one_dot_shorter_with_background() {
        let mut counter = ScanlineCounter {
            odd_frame: true,
            ..ScanlineCounter::default()
        };
        let ticks = ScanlineCounter::frame_ticks(NTSC_LAST, true, true);
        assert_eq!(ticks, 262 * 341 - 1);
        run(&mut counter, ticks, true);
        assert_eq!(counter.line, FIRST_LINE);
        assert_eq!(counter.timer, DOTS_PER_LINE);
        assert!(!counter.odd_frame);
    }

    #[test]
    fn two_frames_restore_parity() {
        let mut counter = ScanlineCounter::default();
        let first = ScanlineCounter::frame_ticks(NTSC_LAST, false, true);
        let second = ScanlineCounter::frame_ticks(NTSC_LAST, true, true);
        run(&mut counter, first + second, true);
        assert_eq!(counter, ScanlineCounter::default());
    }

    #[test]
    fn no_skip_with_background_off() {
        let mut counter = ScanlineCounter {
            odd_frame: true,
            ..ScanlineCounter::default()
        };
        run(&mut counter, 262 * 341 - 1, false);
        assert_eq!(counter.timer, 1);
    }

    #[test]
    fn vblank_found_at_line_241_dot_1() {
        let counter = ScanlineCounter::default();
        // Pre-render plus lines 0..=240.
        let expected = 242 * 341;
        assert_eq!(next_vblank(counter, true, NTSC_LAST, expected + 1), Some(expected));
        assert_eq!(next_vblank(counter, true, NTSC_LAST, expected), None);
    }

    #[test]
    fn predictor_leaves_counter_alone() {
        let counter = ScanlineCounter {
            line: 240,
            timer: 5,
            odd_frame: true,
        };
        assert_eq!(next_vblank(counter, true, NTSC_LAST, 100), Some(5));
        assert_eq!(counter.line, 240);
        assert_eq!(counter.timer, 5);
    }
}
