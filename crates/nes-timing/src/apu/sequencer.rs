//! APU frame sequencer.
//!
//! A countdown in APU ticks that, each time it expires, reloads from the
//! region's period table and performs one step. Steps are 1-based.
//!
//! | mode   | steps 1, 3             | steps 2, 4             | step 5  |
//! |--------|------------------------|------------------------|---------|
//! | 4-step | envelope, linear       | everything             |         |
//! | 5-step | everything             | envelope, linear       | nothing |
//!
//! "Everything" adds the length counters and sweeps. Only step 4 of the
//! 4-step sequence raises the frame IRQ.

use crate::config::NesRegion;
use crate::error::StateError;
use crate::state::{StateReader, StateWriter};

/// Step periods in APU ticks, `[mode][step - 1]`, mode 0 = 4-step.
const PERIODS_NTSC: [[u16; 5]; 2] = [
    [0x1D23, 0x1D20, 0x1D22, 0x1D22, 0x1D22],
    [0x1D22, 0x1D20, 0x1D22, 0x1D22, 0x1D1C],
];

const PERIODS_PAL: [[u16; 5]; 2] = [
    [0x207B, 0x207A, 0x2078, 0x207A, 0x207A],
    [0x207A, 0x207A, 0x2078, 0x207A, 0x207A],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencerMode {
    #[default]
    FourStep,
    FiveStep,
}

impl SequencerMode {
    #[must_use]
    pub const fn steps(self) -> u8 {
        match self {
            Self::FourStep => 4,
            Self::FiveStep => 5,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::FourStep => 0,
            Self::FiveStep => 1,
        }
    }
}

/// Which channel units a step clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepClocks {
    /// Envelopes and the triangle's linear counter.
    pub quarter: bool,
    /// Length counters and sweeps.
    pub half: bool,
    /// The frame IRQ flag went up on this step.
    pub irq: bool,
}

impl StepClocks {
    pub const ALL: Self = Self {
        quarter: true,
        half: true,
        irq: false,
    };
}

#[derive(Debug, Clone)]
pub struct FrameSequencer {
    mode: SequencerMode,
    /// 1-based.
    step: u8,
    counter: i32,
    periods: &'static [[u16; 5]; 2],
    pub irq_enabled: bool,
    pub irq_flag: bool,
}

impl FrameSequencer {
    #[must_use]
    pub fn new(region: NesRegion) -> Self {
        let mut sequencer = Self {
            mode: SequencerMode::FourStep,
            step: 1,
            counter: 0,
            periods: periods_for(region),
            irq_enabled: true,
            irq_flag: false,
        };
        sequencer.reset();
        sequencer
    }

    pub fn set_region(&mut self, region: NesRegion) {
        self.periods = periods_for(region);
    }

    #[must_use]
    pub fn mode(&self) -> SequencerMode {
        self.mode
    }

    #[must_use]
    pub fn step(&self) -> u8 {
        self.step
    }

    #[must_use]
    pub fn counter(&self) -> i32 {
        self.counter
    }

    /// Counter and step, which a soft reset carries over.
    #[must_use]
    pub fn position(&self) -> (i32, u8) {
        (self.counter, self.step)
    }

    pub fn set_position(&mut self, counter: i32, step: u8) {
        self.counter = counter;
        self.step = step.clamp(1, self.mode.steps());
    }

    /// $4017 bits: 7 selects five steps, and either 6 or 7 turns frame IRQs
    /// off. The caller resets the sequencer afterwards.
    pub fn write_control(&mut self, value: u8) {
        self.mode = if value & 0x80 != 0 {
            SequencerMode::FiveStep
        } else {
            SequencerMode::FourStep
        };
        self.irq_enabled = value & 0xC0 == 0;
    }

    /// Back to step 1 with the first period loaded. Clears the frame IRQ
    /// flag; the caller withdraws it from the CPU.
    pub fn reset(&mut self) {
        self.step = 1;
        self.irq_flag = false;
        self.counter = 0;
        self.reload();
    }

    fn reload(&mut self) {
        let period = self.periods[self.mode.index()][usize::from(self.step - 1)];
        self.counter += i32::from(period);
    }

    /// Advance by `delta` APU ticks. Returns the step's clocks if a step
    /// came due.
    pub fn clock(&mut self, delta: i32) -> Option<StepClocks> {
        if self.counter > 0 {
            self.counter -= delta;
            if self.counter > 0 {
                return None;
            }
        }
        self.reload();

        let mut clocks = match (self.mode, self.step) {
            (SequencerMode::FourStep, 1 | 3) | (SequencerMode::FiveStep, 2 | 4) => StepClocks {
                quarter: true,
                ..StepClocks::default()
            },
            (SequencerMode::FourStep, _) | (SequencerMode::FiveStep, 1 | 3) => StepClocks::ALL,
            (SequencerMode::FiveStep, _) => StepClocks::default(),
        };

        if self.mode == SequencerMode::FourStep
            && self.step == 4
            && self.irq_enabled
            && !self.irq_flag
        {
            self.irq_flag = true;
            clocks.irq = true;
        }

        self.step = if self.step >= self.mode.steps() { 1 } else { self.step + 1 };
        Some(clocks)
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.i32(self.counter);
        w.u8(self.step);
        w.u8(self.mode.steps());
        w.bool(self.irq_enabled);
        w.bool(self.irq_flag);
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        let counter = r.i32()?;
        let step = r.u8()?;
        self.mode = if r.u8()? == 5 {
            SequencerMode::FiveStep
        } else {
            SequencerMode::FourStep
        };
        self.irq_enabled = r.bool()?;
        self.irq_flag = r.bool()?;
        self.set_position(counter, step);
        Ok(())
    }
}

fn periods_for(region: NesRegion) -> &'static [[u16; 5]; 2] {
    match region {
        NesRegion::Ntsc => &PERIODS_NTSC,
        NesRegion::Pal => &PERIODS_PAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run single ticks until a step fires; returns (ticks taken, clocks).
    fn next_step(sequencer: &mut FrameSequencer) -> (u32, StepClocks) {
        let mut ticks = 0;
        loop {
            ticks += 1;
            if let Some(clocks) = sequencer.clock(1) {
                return (ticks, clocks);
            }
        }
    }

    #[test]
    fn four_step_pattern_and_irq() {
        let mut sequencer = FrameSequencer::new(NesRegion::Ntsc);
        let (ticks, first) = next_step(&mut sequencer);
        assert_eq!(ticks, 0x1D23);
        assert!(first.quarter && !first.half);
        let (_, second) = next_step(&mut sequencer);
        assert_eq!(second, StepClocks::ALL);
        next_step(&mut sequencer);
        let (_, fourth) = next_step(&mut sequencer);
        assert!(fourth.half && fourth.irq);
        assert!(sequencer.irq_flag);
        assert_eq!(sequencer.step(), 1);
    }

    #[test]
    fn irq_raised_once_until_cleared() {
        let mut sequencer = FrameSequencer::new(NesRegion::Ntsc);
        for _ in 0..4 {
            next_step(&mut sequencer);
        }
        assert!(sequencer.irq_flag);
        for _ in 0..3 {
            next_step(&mut sequencer);
        }
        let (_, again) = next_step(&mut sequencer);
        assert!(!again.irq, "flag still set from the last sequence");
    }

    #[test]
    fn five_step_pattern_has_no_irq() {
        let mut sequencer = FrameSequencer::new(NesRegion::Ntsc);
        sequencer.write_control(0x80);
        sequencer.reset();
        assert!(!sequencer.irq_enabled);
        let steps: Vec<_> = (0..5).map(|_| next_step(&mut sequencer).1).collect();
        assert_eq!(steps[0], StepClocks::ALL);
        assert!(steps[1].quarter && !steps[1].half);
        assert_eq!(steps[2], StepClocks::ALL);
        assert!(steps[3].quarter && !steps[3].half);
        assert_eq!(steps[4], StepClocks::default());
        assert!(!sequencer.irq_flag);
    }

    #[test]
    fn bit_six_disables_irq() {
        let mut sequencer = FrameSequencer::new(NesRegion::Ntsc);
        sequencer.write_control(0x40);
        assert_eq!(sequencer.mode(), SequencerMode::FourStep);
        assert!(!sequencer.irq_enabled);
    }

    #[test]
    fn batched_delta_lands_on_same_step() {
        let mut single = FrameSequencer::new(NesRegion::Pal);
        let mut batched = FrameSequencer::new(NesRegion::Pal);
        for _ in 0..0x207B {
            single.clock(1);
        }
        batched.clock(0x207B);
        assert_eq!(single.position(), batched.position());
        assert_eq!(single.step(), 2);
    }

    #[test]
    fn reset_loads_first_period() {
        let mut sequencer = FrameSequencer::new(NesRegion::Ntsc);
        sequencer.clock(100);
        sequencer.irq_flag = true;
        sequencer.reset();
        assert_eq!(sequencer.position(), (0x1D23, 1));
        assert!(!sequencer.irq_flag);
    }
}
