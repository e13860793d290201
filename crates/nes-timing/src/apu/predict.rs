//! Side-effect-free IRQ predictors.
//!
//! Both take their state by value and run it forward one APU tick at a
//! time, returning the index of the tick on which the IRQ would rise.

use super::channels::DmcReader;
use super::sequencer::{FrameSequencer, SequencerMode};

/// Tick on which the 4-step sequence next reaches step 4 with IRQs on.
#[must_use]
pub fn next_frame_irq(mut sequencer: FrameSequencer, ticks: u64) -> Option<u64> {
    if sequencer.mode() != SequencerMode::FourStep || !sequencer.irq_enabled {
        return None;
    }
    // The flag only gates the real sequencer; the predictor reports the
    // step itself.
    sequencer.irq_flag = false;
    (0..ticks).find(|_| sequencer.clock(1).is_some_and(|clocks| clocks.irq))
}

/// Tick on which the DMC reader fetches the last byte of a sample. The
/// caller skips this when IRQs are off or the sample loops.
#[must_use]
pub fn next_dmc_irq(mut reader: DmcReader, ticks: u64) -> Option<u64> {
    for k in 0..ticks {
        if !reader.buffer_full && reader.bytes_remaining > 0 {
            reader.buffer_full = true;
            reader.bytes_remaining -= 1;
            if reader.bytes_remaining == 0 {
                return Some(k);
            }
        }

        if reader.bits_remaining == 0 {
            reader.bits_remaining = 8;
            reader.buffer_full = false;
        }

        if reader.timer > 0 {
            reader.timer -= 1;
            if reader.timer > 0 {
                continue;
            }
        }
        reader.timer += i32::from(reader.period);
        reader.bits_remaining -= 1;
    }
    None
}
