//! The five 2A03 sound generators.
//!
//! Every channel timer follows the same batched pattern: it is handed the
//! number of APU ticks that elapsed since it was last clocked (`delta`),
//! counts down by that much, and when it runs out reloads by adding its
//! period and advances its waveform one step. In per-tick modes `delta` is
//! one; the fast mode hands over a whole host sample's worth at once.
//!
//! Each channel keeps its last waveform value in `output`. The mixer reads
//! that latch; it only changes when the channel's timer expires.

use crate::error::StateError;
use crate::state::{StateReader, StateWriter};

// ---------------------------------------------------------------------------
// Lookup tables
// ---------------------------------------------------------------------------

/// Length counter load values, indexed by the top 5 bits of the register write.
pub const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96,
    22, 192, 24, 72, 26, 16, 28, 32, 30,
];

/// Noise timer period lookup (NTSC), in APU ticks.
pub const NOISE_PERIOD_TABLE_NTSC: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

/// Noise timer period lookup (PAL).
pub const NOISE_PERIOD_TABLE_PAL: [u16; 16] = [
    4, 8, 14, 30, 60, 88, 118, 148, 188, 236, 354, 472, 708, 944, 1890, 3778,
];

/// DMC rate table (NTSC): APU ticks per output bit.
pub const DMC_RATE_TABLE_NTSC: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

/// DMC rate table (PAL).
pub const DMC_RATE_TABLE_PAL: [u16; 16] = [
    398, 354, 316, 298, 276, 236, 210, 198, 176, 148, 132, 118, 98, 78, 66, 50,
];

/// Triangle waveform: 32-step sequence (15 down to 0, then back up).
const TRIANGLE_SEQUENCE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10,
    11, 12, 13, 14, 15,
];

/// Square duty cycle waveforms: 4 patterns × 8 steps.
/// 0 = 12.5%, 1 = 25%, 2 = 50%, 3 = 75% (negated 25%).
const PULSE_DUTY: [[bool; 8]; 4] = [
    [false, true, false, false, false, false, false, false],
    [false, true, true, false, false, false, false, false],
    [false, true, true, true, true, false, false, false],
    [true, false, false, true, true, true, true, true],
];

/// Shared batched countdown. Returns true when the timer ran out and was
/// reloaded with `reload`.
fn expire(timer: &mut i32, delta: i32, reload: i32) -> bool {
    if *timer > 0 {
        *timer -= delta;
        if *timer > 0 {
            return false;
        }
    }
    *timer += reload;
    true
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Decay envelope, clocked by the frame sequencer.
///
/// When the loop flag is clear, the envelope counts down from 15 to 0 and
/// stays there. When loop is set, it wraps from 0 back to 15.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    start_flag: bool,
    divider: u8,
    decay_level: u8,
    /// Volume / divider period (register bits 0-3).
    volume: u8,
    /// Constant volume flag (register bit 4).
    constant_volume: bool,
    /// Loop flag (register bit 5, shared with length counter halt).
    loop_flag: bool,
}

impl Envelope {
    fn write(&mut self, value: u8) {
        self.loop_flag = value & 0x20 != 0;
        self.constant_volume = value & 0x10 != 0;
        self.volume = value & 0x0F;
    }

    pub fn clock(&mut self) {
        if self.start_flag {
            self.start_flag = false;
            self.decay_level = 15;
            self.divider = self.volume;
        } else if self.divider == 0 {
            self.divider = self.volume;
            if self.decay_level > 0 {
                self.decay_level -= 1;
            } else if self.loop_flag {
                self.decay_level = 15;
            }
        } else {
            self.divider -= 1;
        }
    }

    /// Current level (0-15).
    #[must_use]
    pub fn output(&self) -> u8 {
        if self.constant_volume {
            self.volume
        } else {
            self.decay_level
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.bool(self.start_flag);
        w.u8(self.divider);
        w.u8(self.decay_level);
        w.u8(self.volume);
        w.bool(self.constant_volume);
        w.bool(self.loop_flag);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.start_flag = r.bool()?;
        self.divider = r.u8()?;
        self.decay_level = r.u8()? & 0x0F;
        self.volume = r.u8()? & 0x0F;
        self.constant_volume = r.bool()?;
        self.loop_flag = r.bool()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Length counter
// ---------------------------------------------------------------------------

/// Counts down on half-frame clocks. At zero the channel is silenced.
#[derive(Debug, Clone, Default)]
pub struct LengthCounter {
    counter: u8,
    halt: bool,
    /// $4015 enable bit.
    enabled: bool,
}

impl LengthCounter {
    pub fn clock(&mut self) {
        if !self.halt && self.counter > 0 {
            self.counter -= 1;
        }
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.counter > 0
    }

    #[must_use]
    pub fn value(&self) -> u8 {
        self.counter
    }

    fn load(&mut self, index: u8) {
        if self.enabled {
            self.counter = LENGTH_TABLE[usize::from(index & 0x1F)];
        }
    }

    /// Disabling clears the counter.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.counter = 0;
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.u8(self.counter);
        w.bool(self.halt);
        w.bool(self.enabled);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.counter = r.u8()?;
        self.halt = r.bool()?;
        self.enabled = r.bool()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sweep unit
// ---------------------------------------------------------------------------

/// Sweep unit for the squares. Square 1 negates with one's complement
/// (period - (period >> shift) - 1), square 2 with two's complement.
#[derive(Debug, Clone)]
pub struct Sweep {
    enabled: bool,
    negate: bool,
    shift: u8,
    period: u8,
    divider: u8,
    reload_flag: bool,
    ones_complement: bool,
}

impl Sweep {
    fn new(ones_complement: bool) -> Self {
        Self {
            enabled: false,
            negate: false,
            shift: 0,
            period: 0,
            divider: 0,
            reload_flag: false,
            ones_complement,
        }
    }

    fn write(&mut self, value: u8) {
        self.enabled = value & 0x80 != 0;
        self.period = (value >> 4) & 0x07;
        self.negate = value & 0x08 != 0;
        self.shift = value & 0x07;
        self.reload_flag = true;
    }

    fn target_period(&self, current_period: u16) -> u16 {
        let shift_result = current_period >> self.shift;
        if self.negate {
            if self.ones_complement {
                current_period.wrapping_sub(shift_result).wrapping_sub(1)
            } else {
                current_period.wrapping_sub(shift_result)
            }
        } else {
            current_period.wrapping_add(shift_result)
        }
    }

    /// Too low to hear, or about to overflow 11 bits.
    #[must_use]
    pub fn muting(&self, current_period: u16) -> bool {
        current_period < 8 || self.target_period(current_period) > 0x7FF
    }

    /// Half-frame clock. Returns the new timer period.
    fn clock(&mut self, current_period: u16) -> u16 {
        let mut new_period = current_period;

        if self.divider == 0 && self.enabled && self.shift > 0 && !self.muting(current_period) {
            let target = self.target_period(current_period);
            if target <= 0x7FF {
                new_period = target;
            }
        }

        if self.divider == 0 || self.reload_flag {
            self.divider = self.period;
            self.reload_flag = false;
        } else {
            self.divider -= 1;
        }

        new_period
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.bool(self.enabled);
        w.bool(self.negate);
        w.u8(self.shift);
        w.u8(self.period);
        w.u8(self.divider);
        w.bool(self.reload_flag);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.enabled = r.bool()?;
        self.negate = r.bool()?;
        self.shift = r.u8()? & 0x07;
        self.period = r.u8()? & 0x07;
        self.divider = r.u8()? & 0x07;
        self.reload_flag = r.bool()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Square channel
// ---------------------------------------------------------------------------

/// Square wave channel ($4000-$4003 and $4004-$4007).
#[derive(Debug, Clone)]
pub struct Square {
    /// 11-bit period from the registers.
    period: u16,
    timer: i32,
    duty: u8,
    duty_pos: u8,
    pub envelope: Envelope,
    pub length: LengthCounter,
    pub sweep: Sweep,
    pub output: u8,
}

impl Square {
    /// `first` selects square 1's one's-complement sweep.
    #[must_use]
    pub fn new(first: bool) -> Self {
        Self {
            period: 0,
            timer: 0,
            duty: 0,
            duty_pos: 0,
            envelope: Envelope::default(),
            length: LengthCounter::default(),
            sweep: Sweep::new(first),
            output: 0,
        }
    }

    /// Write register 0-3 of the channel.
    pub fn write(&mut self, register: u16, value: u8) {
        match register & 0x03 {
            0 => {
                self.duty = value >> 6;
                self.envelope.write(value);
                self.length.halt = value & 0x20 != 0;
            }
            1 => self.sweep.write(value),
            2 => self.period = (self.period & 0x0700) | u16::from(value),
            _ => {
                self.period = (self.period & 0x00FF) | (u16::from(value & 0x07) << 8);
                self.length.load(value >> 3);
                self.envelope.start_flag = true;
                self.duty_pos = 0;
            }
        }
    }

    #[must_use]
    pub fn period(&self) -> u16 {
        self.period
    }

    pub fn clock_sweep(&mut self) {
        self.period = self.sweep.clock(self.period);
    }

    /// Timer period is (period + 2) * 2 APU ticks; one duty step per expiry.
    pub fn clock_timer(&mut self, delta: i32) {
        let reload = (i32::from(self.period) + 2) << 1;
        if !expire(&mut self.timer, delta, reload) {
            return;
        }
        let high = PULSE_DUTY[usize::from(self.duty)][usize::from(self.duty_pos)];
        self.output = if high && self.length.active() && !self.sweep.muting(self.period) {
            self.envelope.output()
        } else {
            0
        };
        self.duty_pos = (self.duty_pos + 1) & 0x07;
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.u16(self.period);
        w.i32(self.timer);
        w.u8(self.duty);
        w.u8(self.duty_pos);
        w.u8(self.output);
        self.envelope.save_state(w);
        self.length.save_state(w);
        self.sweep.save_state(w);
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.period = r.u16()? & 0x07FF;
        self.timer = r.i32()?;
        self.duty = r.u8()? & 0x03;
        self.duty_pos = r.u8()? & 0x07;
        self.output = r.u8()? & 0x0F;
        self.envelope.load_state(r)?;
        self.length.load_state(r)?;
        self.sweep.load_state(r)
    }
}

// ---------------------------------------------------------------------------
// Triangle channel
// ---------------------------------------------------------------------------

/// Triangle wave channel ($4008-$400B). Its timer runs at the full APU
/// rate, twice as fast as the squares'.
#[derive(Debug, Clone, Default)]
pub struct Triangle {
    period: u16,
    timer: i32,
    sequence_pos: u8,
    pub length: LengthCounter,
    linear_counter: u8,
    linear_counter_reload: u8,
    linear_reload_flag: bool,
    /// Control flag (shared with length counter halt).
    control_flag: bool,
    pub output: u8,
}

impl Triangle {
    pub fn write(&mut self, register: u16, value: u8) {
        match register & 0x03 {
            0 => {
                self.control_flag = value & 0x80 != 0;
                self.length.halt = self.control_flag;
                self.linear_counter_reload = value & 0x7F;
            }
            1 => {}
            2 => self.period = (self.period & 0x0700) | u16::from(value),
            _ => {
                self.period = (self.period & 0x00FF) | (u16::from(value & 0x07) << 8);
                self.length.load(value >> 3);
                self.linear_reload_flag = true;
            }
        }
    }

    /// Quarter-frame clock.
    pub fn clock_linear_counter(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.linear_counter_reload;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        if !self.control_flag {
            self.linear_reload_flag = false;
        }
    }

    #[must_use]
    pub fn linear_counter(&self) -> u8 {
        self.linear_counter
    }

    /// The sequencer only moves while both counters are non-zero. Periods
    /// below 2 are ultrasonic and output silence.
    pub fn clock_timer(&mut self, delta: i32) {
        if !expire(&mut self.timer, delta, i32::from(self.period) + 1) {
            return;
        }
        if !self.length.active() || self.linear_counter == 0 {
            return;
        }
        self.output = if self.period < 2 {
            0
        } else {
            TRIANGLE_SEQUENCE[usize::from(self.sequence_pos)]
        };
        self.sequence_pos = (self.sequence_pos + 1) & 0x1F;
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.u16(self.period);
        w.i32(self.timer);
        w.u8(self.sequence_pos);
        w.u8(self.linear_counter);
        w.u8(self.linear_counter_reload);
        w.bool(self.linear_reload_flag);
        w.bool(self.control_flag);
        w.u8(self.output);
        self.length.save_state(w);
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.period = r.u16()? & 0x07FF;
        self.timer = r.i32()?;
        self.sequence_pos = r.u8()? & 0x1F;
        self.linear_counter = r.u8()? & 0x7F;
        self.linear_counter_reload = r.u8()? & 0x7F;
        self.linear_reload_flag = r.bool()?;
        self.control_flag = r.bool()?;
        self.output = r.u8()? & 0x0F;
        self.length.load_state(r)
    }
}

// ---------------------------------------------------------------------------
// Noise channel
// ---------------------------------------------------------------------------

/// Noise channel ($400C-$400F). A 15-bit LFSR with feedback from bit 1,
/// or bit 6 in short mode.
#[derive(Debug, Clone)]
pub struct Noise {
    period: u16,
    timer: i32,
    shift_register: u16,
    short_mode: bool,
    pub envelope: Envelope,
    pub length: LengthCounter,
    pub output: u8,
}

impl Default for Noise {
    fn default() -> Self {
        Self {
            period: NOISE_PERIOD_TABLE_NTSC[0],
            timer: 0,
            // Power-up value.
            shift_register: 1,
            short_mode: false,
            envelope: Envelope::default(),
            length: LengthCounter::default(),
            output: 0,
        }
    }
}

impl Noise {
    /// `periods` is the region's noise period table.
    pub fn write(&mut self, register: u16, value: u8, periods: &[u16; 16]) {
        match register & 0x03 {
            0 => {
                self.envelope.write(value);
                self.length.halt = value & 0x20 != 0;
            }
            1 => {}
            2 => {
                self.short_mode = value & 0x80 != 0;
                self.period = periods[usize::from(value & 0x0F)];
            }
            _ => {
                self.length.load(value >> 3);
                self.envelope.start_flag = true;
            }
        }
    }

    pub fn clock_timer(&mut self, delta: i32) {
        if !expire(&mut self.timer, delta, i32::from(self.period)) {
            return;
        }
        let tap = if self.short_mode { 6 } else { 1 };
        let feedback = (self.shift_register & 1) ^ ((self.shift_register >> tap) & 1);
        self.shift_register = (self.shift_register >> 1) | (feedback << 14);
        // Bit 0 set silences the output.
        self.output = if self.shift_register & 1 == 0 && self.length.active() {
            self.envelope.output()
        } else {
            0
        };
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.u16(self.period);
        w.i32(self.timer);
        w.u16(self.shift_register);
        w.bool(self.short_mode);
        w.u8(self.output);
        self.envelope.save_state(w);
        self.length.save_state(w);
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.period = r.u16()?;
        self.timer = r.i32()?;
        self.shift_register = r.u16()? & 0x7FFF;
        self.short_mode = r.bool()?;
        self.output = r.u8()? & 0x0F;
        self.envelope.load_state(r)?;
        self.length.load_state(r)
    }
}

// ---------------------------------------------------------------------------
// DMC channel
// ---------------------------------------------------------------------------

/// Delta modulation channel ($4010-$4013).
///
/// The memory reader refills a one-byte sample buffer from $8000 plus a
/// 15-bit offset whenever the buffer is empty and bytes remain. The fetch
/// itself is done by the APU, which owns the path to the CPU bus; this
/// struct only says what to fetch ([`Dmc::pending_fetch`]) and takes the
/// byte back ([`Dmc::receive_dma_byte`]).
#[derive(Debug, Clone)]
pub struct Dmc {
    period: u16,
    timer: i32,
    pub irq_enabled: bool,
    pub loop_flag: bool,
    /// Raised when a non-looping sample runs out with IRQs enabled.
    pub irq_flag: bool,

    /// Sample start, as an offset from $8000 ($4012).
    sample_address: u16,
    /// Sample length in bytes ($4013).
    sample_length: u16,
    current_address: u16,
    bytes_remaining: u16,

    sample_buffer: u8,
    buffer_full: bool,
    shift_register: u8,
    /// Bits left in the current output cycle.
    bits_remaining: u8,
    silence: bool,
    /// 7-bit DAC.
    level: u8,
    pub output: u8,
}

impl Default for Dmc {
    fn default() -> Self {
        Self {
            period: DMC_RATE_TABLE_NTSC[0],
            timer: 0,
            irq_enabled: false,
            loop_flag: false,
            irq_flag: false,
            sample_address: 0x4000,
            sample_length: 1,
            current_address: 0x4000,
            bytes_remaining: 0,
            sample_buffer: 0,
            buffer_full: false,
            shift_register: 0,
            bits_remaining: 0,
            silence: true,
            level: 0,
            output: 0,
        }
    }
}

impl Dmc {
    /// Write register 0-3. `rates` is the region's DMC rate table.
    pub fn write(&mut self, register: u16, value: u8, rates: &[u16; 16]) {
        match register & 0x03 {
            0 => {
                self.period = rates[usize::from(value & 0x0F)];
                self.loop_flag = value & 0x40 != 0;
                self.irq_enabled = value & 0x80 != 0;
                if !self.irq_enabled {
                    self.irq_flag = false;
                }
            }
            1 => {
                self.level = value & 0x7F;
                self.output = self.level;
            }
            2 => {
                self.sample_address = 0x4000 + (u16::from(value) << 6);
                if self.bytes_remaining == 0 {
                    self.restart();
                }
            }
            _ => {
                self.sample_length = (u16::from(value) << 4) + 1;
                if self.bytes_remaining == 0 {
                    self.restart();
                }
            }
        }
    }

    fn restart(&mut self) {
        self.current_address = self.sample_address;
        self.bytes_remaining = self.sample_length;
    }

    /// $4015 bit 4. Enabling restarts an idle sample; disabling drops the
    /// bytes left.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.bytes_remaining = 0;
        } else if self.bytes_remaining == 0 {
            self.restart();
        }
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.bytes_remaining > 0
    }

    /// CPU address of the byte the reader wants, if it wants one now.
    #[must_use]
    pub fn pending_fetch(&self) -> Option<u16> {
        (!self.buffer_full && self.bytes_remaining > 0).then_some(0x8000 | self.current_address)
    }

    /// Deliver a fetched byte. Returns true if this ended a sample and
    /// raised the IRQ flag.
    pub fn receive_dma_byte(&mut self, byte: u8) -> bool {
        self.sample_buffer = byte;
        self.buffer_full = true;
        self.current_address = (self.current_address + 1) & 0x7FFF;
        self.bytes_remaining = self.bytes_remaining.saturating_sub(1);
        if self.bytes_remaining > 0 {
            return false;
        }
        if self.loop_flag {
            self.restart();
            false
        } else if self.irq_enabled && !self.irq_flag {
            self.irq_flag = true;
            true
        } else {
            false
        }
    }

    /// Output unit and timer.
    pub fn clock_timer(&mut self, delta: i32) {
        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            if self.buffer_full {
                self.silence = false;
                self.shift_register = self.sample_buffer;
                self.buffer_full = false;
            } else {
                self.silence = true;
            }
        }

        if !expire(&mut self.timer, delta, i32::from(self.period)) {
            return;
        }
        if !self.silence {
            if self.shift_register & 1 == 0 {
                if self.level > 1 {
                    self.level -= 2;
                }
            } else if self.level < 126 {
                self.level += 2;
            }
            self.output = self.level & 0x7F;
        }
        self.shift_register >>= 1;
        self.bits_remaining -= 1;
    }

    /// The reader's timing state, for prediction.
    #[must_use]
    pub fn reader(&self) -> DmcReader {
        DmcReader {
            timer: self.timer,
            period: self.period,
            bytes_remaining: self.bytes_remaining,
            buffer_full: self.buffer_full,
            bits_remaining: self.bits_remaining,
        }
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.u16(self.period);
        w.i32(self.timer);
        w.bool(self.irq_enabled);
        w.bool(self.loop_flag);
        w.bool(self.irq_flag);
        w.u16(self.sample_address);
        w.u16(self.sample_length);
        w.u16(self.current_address);
        w.u16(self.bytes_remaining);
        w.u8(self.sample_buffer);
        w.bool(self.buffer_full);
        w.u8(self.shift_register);
        w.u8(self.bits_remaining);
        w.bool(self.silence);
        w.u8(self.level);
        w.u8(self.output);
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.period = r.u16()?.max(1);
        self.timer = r.i32()?;
        self.irq_enabled = r.bool()?;
        self.loop_flag = r.bool()?;
        self.irq_flag = r.bool()?;
        self.sample_address = r.u16()? & 0x7FFF;
        self.sample_length = r.u16()?;
        self.current_address = r.u16()? & 0x7FFF;
        self.bytes_remaining = r.u16()?;
        self.sample_buffer = r.u8()?;
        self.buffer_full = r.bool()?;
        self.shift_register = r.u8()?;
        self.bits_remaining = r.u8()?.min(8);
        self.silence = r.bool()?;
        self.level = r.u8()? & 0x7F;
        self.output = r.u8()? & 0x7F;
        Ok(())
    }
}

/// The part of the DMC that decides when a sample ends: enough to run the
/// reader forward without touching memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmcReader {
    pub timer: i32,
    pub period: u16,
    pub bytes_remaining: u16,
    pub buffer_full: bool,
    pub bits_remaining: u8,
}
