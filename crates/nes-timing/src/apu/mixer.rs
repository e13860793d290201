//! Channel mixing and resampling to the host rate.
//!
//! The APU produces one mix per tick (about 1.79 MHz). The host wants tens
//! of kilohertz. `max_samples` is the number of APU ticks per host sample;
//! it is not a whole number, so the resampler carries the fraction over
//! from one host sample to the next.
//!
//! - Fast: channels advance in one batch per host sample, which is then
//!   low-pass filtered.
//! - Accurate: channels advance every tick, the host takes whichever mix is
//!   current when a sample comes due (sample and hold), low-pass filtered.
//! - `HighQuality`: every tick's mix is averaged over the host sample's span
//!   (a box filter), with the last tick split at the fractional boundary.
//!
//! Every mode then runs a DC blocker, the optional normaliser and the
//! global volume.

#![allow(clippy::cast_precision_loss)]

use crate::config::{ApuConfig, ApuMode, NesRegion};

const LPF_INPUT_WEIGHT: f64 = 0.75;
const LPF_PREVIOUS_WEIGHT: f64 = 0.25;

/// How often the DC blocker takes a new reference level.
const DCF_FREQUENCY: f64 = 16.0;
/// Crossfade between reference levels, in seconds.
const DCF_STEP_TIME: f64 = 0.01;

const AGC_ATTACK_TIME: f64 = 0.1;
const AGC_RELEASE_TIME: f64 = 0.1;
const AGC_GAIN_FLOOR: f64 = 0.5;
const AGC_GAIN_CEILING: f64 = 2.0;

/// Samples kept when nobody drains the buffer: one second's worth.
const MAX_BUFFERED_SECONDS: usize = 1;

/// Largest tnd index: triangle 15, noise 15, DMC 127.
const TND_ENTRIES: usize = 3 * 15 + 2 * 15 + 127 + 1;

/// Per-channel waveform levels at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Levels {
    pub square1: u8,
    pub square2: u8,
    pub triangle: u8,
    pub noise: u8,
    pub dmc: u8,
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct LowPass {
    previous: f64,
}

impl LowPass {
    fn apply(&mut self, sample: f64) -> f64 {
        let out = sample * LPF_INPUT_WEIGHT + self.previous * LPF_PREVIOUS_WEIGHT;
        self.previous = out;
        out
    }
}

/// Subtracts a reference level sampled every 1/16 s, crossfading to each
/// new reference over 10 ms.
#[derive(Debug, Clone, Default)]
struct DcBlocker {
    level: f64,
    next_level: f64,
    timer: f64,
    step_time: f64,
    weight_per_step: f64,
    step: f64,
}

impl DcBlocker {
    fn apply(&mut self, sample: f64, rate: f64) -> f64 {
        let mut out = sample;
        if self.step_time > 0.0 {
            let weight = self.weight_per_step * self.step;
            out -= self.level * (1.0 - weight) + self.next_level * weight;
            self.step += 1.0;
            self.step_time -= 1.0;
            if self.step_time <= 0.0 {
                self.level = self.next_level;
            }
        } else {
            out -= self.level;
        }

        if self.timer > 0.0 {
            self.timer -= 1.0;
        }
        if self.timer <= 0.0 {
            self.timer += rate / DCF_FREQUENCY;
            self.next_level = sample;
            self.step_time = (rate * DCF_STEP_TIME).max(1.0);
            self.weight_per_step = 1.0 / self.step_time;
            self.step = 0.0;
        }
        out
    }
}

/// Automatic gain control: tracks the signal envelope and scales towards
/// unity, clamped to 0.5..2.
#[derive(Debug, Clone, Default)]
struct Normalizer {
    gain: f64,
}

impl Normalizer {
    fn apply(&mut self, sample: f64, rate: f64) -> f64 {
        let amplitude = sample.abs();
        if amplitude > self.gain {
            self.gain += 1.0 / (rate * AGC_ATTACK_TIME);
        } else if amplitude < self.gain {
            self.gain -= 1.0 / (rate * AGC_RELEASE_TIME);
        }
        let scale = (1.0 / self.gain.max(f64::EPSILON)).clamp(AGC_GAIN_FLOOR, AGC_GAIN_CEILING);
        sample * scale
    }
}

// ---------------------------------------------------------------------------
// Mixer
// ---------------------------------------------------------------------------

pub struct Mixer {
    mode: ApuMode,
    channels: usize,
    swap_channels: bool,
    volume: f64,
    normalize: bool,
    enables: [bool; 5],
    sample_rate: f64,

    square_table: [f64; 31],
    tnd_table: Vec<f64>,
    max_tnd: f64,

    /// APU ticks per host sample.
    max_samples: f64,
    /// Ticks counted toward the next host sample, carrying the fraction.
    accumulated: f64,
    /// Fast mode: ticks not yet handed to the channels.
    backlog: i32,
    sums: [f64; 2],
    last: [f64; 2],

    lowpass: [LowPass; 2],
    dc: [DcBlocker; 2],
    normalizer: Normalizer,

    samples: Vec<f32>,
}

impl Mixer {
    #[must_use]
    pub fn new(config: &ApuConfig, region: NesRegion) -> Self {
        let mut square_table = [0.0; 31];
        for (n, entry) in square_table.iter_mut().enumerate().skip(1) {
            *entry = 95.52 / (8128.0 / n as f64 + 100.0);
        }
        let tnd_table: Vec<f64> = (0..TND_ENTRIES)
            .map(|n| if n == 0 { 0.0 } else { 163.67 / (24329.0 / n as f64 + 100.0) })
            .collect();
        let max_tnd = tnd_table[TND_ENTRIES - 1];

        let mut mixer = Self {
            mode: config.mode,
            channels: 1,
            swap_channels: false,
            volume: 1.0,
            normalize: false,
            enables: [true; 5],
            sample_rate: 44_100.0,
            square_table,
            tnd_table,
            max_tnd,
            max_samples: 1.0,
            accumulated: 0.0,
            backlog: 0,
            sums: [0.0; 2],
            last: [0.0; 2],
            lowpass: Default::default(),
            dc: Default::default(),
            normalizer: Normalizer::default(),
            samples: Vec::new(),
        };
        mixer.configure(config, region);
        mixer
    }

    /// Apply audio options and recompute the resampling ratio.
    pub fn configure(&mut self, config: &ApuConfig, region: NesRegion) {
        self.mode = config.mode;
        self.channels = config.stereo.channels();
        self.swap_channels = config.swap_channels;
        self.volume = config.volume;
        self.normalize = config.normalize;
        self.enables = [
            config.enable_square_1,
            config.enable_square_2,
            config.enable_triangle,
            config.enable_noise,
            config.enable_dmc,
        ];
        self.sample_rate = f64::from(config.sample_rate.max(1));
        let apu_hz = region.master_clock().device_hz(region.apu_divider());
        self.max_samples = (apu_hz / self.sample_rate).max(1.0);
        self.reset();
        log::debug!(
            "mixer: {:?}, {} Hz, {} channel(s), {:.3} ticks per sample",
            self.mode,
            config.sample_rate,
            self.channels,
            self.max_samples
        );
    }

    /// Drop resampler and filter state. Buffered samples are kept.
    pub fn reset(&mut self) {
        self.accumulated = 0.0;
        self.backlog = 0;
        self.sums = [0.0; 2];
        self.last = [0.0; 2];
        self.lowpass = Default::default();
        self.dc = Default::default();
        self.normalizer = Normalizer::default();
    }

    #[must_use]
    pub fn mode(&self) -> ApuMode {
        self.mode
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[must_use]
    pub fn max_samples(&self) -> f64 {
        self.max_samples
    }

    /// Fractional tick count carried toward the next host sample.
    #[must_use]
    pub fn accumulated(&self) -> f64 {
        self.accumulated
    }

    /// Fast mode ticks the channels have not seen yet.
    #[must_use]
    pub fn backlog(&self) -> u64 {
        u64::try_from(self.backlog).unwrap_or(0)
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate as u32
    }

    // -----------------------------------------------------------------------
    // Mixing
    // -----------------------------------------------------------------------

    /// Non-linear DAC model. Mono is `square + tnd` in 0..1; stereo puts the
    /// squares left and the rest right, then bleeds each into the other.
    #[must_use]
    pub fn mix(&self, levels: Levels) -> [f64; 2] {
        let gate = |on: bool, level: u8| if on { usize::from(level) } else { 0 };
        let squares = gate(self.enables[0], levels.square1) + gate(self.enables[1], levels.square2);
        let tnd = 3 * gate(self.enables[2], levels.triangle)
            + 2 * gate(self.enables[3], levels.noise)
            + gate(self.enables[4], levels.dmc);
        let square_out = self.square_table[squares.min(30)];
        let tnd_out = self.tnd_table[tnd.min(TND_ENTRIES - 1)];

        if self.channels == 1 {
            return [square_out + tnd_out, 0.0];
        }
        let left = square_out / self.max_tnd;
        let right = tnd_out / self.max_tnd;
        let blended = [(left + right / 2.0) / 1.5, (right + left / 2.0) / 1.5];
        if self.swap_channels {
            [blended[1], blended[0]]
        } else {
            blended
        }
    }

    // -----------------------------------------------------------------------
    // Resampling
    // -----------------------------------------------------------------------

    /// Fast mode: count one tick. When a host sample comes due, returns the
    /// number of ticks to hand to the channels in one batch.
    pub fn batch_tick(&mut self) -> Option<i32> {
        self.backlog += 1;
        self.accumulated += 1.0;
        if self.accumulated < self.max_samples {
            return None;
        }
        self.accumulated -= self.max_samples;
        Some(std::mem::take(&mut self.backlog))
    }

    /// Fast mode: hand over the pending ticks without a sample coming due.
    pub fn take_backlog(&mut self) -> i32 {
        std::mem::take(&mut self.backlog)
    }

    /// Fast mode: emit the sample for a batch just applied.
    pub fn emit_batched(&mut self, levels: Levels) {
        let inputs = self.mix(levels);
        for channel in 0..self.channels {
            let sample = self.lowpass[channel].apply(inputs[channel]);
            self.finish(channel, sample);
        }
    }

    /// Accurate mode: one tick of sample and hold.
    pub fn hold_tick(&mut self, levels: Levels) {
        self.accumulated += 1.0;
        if self.accumulated < self.max_samples {
            return;
        }
        self.accumulated -= self.max_samples;
        let inputs = self.mix(levels);
        for channel in 0..self.channels {
            let sample = self.lowpass[channel].apply(inputs[channel]);
            self.finish(channel, sample);
        }
    }

    /// High quality mode: one tick into the box filter.
    pub fn box_tick(&mut self, levels: Levels) {
        let inputs = self.mix(levels);
        for channel in 0..self.channels {
            self.sums[channel] += inputs[channel];
            self.last[channel] = inputs[channel];
        }
        self.accumulated += 1.0;
        if self.accumulated < self.max_samples {
            return;
        }
        // The part of this tick that belongs to the next host sample.
        let residual = self.accumulated - self.max_samples;
        for channel in 0..self.channels {
            let carried = self.last[channel] * residual;
            let sample = (self.sums[channel] - carried) / self.max_samples;
            self.sums[channel] = carried;
            self.finish(channel, sample);
        }
        self.accumulated = residual;
    }

    fn finish(&mut self, channel: usize, sample: f64) {
        let mut out = self.dc[channel].apply(sample, self.sample_rate);
        if self.normalize {
            out = self.normalizer.apply(out, self.sample_rate);
        }
        out *= self.volume;

        let cap = self.sample_rate as usize * self.channels * MAX_BUFFERED_SECONDS;
        if self.samples.len() < cap {
            self.samples.push(out as f32);
        }
    }

    // -----------------------------------------------------------------------
    // Output buffer
    // -----------------------------------------------------------------------

    /// Drain the output buffer. Stereo samples are interleaved left, right.
    pub fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.samples.len()
    }
}
