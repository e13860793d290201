//! NES APU (2A03 audio), lazily synchronised.
//!
//! Like the PPU, the APU trails the CPU and catches up in batches of ticks
//! when a register is touched or a prediction is asked for. One APU tick is
//! one CPU cycle. Each tick clocks the frame sequencer and the channel
//! timers and feeds the mixer, which resamples to the host rate.
//!
//! Two interrupt sources live here: the frame IRQ (4-step sequence, step 4)
//! and the DMC IRQ (a non-looping sample ran out). Both are predicted ahead
//! of the CPU by running copies of the relevant state forward, then queued
//! at exact master instants on the [`CpuTimeline`].
//!
//! The DMC memory reader is the one place the APU reaches back into the
//! CPU: every byte it fetches goes through the CPU read path and costs the
//! CPU four cycles.

pub mod channels;
pub mod mixer;
pub mod predict;
pub mod sequencer;

use emu_core::{DeviceClock, PredictionWindow, Ticks};

use crate::config::{ApuConfig, ApuMode, NesRegion};
use crate::cpu::{CpuTimeline, InterruptKind};
use crate::error::StateError;
use crate::state::{StateReader, StateWriter};
use crate::timing::DMC_FETCH_CPU_CYCLES;

use channels::{
    DMC_RATE_TABLE_NTSC, DMC_RATE_TABLE_PAL, Dmc, NOISE_PERIOD_TABLE_NTSC,
    NOISE_PERIOD_TABLE_PAL, Noise, Square, Triangle,
};
use mixer::{Levels, Mixer};
use predict::{next_dmc_irq, next_frame_irq};
use sequencer::{FrameSequencer, SequencerMode, StepClocks};

/// What the APU needs from the machine while it catches up.
pub trait ApuHost {
    fn timeline(&mut self) -> &mut CpuTimeline;

    /// Read a byte through the CPU's address decoding, for DMC sample
    /// fetches. The APU charges the cycles itself.
    fn dma_read(&mut self, address: u16) -> u8;
}

/// Which interrupt source a register write invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Frame,
    Dmc,
    Both,
}

impl Source {
    fn frame(self) -> bool {
        matches!(self, Self::Frame | Self::Both)
    }

    fn dmc(self) -> bool {
        matches!(self, Self::Dmc | Self::Both)
    }
}

/// APU 2A03.
pub struct Apu {
    clock: DeviceClock,
    window: PredictionWindow,
    prediction_buffer: u64,
    region: NesRegion,
    config: ApuConfig,
    noise_periods: &'static [u16; 16],
    dmc_rates: &'static [u16; 16],

    sequencer: FrameSequencer,
    square1: Square,
    square2: Square,
    triangle: Triangle,
    noise: Noise,
    dmc: Dmc,

    mixer: Mixer,
}

impl Apu {
    #[must_use]
    pub fn new(region: NesRegion, config: &ApuConfig) -> Self {
        let (noise_periods, dmc_rates) = tables_for(region);
        let mut apu = Self {
            clock: DeviceClock::new(region.apu_divider()),
            window: PredictionWindow::new(),
            prediction_buffer: region.prediction_buffer(),
            region,
            config: config.clone(),
            noise_periods,
            dmc_rates,
            sequencer: FrameSequencer::new(region),
            square1: Square::new(true),
            square2: Square::new(false),
            triangle: Triangle::default(),
            noise: Noise::default(),
            dmc: Dmc::default(),
            mixer: Mixer::new(config, region),
        };
        apu.write_channels(0x4010, 0);
        apu
    }

    /// Switch timing tables and divider. The clock restarts at `now`.
    pub fn set_region(&mut self, region: NesRegion, now: Ticks) {
        self.region = region;
        self.clock.set_divider(region.apu_divider());
        self.clock.rebase(now);
        self.prediction_buffer = region.prediction_buffer();
        (self.noise_periods, self.dmc_rates) = tables_for(region);
        self.sequencer.set_region(region);
        self.mixer.configure(&self.config, region);
    }

    /// Apply new audio options. Resampler state restarts.
    pub fn set_config(&mut self, config: &ApuConfig) {
        self.config = config.clone();
        self.mixer.configure(config, self.region);
    }

    #[must_use]
    pub fn config(&self) -> &ApuConfig {
        &self.config
    }

    /// Cold start: 4-step sequence from step 1, every channel silent.
    pub fn power_up(&mut self, timeline: &mut CpuTimeline) {
        self.sequencer = FrameSequencer::new(self.region);
        self.reset(timeline);
        self.sequencer.reset();
    }

    /// Soft reset. Registers are written with zero; the frame sequencer
    /// keeps its position.
    pub fn reset(&mut self, timeline: &mut CpuTimeline) {
        let (counter, step) = self.sequencer.position();

        self.square1 = Square::new(true);
        self.square2 = Square::new(false);
        self.triangle = Triangle::default();
        self.noise = Noise::default();
        self.dmc = Dmc::default();
        for address in (0x4000..=0x4013).chain(std::iter::once(0x4015)) {
            self.write_channels(address, 0);
        }

        self.sequencer.write_control(0);
        self.sequencer.set_position(counter, step);
        self.sequencer.irq_flag = false;

        timeline.clear_interrupt(InterruptKind::IrqFrame);
        timeline.clear_interrupt(InterruptKind::IrqDmc);
        self.clock.restore(timeline.now(), 0);
        self.window.clear();
        self.mixer.reset();
        log::debug!("apu reset at {}, sequencer step {step}", timeline.now());
    }

    // -----------------------------------------------------------------------
    // Synchronisation
    // -----------------------------------------------------------------------

    /// Catch up to the CPU's current instant.
    pub fn synchronize(&mut self, host: &mut impl ApuHost) {
        let batch = self.clock.catch_up(host.timeline().now());
        for k in 0..batch.ticks {
            self.tick(batch.time_of(k), host);
        }
    }

    /// One APU tick, completing at master instant `at`.
    ///
    /// The DMC reader steals CPU cycles, so it is clocked every tick in
    /// every mode. Fast mode batches only the other units.
    fn tick(&mut self, at: Ticks, host: &mut impl ApuHost) {
        self.service_dmc_fetch(at, host);
        self.dmc.clock_timer(1);

        match self.mixer.mode() {
            ApuMode::Fast => {
                if let Some(delta) = self.mixer.batch_tick() {
                    self.advance(delta, at, host.timeline());
                    self.mixer.emit_batched(self.levels());
                }
            }
            ApuMode::Accurate => {
                self.advance(1, at, host.timeline());
                self.mixer.hold_tick(self.levels());
            }
            ApuMode::HighQuality => {
                self.advance(1, at, host.timeline());
                self.mixer.box_tick(self.levels());
            }
        }
    }

    /// Run the sequencer and the channel timers forward by `delta` ticks.
    fn advance(&mut self, delta: i32, at: Ticks, timeline: &mut CpuTimeline) {
        if let Some(clocks) = self.sequencer.clock(delta) {
            self.clock_units(clocks);
            if clocks.irq {
                timeline.set_interrupt(InterruptKind::IrqFrame, at);
            }
        }
        self.square1.clock_timer(delta);
        self.square2.clock_timer(delta);
        self.triangle.clock_timer(delta);
        self.noise.clock_timer(delta);
    }

    /// Fast mode: bring the batched units up to date so a register access
    /// sees current state. Nothing is pending in the other modes.
    fn flush_backlog(&mut self, timeline: &mut CpuTimeline) {
        let delta = self.mixer.take_backlog();
        if delta > 0 {
            self.advance(delta, timeline.now(), timeline);
        }
    }

    /// Catch up and apply any Fast mode backlog. Used before the state is
    /// read out whole.
    pub fn settle(&mut self, host: &mut impl ApuHost) {
        self.synchronize(host);
        self.flush_backlog(host.timeline());
    }

    fn clock_units(&mut self, clocks: StepClocks) {
        if clocks.quarter {
            self.square1.envelope.clock();
            self.square2.envelope.clock();
            self.noise.envelope.clock();
            self.triangle.clock_linear_counter();
        }
        if clocks.half {
            self.square1.length.clock();
            self.square2.length.clock();
            self.triangle.length.clock();
            self.noise.length.clock();
            self.square1.clock_sweep();
            self.square2.clock_sweep();
        }
    }

    /// Refill the DMC sample buffer if it is empty and bytes remain.
    fn service_dmc_fetch(&mut self, at: Ticks, host: &mut impl ApuHost) {
        let Some(address) = self.dmc.pending_fetch() else {
            return;
        };
        let byte = host.dma_read(address);
        let timeline = host.timeline();
        timeline.burn_cycles(DMC_FETCH_CPU_CYCLES);
        if self.dmc.receive_dma_byte(byte) {
            timeline.set_interrupt(InterruptKind::IrqDmc, at);
        }
    }

    fn levels(&self) -> Levels {
        Levels {
            square1: self.square1.output,
            square2: self.square2.output,
            triangle: self.triangle.output,
            noise: self.noise.output,
            dmc: self.dmc.output,
        }
    }

    // -----------------------------------------------------------------------
    // IRQ prediction
    // -----------------------------------------------------------------------

    /// Look `cycles` master cycles ahead and queue the frame and DMC IRQs
    /// that would rise in that span.
    pub fn predict_irqs(&mut self, cycles: u64, host: &mut impl ApuHost) {
        self.synchronize(host);
        let timeline = host.timeline();
        let horizon = cycles + self.prediction_buffer + self.clock.divider();
        self.window.open(timeline.now(), horizon);
        self.predict(Source::Both, horizon, timeline);
    }

    /// Redo a prediction over what is left of the current window.
    fn repredict(&self, source: Source, timeline: &mut CpuTimeline) {
        let remaining = self.window.remaining(timeline.now());
        if remaining == 0 {
            return;
        }
        self.predict(source, remaining, timeline);
    }

    fn predict(&self, source: Source, horizon: u64, timeline: &mut CpuTimeline) {
        let now = timeline.now();
        let ticks = horizon / self.clock.divider();
        if source.frame() {
            // Fast mode holds back sequencer ticks; the copy starts that far
            // in the past.
            let backlog = self.mixer.backlog();
            timeline.retract_pending(InterruptKind::IrqFrame, now);
            if let Some(k) = next_frame_irq(self.sequencer.clone(), ticks + backlog) {
                let at = self.clock.next_tick_time(k.saturating_sub(backlog));
                timeline.set_interrupt(InterruptKind::IrqFrame, at);
            }
        }

        if source.dmc() {
            timeline.retract_pending(InterruptKind::IrqDmc, now);
            if self.dmc.irq_enabled && !self.dmc.loop_flag && !self.dmc.irq_flag {
                if let Some(k) = next_dmc_irq(self.dmc.reader(), ticks) {
                    timeline.set_interrupt(InterruptKind::IrqDmc, self.clock.next_tick_time(k));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Registers
    // -----------------------------------------------------------------------

    /// CPU read of $4015. Reading acknowledges the frame IRQ and restarts
    /// the sequencer.
    pub fn read_status(&mut self, host: &mut impl ApuHost) -> u8 {
        self.settle(host);
        let mut status = 0;
        status |= u8::from(self.square1.length.active());
        status |= u8::from(self.square2.length.active()) << 1;
        status |= u8::from(self.triangle.length.active()) << 2;
        status |= u8::from(self.noise.length.active()) << 3;
        status |= u8::from(self.dmc.active()) << 4;
        status |= u8::from(self.sequencer.irq_flag) << 6;
        status |= u8::from(self.dmc.irq_flag) << 7;

        self.sequencer.reset();
        let timeline = host.timeline();
        timeline.clear_interrupt(InterruptKind::IrqFrame);
        self.repredict(Source::Frame, timeline);
        status
    }

    /// CPU write of $4000-$4013, $4015 or $4017.
    pub fn write_register(&mut self, address: u16, value: u8, host: &mut impl ApuHost) {
        self.settle(host);
        let timeline = host.timeline();
        match address {
            0x4010 => {
                self.write_channels(address, value);
                if !self.dmc.irq_enabled {
                    timeline.clear_interrupt(InterruptKind::IrqDmc);
                }
                self.repredict(Source::Dmc, timeline);
            }
            0x4012 | 0x4013 => {
                self.write_channels(address, value);
                self.repredict(Source::Dmc, timeline);
            }
            0x4015 => {
                self.write_channels(address, value);
                self.dmc.irq_flag = false;
                timeline.clear_interrupt(InterruptKind::IrqDmc);
                self.repredict(Source::Dmc, timeline);
            }
            0x4017 => {
                self.sequencer.write_control(value);
                self.sequencer.reset();
                timeline.clear_interrupt(InterruptKind::IrqFrame);
                if self.sequencer.mode() == SequencerMode::FiveStep {
                    self.clock_units(StepClocks::ALL);
                }
                self.repredict(Source::Frame, timeline);
            }
            _ => self.write_channels(address, value),
        }
    }

    /// Channel register effects alone, with no interrupt bookkeeping.
    fn write_channels(&mut self, address: u16, value: u8) {
        match address {
            0x4000..=0x4003 => self.square1.write(address, value),
            0x4004..=0x4007 => self.square2.write(address, value),
            0x4008..=0x400B => self.triangle.write(address, value),
            0x400C..=0x400F => self.noise.write(address, value, self.noise_periods),
            0x4010..=0x4013 => self.dmc.write(address, value, self.dmc_rates),
            0x4015 => {
                self.square1.length.set_enabled(value & 0x01 != 0);
                self.square2.length.set_enabled(value & 0x02 != 0);
                self.triangle.length.set_enabled(value & 0x04 != 0);
                self.noise.length.set_enabled(value & 0x08 != 0);
                self.dmc.set_enabled(value & 0x10 != 0);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Output and inspection
    // -----------------------------------------------------------------------

    /// Drain resampled audio. Stereo output is interleaved.
    pub fn take_samples(&mut self) -> Vec<f32> {
        self.mixer.take_samples()
    }

    #[must_use]
    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    /// Current frame sequencer step, 1-based.
    #[must_use]
    pub fn step(&self) -> u8 {
        self.sequencer.step()
    }

    /// Steps in the current sequence: 4 or 5.
    #[must_use]
    pub fn steps(&self) -> u8 {
        self.sequencer.mode().steps()
    }

    #[must_use]
    pub fn sequencer(&self) -> &FrameSequencer {
        &self.sequencer
    }

    #[must_use]
    pub fn square1(&self) -> &Square {
        &self.square1
    }

    #[must_use]
    pub fn dmc(&self) -> &Dmc {
        &self.dmc
    }

    #[must_use]
    pub fn clock(&self) -> &DeviceClock {
        &self.clock
    }

    // -----------------------------------------------------------------------
    // Save state
    // -----------------------------------------------------------------------

    /// Write the APU chunk. The caller settles first.
    pub fn save_state(&self, w: &mut StateWriter) {
        w.ticks(self.clock.counter());
        w.u64(self.clock.buffer());
        w.ticks(self.window.timestamp());
        w.u64(self.window.horizon());
        self.sequencer.save_state(w);
        self.square1.save_state(w);
        self.square2.save_state(w);
        self.triangle.save_state(w);
        self.noise.save_state(w);
        self.dmc.save_state(w);
    }

    /// Read the APU chunk back and rebase the clock on `now`.
    pub fn load_state(&mut self, r: &mut StateReader<'_>, now: Ticks) -> Result<(), StateError> {
        let counter = r.ticks()?;
        let buffer = r.u64()?;
        self.clock.restore(counter, buffer);
        let timestamp = r.ticks()?;
        let horizon = r.u64()?;
        self.window.restore(timestamp, horizon);
        self.sequencer.load_state(r)?;
        self.square1.load_state(r)?;
        self.square2.load_state(r)?;
        self.triangle.load_state(r)?;
        self.noise.load_state(r)?;
        self.dmc.load_state(r)?;

        self.clock.rebase(now);
        self.mixer.reset();
        Ok(())
    }

    /// Decode an APU chunk into a scratch APU. Nothing here changes.
    pub fn check_state(&self, data: &[u8]) -> Result<(), StateError> {
        Apu::new(self.region, &self.config).load_state(&mut StateReader::new(data), Ticks::ZERO)
    }
}

fn tables_for(region: NesRegion) -> (&'static [u16; 16], &'static [u16; 16]) {
    match region {
        NesRegion::Ntsc => (&NOISE_PERIOD_TABLE_NTSC, &DMC_RATE_TABLE_NTSC),
        NesRegion::Pal => (&NOISE_PERIOD_TABLE_PAL, &DMC_RATE_TABLE_PAL),
    }
}

#[cfg(test)]
pub(crate) mod rig {
    use super::ApuHost;
    use crate::cpu::CpuTimeline;

    /// A timeline and 32K of PRG for the DMC to read from.
    pub struct Host {
        pub timeline: CpuTimeline,
        pub prg: Vec<u8>,
        pub reads: Vec<u16>,
    }

    impl Host {
        pub fn new() -> Self {
            Self {
                timeline: CpuTimeline::new(12),
                prg: vec![0; 0x8000],
                reads: Vec::new(),
            }
        }
    }

    impl ApuHost for Host {
        fn timeline(&mut self) -> &mut CpuTimeline {
            &mut self.timeline
        }

        fn dma_read(&mut self, address: u16) -> u8 {
            self.reads.push(address);
            self.prg[usize::from(address & 0x7FFF)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::rig::Host;
    use super::*;

    /// Master instant of the first 4-step frame IRQ from power-up.
    const FIRST_FRAME_IRQ: Ticks = Ticks(12 * (0x1D23 + 0x1D23 + 0x1D20 + 0x1D22));

    fn apu(mode: ApuMode) -> Apu {
        let config = ApuConfig {
            mode,
            ..ApuConfig::default()
        };
        Apu::new(NesRegion::Ntsc, &config)
    }

    fn run(apu: &mut Apu, host: &mut Host, cpu_cycles: u64) {
        host.timeline.burn_cycles(cpu_cycles);
        apu.synchronize(host);
    }

    #[test]
    fn silent_by_default() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        run(&mut apu, &mut host, 10_000);
        let samples = apu.take_samples();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn square_produces_audio() {
        let mut apu = apu(ApuMode::Accurate);
        let mut host = Host::new();
        apu.write_register(0x4015, 0x01, &mut host);
        apu.write_register(0x4000, 0xBF, &mut host);
        apu.write_register(0x4002, 0xFD, &mut host);
        apu.write_register(0x4003, 0x00, &mut host);
        run(&mut apu, &mut host, 10_000);
        let samples = apu.take_samples();
        assert!(samples.iter().any(|s| s.abs() > 0.01));
    }

    #[test]
    fn one_frame_yields_host_rate_samples() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        run(&mut apu, &mut host, 29_780);
        // 29780 / (1789772.67 / 44100) is about 733.8.
        assert_eq!(apu.take_samples().len(), 733);
    }

    #[test]
    fn status_reflects_length_and_disable_clears_it() {
        let mut apu = apu(ApuMode::Fast);
        let mut host = Host::new();
        apu.write_register(0x4015, 0x0F, &mut host);
        apu.write_register(0x4003, 0x08, &mut host);
        apu.write_register(0x400F, 0x08, &mut host);
        assert_eq!(apu.read_status(&mut host) & 0x0F, 0x09);
        apu.write_register(0x4015, 0x08, &mut host);
        assert_eq!(apu.read_status(&mut host) & 0x0F, 0x08);
    }

    #[test]
    fn frame_irq_realised_at_step_four() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        run(&mut apu, &mut host, 30_000);
        assert!(apu.sequencer().irq_flag);
        assert_eq!(host.timeline.queued(InterruptKind::IrqFrame), Some(FIRST_FRAME_IRQ));
    }

    #[test]
    fn frame_irq_prediction_matches_realisation() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        let slice = NesRegion::Ntsc.scanline_clocks();
        let mut predicted = None;
        while !apu.sequencer().irq_flag {
            apu.predict_irqs(slice, &mut host);
            predicted = predicted.or(host.timeline.queued(InterruptKind::IrqFrame));
            host.timeline.burn(slice);
            apu.synchronize(&mut host);
        }
        assert_eq!(predicted, Some(FIRST_FRAME_IRQ));
        assert_eq!(host.timeline.queued(InterruptKind::IrqFrame), Some(FIRST_FRAME_IRQ));
        let frames = host
            .timeline
            .entries()
            .iter()
            .filter(|(k, _)| *k == InterruptKind::IrqFrame)
            .count();
        assert_eq!(frames, 1);
    }

    #[test]
    fn prediction_leaves_state_alone() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        run(&mut apu, &mut host, 1_000);
        let before = apu.sequencer().position();
        apu.predict_irqs(1_000_000, &mut host);
        assert_eq!(apu.sequencer().position(), before);
        assert!(!apu.sequencer().irq_flag);
        assert_eq!(host.timeline.queued(InterruptKind::IrqFrame), Some(FIRST_FRAME_IRQ));
    }

    #[test]
    fn five_step_write_mid_frame() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        apu.write_register(0x4015, 0x01, &mut host);
        apu.write_register(0x4000, 0x00, &mut host);
        apu.write_register(0x4003, 0x08, &mut host);
        assert_eq!(apu.square1().length.value(), 254);
        apu.predict_irqs(1_000_000, &mut host);
        assert!(host.timeline.queued(InterruptKind::IrqFrame).is_some());

        run(&mut apu, &mut host, 5_000);
        apu.write_register(0x4017, 0x80, &mut host);

        assert_eq!(apu.step(), 1);
        assert_eq!(apu.steps(), 5);
        assert_eq!(apu.sequencer().position(), (0x1D22, 1));
        // The extra clock on the write.
        assert_eq!(apu.square1().length.value(), 253);
        assert!(!apu.sequencer().irq_enabled);
        assert_eq!(host.timeline.queued(InterruptKind::IrqFrame), None);

        run(&mut apu, &mut host, 100_000);
        assert!(!apu.sequencer().irq_flag);
        assert_eq!(host.timeline.queued(InterruptKind::IrqFrame), None);
    }

    #[test]
    fn four_step_write_has_no_extra_clock() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        apu.write_register(0x4015, 0x01, &mut host);
        apu.write_register(0x4003, 0x08, &mut host);
        apu.write_register(0x4017, 0x40, &mut host);
        assert_eq!(apu.square1().length.value(), 254);
        assert_eq!(apu.steps(), 4);
        apu.predict_irqs(1_000_000, &mut host);
        assert_eq!(host.timeline.queued(InterruptKind::IrqFrame), None);
    }

    #[test]
    fn status_read_acknowledges_frame_irq() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        run(&mut apu, &mut host, 30_000);
        assert!(host.timeline.is_asserted(InterruptKind::IrqFrame));
        assert_ne!(apu.read_status(&mut host) & 0x40, 0);
        assert_eq!(host.timeline.queued(InterruptKind::IrqFrame), None);
        assert_eq!(apu.step(), 1);
        assert_eq!(apu.read_status(&mut host) & 0x40, 0);
    }

    #[test]
    fn dmc_fetch_steals_cycles_and_raises_irq() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        host.prg[0x4000] = 0xAA;
        apu.write_register(0x4010, 0x80, &mut host);
        apu.write_register(0x4012, 0x00, &mut host);
        apu.write_register(0x4013, 0x00, &mut host);
        apu.write_register(0x4015, 0x10, &mut host);
        apu.predict_irqs(1_000, &mut host);
        // One byte: the fetch on the very next tick ends the sample.
        assert_eq!(host.timeline.queued(InterruptKind::IrqDmc), Some(Ticks(12)));

        run(&mut apu, &mut host, 100);
        assert_eq!(host.reads, vec![0xC000]);
        assert_eq!(host.timeline.now(), Ticks(1200 + 48));
        assert_eq!(host.timeline.queued(InterruptKind::IrqDmc), Some(Ticks(12)));
        assert_ne!(apu.read_status(&mut host) & 0x80, 0);

        apu.write_register(0x4015, 0x00, &mut host);
        assert!(!apu.dmc().irq_flag);
        assert_eq!(host.timeline.queued(InterruptKind::IrqDmc), None);
    }

    #[test]
    fn dmc_prediction_matches_realisation() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        apu.write_register(0x4010, 0x8F, &mut host);
        apu.write_register(0x4013, 0x01, &mut host);
        apu.write_register(0x4015, 0x10, &mut host);
        let slice = NesRegion::Ntsc.scanline_clocks();
        let mut predicted = None;
        while !apu.dmc().irq_flag {
            apu.predict_irqs(slice, &mut host);
            predicted = predicted.or(host.timeline.queued(InterruptKind::IrqDmc));
            host.timeline.burn(slice);
            apu.synchronize(&mut host);
        }
        assert!(predicted.is_some());
        assert_eq!(host.timeline.queued(InterruptKind::IrqDmc), predicted);
        assert_eq!(host.reads.len(), 17);
    }

    /// Predict once over `horizon` master cycles and note what was queued
    /// for `kind`. The entry is then withdrawn so the realised instant is
    /// recorded on its own while the APU runs in scanline slices until
    /// `raised`.
    fn predict_then_realise(
        apu: &mut Apu,
        host: &mut Host,
        kind: InterruptKind,
        horizon: u64,
        raised: impl Fn(&Apu) -> bool,
    ) -> (Option<Ticks>, Option<Ticks>) {
        apu.predict_irqs(horizon, host);
        let predicted = host.timeline.queued(kind);
        host.timeline.clear_interrupt(kind);
        let slice = NesRegion::Ntsc.scanline_clocks();
        while !raised(apu) {
            host.timeline.burn(slice);
            apu.synchronize(host);
        }
        (predicted, host.timeline.queued(kind))
    }

    #[test]
    fn dmc_prediction_after_five_step_write() {
        for mode in [ApuMode::HighQuality, ApuMode::Accurate, ApuMode::Fast] {
            let mut apu = apu(mode);
            let mut host = Host::new();
            apu.write_register(0x4015, 0x01, &mut host);
            apu.write_register(0x4003, 0x08, &mut host);
            apu.write_register(0x4010, 0x8F, &mut host);
            apu.write_register(0x4013, 0x01, &mut host);
            apu.write_register(0x4015, 0x11, &mut host);
            run(&mut apu, &mut host, 5_000);
            assert!(apu.dmc().active(), "{mode:?}");

            apu.write_register(0x4017, 0x80, &mut host);
            assert_eq!(apu.steps(), 5);
            assert_eq!(apu.sequencer().position(), (0x1D22, 1), "{mode:?}");

            let (predicted, realised) = predict_then_realise(
                &mut apu,
                &mut host,
                InterruptKind::IrqDmc,
                1_000_000,
                |apu| apu.dmc().irq_flag,
            );
            assert!(predicted.is_some(), "{mode:?}: nothing predicted");
            assert_eq!(realised, predicted, "{mode:?}");
            assert_eq!(host.reads.len(), 17, "{mode:?}");
            assert_eq!(host.timeline.queued(InterruptKind::IrqFrame), None);
        }
    }

    #[test]
    fn fast_mode_frame_prediction_counts_the_backlog() {
        let mut apu = apu(ApuMode::Fast);
        let mut host = Host::new();
        run(&mut apu, &mut host, 1_000);
        assert!(apu.mixer().backlog() > 0);

        let (predicted, realised) = predict_then_realise(
            &mut apu,
            &mut host,
            InterruptKind::IrqFrame,
            1_000_000,
            |apu| apu.sequencer().irq_flag,
        );
        assert_eq!(predicted, Some(FIRST_FRAME_IRQ));
        // Fast mode raises it when the batch holding step 4 is applied.
        let realised = realised.expect("frame IRQ raised");
        assert!(realised >= FIRST_FRAME_IRQ);
        assert!(realised.since(FIRST_FRAME_IRQ) < 42 * 12);
    }

    #[test]
    fn fast_mode_register_access_applies_backlog() {
        // Step 2 (a half-frame clock) lands on tick 14918, inside the last
        // unapplied batch.
        let mut lengths = Vec::new();
        for mode in [ApuMode::Fast, ApuMode::HighQuality] {
            let mut apu = apu(mode);
            let mut host = Host::new();
            apu.write_register(0x4015, 0x01, &mut host);
            apu.write_register(0x4003, 0x08, &mut host);
            run(&mut apu, &mut host, 14_925);
            apu.write_register(0x4017, 0x80, &mut host);
            assert_eq!(apu.mixer().backlog(), 0);
            lengths.push(apu.square1().length.value());
        }
        assert_eq!(lengths, [252, 252]);
    }

    #[test]
    fn disabling_dmc_irq_withdraws_it() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        apu.write_register(0x4010, 0x80, &mut host);
        apu.write_register(0x4015, 0x10, &mut host);
        run(&mut apu, &mut host, 10);
        assert!(apu.dmc().irq_flag);
        apu.write_register(0x4010, 0x00, &mut host);
        assert!(!apu.dmc().irq_flag);
        assert_eq!(host.timeline.queued(InterruptKind::IrqDmc), None);
    }

    #[test]
    fn looping_sample_never_predicts() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        apu.write_register(0x4010, 0xC0, &mut host);
        apu.write_register(0x4015, 0x10, &mut host);
        apu.predict_irqs(1_000_000, &mut host);
        assert_eq!(host.timeline.queued(InterruptKind::IrqDmc), None);
        run(&mut apu, &mut host, 20_000);
        assert!(apu.dmc().active());
        assert!(!apu.dmc().irq_flag);
    }

    #[test]
    fn fast_mode_still_raises_frame_irq() {
        let mut apu = apu(ApuMode::Fast);
        let mut host = Host::new();
        run(&mut apu, &mut host, 31_000);
        assert!(apu.sequencer().irq_flag);
        let at = host.timeline.queued(InterruptKind::IrqFrame);
        assert!(at.is_some_and(|t| t >= FIRST_FRAME_IRQ));
    }

    #[test]
    fn soft_reset_keeps_sequencer_position() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        apu.write_register(0x4017, 0x40, &mut host);
        run(&mut apu, &mut host, 9_000);
        let position = apu.sequencer().position();
        assert_eq!(position.1, 2);

        apu.reset(&mut host.timeline);
        assert_eq!(apu.sequencer().position(), position);
        assert!(apu.sequencer().irq_enabled);
        assert_eq!(apu.clock().counter(), host.timeline.now());

        apu.power_up(&mut host.timeline);
        assert_eq!(apu.sequencer().position(), (0x1D23, 1));
    }

    #[test]
    fn state_reloads_at_new_instant() {
        let mut apu = apu(ApuMode::HighQuality);
        let mut host = Host::new();
        apu.write_register(0x4015, 0x01, &mut host);
        apu.write_register(0x4003, 0x08, &mut host);
        run(&mut apu, &mut host, 12_345);
        let mut w = StateWriter::new();
        apu.save_state(&mut w);
        let bytes = w.into_inner();

        let mut restored = Apu::new(NesRegion::Ntsc, &ApuConfig::default());
        let now = Ticks(5_000_000);
        restored
            .load_state(&mut StateReader::new(&bytes), now)
            .expect("load");
        assert_eq!(restored.sequencer().position(), apu.sequencer().position());
        assert_eq!(restored.square1().length.value(), apu.square1().length.value());
        assert_eq!(restored.clock().counter(), now);
        assert_eq!(restored.clock().buffer(), apu.clock().buffer());
    }

    #[test]
    fn truncated_state_is_rejected() {
        let mut apu = apu(ApuMode::HighQuality);
        let bytes = [0u8; 10];
        assert!(apu.load_state(&mut StateReader::new(&bytes), Ticks::ZERO).is_err());
    }
}
