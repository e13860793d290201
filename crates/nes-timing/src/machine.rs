//! Top-level NES machine and frame orchestrator.
//!
//! Nothing is stepped in lock-step. Each frame the orchestrator hands the
//! CPU one scanline's worth of master cycles at a time; before every slice
//! the APU, mapper and PPU queue the interrupts they will raise inside it,
//! and after it they catch up to wherever the CPU stopped. The frame ends
//! when the PPU finishes its last line, not after a fixed instruction
//! count.
//!
//! Around that loop sit the wall-clock concerns: throttle and frameskip,
//! the rewinder, replay recording and playback, and the game clock.

use std::fmt;

use emu_core::{Observable, Ticks, Value};

use crate::bus::NesBus;
use crate::cartridge::CartridgeImage;
use crate::config::MachineConfig;
use crate::cpu::{self, CpuCore};
use crate::error::StateError;
use crate::input::{KeyBuffer, NesButton};
use crate::mapper::Mapper;
use crate::replay::{ReplayPlayer, ReplayRecorder};
use crate::rewind::Rewinder;
use crate::savestate;
use crate::throttle::Throttle;
use crate::timing::SAVE_RAM_SIZE;

/// Trainer bytes land at $7000, inside save RAM.
const TRAINER_OFFSET: usize = 0x1000;

// ---------------------------------------------------------------------------
// Game clock
// ---------------------------------------------------------------------------

/// Emulated time played, advanced by one frame period per frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GameClock {
    pub milliseconds: u16,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub days: u32,
    /// Fraction of a millisecond not yet counted.
    carry: f64,
}

impl GameClock {
    /// Add `ms` milliseconds, carrying fractions to later frames.
    pub fn advance(&mut self, ms: f64) {
        self.carry += ms;
        // Absorb rounding so 60 x (1000/60) lands on a whole second.
        let whole = (self.carry + 1e-9).floor();
        self.carry = (self.carry - whole).max(0.0);

        let mut ms = u64::from(self.milliseconds) + whole as u64;
        self.milliseconds = (ms % 1000) as u16;
        ms /= 1000;
        let mut s = u64::from(self.seconds) + ms;
        self.seconds = (s % 60) as u8;
        s /= 60;
        let mut m = u64::from(self.minutes) + s;
        self.minutes = (m % 60) as u8;
        m /= 60;
        let h = u64::from(self.hours) + m;
        self.hours = (h % 24) as u8;
        self.days = self.days.saturating_add((h / 24) as u32);
    }

    #[must_use]
    pub fn total_milliseconds(&self) -> u64 {
        let hours = u64::from(self.days) * 24 + u64::from(self.hours);
        let minutes = hours * 60 + u64::from(self.minutes);
        let seconds = minutes * 60 + u64::from(self.seconds);
        seconds * 1000 + u64::from(self.milliseconds)
    }
}

impl fmt::Display for GameClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:02}:{:02}:{:02}.{:03}",
            self.days, self.hours, self.minutes, self.seconds, self.milliseconds
        )
    }
}

// ---------------------------------------------------------------------------
// Frame report
// ---------------------------------------------------------------------------

/// What one call to [`Machine::run_frame`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// The frame was presented rather than skipped.
    pub redrawn: bool,
    /// The CPU ran. False when a rewind had nothing to restore.
    pub executed: bool,
    /// The rewinder restored a snapshot this frame.
    pub rewound: bool,
    /// Replay playback ran out of input this frame.
    pub replay_finished: bool,
    /// The host asked to leave the emulation loop.
    pub escape: bool,
}

enum Replay {
    Idle,
    Recording(ReplayRecorder),
    Playing(ReplayPlayer),
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// A complete NES: CPU core, devices, cartridge and the frame loop.
pub struct Machine<C: CpuCore> {
    cpu: C,
    bus: NesBus,
    image: CartridgeImage,
    config: MachineConfig,
    throttle: Throttle,
    keys: KeyBuffer,
    rewinder: Rewinder,
    rewinding: bool,
    replay: Replay,
    /// Frames left before the next drawn frame.
    frame_count: i32,
    executed_frames: u64,
    game_clock: GameClock,
}

impl<C: CpuCore> Machine<C> {
    /// Build and power up a machine.
    pub fn new(cpu: C, image: CartridgeImage, mapper: Box<dyn Mapper>, config: MachineConfig) -> Self {
        let mut bus = NesBus::new(config.region, mapper, &config.apu);
        bus.ppu.set_options(config.ppu);
        let rewinder = Rewinder::new(&config.rewind);
        let mut machine = Self {
            cpu,
            bus,
            image,
            config,
            throttle: Throttle::manual(),
            keys: KeyBuffer::new(),
            rewinder,
            rewinding: false,
            replay: Replay::Idle,
            frame_count: 1,
            executed_frames: 0,
            game_clock: GameClock::default(),
        };
        machine.power_up();
        machine
    }

    /// Build with the mapper the image's header asks for, if supported.
    #[must_use]
    pub fn with_default_mapper(cpu: C, image: CartridgeImage, config: MachineConfig) -> Option<Self> {
        let mapper = image.create_mapper()?;
        Some(Self::new(cpu, image, mapper, config))
    }

    /// Cold start: fresh address space, RAM at power-up contents, every
    /// device initialised, then the CPU takes the reset vector.
    pub fn power_up(&mut self) {
        self.bus.timeline.reset();
        self.bus.ppu.power_up(Ticks::ZERO);
        self.bus.install();
        self.bus.apu.power_up(&mut self.bus.timeline);
        self.bus.input.reset();

        if let Some(trainer) = &self.image.trainer {
            let len = trainer.len().min(SAVE_RAM_SIZE - TRAINER_OFFSET);
            self.bus.save_ram_mut()[TRAINER_OFFSET..TRAINER_OFFSET + len]
                .copy_from_slice(&trainer[..len]);
        }

        self.cpu.power_up();
        self.cpu.reset(&mut self.bus);

        self.frame_count = 1;
        self.executed_frames = 0;
        self.game_clock = GameClock::default();
        self.rewinder.clear();
        self.replay = Replay::Idle;
        log::info!("power up: {} on mapper {}", self.title(), self.bus.mapper.name());
    }

    /// Soft reset (the console's reset button).
    pub fn reset(&mut self) {
        self.reset_devices();
        log::info!("machine reset at {}", self.bus.timeline.now());
    }

    /// Reset in the hardware order: CPU, PPU, mapper, APU, input.
    pub(crate) fn reset_devices(&mut self) {
        self.cpu.reset(&mut self.bus);
        let now = self.bus.timeline.now();
        self.bus.ppu.reset(now);
        self.bus.reset_mapper();
        self.bus.apu.reset(&mut self.bus.timeline);
        self.bus.input.reset();
    }

    // -----------------------------------------------------------------------
    // Frame loop
    // -----------------------------------------------------------------------

    /// Run one frame, or skip its presentation, as pacing demands.
    pub fn run_frame(&mut self) -> FrameReport {
        let mut report = FrameReport {
            escape: self.keys.take_escape(),
            ..FrameReport::default()
        };

        report.redrawn = self.pace();

        if self.rewinder.is_enabled() {
            if self.rewinding {
                if !self.rewind_step() {
                    self.bus.sync_apu();
                    self.bus.sync_ppu();
                    log::trace!("rewind: nothing restored, frame held");
                    return report;
                }
                report.rewound = true;
            } else if self.rewinder.wants_snapshot() {
                let image = savestate::save_state(self);
                self.rewinder.push_snapshot(image);
            }
        }

        report.replay_finished = self.replay_step();

        let base_fps = self.config.region.frame_rate();
        self.game_clock.advance(1000.0 / f64::from(base_fps));

        self.bus
            .ppu
            .set_rendering(report.redrawn && self.config.ppu.enable_rendering);

        let slice = self.config.region.scanline_clocks();
        while !self.bus.ppu.frame_lock() {
            self.bus.predict_apu_irqs(slice);
            self.bus.predict_mapper_irqs(slice);
            self.bus.predict_nmi(slice);
            cpu::execute(&mut self.cpu, &mut self.bus, slice);
            self.bus.sync_apu();
            self.bus.sync_ppu();
        }
        self.bus.ppu.clear_frame_lock();

        self.executed_frames += 1;
        report.executed = true;
        log::trace!(
            "frame {} done at {} (redrawn: {})",
            self.executed_frames,
            self.bus.timeline.now(),
            report.redrawn
        );
        report
    }

    /// Frameskip and speed cap. True when this frame is drawn.
    fn pace(&mut self) -> bool {
        self.frame_count -= 1;
        if self.frame_count > 0 {
            return false;
        }

        if self.config.speed_cap {
            self.throttle.wait(self.config.cpu_usage);
        }
        let owed = i32::try_from(self.throttle.take()).unwrap_or(i32::MAX);
        self.frame_count = owed;
        if self.config.frame_skip != -1 && self.frame_count > self.config.frame_skip {
            self.frame_count = self.config.frame_skip;
        }
        true
    }

    /// Restore the newest snapshot. False when none was restored.
    fn rewind_step(&mut self) -> bool {
        match self.rewinder.take_snapshot() {
            Ok(Some(image)) => match savestate::load_state(self, &image) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("rewind snapshot rejected: {e}");
                    false
                }
            },
            Ok(None) | Err(StateError::Empty) => false,
            Err(e) => {
                log::warn!("rewind failed: {e}");
                false
            }
        }
    }

    /// Record or play back this frame's controller byte. True when
    /// playback ran out.
    fn replay_step(&mut self) -> bool {
        match &mut self.replay {
            Replay::Idle => false,
            Replay::Recording(recorder) => {
                recorder.save_byte(self.bus.input.replay_byte());
                false
            }
            Replay::Playing(player) => {
                let (byte, eof) = player.read_byte();
                if eof {
                    log::info!("replay finished after {} frames", player.position());
                    self.replay = Replay::Idle;
                    return true;
                }
                self.bus.input.apply_replay_byte(byte);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Start recording: the current state becomes the replay's starting
    /// point. Any playback or earlier recording is dropped.
    pub fn start_recording(&mut self) {
        let image = savestate::save_state(self);
        self.replay = Replay::Recording(ReplayRecorder::new(image));
        log::info!("replay recording started");
    }

    /// Finish recording. Returns the replay image, or `None` if nothing
    /// was being recorded.
    pub fn stop_recording(&mut self) -> Option<Vec<u8>> {
        match std::mem::replace(&mut self.replay, Replay::Idle) {
            Replay::Recording(recorder) => {
                log::info!("replay recorded: {} frames", recorder.frames());
                Some(recorder.finish())
            }
            other => {
                self.replay = other;
                None
            }
        }
    }

    /// Load a replay's starting state and play its input from the next
    /// frame on.
    pub fn start_playback(&mut self, replay: &[u8]) -> Result<(), StateError> {
        let player = ReplayPlayer::from_image(replay)?;
        savestate::load_state(self, replay)?;
        log::info!("replay playback started: {} frames", player.len());
        self.replay = Replay::Playing(player);
        Ok(())
    }

    pub fn stop_playback(&mut self) {
        if matches!(self.replay, Replay::Playing(_)) {
            self.replay = Replay::Idle;
        }
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        matches!(self.replay, Replay::Recording(_))
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        matches!(self.replay, Replay::Playing(_))
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Apply new settings. A region change re-times every device from the
    /// current instant; a new speed restarts the throttle if it was running.
    pub fn set_config(&mut self, config: MachineConfig) -> std::io::Result<()> {
        if config.region != self.config.region {
            self.bus.set_region(config.region);
        }
        self.bus.apu.set_config(&config.apu);
        self.bus.ppu.set_options(config.ppu);
        if config.rewind != self.config.rewind {
            self.rewinder.configure(&config.rewind);
        }
        let restart = self.throttle.is_running()
            && (config.region != self.config.region || config.speed_factor != self.config.speed_factor);
        self.config = config;
        if restart {
            self.start_throttle()?;
        }
        Ok(())
    }

    /// Pace frames against the wall clock from now on.
    pub fn start_throttle(&mut self) -> std::io::Result<()> {
        self.throttle = Throttle::start(self.config.region.frame_rate(), self.config.speed_factor)?;
        Ok(())
    }

    /// Use an externally driven throttle instead of the timer thread.
    pub fn set_throttle(&mut self, throttle: Throttle) {
        self.throttle = throttle;
    }

    #[must_use]
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Hold or release the rewind key.
    pub fn set_rewinding(&mut self, held: bool) {
        self.rewinding = held;
    }

    #[must_use]
    pub fn rewinder(&self) -> &Rewinder {
        &self.rewinder
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[must_use]
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    #[must_use]
    pub fn bus(&self) -> &NesBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut NesBus {
        &mut self.bus
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut C, &mut NesBus) {
        (&mut self.cpu, &mut self.bus)
    }

    #[must_use]
    pub fn image(&self) -> &CartridgeImage {
        &self.image
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.image.title
    }

    /// A handle the front end pushes keys into from any thread.
    #[must_use]
    pub fn keys(&self) -> KeyBuffer {
        self.keys.clone()
    }

    #[must_use]
    pub fn frame_count(&self) -> i32 {
        self.frame_count
    }

    #[must_use]
    pub fn executed_frames(&self) -> u64 {
        self.executed_frames
    }

    #[must_use]
    pub fn game_clock(&self) -> GameClock {
        self.game_clock
    }

    /// The last presented frame (ARGB32, 256x240).
    #[must_use]
    pub fn framebuffer(&self) -> &[u32] {
        self.bus.ppu.display()
    }

    /// Drain mixed audio, interleaved when stereo.
    pub fn take_audio_buffer(&mut self) -> Vec<f32> {
        self.bus.apu.take_samples()
    }

    pub fn press_button(&mut self, port: usize, button: NesButton) {
        self.bus.input.press(port, button);
    }

    pub fn release_button(&mut self, port: usize, button: NesButton) {
        self.bus.input.release(port, button);
    }
}

impl<C: CpuCore> Observable for Machine<C> {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "cpu.time" => Some(self.bus.timeline.now().get().into()),
            "cpu.pc" => Some(self.cpu.registers().pc.into()),
            "ppu.scanline" => Some(self.bus.ppu.scanline().into()),
            "ppu.timer" => Some(self.bus.ppu.timer().into()),
            "ppu.dot" => Some(self.bus.ppu.dot().into()),
            "ppu.odd_frame" => Some(self.bus.ppu.odd_frame().into()),
            "apu.step" => Some(self.bus.apu.step().into()),
            "apu.steps" => Some(self.bus.apu.steps().into()),
            "frame_count" => Some(self.frame_count.into()),
            "executed_frames" => Some(self.executed_frames.into()),
            "game_clock" => Some(self.game_clock.to_string().into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "cpu.time",
            "cpu.pc",
            "ppu.scanline",
            "ppu.timer",
            "ppu.dot",
            "ppu.odd_frame",
            "apu.step",
            "apu.steps",
            "frame_count",
            "executed_frames",
            "game_clock",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_clock_carries_fractions() {
        let mut clock = GameClock::default();
        for _ in 0..60 {
            clock.advance(1000.0 / 60.0);
        }
        assert_eq!(clock.seconds, 1);
        assert!(clock.milliseconds <= 1);
        assert_eq!(clock.total_milliseconds() / 1000, 1);
    }

    #[test]
    fn game_clock_cascades_to_days() {
        let mut clock = GameClock::default();
        clock.advance(86_400_000.0 + 3_661_001.0);
        assert_eq!(clock.days, 1);
        assert_eq!(clock.hours, 1);
        assert_eq!(clock.minutes, 1);
        assert_eq!(clock.seconds, 1);
        assert_eq!(clock.milliseconds, 1);
        assert_eq!(clock.to_string(), "1:01:01:01.001");
    }

    #[test]
    fn pal_frames_are_twenty_ms() {
        let mut clock = GameClock::default();
        for _ in 0..50 {
            clock.advance(1000.0 / 50.0);
        }
        assert_eq!(clock.total_milliseconds(), 1000);
    }
}
