//! NES PPU (2C02), lazily synchronised.
//!
//! The PPU is never stepped alongside the CPU. It remembers the last master
//! instant it saw and, whenever one of its registers is touched or a
//! prediction is asked for, catches up in one batch of dots. One dot is one
//! PPU tick: 4 master cycles on NTSC, 5 on PAL.
//!
//! ## Frame layout
//! - -1: pre-render
//! - 0-239: visible
//! - 240: post-render
//! - 241 to the last line: `VBlank` (NMI on dot 1 of line 241)
//!
//! Because the CPU runs ahead of the PPU, the NMI cannot be raised when the
//! dot is reached. [`Ppu::predict_nmi`] looks ahead over a copy of the
//! scanline counter and queues the NMI at the exact master instant instead.

pub mod palette;
pub mod predict;
pub mod registers;
mod render;
pub mod vram;

use emu_core::{DeviceClock, PredictionWindow, Ticks};

use crate::config::{NesRegion, PpuConfig};
use crate::cpu::{CpuTimeline, InterruptKind};
use crate::error::StateError;
use crate::mapper::{IrqSink, Mapper, MapperBus, MapperHooks};
use crate::memory_map::MemoryMap;
use crate::state::{StateReader, StateWriter};
use crate::timing::{FIRST_LINE, FIRST_VBLANK_LINE, HBLANK_DOT, LAST_VISIBLE_LINE};

use predict::{ScanlineCounter, next_vblank};
use registers::{Ctrl, Loopy, Mask, Status};
use render::Pipeline;
use vram::Vram;

/// Framebuffer dimensions.
pub const FB_WIDTH: u32 = 256;
pub const FB_HEIGHT: u32 = 240;

/// Dots between an OAM DMA read and its write.
const OAM_DMA_STEP_DOTS: u8 = 3;

/// What the PPU borrows from the rest of the machine while it catches up.
pub struct PpuPort<'a> {
    pub timeline: &'a mut CpuTimeline,
    pub mapper: &'a mut dyn Mapper,
    pub memory: &'a mut MemoryMap,
}

#[derive(Debug, Clone, Copy)]
enum LineHook {
    Start,
    HBlank,
    End,
}

/// Sprite DMA in flight. Bytes are staged at the $4014 write and copied
/// into OAM one every six dots.
#[derive(Debug, Clone)]
struct OamDma {
    data: [u8; 256],
    active: bool,
    index: u16,
    timer: u8,
    writing: bool,
    latch: u8,
}

impl Default for OamDma {
    fn default() -> Self {
        Self {
            data: [0; 256],
            active: false,
            index: 0,
            timer: 0,
            writing: false,
            latch: 0,
        }
    }
}

/// PPU 2C02.
pub struct Ppu {
    clock: DeviceClock,
    counter: ScanlineCounter,
    window: PredictionWindow,
    /// Ticks completing before this instant have been examined by a
    /// prediction.
    predicted_until: Ticks,
    last_line: i16,
    prediction_buffer: u64,

    ctrl: Ctrl,
    mask: Mask,
    status: Status,
    oam_addr: u8,
    oam: [u8; 256],
    loopy: Loopy,
    read_buffer: u8,
    /// Last value written to any register; the low bits of $2002 and the
    /// write-only registers read it back.
    write_buffer: u8,
    vblank_quirk: u8,
    hblank: bool,
    oam_dma: OamDma,

    vram: Vram,
    pipeline: Pipeline,

    /// Options in force for the frame being drawn.
    options: PpuConfig,
    /// Requested options, applied at the end of the frame.
    pending_options: PpuConfig,

    frame_lock: bool,
    frames: u64,
    last_vblank: Option<Ticks>,
    framebuffer: Vec<u32>,
    display: Vec<u32>,
}

impl Ppu {
    #[must_use]
    pub fn new(region: NesRegion) -> Self {
        let pixels = (FB_WIDTH * FB_HEIGHT) as usize;
        Self {
            clock: DeviceClock::new(region.ppu_divider()),
            counter: ScanlineCounter::default(),
            window: PredictionWindow::new(),
            predicted_until: Ticks::ZERO,
            last_line: region.last_line(),
            prediction_buffer: region.prediction_buffer(),

            ctrl: Ctrl::empty(),
            mask: Mask::empty(),
            status: Status::empty(),
            oam_addr: 0,
            oam: [0; 256],
            loopy: Loopy::default(),
            read_buffer: 0,
            write_buffer: 0,
            vblank_quirk: 0,
            hblank: false,
            oam_dma: OamDma::default(),

            vram: Vram::new(),
            pipeline: Pipeline::default(),

            options: PpuConfig::default(),
            pending_options: PpuConfig::default(),

            frame_lock: false,
            frames: 0,
            last_vblank: None,
            framebuffer: vec![0; pixels],
            display: vec![0; pixels],
        }
    }

    /// Switch video timing. The clock restarts at `now`.
    pub fn set_region(&mut self, region: NesRegion, now: Ticks) {
        self.clock.set_divider(region.ppu_divider());
        self.clock.rebase(now);
        self.last_line = region.last_line();
        self.prediction_buffer = region.prediction_buffer();
    }

    /// Soft reset: registers cleared, frame restarted at the pre-render
    /// line. VRAM contents survive.
    pub fn reset(&mut self, now: Ticks) {
        self.clock.restore(now, 0);
        self.counter = ScanlineCounter::default();
        self.window.clear();
        self.predicted_until = now;
        self.ctrl = Ctrl::empty();
        self.mask = Mask::empty();
        self.status = Status::empty();
        self.oam_addr = 0;
        self.loopy = Loopy::default();
        self.read_buffer = 0;
        self.write_buffer = 0;
        self.vblank_quirk = 0;
        self.hblank = false;
        self.oam_dma = OamDma::default();
        self.pipeline = Pipeline::default();
        self.frame_lock = false;
        self.last_vblank = None;
        log::debug!("ppu reset at {now}");
    }

    /// Cold start: also forgets VRAM and OAM.
    pub fn power_up(&mut self, now: Ticks) {
        self.vram.clear();
        self.oam = [0; 256];
        self.framebuffer.fill(0);
        self.display.fill(0);
        self.frames = 0;
        self.reset(now);
    }

    // -----------------------------------------------------------------------
    // Synchronisation
    // -----------------------------------------------------------------------

    /// Catch up to the CPU's current instant.
    pub fn synchronize(&mut self, port: &mut PpuPort<'_>) {
        let batch = self.clock.catch_up(port.timeline.now());
        for k in 0..batch.ticks {
            self.tick(batch.time_of(k), port);
        }
    }

    /// One dot, completing at master instant `at`.
    fn tick(&mut self, at: Ticks, port: &mut PpuPort<'_>) {
        let dot = self.counter.begin_tick(self.mask.contains(Mask::BACKGROUND));
        self.step_oam_dma();

        let line = self.counter.line;
        if dot == 1 {
            if line == FIRST_LINE {
                self.start_frame();
            }
            self.start_scanline(line, at, port);
        }

        if line <= LAST_VISIBLE_LINE {
            self.render_clock(line, dot, port);
            if dot == HBLANK_DOT {
                self.hblank = true;
                self.run_hook(LineHook::HBlank, line, at, port);
            }
        }

        if self.vblank_quirk > 0 {
            self.vblank_quirk -= 1;
        }

        if let Some(ended) = self.counter.end_tick(self.last_line) {
            self.end_scanline(ended, at, port);
        }
    }

    fn start_frame(&mut self) {
        self.pipeline.clear_sprites();
        if self.mask.rendering_enabled() {
            self.loopy.v = self.loopy.t;
        }
    }

    fn start_scanline(&mut self, line: i16, at: Ticks, port: &mut PpuPort<'_>) {
        if line == FIRST_VBLANK_LINE {
            self.status.insert(Status::VBLANK);
            self.vblank_quirk = 1;
            self.last_vblank = Some(at);
            // A prediction normally queued this NMI already. Past the
            // examined span (CPU overshoot, DMA) it is raised here instead.
            if self.ctrl.nmi_enabled() && at >= self.predicted_until {
                log::trace!("vblank at {at} outside prediction, raising NMI late");
                port.timeline.set_interrupt(InterruptKind::Nmi, at);
            }
        }
        self.run_hook(LineHook::Start, line, at, port);
    }

    fn end_scanline(&mut self, line: i16, at: Ticks, port: &mut PpuPort<'_>) {
        self.run_hook(LineHook::End, line, at, port);
        self.hblank = false;
        self.status.remove(Status::SPRITE_OVERFLOW);
        if line == self.last_line {
            self.status.remove(Status::VBLANK | Status::SPRITE_ZERO_HIT);
            self.end_frame();
        }
    }

    fn end_frame(&mut self) {
        if self.options.enable_rendering {
            self.display.copy_from_slice(&self.framebuffer);
        }
        self.options = self.pending_options;
        self.frames += 1;
        self.frame_lock = true;
    }

    fn run_hook(&mut self, hook: LineHook, line: i16, at: Ticks, port: &mut PpuPort<'_>) {
        let wanted = match hook {
            LineHook::Start => MapperHooks::SCANLINE_START,
            LineHook::HBlank => MapperHooks::HBLANK_START,
            LineHook::End => MapperHooks::SCANLINE_END,
        };
        if !port.mapper.hooks().contains(wanted) {
            return;
        }
        let mut bus = MapperBus {
            memory: &mut *port.memory,
            vram: &mut self.vram,
            irq: IrqSink::new(&mut *port.timeline),
        };
        let irq = match hook {
            LineHook::Start => port.mapper.scanline_start(line, &mut bus),
            LineHook::HBlank => port.mapper.hblank_start(line, &mut bus),
            LineHook::End => port.mapper.scanline_end(line, &mut bus),
        };
        match irq {
            Some(kind) if kind.is_nmi() => {
                log::warn!("mapper {} returned an NMI from a line hook, ignored", port.mapper.name());
            }
            Some(kind) => port.timeline.set_interrupt(kind, at),
            None => {}
        }
    }

    // -----------------------------------------------------------------------
    // NMI prediction
    // -----------------------------------------------------------------------

    /// Look `cycles` master cycles ahead and queue the next NMI, if NMIs
    /// are enabled and `VBlank` begins in that span.
    pub fn predict_nmi(&mut self, cycles: u64, port: &mut PpuPort<'_>) {
        self.synchronize(port);
        let horizon = cycles + self.prediction_buffer + self.clock.divider();
        self.window.open(port.timeline.now(), horizon);
        self.predict(horizon, port.timeline);
    }

    /// Redo the prediction over what is left of the current window.
    fn repredict(&mut self, timeline: &mut CpuTimeline) {
        let remaining = self.window.remaining(timeline.now());
        if remaining == 0 {
            return;
        }
        self.predict(remaining, timeline);
    }

    fn predict(&mut self, horizon: u64, timeline: &mut CpuTimeline) {
        let now = timeline.now();
        timeline.retract_pending(InterruptKind::Nmi, now);

        let ticks = horizon / self.clock.divider();
        if self.ctrl.nmi_enabled() {
            let background = self.mask.contains(Mask::BACKGROUND);
            if let Some(k) = next_vblank(self.counter, background, self.last_line, ticks) {
                timeline.set_interrupt(InterruptKind::Nmi, self.clock.next_tick_time(k));
            }
        }
        self.predicted_until = self.clock.next_tick_time(ticks);
    }

    // -----------------------------------------------------------------------
    // Registers
    // -----------------------------------------------------------------------

    /// CPU read of $2000-$3FFF.
    pub fn read_register(&mut self, address: u16, port: &mut PpuPort<'_>) -> u8 {
        self.synchronize(port);
        match address & 0x07 {
            2 => {
                let mut data = (self.write_buffer & 0x1F)
                    | (self.status.bits() & (Status::SPRITE_OVERFLOW | Status::SPRITE_ZERO_HIT).bits());
                if self.status.contains(Status::VBLANK) {
                    // Read on the very dot the flag rises: cleared but not
                    // reported.
                    if self.vblank_quirk == 0 {
                        data |= Status::VBLANK.bits();
                    }
                    self.status.remove(Status::VBLANK);
                }
                self.loopy.w = false;
                data
            }
            4 => {
                let value = self.oam[usize::from(self.oam_addr)];
                // Attribute bits 2-4 do not exist.
                if self.oam_addr & 0x03 == 0x02 {
                    value & 0xE3
                } else {
                    value
                }
            }
            7 => self.read_data(),
            _ => self.write_buffer,
        }
    }

    fn read_data(&mut self) -> u8 {
        let address = self.loopy.v & 0x3FFF;
        let result = if address >= 0x3F00 {
            // Palette reads are direct; the buffer gets the nametable byte
            // underneath.
            self.read_buffer = self.vram.read(address & 0x2FFF);
            self.vram.read(address)
        } else {
            let buffered = self.read_buffer;
            self.read_buffer = self.vram.read(address);
            buffered
        };
        self.loopy.increment(self.ctrl.increment());
        result
    }

    /// CPU write of $2000-$3FFF.
    pub fn write_register(&mut self, address: u16, value: u8, port: &mut PpuPort<'_>) {
        self.synchronize(port);
        self.write_buffer = value;
        match address & 0x07 {
            0 => {
                let was_enabled = self.ctrl.nmi_enabled();
                self.ctrl = Ctrl::from_bits_retain(value);
                self.loopy.write_ctrl(value);
                let enabled = self.ctrl.nmi_enabled();
                if enabled != was_enabled {
                    if enabled && self.status.contains(Status::VBLANK) {
                        port.timeline.raise(InterruptKind::Nmi);
                    }
                    self.repredict(port.timeline);
                }
            }
            1 => self.mask = Mask::from_bits_retain(value),
            3 => self.oam_addr = value,
            4 => {
                self.oam[usize::from(self.oam_addr)] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            5 => self.loopy.write_scroll(value),
            6 => self.loopy.write_address(value),
            7 => {
                self.vram.write(self.loopy.v & 0x3FFF, value);
                self.loopy.increment(self.ctrl.increment());
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // OAM DMA
    // -----------------------------------------------------------------------

    /// Stage a 256-byte sprite DMA. The caller charges the CPU.
    pub fn start_oam_dma(&mut self, data: &[u8; 256], port: &mut PpuPort<'_>) {
        self.synchronize(port);
        self.oam_dma = OamDma {
            data: *data,
            active: true,
            index: 0,
            timer: OAM_DMA_STEP_DOTS,
            writing: false,
            latch: 0,
        };
    }

    fn step_oam_dma(&mut self) {
        let dma = &mut self.oam_dma;
        if !dma.active {
            return;
        }
        dma.timer -= 1;
        if dma.timer > 0 {
            return;
        }
        dma.timer = OAM_DMA_STEP_DOTS;
        if dma.writing {
            self.oam[usize::from(self.oam_addr)] = dma.latch;
            self.oam_addr = self.oam_addr.wrapping_add(1);
            dma.index += 1;
            if dma.index == 256 {
                dma.active = false;
            }
        } else {
            dma.latch = dma.data[usize::from(dma.index)];
        }
        dma.writing = !dma.writing;
    }

    #[must_use]
    pub fn oam_dma_active(&self) -> bool {
        self.oam_dma.active
    }

    // -----------------------------------------------------------------------
    // Frame handshake and options
    // -----------------------------------------------------------------------

    /// Set once the last line of a frame has ended.
    #[must_use]
    pub fn frame_lock(&self) -> bool {
        self.frame_lock
    }

    pub fn clear_frame_lock(&mut self) {
        self.frame_lock = false;
    }

    /// Request presentation (or not) of the next completed frame.
    pub fn set_rendering(&mut self, enabled: bool) {
        self.pending_options.enable_rendering = enabled;
    }

    /// Request layer switches. They take effect when the frame ends.
    pub fn set_options(&mut self, options: PpuConfig) {
        self.pending_options = options;
    }

    #[must_use]
    pub fn options(&self) -> PpuConfig {
        self.options
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn scanline(&self) -> i16 {
        self.counter.line
    }

    /// Dots left in the current line.
    #[must_use]
    pub fn timer(&self) -> u16 {
        self.counter.timer
    }

    #[must_use]
    pub fn dot(&self) -> u16 {
        self.counter.dot()
    }

    #[must_use]
    pub fn odd_frame(&self) -> bool {
        self.counter.odd_frame
    }

    #[must_use]
    pub fn in_hblank(&self) -> bool {
        self.hblank
    }

    /// Master instant at which the last `VBlank` began.
    #[must_use]
    pub fn last_vblank(&self) -> Option<Ticks> {
        self.last_vblank
    }

    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    #[must_use]
    pub fn clock(&self) -> &DeviceClock {
        &self.clock
    }

    #[must_use]
    pub fn ctrl(&self) -> Ctrl {
        self.ctrl
    }

    #[must_use]
    pub fn mask(&self) -> Mask {
        self.mask
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn oam(&self) -> &[u8; 256] {
        &self.oam
    }

    #[must_use]
    pub fn vram(&self) -> &Vram {
        &self.vram
    }

    pub fn vram_mut(&mut self) -> &mut Vram {
        &mut self.vram
    }

    /// Frame being drawn (ARGB32, 256x240).
    #[must_use]
    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffer
    }

    /// Last presented frame.
    #[must_use]
    pub fn display(&self) -> &[u32] {
        &self.display
    }

    // -----------------------------------------------------------------------
    // Save state
    // -----------------------------------------------------------------------

    /// Write the PPU chunk. The caller synchronises first.
    pub fn save_state(&self, w: &mut StateWriter) {
        w.ticks(self.clock.counter());
        w.u64(self.clock.buffer());
        w.i16(self.counter.line);
        w.u16(self.counter.timer);
        w.bool(self.counter.odd_frame);
        w.ticks(self.window.timestamp());
        w.u64(self.window.horizon());
        w.ticks(self.predicted_until);

        w.u8(self.ctrl.bits());
        w.u8(self.mask.bits());
        w.u8(self.status.bits());
        w.u8(self.oam_addr);
        w.u16(self.loopy.v);
        w.u16(self.loopy.t);
        w.u8(self.loopy.fine_x);
        w.bool(self.loopy.w);
        w.u8(self.read_buffer);
        w.u8(self.write_buffer);
        w.u8(self.vblank_quirk);
        w.bool(self.hblank);

        let dma = &self.oam_dma;
        w.bool(dma.active);
        w.u16(dma.index);
        w.u8(dma.timer);
        w.bool(dma.writing);
        w.u8(dma.latch);
        w.bytes(&dma.data);

        self.vram.save_state(w);
        w.bytes(&self.oam);
    }

    /// Read the PPU chunk back and rebase the clock on `now`.
    pub fn load_state(&mut self, r: &mut StateReader<'_>, now: Ticks) -> Result<(), StateError> {
        let counter = r.ticks()?;
        let buffer = r.u64()?;
        self.clock.restore(counter, buffer);
        self.counter = ScanlineCounter {
            line: r.i16()?,
            timer: r.u16()?,
            odd_frame: r.bool()?,
        };
        let timestamp = r.ticks()?;
        let horizon = r.u64()?;
        self.window.restore(timestamp, horizon);
        self.predicted_until = r.ticks()?;

        self.ctrl = Ctrl::from_bits_retain(r.u8()?);
        self.mask = Mask::from_bits_retain(r.u8()?);
        self.status = Status::from_bits_retain(r.u8()?);
        self.oam_addr = r.u8()?;
        self.loopy = Loopy {
            v: r.u16()?,
            t: r.u16()?,
            fine_x: r.u8()?,
            w: r.bool()?,
        };
        self.read_buffer = r.u8()?;
        self.write_buffer = r.u8()?;
        self.vblank_quirk = r.u8()?;
        self.hblank = r.bool()?;

        let dma = &mut self.oam_dma;
        dma.active = r.bool()?;
        dma.index = r.u16()?.min(255);
        dma.timer = r.u8()?.clamp(1, OAM_DMA_STEP_DOTS);
        dma.writing = r.bool()?;
        dma.latch = r.u8()?;
        r.bytes_into(&mut dma.data)?;

        self.vram.load_state(r)?;
        r.bytes_into(&mut self.oam)?;

        self.clock.rebase(now);
        self.pipeline = Pipeline::default();
        self.frame_lock = false;
        Ok(())
    }

    /// Decode a PPU chunk into a scratch PPU with this one's CHR RAM size.
    /// Nothing here changes.
    pub fn check_state(&self, data: &[u8]) -> Result<(), StateError> {
        let mut scratch = Ppu::new(NesRegion::Ntsc);
        scratch.vram.set_chr_ram(self.vram.chr_ram().len());
        scratch.load_state(&mut StateReader::new(data), Ticks::ZERO)
    }
}

#[cfg(test)]
mod rig {
    use super::{Ppu, PpuPort};
    use crate::cartridge::{CartridgeImage, Mirroring};
    use crate::cpu::CpuTimeline;
    use crate::mapper::{IrqSink, Mapper, MapperBus, NoMapper};
    use crate::memory_map::MemoryMap;

    /// Timeline, memory map and a CHR RAM cartridge for driving a PPU.
    pub struct Rig {
        pub timeline: CpuTimeline,
        pub memory: MemoryMap,
        pub mapper: NoMapper,
    }

    impl Rig {
        pub fn new() -> Self {
            let image = CartridgeImage::new(vec![0; 0x4000], Vec::new(), Mirroring::Vertical);
            Self {
                timeline: CpuTimeline::new(12),
                memory: MemoryMap::new(),
                mapper: NoMapper::new(&image),
            }
        }

        /// Bind the cartridge into the PPU's VRAM.
        pub fn install(&mut self, ppu: &mut Ppu) {
            let mut bus = MapperBus {
                memory: &mut self.memory,
                vram: &mut ppu.vram,
                irq: IrqSink::new(&mut self.timeline),
            };
            self.mapper.init(&mut bus);
        }

        pub fn port(&mut self) -> PpuPort<'_> {
            PpuPort {
                timeline: &mut self.timeline,
                mapper: &mut self.mapper,
                memory: &mut self.memory,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig::Rig;

    const NTSC_FRAME_DOTS: u64 = 262 * 341;

    fn setup() -> (Ppu, Rig) {
        let mut ppu = Ppu::new(NesRegion::Ntsc);
        let mut rig = Rig::new();
        rig.install(&mut ppu);
        (ppu, rig)
    }

    fn run_dots(ppu: &mut Ppu, rig: &mut Rig, dots: u64) {
        rig.timeline.burn(dots * 4);
        ppu.synchronize(&mut rig.port());
    }

    #[test]
    fn one_frame_wraps_and_locks() {
        let (mut ppu, mut rig) = setup();
        run_dots(&mut ppu, &mut rig, NTSC_FRAME_DOTS);
        assert_eq!(ppu.scanline(), FIRST_LINE);
        assert_eq!(ppu.timer(), 341);
        assert!(ppu.odd_frame());
        assert!(ppu.frame_lock());
        assert_eq!(ppu.frames(), 1);
    }

    #[test]
    fn vblank_flag_and_status_read() {
        let (mut ppu, mut rig) = setup();
        run_dots(&mut ppu, &mut rig, 242 * 341 + 1);
        assert!(ppu.status().contains(Status::VBLANK));
        assert_eq!(ppu.last_vblank(), Some(Ticks((242 * 341 + 1) * 4)));

        let status = ppu.read_register(0x2002, &mut rig.port());
        assert_eq!(status & 0x80, 0x80);
        assert!(!ppu.status().contains(Status::VBLANK));
        assert_eq!(ppu.read_register(0x2002, &mut rig.port()) & 0x80, 0);
    }

    #[test]
    fn status_low_bits_come_from_write_buffer() {
        let (mut ppu, mut rig) = setup();
        ppu.write_register(0x2003, 0x5A, &mut rig.port());
        assert_eq!(ppu.read_register(0x2002, &mut rig.port()), 0x1A);
        assert_eq!(ppu.read_register(0x2005, &mut rig.port()), 0x5A);
    }

    #[test]
    fn predicted_nmi_matches_vblank() {
        let (mut ppu, mut rig) = setup();
        ppu.write_register(0x2000, 0x80, &mut rig.port());
        // Jump to a few lines before vblank, then predict over two lines.
        run_dots(&mut ppu, &mut rig, 240 * 341);
        ppu.predict_nmi(341 * 4 * 2, &mut rig.port());
        let predicted = rig.timeline.queued(InterruptKind::Nmi);
        assert!(predicted.is_some());

        run_dots(&mut ppu, &mut rig, 3 * 341);
        assert_eq!(ppu.last_vblank(), predicted);
        assert_eq!(rig.timeline.entries().len(), 1);
    }

    #[test]
    fn disabling_nmi_retracts_prediction() {
        let (mut ppu, mut rig) = setup();
        ppu.write_register(0x2000, 0x80, &mut rig.port());
        run_dots(&mut ppu, &mut rig, 241 * 341);
        ppu.predict_nmi(341 * 4 * 2, &mut rig.port());
        assert!(rig.timeline.queued(InterruptKind::Nmi).is_some());

        ppu.write_register(0x2000, 0x00, &mut rig.port());
        assert_eq!(rig.timeline.queued(InterruptKind::Nmi), None);
    }

    #[test]
    fn prediction_leaves_mapper_proxy_queued() {
        let (mut ppu, mut rig) = setup();
        ppu.write_register(0x2000, 0x80, &mut rig.port());
        run_dots(&mut ppu, &mut rig, 240 * 341);
        let due = rig.timeline.now() + 1000;
        rig.timeline.set_interrupt(InterruptKind::IrqMapperProxy, due);

        ppu.predict_nmi(341 * 4 * 2, &mut rig.port());
        assert_eq!(rig.timeline.queued(InterruptKind::IrqMapperProxy), Some(due));

        // Toggling NMIs repredicts over the open window.
        ppu.write_register(0x2000, 0x00, &mut rig.port());
        ppu.write_register(0x2000, 0x80, &mut rig.port());
        assert_eq!(rig.timeline.queued(InterruptKind::IrqMapperProxy), Some(due));
        assert!(rig.timeline.queued(InterruptKind::Nmi).is_some());
    }

    #[test]
    fn enabling_nmi_inside_vblank_raises_now() {
        let (mut ppu, mut rig) = setup();
        run_dots(&mut ppu, &mut rig, 243 * 341);
        ppu.write_register(0x2000, 0x80, &mut rig.port());
        assert_eq!(rig.timeline.queued(InterruptKind::Nmi), Some(rig.timeline.now()));
    }

    #[test]
    fn unpredicted_vblank_still_raises_nmi() {
        let (mut ppu, mut rig) = setup();
        ppu.write_register(0x2000, 0x80, &mut rig.port());
        run_dots(&mut ppu, &mut rig, 243 * 341);
        assert_eq!(rig.timeline.queued(InterruptKind::Nmi), ppu.last_vblank());
    }

    #[test]
    fn data_port_buffers_reads_below_palette() {
        let (mut ppu, mut rig) = setup();
        let mut port = rig.port();
        ppu.write_register(0x2006, 0x21, &mut port);
        ppu.write_register(0x2006, 0x00, &mut port);
        ppu.write_register(0x2007, 0xAB, &mut port);
        ppu.write_register(0x2007, 0xCD, &mut port);

        ppu.write_register(0x2006, 0x21, &mut port);
        ppu.write_register(0x2006, 0x00, &mut port);
        let _stale = ppu.read_register(0x2007, &mut port);
        assert_eq!(ppu.read_register(0x2007, &mut port), 0xAB);
        assert_eq!(ppu.read_register(0x2007, &mut port), 0xCD);
    }

    #[test]
    fn palette_reads_are_direct() {
        let (mut ppu, mut rig) = setup();
        let mut port = rig.port();
        ppu.write_register(0x2006, 0x3F, &mut port);
        ppu.write_register(0x2006, 0x11, &mut port);
        ppu.write_register(0x2007, 0x2C, &mut port);
        ppu.write_register(0x2006, 0x3F, &mut port);
        ppu.write_register(0x2006, 0x11, &mut port);
        assert_eq!(ppu.read_register(0x2007, &mut port), 0x2C);
    }

    #[test]
    fn oam_attribute_byte_reads_masked() {
        let (mut ppu, mut rig) = setup();
        let mut port = rig.port();
        ppu.write_register(0x2003, 0x02, &mut port);
        ppu.write_register(0x2004, 0xFF, &mut port);
        ppu.write_register(0x2003, 0x02, &mut port);
        assert_eq!(ppu.read_register(0x2004, &mut port), 0xE3);
    }

    #[test]
    fn oam_dma_copies_one_byte_per_six_dots() {
        let (mut ppu, mut rig) = setup();
        let mut data = [0u8; 256];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ppu.write_register(0x2003, 0x10, &mut rig.port());
        ppu.start_oam_dma(&data, &mut rig.port());

        run_dots(&mut ppu, &mut rig, 6);
        assert_eq!(ppu.oam()[0x10], 0);
        assert!(ppu.oam_dma_active());

        run_dots(&mut ppu, &mut rig, 256 * 6);
        assert!(!ppu.oam_dma_active());
        assert_eq!(ppu.oam()[0x11], 1);
        // OAM address wrapped: byte 0xF0 landed at 0x00.
        assert_eq!(ppu.oam()[0x00], 0xF0);
    }

    #[test]
    fn options_apply_at_end_of_frame() {
        let (mut ppu, mut rig) = setup();
        ppu.set_rendering(false);
        assert!(ppu.options().enable_rendering);
        run_dots(&mut ppu, &mut rig, NTSC_FRAME_DOTS);
        assert!(!ppu.options().enable_rendering);
    }

    #[test]
    fn state_round_trip_rebases_clock() {
        let (mut ppu, mut rig) = setup();
        ppu.write_register(0x2000, 0x80, &mut rig.port());
        ppu.write_register(0x2001, 0x1E, &mut rig.port());
        run_dots(&mut ppu, &mut rig, 1000);
        let mut w = StateWriter::new();
        ppu.save_state(&mut w);
        let data = w.into_inner();

        let mut restored = Ppu::new(NesRegion::Ntsc);
        rig.install(&mut restored);
        restored
            .load_state(&mut StateReader::new(&data), Ticks(50_000))
            .unwrap();
        assert_eq!(restored.scanline(), ppu.scanline());
        assert_eq!(restored.timer(), ppu.timer());
        assert_eq!(restored.ctrl(), ppu.ctrl());
        assert_eq!(restored.mask(), ppu.mask());
        assert_eq!(restored.clock().counter(), Ticks(50_000));
    }
}
