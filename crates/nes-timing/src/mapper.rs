//! Cartridge mapper contract.
//!
//! A mapper binds the cartridge's PRG and CHR into the CPU and PPU address
//! spaces and may raise IRQs. It is invoked from fixed points of the PPU's
//! scanline and from its own handler windows. Hooks get a [`MapperBus`],
//! which reaches the memory maps and, through an [`IrqSink`], the interrupt
//! queue. The CPU clock itself is read-only to a mapper, so a hook cannot
//! move time under a synchronisation already in progress.

use std::sync::Arc;

use bitflags::bitflags;
use emu_core::Ticks;

use crate::cartridge::{CartridgeImage, Mirroring};
use crate::cpu::{CpuTimeline, InterruptKind};
use crate::error::StateError;
use crate::memory_map::MemoryMap;
use crate::page_table::PageTable;
use crate::ppu::vram::{Vram, Window, WINDOW_SIZE};
use crate::state::{StateReader, StateWriter};

bitflags! {
    /// Hooks a mapper actually implements. Call sites skip the rest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapperHooks: u8 {
        const SCANLINE_START = 1 << 0;
        const HBLANK_START = 1 << 1;
        const SCANLINE_END = 1 << 2;
        const PREDICT_IRQS = 1 << 3;
        const CHECK_LATCHES = 1 << 4;
    }
}

/// A mapper's view of the CPU timeline: the current instant and the
/// interrupt queue. Burning cycles, resetting and changing the divider
/// stay with the CPU.
pub struct IrqSink<'a> {
    timeline: &'a mut CpuTimeline,
}

impl<'a> IrqSink<'a> {
    pub fn new(timeline: &'a mut CpuTimeline) -> Self {
        Self { timeline }
    }

    #[must_use]
    pub fn now(&self) -> Ticks {
        self.timeline.now()
    }

    /// Master cycles per CPU cycle.
    #[must_use]
    pub fn divider(&self) -> u64 {
        self.timeline.divider()
    }

    pub fn set_interrupt(&mut self, kind: InterruptKind, at: Ticks) {
        self.timeline.set_interrupt(kind, at);
    }

    pub fn clear_interrupt(&mut self, kind: InterruptKind) {
        self.timeline.clear_interrupt(kind);
    }

    #[must_use]
    pub fn queued(&self, kind: InterruptKind) -> Option<Ticks> {
        self.timeline.queued(kind)
    }
}

/// What a mapper hook may touch.
pub struct MapperBus<'a> {
    pub memory: &'a mut MemoryMap,
    pub vram: &'a mut Vram,
    pub irq: IrqSink<'a>,
}

pub trait Mapper {
    fn name(&self) -> &str;

    /// iNES mapper number.
    fn number(&self) -> u16;

    fn hooks(&self) -> MapperHooks {
        MapperHooks::empty()
    }

    /// Power-up: register buffers and bind the initial windows.
    fn init(&mut self, bus: &mut MapperBus<'_>);

    /// Soft reset. Buffers stay registered.
    fn reset(&mut self, _bus: &mut MapperBus<'_>) {}

    /// Read from a block bound to [`Handler::Mapper`](crate::memory_map::Handler::Mapper).
    fn cpu_read(&mut self, _address: u16, _bus: &mut MapperBus<'_>) -> u8 {
        0
    }

    /// Write to a block bound to [`Handler::Mapper`](crate::memory_map::Handler::Mapper).
    fn cpu_write(&mut self, _address: u16, _value: u8, _bus: &mut MapperBus<'_>) {}

    fn scanline_start(&mut self, _line: i16, _bus: &mut MapperBus<'_>) -> Option<InterruptKind> {
        None
    }

    fn hblank_start(&mut self, _line: i16, _bus: &mut MapperBus<'_>) -> Option<InterruptKind> {
        None
    }

    fn scanline_end(&mut self, _line: i16, _bus: &mut MapperBus<'_>) -> Option<InterruptKind> {
        None
    }

    /// Queue IRQs the mapper's own counters will raise within `cycles`
    /// master cycles from now.
    fn predict_asynchronous_irqs(&mut self, _cycles: u64, _irq: &mut IrqSink<'_>) {}

    /// Pattern fetch in $0FD0-$0FEF or $1FD0-$1FEF.
    fn check_latches(&mut self, _address: u16, _bus: &mut MapperBus<'_>) {}

    fn save_state(&self, _w: &mut StateWriter) {}

    fn load_state(&mut self, _r: &mut StateReader<'_>) -> Result<(), StateError> {
        Ok(())
    }

    /// Fail exactly when [`load_state`](Self::load_state) would, without
    /// changing anything. Save states call it before the machine is reset.
    /// A mapper that overrides `load_state` overrides this too.
    fn check_state(&self, _r: &mut StateReader<'_>) -> Result<(), StateError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mapper 0
// ---------------------------------------------------------------------------

/// Mapper 0: 16K or 32K PRG at $8000, 8K CHR ROM or RAM, no registers.
///
/// PRG and CHR are copied out of the image once. Every later `init`
/// registers the same shared buffers.
pub struct NoMapper {
    prg: Arc<[u8]>,
    chr: Arc<[u8]>,
    mirroring: Mirroring,
}

impl NoMapper {
    #[must_use]
    pub fn new(image: &CartridgeImage) -> Self {
        Self {
            prg: Arc::from(image.prg.as_slice()),
            chr: Arc::from(image.chr.as_slice()),
            mirroring: image.mirroring,
        }
    }
}

impl Mapper for NoMapper {
    fn name(&self) -> &str {
        "No mapper"
    }

    fn number(&self) -> u16 {
        0
    }

    fn init(&mut self, bus: &mut MapperBus<'_>) {
        let prg_pages = PageTable::new(self.prg.len(), 0x4000);
        let prg = bus.memory.add_rom(Arc::clone(&self.prg));
        for bank in 0..2 {
            let start = 0x8000 + (bank as u16) * 0x4000;
            bus.memory
                .map_rom(start, 0x4000, prg, prg_pages.page(bank).offset);
        }

        if self.chr.is_empty() {
            bus.vram.set_chr_ram(0x2000);
            for slot in 0..8 {
                bus.vram.map_pattern(slot, Window::ChrRam(slot * WINDOW_SIZE));
            }
        } else {
            let chr_pages = PageTable::new(self.chr.len(), 0x2000);
            let base = chr_pages.page(0).offset;
            bus.vram.set_chr_rom(Arc::clone(&self.chr));
            for slot in 0..8 {
                bus.vram
                    .map_pattern(slot, Window::ChrRom(base + slot * WINDOW_SIZE));
            }
        }
        bus.vram.set_mirroring(self.mirroring);
    }
}
