//! NES bus: CPU address routing.
//!
//! Implements [`CpuBus`] over the [`MemoryMap`]. Direct blocks (work RAM,
//! save RAM, mapper-banked PRG) are answered by the map itself; handler
//! blocks are routed here to the PPU, the APU and input ports, or the
//! mapper. Every device access goes through the device's own catch-up
//! first, so a register always answers as of the CPU's current instant.
//!
//! The NES is fully memory-mapped; there is no separate I/O space.

use emu_core::Bus;

use crate::apu::{Apu, ApuHost};
use crate::config::{ApuConfig, NesRegion};
use crate::cpu::{CpuBus, CpuTimeline};
use crate::input::Input;
use crate::mapper::{IrqSink, Mapper, MapperBus, MapperHooks};
use crate::memory_map::{BufferId, Handler, MemoryMap, Read};
use crate::ppu::vram::Vram;
use crate::ppu::{Ppu, PpuPort};
use crate::timing::{OAM_DMA_CPU_CYCLES, SAVE_RAM_SIZE, WORK_RAM_SIZE};

/// Work RAM at power-up: all ones except a few bytes some games check.
#[must_use]
pub fn work_ram_power_up() -> Vec<u8> {
    let mut ram = vec![0xFF; WORK_RAM_SIZE];
    ram[0x08] = 0xF7;
    ram[0x09] = 0xEF;
    ram[0x0A] = 0xDF;
    ram[0x0F] = 0xBF;
    ram
}

/// Work RAM, the register handlers and save RAM. Everything else is left
/// for the mapper.
fn map_fixed_blocks(memory: &mut MemoryMap) -> (BufferId, BufferId) {
    let work_ram = memory.add_buffer(work_ram_power_up());
    let save_ram = memory.add_buffer(vec![0; SAVE_RAM_SIZE]);
    memory.map_mirrored(0x0000, 0x2000, work_ram);
    memory.map_handler(0x2000, 0x2000, Handler::Ppu);
    memory.map_handler(0x4000, 0x0800, Handler::ApuIo);
    memory.map_direct(0x6000, SAVE_RAM_SIZE, save_ram, 0);
    (work_ram, save_ram)
}

/// The machine's CPU-side devices and the timeline they share.
pub struct NesBus {
    pub timeline: CpuTimeline,
    pub memory: MemoryMap,
    pub ppu: Ppu,
    pub apu: Apu,
    pub mapper: Box<dyn Mapper>,
    pub input: Input,
    work_ram: BufferId,
    save_ram: BufferId,
}

impl NesBus {
    #[must_use]
    pub fn new(region: NesRegion, mapper: Box<dyn Mapper>, apu: &ApuConfig) -> Self {
        let mut memory = MemoryMap::new();
        let (work_ram, save_ram) = map_fixed_blocks(&mut memory);
        let mut bus = Self {
            timeline: CpuTimeline::new(region.cpu_divider()),
            memory,
            ppu: Ppu::new(region),
            apu: Apu::new(region, apu),
            mapper,
            input: Input::new(),
            work_ram,
            save_ram,
        };
        bus.init_mapper();
        bus
    }

    /// Rebuild the address space from scratch and let the mapper bind its
    /// windows. RAM takes its power-up contents.
    pub fn install(&mut self) {
        self.memory.clear();
        (self.work_ram, self.save_ram) = map_fixed_blocks(&mut self.memory);
        self.ppu.vram_mut().clear();
        self.init_mapper();
    }

    fn init_mapper(&mut self) {
        let mut bus = MapperBus {
            memory: &mut self.memory,
            vram: self.ppu.vram_mut(),
            irq: IrqSink::new(&mut self.timeline),
        };
        self.mapper.init(&mut bus);
        log::debug!("address space installed for mapper {}", self.mapper.name());
    }

    /// Switch region timing. Every device clock restarts at the current
    /// instant.
    pub fn set_region(&mut self, region: NesRegion) {
        let now = self.timeline.now();
        self.timeline.set_divider(region.cpu_divider());
        self.ppu.set_region(region, now);
        self.apu.set_region(region, now);
    }

    #[must_use]
    pub fn work_ram(&self) -> &[u8] {
        self.memory.buffer(self.work_ram)
    }

    pub fn work_ram_mut(&mut self) -> &mut [u8] {
        self.memory.buffer_mut(self.work_ram)
    }

    #[must_use]
    pub fn save_ram(&self) -> &[u8] {
        self.memory.buffer(self.save_ram)
    }

    pub fn save_ram_mut(&mut self) -> &mut [u8] {
        self.memory.buffer_mut(self.save_ram)
    }

    // -----------------------------------------------------------------------
    // Device ports
    // -----------------------------------------------------------------------

    fn split_ppu(&mut self) -> (&mut Ppu, PpuPort<'_>) {
        (
            &mut self.ppu,
            PpuPort {
                timeline: &mut self.timeline,
                mapper: self.mapper.as_mut(),
                memory: &mut self.memory,
            },
        )
    }

    fn split_apu(&mut self) -> (&mut Apu, DmaPort<'_>) {
        (
            &mut self.apu,
            DmaPort {
                timeline: &mut self.timeline,
                memory: &mut self.memory,
                mapper: self.mapper.as_mut(),
                vram: self.ppu.vram_mut(),
            },
        )
    }

    fn mapper_bus(&mut self) -> (&mut dyn Mapper, MapperBus<'_>) {
        (
            self.mapper.as_mut(),
            MapperBus {
                memory: &mut self.memory,
                vram: self.ppu.vram_mut(),
                irq: IrqSink::new(&mut self.timeline),
            },
        )
    }

    pub fn sync_ppu(&mut self) {
        let (ppu, mut port) = self.split_ppu();
        ppu.synchronize(&mut port);
    }

    pub fn sync_apu(&mut self) {
        let (apu, mut port) = self.split_apu();
        apu.synchronize(&mut port);
    }

    /// As [`sync_apu`](Self::sync_apu), with nothing left batched.
    pub fn settle_apu(&mut self) {
        let (apu, mut port) = self.split_apu();
        apu.settle(&mut port);
    }

    pub fn predict_nmi(&mut self, cycles: u64) {
        let (ppu, mut port) = self.split_ppu();
        ppu.predict_nmi(cycles, &mut port);
    }

    pub fn predict_apu_irqs(&mut self, cycles: u64) {
        let (apu, mut port) = self.split_apu();
        apu.predict_irqs(cycles, &mut port);
    }

    pub fn predict_mapper_irqs(&mut self, cycles: u64) {
        if self.mapper.hooks().contains(MapperHooks::PREDICT_IRQS) {
            self.mapper
                .predict_asynchronous_irqs(cycles, &mut IrqSink::new(&mut self.timeline));
        }
    }

    /// Soft reset of the mapper, with the PPU brought up to date first.
    pub fn reset_mapper(&mut self) {
        self.sync_ppu();
        let (mapper, mut bus) = self.mapper_bus();
        mapper.reset(&mut bus);
    }

    // -----------------------------------------------------------------------
    // $4000 block
    // -----------------------------------------------------------------------

    fn read_io(&mut self, address: u16) -> u8 {
        match address {
            0x4015 => {
                let (apu, mut port) = self.split_apu();
                apu.read_status(&mut port)
            }
            0x4016 | 0x4017 => self.input.read(address),
            _ => 0,
        }
    }

    fn write_io(&mut self, address: u16, value: u8) {
        match address {
            0x4014 => self.oam_dma(value),
            0x4016 => self.input.write(address, value),
            0x4017 => {
                let (apu, mut port) = self.split_apu();
                apu.write_register(address, value, &mut port);
                self.input.write(address, value);
            }
            0x4000..=0x4013 | 0x4015 => {
                let (apu, mut port) = self.split_apu();
                apu.write_register(address, value, &mut port);
            }
            _ => {}
        }
    }

    /// $4014: stage page `page` for the PPU and stall the CPU.
    fn oam_dma(&mut self, page: u8) {
        let base = u16::from(page) << 8;
        let mut data = [0u8; 256];
        for (offset, slot) in (0u16..).zip(data.iter_mut()) {
            *slot = self.read(base | offset);
        }
        let (ppu, mut port) = self.split_ppu();
        ppu.start_oam_dma(&data, &mut port);
        self.timeline.burn_cycles(OAM_DMA_CPU_CYCLES);
    }
}

impl Bus for NesBus {
    fn read(&mut self, address: u16) -> u8 {
        match self.memory.read(address) {
            Read::Value(value) => value,
            Read::Handler(Handler::Ppu) => {
                let (ppu, mut port) = self.split_ppu();
                ppu.read_register(address, &mut port)
            }
            Read::Handler(Handler::ApuIo) => self.read_io(address),
            Read::Handler(Handler::Mapper) => {
                let (mapper, mut bus) = self.mapper_bus();
                mapper.cpu_read(address, &mut bus)
            }
        }
    }

    fn write(&mut self, address: u16, value: u8) {
        match self.memory.write(address, value) {
            None => {}
            Some(Handler::Ppu) => {
                let (ppu, mut port) = self.split_ppu();
                ppu.write_register(address, value, &mut port);
            }
            Some(Handler::ApuIo) => self.write_io(address, value),
            Some(Handler::Mapper) => {
                // Bank switches must not reach dots already drawn.
                self.sync_ppu();
                let (mapper, mut bus) = self.mapper_bus();
                mapper.cpu_write(address, value, &mut bus);
            }
        }
    }
}

impl CpuBus for NesBus {
    fn timeline(&mut self) -> &mut CpuTimeline {
        &mut self.timeline
    }
}

// ---------------------------------------------------------------------------
// DMC fetch path
// ---------------------------------------------------------------------------

/// The CPU read path as the APU's DMC reader sees it: the memory map and
/// mapper windows, without the register handlers.
struct DmaPort<'a> {
    timeline: &'a mut CpuTimeline,
    memory: &'a mut MemoryMap,
    mapper: &'a mut dyn Mapper,
    vram: &'a mut Vram,
}

impl ApuHost for DmaPort<'_> {
    fn timeline(&mut self) -> &mut CpuTimeline {
        self.timeline
    }

    fn dma_read(&mut self, address: u16) -> u8 {
        match self.memory.read(address) {
            Read::Value(value) => value,
            Read::Handler(Handler::Mapper) => {
                let mut bus = MapperBus {
                    memory: &mut *self.memory,
                    vram: &mut *self.vram,
                    irq: IrqSink::new(&mut *self.timeline),
                };
                self.mapper.cpu_read(address, &mut bus)
            }
            Read::Handler(handler) => {
                log::trace!("DMC fetch from {handler:?} register at {address:#06X} reads 0");
                0
            }
        }
    }
}
