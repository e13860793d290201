//! Shared rig for the machine-level tests.
//!
//! `MiniCpu` interprets the handful of 6502 opcodes the test programs use,
//! with real cycle counts, and logs every interrupt it takes. `TestMapper`
//! is mapper 0 plus a scanline IRQ and a CPU-cycle IRQ timer behind
//! registers at $E000-$E003.

#![allow(dead_code)]

use emu_core::{Bus, Ticks};
use nes_timing::memory_map::{Binding, Handler};
use nes_timing::{
    CartridgeImage, CpuBus, CpuCore, InterruptKind, IrqSink, MachineConfig, Machine, Mapper,
    MapperBus, MapperHooks, Mirroring, NoMapper, Registers, RewindConfig,
};

const FLAG_Z: u8 = 0x02;
const FLAG_I: u8 = 0x04;
const FLAG_N: u8 = 0x80;

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MiniCpu {
    regs: Registers,
    /// Every interrupt entered, with the master time it was taken at.
    pub serviced: Vec<(InterruptKind, Ticks)>,
}

impl MiniCpu {
    fn fetch<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        let value = bus.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_word<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch(bus);
        let hi = self.fetch(bus);
        u16::from_le_bytes([lo, hi])
    }

    fn push<B: CpuBus>(&mut self, bus: &mut B, value: u8) {
        bus.write(0x0100 | u16::from(self.regs.s), value);
        self.regs.s = self.regs.s.wrapping_sub(1);
    }

    fn pull<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        self.regs.s = self.regs.s.wrapping_add(1);
        bus.read(0x0100 | u16::from(self.regs.s))
    }

    fn set_nz(&mut self, value: u8) {
        self.regs.p &= !(FLAG_N | FLAG_Z);
        if value == 0 {
            self.regs.p |= FLAG_Z;
        }
        self.regs.p |= value & FLAG_N;
    }

    /// Times `kind` was entered.
    pub fn count(&self, kind: InterruptKind) -> usize {
        self.serviced.iter().filter(|(k, _)| *k == kind).count()
    }
}

impl CpuCore for MiniCpu {
    fn power_up(&mut self) {
        self.regs = Registers {
            s: 0xFD,
            p: 0x24,
            ..Registers::default()
        };
        self.serviced.clear();
    }

    fn reset<B: CpuBus>(&mut self, bus: &mut B) {
        self.regs.s = self.regs.s.wrapping_sub(3);
        self.regs.p |= FLAG_I;
        self.regs.pc = bus.read_word(0xFFFC);
    }

    fn step<B: CpuBus>(&mut self, bus: &mut B) -> u64 {
        match self.fetch(bus) {
            // SEI
            0x78 => {
                self.regs.p |= FLAG_I;
                2
            }
            // CLI
            0x58 => {
                self.regs.p &= !FLAG_I;
                2
            }
            // LDA #imm
            0xA9 => {
                self.regs.a = self.fetch(bus);
                self.set_nz(self.regs.a);
                2
            }
            // LDA abs
            0xAD => {
                let address = self.fetch_word(bus);
                self.regs.a = bus.read(address);
                self.set_nz(self.regs.a);
                4
            }
            // STA abs
            0x8D => {
                let address = self.fetch_word(bus);
                bus.write(address, self.regs.a);
                4
            }
            // INC abs
            0xEE => {
                let address = self.fetch_word(bus);
                let value = bus.read(address).wrapping_add(1);
                bus.write(address, value);
                self.set_nz(value);
                6
            }
            // JMP abs
            0x4C => {
                self.regs.pc = self.fetch_word(bus);
                3
            }
            // BPL
            0x10 => {
                let offset = self.fetch(bus) as i8;
                if self.regs.p & FLAG_N == 0 {
                    self.regs.pc = self.regs.pc.wrapping_add_signed(i16::from(offset));
                    3
                } else {
                    2
                }
            }
            // RTI
            0x40 => {
                self.regs.p = self.pull(bus);
                let lo = self.pull(bus);
                let hi = self.pull(bus);
                self.regs.pc = u16::from_le_bytes([lo, hi]);
                6
            }
            // NOP, and anything the programs never use
            _ => 2,
        }
    }

    fn service_interrupt<B: CpuBus>(&mut self, kind: InterruptKind, bus: &mut B) -> u64 {
        let now = bus.timeline().now();
        self.serviced.push((kind, now));
        let [lo, hi] = self.regs.pc.to_le_bytes();
        self.push(bus, hi);
        self.push(bus, lo);
        self.push(bus, self.regs.p & !0x10);
        self.regs.p |= FLAG_I;
        let vector = if kind.is_nmi() { 0xFFFA } else { 0xFFFE };
        self.regs.pc = bus.read_word(vector);
        7
    }

    fn irq_masked(&self) -> bool {
        self.regs.p & FLAG_I != 0
    }

    fn registers(&self) -> Registers {
        self.regs
    }

    fn set_registers(&mut self, registers: Registers) {
        self.regs = registers;
    }
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

/// Work RAM counters the handlers bump.
pub const NMI_COUNT: u16 = 0x0300;
pub const IRQ_COUNT: u16 = 0x0301;
pub const MAPPER_IRQ_COUNT: u16 = 0x0302;

pub const NMI_HANDLER: u16 = 0x8040;
pub const FRAME_IRQ_HANDLER: u16 = 0x8050;
pub const MAPPER_IRQ_HANDLER: u16 = 0x8060;

/// 32K of PRG, NOP-filled.
pub struct Rom {
    prg: Vec<u8>,
}

impl Rom {
    pub fn new() -> Self {
        let mut rom = Self {
            prg: vec![0xEA; 0x8000],
        };
        rom.code(NMI_HANDLER, &[0xEE, 0x00, 0x03, 0x40]);
        rom.code(FRAME_IRQ_HANDLER, &[0xAD, 0x15, 0x40, 0xEE, 0x01, 0x03, 0x40]);
        rom.code(MAPPER_IRQ_HANDLER, &[0x8D, 0x03, 0xE0, 0xEE, 0x02, 0x03, 0x40]);
        rom.vectors(NMI_HANDLER, 0x8000, FRAME_IRQ_HANDLER);
        rom
    }

    pub fn code(&mut self, address: u16, bytes: &[u8]) -> &mut Self {
        let start = usize::from(address - 0x8000);
        self.prg[start..start + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn vectors(&mut self, nmi: u16, reset: u16, irq: u16) -> &mut Self {
        for (at, vector) in [(0x7FFA, nmi), (0x7FFC, reset), (0x7FFE, irq)] {
            self.prg[at..at + 2].copy_from_slice(&vector.to_le_bytes());
        }
        self
    }

    pub fn image(&self) -> CartridgeImage {
        let mut image = CartridgeImage::new(self.prg.clone(), Vec::new(), Mirroring::Horizontal);
        image.title = "timing rig".into();
        image
    }
}

/// Zero the counters, enable NMIs, spin.
pub fn nmi_program() -> Rom {
    let mut rom = Rom::new();
    rom.code(
        0x8000,
        &[
            0x78, // SEI
            0xA9, 0x00, // LDA #$00
            0x8D, 0x00, 0x03, // STA $0300
            0x8D, 0x01, 0x03, // STA $0301
            0x8D, 0x02, 0x03, // STA $0302
            0xA9, 0x80, // LDA #$80
            0x8D, 0x00, 0x20, // STA $2000
            0x4C, 0x11, 0x80, // JMP $8011
        ],
    );
    rom
}

/// Zero the counters, unmask IRQs, spin.
pub fn irq_program(irq_handler: u16) -> Rom {
    let mut rom = Rom::new();
    rom.code(
        0x8000,
        &[
            0x78, // SEI
            0xA9, 0x00, // LDA #$00
            0x8D, 0x00, 0x03, // STA $0300
            0x8D, 0x01, 0x03, // STA $0301
            0x8D, 0x02, 0x03, // STA $0302
            0x58, // CLI
            0x4C, 0x0D, 0x80, // JMP $800D
        ],
    );
    rom.vectors(NMI_HANDLER, 0x8000, irq_handler);
    rom
}

/// No speed cap, no rewinder: every frame runs and is drawn.
pub fn config() -> MachineConfig {
    MachineConfig {
        speed_cap: false,
        rewind: RewindConfig {
            enabled: false,
            ..RewindConfig::default()
        },
        ..MachineConfig::default()
    }
}

pub fn machine(rom: &Rom) -> Machine<MiniCpu> {
    machine_with(rom, config())
}

pub fn machine_with(rom: &Rom, config: MachineConfig) -> Machine<MiniCpu> {
    Machine::with_default_mapper(MiniCpu::default(), rom.image(), config).expect("mapper 0")
}

pub fn ram(machine: &Machine<MiniCpu>, address: u16) -> u8 {
    machine.bus().work_ram()[usize::from(address & 0x7FF)]
}

// ---------------------------------------------------------------------------
// Mapper
// ---------------------------------------------------------------------------

/// Mapper 0 plus two IRQ sources:
/// - $E000 = line: raise at the start of that line's `HBlank`
/// - $E001: disarm the line IRQ
/// - $E002 = n: raise `n * 64` CPU cycles after the write
/// - $E003: acknowledge and stop the timer
pub struct TestMapper {
    base: NoMapper,
    irq_line: Option<i16>,
    timer_at: Option<Ticks>,
}

impl TestMapper {
    pub fn new(image: &CartridgeImage) -> Self {
        Self {
            base: NoMapper::new(image),
            irq_line: None,
            timer_at: None,
        }
    }
}

impl Mapper for TestMapper {
    fn name(&self) -> &str {
        "Test mapper"
    }

    fn number(&self) -> u16 {
        0xFFF
    }

    fn hooks(&self) -> MapperHooks {
        MapperHooks::HBLANK_START | MapperHooks::PREDICT_IRQS
    }

    fn init(&mut self, bus: &mut MapperBus<'_>) {
        self.base.init(bus);
        bus.memory
            .bind_write(0xE000 / 0x800, Binding::Handler(Handler::Mapper));
    }

    fn cpu_write(&mut self, address: u16, value: u8, bus: &mut MapperBus<'_>) {
        match address & 3 {
            0 => self.irq_line = Some(i16::from(value)),
            1 => self.irq_line = None,
            2 => {
                let at = bus.irq.now() + u64::from(value) * 64 * bus.irq.divider();
                self.timer_at = Some(at);
            }
            _ => {
                self.timer_at = None;
                bus.irq.clear_interrupt(InterruptKind::IrqMapper);
            }
        }
    }

    fn hblank_start(&mut self, line: i16, _bus: &mut MapperBus<'_>) -> Option<InterruptKind> {
        (self.irq_line == Some(line)).then_some(InterruptKind::IrqMapper)
    }

    fn predict_asynchronous_irqs(&mut self, cycles: u64, irq: &mut IrqSink<'_>) {
        if let Some(at) = self.timer_at {
            if at <= irq.now() + cycles {
                irq.set_interrupt(InterruptKind::IrqMapper, at);
            }
        }
    }
}

/// Frame IRQs off, counters zeroed, `value` written to the test mapper's
/// register `$E000 + register`, then spin with IRQs unmasked.
pub fn mapper_program(register: u8, value: u8) -> Rom {
    let mut rom = Rom::new();
    rom.code(
        0x8000,
        &[
            0x78, // SEI
            0xA9, 0x40, // LDA #$40
            0x8D, 0x17, 0x40, // STA $4017
            0xA9, 0x00, // LDA #$00
            0x8D, 0x00, 0x03, // STA $0300
            0x8D, 0x01, 0x03, // STA $0301
            0x8D, 0x02, 0x03, // STA $0302
            0xA9, value, // LDA #value
            0x8D, register, 0xE0, // STA $E00x
            0x58, // CLI
            0x4C, 0x17, 0x80, // JMP $8017
        ],
    );
    rom.vectors(NMI_HANDLER, 0x8000, MAPPER_IRQ_HANDLER);
    rom
}

pub fn machine_with_test_mapper(rom: &Rom) -> Machine<MiniCpu> {
    let image = rom.image();
    let mapper = Box::new(TestMapper::new(&image));
    Machine::new(MiniCpu::default(), image, mapper, config())
}
