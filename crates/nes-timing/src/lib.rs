//! Lazily synchronised NES timing engine.
//!
//! The CPU owns the master timeline. The PPU and APU run on divided clocks
//! and are never stepped in lock-step: each carries a [`DeviceClock`] and
//! catches up in one batch when a register access, a DMA or the frame loop
//! observes it. Interrupts the devices will raise later are predicted
//! ahead of time and queued on the CPU's timeline, so the instruction loop
//! knows when to stop without polling anyone.
//!
//! | region | crystal      | CPU / APU | PPU dot | lines per frame |
//! |--------|--------------|-----------|---------|-----------------|
//! | NTSC   | 21,477,272Hz | /12       | /4      | 262             |
//! | PAL    | 26,601,712Hz | /16       | /5      | 312             |
//!
//! [`DeviceClock`]: emu_core::DeviceClock

pub mod apu;
pub mod bus;
#[cfg(feature = "capture")]
pub mod capture;
pub mod cartridge;
pub mod cheats;
pub mod config;
pub mod controller;
pub mod cpu;
mod crc32;
pub mod error;
pub mod input;
pub mod machine;
pub mod mapper;
pub mod memory_map;
pub mod page_table;
pub mod ppu;
pub mod replay;
pub mod rewind;
pub mod savestate;
pub mod sram;
pub mod state;
pub mod throttle;
pub mod timing;

pub use apu::Apu;
pub use bus::NesBus;
pub use cartridge::{CartridgeImage, Mirroring};
pub use config::{ApuConfig, ApuMode, CpuUsage, MachineConfig, NesRegion, PpuConfig, RewindConfig};
pub use cpu::{CpuBus, CpuCore, CpuTimeline, InterruptKind, Registers};
pub use cheats::GenieCode;
pub use error::{CheatError, ConfigError, PatchError, StateError};
pub use input::{Key, KeyBuffer, NesButton};
pub use machine::{FrameReport, GameClock, Machine};
pub use mapper::{IrqSink, Mapper, MapperBus, MapperHooks, NoMapper};
pub use memory_map::{MemoryMap, Patch};
pub use ppu::Ppu;
pub use throttle::Throttle;
