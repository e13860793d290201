//! Region-independent timing constants.
//!
//! Region-dependent values (dividers, last line, crystal) live on
//! [`NesRegion`](crate::NesRegion).

/// PPU dots per scanline.
pub const DOTS_PER_LINE: u16 = 341;

/// The pre-render line.
pub const FIRST_LINE: i16 = -1;

/// Last line that outputs pixels.
pub const LAST_VISIBLE_LINE: i16 = 239;

/// Line on which the `VBlank` flag rises.
pub const FIRST_VBLANK_LINE: i16 = 241;

/// Dot (1-based) on [`FIRST_VBLANK_LINE`] at which `VBlank` and NMI begin.
pub const VBLANK_DOT: u16 = 1;

/// Dot of the pre-render line elided on odd frames while the background is
/// enabled.
pub const ODD_FRAME_SKIP_DOT: u16 = 340;

/// Dot at which the mapper's `HBlank` hook fires.
pub const HBLANK_DOT: u16 = 257;

/// CPU cycles per orchestrator slice (roughly one scanline).
pub const SCANLINE_CPU_CYCLES: u64 = 114;

/// CPU cycles of slack added to every prediction window.
pub const PREDICTION_BUFFER_CPU_CYCLES: u64 = 8;

/// CPU cycles the CPU is halted for by a sprite DMA.
pub const OAM_DMA_CPU_CYCLES: u64 = 514;

/// CPU cycles stolen by one DMC sample fetch.
pub const DMC_FETCH_CPU_CYCLES: u64 = 4;

/// Internal RAM size.
pub const WORK_RAM_SIZE: usize = 0x800;

/// Cartridge save RAM size.
pub const SAVE_RAM_SIZE: usize = 0x2000;
