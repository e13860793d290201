//! PPU address space: pattern tables, nametables and palette.
//!
//! $0000-$2FFF is decoded in 1K windows. Each window points at CHR ROM,
//! CHR RAM or nametable RAM; the mapper rebinds them. ROM windows swallow
//! writes. $3F00-$3FFF is palette RAM, always internal.

use std::sync::Arc;

use crate::cartridge::Mirroring;
use crate::error::StateError;
use crate::state::{StateReader, StateWriter};

/// Window size.
pub const WINDOW_SIZE: usize = 0x400;

/// Nametable RAM: 2K on the console plus 2K a four-screen board adds.
const NAMETABLE_RAM_SIZE: usize = 4 * WINDOW_SIZE;

/// Backing for one 1K window. Offsets are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    #[default]
    Unmapped,
    ChrRom(usize),
    ChrRam(usize),
    Nametable(usize),
}

#[derive(Debug, Clone)]
pub struct Vram {
    chr_rom: Arc<[u8]>,
    chr_ram: Vec<u8>,
    nametables: Vec<u8>,
    palette: [u8; 32],
    /// $0000-$1FFF.
    pattern: [Window; 8],
    /// $2000-$2FFF (mirrored up to $3EFF).
    names: [Window; 4],
    mirroring: Mirroring,
}

impl Default for Vram {
    fn default() -> Self {
        Self::new()
    }
}

impl Vram {
    #[must_use]
    pub fn new() -> Self {
        let mut vram = Self {
            chr_rom: Arc::from(Vec::new()),
            chr_ram: Vec::new(),
            nametables: vec![0; NAMETABLE_RAM_SIZE],
            palette: [0; 32],
            pattern: [Window::Unmapped; 8],
            names: [Window::Unmapped; 4],
            mirroring: Mirroring::Horizontal,
        };
        vram.set_mirroring(Mirroring::Horizontal);
        vram
    }

    /// Forget the cartridge's CHR and all window bindings.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn set_chr_rom(&mut self, data: Arc<[u8]>) {
        self.chr_rom = data;
    }

    /// Allocate `size` bytes of zeroed CHR RAM.
    pub fn set_chr_ram(&mut self, size: usize) {
        self.chr_ram = vec![0; size];
    }

    #[must_use]
    pub fn chr_ram(&self) -> &[u8] {
        &self.chr_ram
    }

    /// Bind pattern window `slot` (0..8).
    pub fn map_pattern(&mut self, slot: usize, window: Window) {
        self.pattern[slot & 7] = window;
    }

    /// Bind nametable quadrant `slot` (0..4).
    pub fn map_nametable(&mut self, slot: usize, window: Window) {
        self.names[slot & 3] = window;
    }

    #[must_use]
    pub fn pattern_window(&self, slot: usize) -> Window {
        self.pattern[slot & 7]
    }

    #[must_use]
    pub fn nametable_window(&self, slot: usize) -> Window {
        self.names[slot & 3]
    }

    /// Point the four quadrants at nametable RAM according to `mirroring`.
    pub fn set_mirroring(&mut self, mirroring: Mirroring) {
        self.mirroring = mirroring;
        for (slot, page) in mirroring.pages().into_iter().enumerate() {
            self.names[slot] = Window::Nametable(page * WINDOW_SIZE);
        }
    }

    #[must_use]
    pub const fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn window_for(&self, address: u16) -> Window {
        let slot = usize::from(address >> 10);
        if address < 0x2000 {
            self.pattern[slot & 7]
        } else {
            self.names[slot & 3]
        }
    }

    fn window_read(&self, window: Window, offset: usize) -> u8 {
        let byte = match window {
            Window::Unmapped => None,
            Window::ChrRom(base) => self.chr_rom.get(base + offset),
            Window::ChrRam(base) => self.chr_ram.get(base + offset),
            Window::Nametable(base) => self.nametables.get(base + offset),
        };
        byte.copied().unwrap_or(0)
    }

    /// Read a byte of the 14-bit PPU address space.
    #[must_use]
    pub fn read(&self, address: u16) -> u8 {
        let address = address & 0x3FFF;
        if address >= 0x3F00 {
            return self.palette[palette_index(address)];
        }
        let window = self.window_for(address);
        self.window_read(window, usize::from(address) & (WINDOW_SIZE - 1))
    }

    pub fn write(&mut self, address: u16, value: u8) {
        let address = address & 0x3FFF;
        if address >= 0x3F00 {
            self.palette[palette_index(address)] = value;
            return;
        }
        let offset = usize::from(address) & (WINDOW_SIZE - 1);
        let slot = match self.window_for(address) {
            Window::ChrRam(base) => self.chr_ram.get_mut(base + offset),
            Window::Nametable(base) => self.nametables.get_mut(base + offset),
            Window::ChrRom(_) | Window::Unmapped => None,
        };
        if let Some(slot) = slot {
            *slot = value;
        }
    }

    /// Palette entry `index` (0..32) after mirroring.
    #[must_use]
    pub fn palette(&self, index: usize) -> u8 {
        self.palette[palette_index(0x3F00 | (index as u16 & 0x1F))]
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.u8(self.mirroring.code());
        for window in self.pattern.iter().chain(self.names.iter()) {
            let (tag, offset) = match *window {
                Window::Unmapped => (0, 0),
                Window::ChrRom(o) => (1, o),
                Window::ChrRam(o) => (2, o),
                Window::Nametable(o) => (3, o),
            };
            w.u8(tag);
            w.u32(offset as u32);
        }
        w.bytes(&self.nametables);
        w.u32(self.chr_ram.len() as u32);
        w.bytes(&self.chr_ram);
        w.bytes(&self.palette);
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.mirroring = Mirroring::from_code(r.u8()?);
        let mut windows = [Window::Unmapped; 12];
        for window in &mut windows {
            let tag = r.u8()?;
            let offset = r.u32()? as usize;
            *window = match tag {
                1 => Window::ChrRom(offset),
                2 => Window::ChrRam(offset),
                3 => Window::Nametable(offset),
                _ => Window::Unmapped,
            };
        }
        self.pattern.copy_from_slice(&windows[..8]);
        self.names.copy_from_slice(&windows[8..]);
        r.bytes_into(&mut self.nametables)?;
        let chr_len = r.u32()? as usize;
        if chr_len != self.chr_ram.len() {
            return Err(StateError::Truncated);
        }
        r.bytes_into(&mut self.chr_ram)?;
        r.bytes_into(&mut self.palette)
    }
}

/// Index into palette RAM. $3F10/$3F14/$3F18/$3F1C alias the background
/// entries below them.
#[must_use]
pub fn palette_index(address: u16) -> usize {
    let index = usize::from(address & 0x1F);
    if index & 0x13 == 0x10 {
        index & 0x0F
    } else {
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_mirroring() {
        assert_eq!(palette_index(0x3F10), 0x00);
        assert_eq!(palette_index(0x3F14), 0x04);
        assert_eq!(palette_index(0x3F01), 0x01);
        assert_eq!(palette_index(0x3F1F), 0x1F);
        assert_eq!(palette_index(0x3F1C), 0x0C);
        assert_eq!(palette_index(0x3F30), 0x00);
    }

    #[test]
    fn horizontal_and_vertical_nametables() {
        let mut vram = Vram::new();
        vram.set_mirroring(Mirroring::Horizontal);
        vram.write(0x2000, 1);
        assert_eq!(vram.read(0x2400), 1);
        assert_eq!(vram.read(0x2800), 0);

        vram.set_mirroring(Mirroring::Vertical);
        vram.write(0x2400, 2);
        assert_eq!(vram.read(0x2C00), 2);
        assert_eq!(vram.read(0x2000), 1);
        // $3000-$3EFF mirrors $2000-$2EFF.
        assert_eq!(vram.read(0x3400), 2);
    }

    #[test]
    fn single_screen_and_four_screen() {
        let mut vram = Vram::new();
        vram.set_mirroring(Mirroring::SingleScreen(1));
        vram.write(0x2C05, 9);
        assert_eq!(vram.read(0x2005), 9);

        vram.set_mirroring(Mirroring::FourScreen);
        vram.write(0x2C00, 4);
        assert_eq!(vram.read(0x2000), 0);
        assert_eq!(vram.read(0x2C00), 4);
    }

    #[test]
    fn rom_windows_absorb_writes() {
        let mut vram = Vram::new();
        vram.set_chr_rom(Arc::from(vec![0x55; 0x2000]));
        vram.map_pattern(0, Window::ChrRom(0));
        vram.write(0x0010, 0xAA);
        assert_eq!(vram.read(0x0010), 0x55);

        vram.set_chr_ram(0x2000);
        vram.map_pattern(1, Window::ChrRam(0x400));
        vram.write(0x0410, 0xAA);
        assert_eq!(vram.read(0x0410), 0xAA);
        assert_eq!(vram.chr_ram()[0x410], 0xAA);
    }

    #[test]
    fn unmapped_windows_read_zero() {
        let mut vram = Vram::new();
        vram.write(0x1000, 0x77);
        assert_eq!(vram.read(0x1000), 0);
    }

    #[test]
    fn state_round_trip() {
        let mut vram = Vram::new();
        vram.set_chr_ram(0x2000);
        vram.map_pattern(3, Window::ChrRam(0xC00));
        vram.set_mirroring(Mirroring::Vertical);
        vram.write(0x0C01, 0x12);
        vram.write(0x2401, 0x34);
        vram.write(0x3F01, 0x21);
        let mut w = StateWriter::new();
        vram.save_state(&mut w);
        let data = w.into_inner();

        let mut restored = Vram::new();
        restored.set_chr_ram(0x2000);
        restored.load_state(&mut StateReader::new(&data)).unwrap();
        assert_eq!(restored.mirroring(), Mirroring::Vertical);
        assert_eq!(restored.read(0x0C01), 0x12);
        assert_eq!(restored.read(0x2C01), 0x34);
        assert_eq!(restored.read(0x3F01), 0x21);
    }
}
