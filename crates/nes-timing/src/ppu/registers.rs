//! PPU register bits and the loopy scroll/address registers.

use bitflags::bitflags;

bitflags! {
    /// $2000 PPUCTRL.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ctrl: u8 {
        const NAMETABLE_X = 1 << 0;
        const NAMETABLE_Y = 1 << 1;
        const INCREMENT_32 = 1 << 2;
        const SPRITE_TABLE = 1 << 3;
        const BACKGROUND_TABLE = 1 << 4;
        const SPRITE_16 = 1 << 5;
        const MASTER_SLAVE = 1 << 6;
        const GENERATE_NMI = 1 << 7;
    }
}

impl Ctrl {
    #[must_use]
    pub fn increment(self) -> u16 {
        if self.contains(Self::INCREMENT_32) { 32 } else { 1 }
    }

    #[must_use]
    pub fn background_table(self) -> u16 {
        if self.contains(Self::BACKGROUND_TABLE) { 0x1000 } else { 0 }
    }

    /// Pattern table for 8x8 sprites.
    #[must_use]
    pub fn sprite_table(self) -> u16 {
        if self.contains(Self::SPRITE_TABLE) { 0x1000 } else { 0 }
    }

    #[must_use]
    pub fn sprite_height(self) -> u16 {
        if self.contains(Self::SPRITE_16) { 16 } else { 8 }
    }

    #[must_use]
    pub fn nmi_enabled(self) -> bool {
        self.contains(Self::GENERATE_NMI)
    }
}

bitflags! {
    /// $2001 PPUMASK.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Mask: u8 {
        const GREYSCALE = 1 << 0;
        const BACKGROUND_LEFT = 1 << 1;
        const SPRITES_LEFT = 1 << 2;
        const BACKGROUND = 1 << 3;
        const SPRITES = 1 << 4;
        const EMPHASIS_RED = 1 << 5;
        const EMPHASIS_GREEN = 1 << 6;
        const EMPHASIS_BLUE = 1 << 7;
    }
}

impl Mask {
    /// Background or sprites on; off means forced blanking.
    #[must_use]
    pub fn rendering_enabled(self) -> bool {
        self.intersects(Self::BACKGROUND | Self::SPRITES)
    }

    /// Emphasis bits shifted down to 0..8.
    #[must_use]
    pub fn emphasis(self) -> u8 {
        self.bits() >> 5
    }
}

bitflags! {
    /// $2002 PPUSTATUS flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u8 {
        const SPRITE_OVERFLOW = 1 << 5;
        const SPRITE_ZERO_HIT = 1 << 6;
        const VBLANK = 1 << 7;
    }
}

/// The internal `v`, `t`, fine X and write toggle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Loopy {
    pub v: u16,
    pub t: u16,
    pub fine_x: u8,
    pub w: bool,
}

impl Loopy {
    /// $2000 write: nametable select into `t`.
    pub fn write_ctrl(&mut self, value: u8) {
        self.t = (self.t & !0x0C00) | (u16::from(value & 0x03) << 10);
    }

    /// $2005 write.
    pub fn write_scroll(&mut self, value: u8) {
        if self.w {
            self.t = (self.t & !0x73E0) | (u16::from(value & 0x07) << 12) | (u16::from(value >> 3) << 5);
        } else {
            self.t = (self.t & !0x001F) | (u16::from(value) >> 3);
            self.fine_x = value & 0x07;
        }
        self.w = !self.w;
    }

    /// $2006 write. The second write copies `t` into `v`.
    pub fn write_address(&mut self, value: u8) {
        if self.w {
            self.t = (self.t & 0xFF00) | u16::from(value);
            self.v = self.t;
        } else {
            self.t = (self.t & 0x00FF) | (u16::from(value & 0x3F) << 8);
        }
        self.w = !self.w;
    }

    /// $2007 access: step `v` by 1 or 32.
    pub fn increment(&mut self, by: u16) {
        self.v = self.v.wrapping_add(by) & 0x7FFF;
    }

    pub fn increment_x(&mut self) {
        if self.v & 0x001F == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v += 1;
        }
    }

    pub fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v += 0x1000;
        } else {
            self.v &= !0x7000;
            let mut coarse_y = (self.v & 0x03E0) >> 5;
            if coarse_y == 29 {
                coarse_y = 0;
                self.v ^= 0x0800;
            } else if coarse_y == 31 {
                coarse_y = 0;
            } else {
                coarse_y += 1;
            }
            self.v = (self.v & !0x03E0) | (coarse_y << 5);
        }
    }

    /// v: ....A.. ...EDCBA = t: ....A.. ...EDCBA
    pub fn copy_horizontal(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    /// v: GHIA.BC DEF..... = t: GHIA.BC DEF.....
    pub fn copy_vertical(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_writes_fill_t() {
        let mut loopy = Loopy::default();
        loopy.write_scroll(0x7D); // X = 125
        assert_eq!(loopy.t & 0x1F, 15);
        assert_eq!(loopy.fine_x, 5);
        loopy.write_scroll(0x5E); // Y = 94
        assert_eq!((loopy.t >> 5) & 0x1F, 11);
        assert_eq!(loopy.t >> 12, 6);
        assert!(!loopy.w);
    }

    #[test]
    fn address_writes_copy_to_v() {
        let mut loopy = Loopy::default();
        loopy.write_address(0x3F);
        assert_eq!(loopy.v, 0);
        loopy.write_address(0x10);
        assert_eq!(loopy.v, 0x3F10);
    }

    #[test]
    fn coarse_x_wraps_into_next_nametable() {
        let mut loopy = Loopy { v: 31, ..Loopy::default() };
        loopy.increment_x();
        assert_eq!(loopy.v, 0x0400);
    }

    #[test]
    fn coarse_y_29_wraps_and_switches_nametable() {
        let mut loopy = Loopy { v: 0x7000 | (29 << 5), ..Loopy::default() };
        loopy.increment_y();
        assert_eq!(loopy.v, 0x0800);
    }

    #[test]
    fn ctrl_accessors() {
        let ctrl = Ctrl::from_bits_retain(0xBC);
        assert_eq!(ctrl.increment(), 32);
        assert_eq!(ctrl.sprite_table(), 0x1000);
        assert_eq!(ctrl.background_table(), 0x1000);
        assert_eq!(ctrl.sprite_height(), 16);
        assert!(ctrl.nmi_enabled());
        assert!(Mask::SPRITES.rendering_enabled());
        assert!(!Mask::GREYSCALE.rendering_enabled());
    }
}
