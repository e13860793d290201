//! Background and sprite pipeline, one dot at a time.
//!
//! Called from the synchronizer for lines -1 to 239. Pixels are composed
//! for every visible dot so sprite-zero hits are found even on frames that
//! are not presented; only the framebuffer store is skipped then.

use super::palette::PALETTE;
use super::{FB_WIDTH, Ppu, PpuPort};
use crate::mapper::{IrqSink, MapperBus, MapperHooks};
use crate::ppu::registers::{Mask, Status};
use crate::timing::FIRST_LINE;

/// Shift registers, latches and the sprites found for the next line.
#[derive(Debug, Clone)]
pub(super) struct Pipeline {
    pattern_lo: u16,
    pattern_hi: u16,
    attrib_lo: u16,
    attrib_hi: u16,
    next_tile_id: u8,
    next_tile_attrib: u8,
    next_tile_lo: u8,
    next_tile_hi: u8,

    secondary_oam: [u8; 32],
    sprite_count: u8,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_attribs: [u8; 8],
    sprite_x: [u8; 8],
    sprite_zero_on_line: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            pattern_lo: 0,
            pattern_hi: 0,
            attrib_lo: 0,
            attrib_hi: 0,
            next_tile_id: 0,
            next_tile_attrib: 0,
            next_tile_lo: 0,
            next_tile_hi: 0,
            secondary_oam: [0xFF; 32],
            sprite_count: 0,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_attribs: [0; 8],
            sprite_x: [0; 8],
            sprite_zero_on_line: false,
        }
    }
}

impl Pipeline {
    /// Drop the sprites carried over from the last frame.
    pub(super) fn clear_sprites(&mut self) {
        self.sprite_patterns_lo = [0; 8];
        self.sprite_patterns_hi = [0; 8];
    }
}

impl Ppu {
    /// Renderer work for dot `dot` of `line` (-1..=239).
    pub(super) fn render_clock(&mut self, line: i16, dot: u16, port: &mut PpuPort<'_>) {
        if !self.mask.rendering_enabled() {
            if line >= 0 && (1..=256).contains(&dot) {
                self.output_backdrop(line, dot);
            }
            return;
        }

        if (1..=256).contains(&dot) {
            if line >= 0 {
                self.render_pixel(line, dot);
            }
            self.bg_fetch_cycle(dot, port);
            self.shift_registers();
        }

        if dot == 256 {
            self.loopy.increment_y();
        }
        if dot == 257 {
            self.loopy.copy_horizontal();
            if line >= 0 {
                self.evaluate_sprites(line, port);
            }
        }

        // Prefetch the first two tiles of the next line.
        if (321..=336).contains(&dot) {
            self.bg_fetch_cycle(dot, port);
            self.shift_registers();
        }

        if line == FIRST_LINE && (280..=304).contains(&dot) {
            self.loopy.copy_vertical();
        }
    }

    /// Pattern, nametable and attribute fetches go through here so
    /// latch-sensitive mappers can watch them.
    fn fetch(&mut self, address: u16, port: &mut PpuPort<'_>) -> u8 {
        let value = self.vram.read(address);
        if is_latch_address(address) && port.mapper.hooks().contains(MapperHooks::CHECK_LATCHES) {
            let mut bus = MapperBus {
                memory: &mut *port.memory,
                vram: &mut self.vram,
                irq: IrqSink::new(&mut *port.timeline),
            };
            port.mapper.check_latches(address, &mut bus);
        }
        value
    }

    fn bg_fetch_cycle(&mut self, dot: u16, port: &mut PpuPort<'_>) {
        let cycle = if dot >= 321 { dot - 321 } else { dot - 1 };
        let v = self.loopy.v;

        match cycle & 0x07 {
            0 => {
                if dot != 321 {
                    self.load_bg_shift_registers();
                }
                self.pipeline.next_tile_id = self.fetch(0x2000 | (v & 0x0FFF), port);
            }
            2 => {
                let address = 0x23C0 | (v & 0x0C00) | ((v >> 4) & 0x38) | ((v >> 2) & 0x07);
                let attrib = self.fetch(address, port);
                let shift = ((v >> 4) & 0x04) | (v & 0x02);
                self.pipeline.next_tile_attrib = (attrib >> shift) & 0x03;
            }
            4 => {
                let address = self.bg_pattern_address();
                self.pipeline.next_tile_lo = self.fetch(address, port);
            }
            6 => {
                let address = self.bg_pattern_address() + 8;
                self.pipeline.next_tile_hi = self.fetch(address, port);
            }
            7 => self.loopy.increment_x(),
            _ => {}
        }
    }

    fn bg_pattern_address(&self) -> u16 {
        let fine_y = (self.loopy.v >> 12) & 0x07;
        self.ctrl.background_table() + u16::from(self.pipeline.next_tile_id) * 16 + fine_y
    }

    fn load_bg_shift_registers(&mut self) {
        let p = &mut self.pipeline;
        p.pattern_lo = (p.pattern_lo & 0xFF00) | u16::from(p.next_tile_lo);
        p.pattern_hi = (p.pattern_hi & 0xFF00) | u16::from(p.next_tile_hi);
        let attrib_lo = if p.next_tile_attrib & 0x01 != 0 { 0xFF } else { 0x00 };
        let attrib_hi = if p.next_tile_attrib & 0x02 != 0 { 0xFF } else { 0x00 };
        p.attrib_lo = (p.attrib_lo & 0xFF00) | attrib_lo;
        p.attrib_hi = (p.attrib_hi & 0xFF00) | attrib_hi;
    }

    fn shift_registers(&mut self) {
        let p = &mut self.pipeline;
        p.pattern_lo <<= 1;
        p.pattern_hi <<= 1;
        p.attrib_lo <<= 1;
        p.attrib_hi <<= 1;
    }

    fn render_pixel(&mut self, line: i16, dot: u16) {
        let x = usize::from(dot - 1);
        let y = line as usize;

        let (bg_pixel, bg_palette) = self.background_pixel(dot);
        let (sp_pixel, sp_palette, behind_bg, sp_is_zero) = self.sprite_pixel(x);

        // Collision uses the real layers, whatever the display toggles say.
        if sp_is_zero
            && bg_pixel != 0
            && sp_pixel != 0
            && x != 255
            && self.mask.contains(Mask::BACKGROUND | Mask::SPRITES)
        {
            self.status.insert(Status::SPRITE_ZERO_HIT);
        }

        if !self.options.enable_rendering {
            return;
        }

        let bg_pixel = if self.options.background { bg_pixel } else { 0 };
        let sprite_shown = if behind_bg {
            self.options.sprites_back
        } else {
            self.options.sprites_front
        };
        let sp_pixel = if sprite_shown { sp_pixel } else { 0 };

        let (pixel, palette) = match (bg_pixel, sp_pixel) {
            (0, 0) => (0, 0),
            (0, _) => (sp_pixel, sp_palette),
            (_, 0) => (bg_pixel, bg_palette),
            (_, _) if behind_bg => (bg_pixel, bg_palette),
            (_, _) => (sp_pixel, sp_palette),
        };

        let colour_addr = if pixel == 0 {
            0
        } else {
            (usize::from(palette) << 2) | usize::from(pixel)
        };
        let index = self.vram.palette(colour_addr) & 0x3F;
        self.framebuffer[y * FB_WIDTH as usize + x] = self.apply_mask_effects(index);
    }

    /// Forced blanking: the backdrop colour fills the line.
    fn output_backdrop(&mut self, line: i16, dot: u16) {
        if !self.options.enable_rendering {
            return;
        }
        let x = usize::from(dot - 1);
        let y = line as usize;
        let index = self.vram.palette(0) & 0x3F;
        self.framebuffer[y * FB_WIDTH as usize + x] = self.apply_mask_effects(index);
    }

    fn background_pixel(&self, dot: u16) -> (u8, u8) {
        if !self.mask.contains(Mask::BACKGROUND) {
            return (0, 0);
        }
        if dot <= 8 && !self.mask.contains(Mask::BACKGROUND_LEFT) {
            return (0, 0);
        }

        let p = &self.pipeline;
        let bit = 0x8000 >> self.loopy.fine_x;
        let pixel = (u8::from(p.pattern_hi & bit != 0) << 1) | u8::from(p.pattern_lo & bit != 0);
        let palette = (u8::from(p.attrib_hi & bit != 0) << 1) | u8::from(p.attrib_lo & bit != 0);
        (pixel, palette)
    }

    /// (pixel, palette, behind background, is sprite zero)
    fn sprite_pixel(&self, x: usize) -> (u8, u8, bool, bool) {
        if !self.mask.contains(Mask::SPRITES) {
            return (0, 0, false, false);
        }
        if x < 8 && !self.mask.contains(Mask::SPRITES_LEFT) {
            return (0, 0, false, false);
        }

        let p = &self.pipeline;
        for i in 0..usize::from(p.sprite_count) {
            let offset = x as i16 - i16::from(p.sprite_x[i]);
            if !(0..=7).contains(&offset) {
                continue;
            }
            let shift = 7 - offset as u8;
            let lo = (p.sprite_patterns_lo[i] >> shift) & 1;
            let hi = (p.sprite_patterns_hi[i] >> shift) & 1;
            let pixel = (hi << 1) | lo;
            if pixel == 0 {
                continue;
            }

            let palette = (p.sprite_attribs[i] & 0x03) + 4;
            let behind_bg = p.sprite_attribs[i] & 0x20 != 0;
            return (pixel, palette, behind_bg, p.sprite_zero_on_line && i == 0);
        }

        (0, 0, false, false)
    }

    /// Find the sprites on `line` and fetch their patterns.
    pub(super) fn evaluate_sprites(&mut self, line: i16, port: &mut PpuPort<'_>) {
        let height = self.ctrl.sprite_height();
        let line = line as u16;

        let p = &mut self.pipeline;
        p.secondary_oam = [0xFF; 32];
        p.sprite_count = 0;
        p.sprite_zero_on_line = false;

        for i in 0..64usize {
            let y = u16::from(self.oam[i * 4]);
            if line.wrapping_sub(y) >= height {
                continue;
            }
            if p.sprite_count < 8 {
                let slot = usize::from(p.sprite_count) * 4;
                p.secondary_oam[slot..slot + 4].copy_from_slice(&self.oam[i * 4..i * 4 + 4]);
                if i == 0 {
                    p.sprite_zero_on_line = true;
                }
                p.sprite_count += 1;
            } else {
                // After eight hits the 2C02 steps the byte offset along with
                // the sprite index on every miss, so it compares tile,
                // attribute and X bytes as if they were Y.
                let mut n = i + 1;
                let mut m = 0usize;
                while n < 64 {
                    let byte = u16::from(self.oam[(n * 4 + m) & 0xFF]);
                    if line.wrapping_sub(byte) < height {
                        self.status.insert(Status::SPRITE_OVERFLOW);
                        break;
                    }
                    n += 1;
                    m = (m + 1) & 3;
                }
                break;
            }
        }

        for i in 0..8usize {
            if i >= usize::from(self.pipeline.sprite_count) {
                self.pipeline.sprite_patterns_lo[i] = 0;
                self.pipeline.sprite_patterns_hi[i] = 0;
                continue;
            }
            let entry = &self.pipeline.secondary_oam[i * 4..i * 4 + 4];
            let (sprite_y, tile_index, attribs, sprite_x) =
                (u16::from(entry[0]), entry[1], entry[2], entry[3]);

            let flip_v = attribs & 0x80 != 0;
            let mut row = line.wrapping_sub(sprite_y);
            let (table, tile, row) = if height == 16 {
                let table = u16::from(tile_index & 1) * 0x1000;
                let tile = tile_index & 0xFE;
                if flip_v {
                    row = 15 - row;
                }
                if row >= 8 {
                    (table, tile + 1, row - 8)
                } else {
                    (table, tile, row)
                }
            } else {
                if flip_v {
                    row = 7 - row;
                }
                (self.ctrl.sprite_table(), tile_index, row)
            };

            let address = table + u16::from(tile) * 16 + row;
            let mut lo = self.fetch(address, port);
            let mut hi = self.fetch(address + 8, port);
            if attribs & 0x40 != 0 {
                lo = flip_byte(lo);
                hi = flip_byte(hi);
            }

            let p = &mut self.pipeline;
            p.sprite_patterns_lo[i] = lo;
            p.sprite_patterns_hi[i] = hi;
            p.sprite_attribs[i] = attribs;
            p.sprite_x[i] = sprite_x;
        }
    }

    /// PPUMASK greyscale and colour emphasis applied to a palette index.
    ///
    /// Greyscale keeps only the palette column ($30). Each emphasis bit
    /// dims the other two channels to 13/16.
    pub(super) fn apply_mask_effects(&self, palette_index: u8) -> u32 {
        let index = if self.mask.contains(Mask::GREYSCALE) {
            palette_index & 0x30
        } else {
            palette_index
        };

        let argb = PALETTE[usize::from(index & 0x3F)];
        let emphasis = self.mask.emphasis();
        if emphasis == 0 {
            return argb;
        }

        let mut r = (argb >> 16) & 0xFF;
        let mut g = (argb >> 8) & 0xFF;
        let mut b = argb & 0xFF;
        if emphasis & 0x01 != 0 {
            g = g * 13 / 16;
            b = b * 13 / 16;
        }
        if emphasis & 0x02 != 0 {
            r = r * 13 / 16;
            b = b * 13 / 16;
        }
        if emphasis & 0x04 != 0 {
            r = r * 13 / 16;
            g = g * 13 / 16;
        }
        0xFF00_0000 | (r << 16) | (g << 8) | b
    }
}

/// Pattern addresses some mappers latch on ($0FD0-$0FEF, $1FD0-$1FEF).
fn is_latch_address(address: u16) -> bool {
    matches!(address, 0x0FD0..=0x0FEF | 0x1FD0..=0x1FEF)
}

/// Reverse the bits in a byte (horizontal sprite flip).
fn flip_byte(mut b: u8) -> u8 {
    b = (b & 0xF0) >> 4 | (b & 0x0F) << 4;
    b = (b & 0xCC) >> 2 | (b & 0x33) << 2;
    (b & 0xAA) >> 1 | (b & 0x55) << 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NesRegion;
    use crate::ppu::rig::Rig;
    use crate::ppu::registers::Ctrl;

    fn ppu() -> Ppu {
        Ppu::new(NesRegion::Ntsc)
    }

    #[test]
    fn flip_byte_works() {
        assert_eq!(flip_byte(0b1000_0000), 0b0000_0001);
        assert_eq!(flip_byte(0b1010_0101), 0b1010_0101);
        assert_eq!(flip_byte(0xFF), 0xFF);
        assert_eq!(flip_byte(0x00), 0x00);
    }

    #[test]
    fn latch_window() {
        assert!(is_latch_address(0x0FD8));
        assert!(is_latch_address(0x1FE8));
        assert!(!is_latch_address(0x0FF0));
        assert!(!is_latch_address(0x1FCF));
    }

    #[test]
    fn sprite_overflow_bug_skips_real_overflow() {
        let mut rig = Rig::new();
        let mut ppu = ppu();
        ppu.ctrl = Ctrl::empty();

        // Nine sprites on line 50 start the buggy scan at n=9, m=0.
        for i in 0..9 {
            ppu.oam[i * 4] = 50;
        }
        // Where m=0 the real Y is read and misses. Everywhere else the
        // sprites are on the line, but their tile/attr/X bytes are read.
        for i in 9..64 {
            ppu.oam[i * 4] = if (i - 9) & 3 == 0 { 200 } else { 50 };
            ppu.oam[i * 4 + 1] = 200;
            ppu.oam[i * 4 + 2] = 200;
            ppu.oam[i * 4 + 3] = 200;
        }

        ppu.evaluate_sprites(50, &mut rig.port());
        assert_eq!(ppu.pipeline.sprite_count, 8);
        assert!(!ppu.status.contains(Status::SPRITE_OVERFLOW));
    }

    #[test]
    fn sprite_overflow_bug_false_positive() {
        let mut rig = Rig::new();
        let mut ppu = ppu();

        for i in 0..9 {
            ppu.oam[i * 4] = 50;
        }
        for i in 9..64 {
            ppu.oam[i * 4..i * 4 + 4].copy_from_slice(&[200; 4]);
        }
        // Sprite 10 is read at m=1: its tile byte looks like Y=50.
        ppu.oam[10 * 4 + 1] = 50;

        ppu.evaluate_sprites(50, &mut rig.port());
        assert_eq!(ppu.pipeline.sprite_count, 8);
        assert!(ppu.status.contains(Status::SPRITE_OVERFLOW));
    }

    #[test]
    fn sprite_zero_hit_ignores_layer_toggles() {
        let mut rig = Rig::new();
        let mut ppu = ppu();
        ppu.mask = Mask::BACKGROUND | Mask::SPRITES | Mask::BACKGROUND_LEFT | Mask::SPRITES_LEFT;
        ppu.options.background = false;
        ppu.options.sprites_front = false;

        ppu.oam[0] = 10;
        ppu.oam[3] = 20;
        rig.install(&mut ppu);
        for row in 0..8 {
            ppu.vram.write(row, 0xFF);
        }
        ppu.evaluate_sprites(10, &mut rig.port());
        ppu.pipeline.pattern_lo = 0xFFFF;

        ppu.render_pixel(11, 21);
        assert!(ppu.status.contains(Status::SPRITE_ZERO_HIT));
        // Both layers hidden: the backdrop was drawn.
        let backdrop = ppu.apply_mask_effects(ppu.vram.palette(0) & 0x3F);
        assert_eq!(ppu.framebuffer[11 * FB_WIDTH as usize + 20], backdrop);
    }

    #[test]
    fn greyscale_masks_palette_column() {
        let mut ppu = ppu();
        assert_eq!(ppu.apply_mask_effects(0x15), PALETTE[0x15]);
        ppu.mask = Mask::GREYSCALE;
        assert_eq!(ppu.apply_mask_effects(0x15), PALETTE[0x10]);
    }

    #[test]
    fn emphasis_red_dims_green_and_blue() {
        let mut ppu = ppu();
        ppu.mask = Mask::EMPHASIS_RED;
        let argb = ppu.apply_mask_effects(0x20);

        let base = PALETTE[0x20];
        assert_eq!((argb >> 16) & 0xFF, (base >> 16) & 0xFF);
        assert_eq!((argb >> 8) & 0xFF, ((base >> 8) & 0xFF) * 13 / 16);
        assert_eq!(argb & 0xFF, (base & 0xFF) * 13 / 16);
    }

    #[test]
    fn no_emphasis_returns_raw_palette() {
        let ppu = ppu();
        for index in 0..64u8 {
            assert_eq!(ppu.apply_mask_effects(index), PALETTE[usize::from(index)]);
        }
    }
}
