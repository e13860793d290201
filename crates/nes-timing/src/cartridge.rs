//! Cartridge image as handed over by a ROM loader.
//!
//! Parsing iNES files is the loader's business. This is what comes out of
//! it: the mapper number, the mirroring wiring and the raw PRG/CHR data,
//! plus the checksums save states are keyed on.

use crate::crc32::crc32;
use crate::mapper::{Mapper, NoMapper};

/// Nametable mirroring mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mirroring {
    /// $2000=$2400, $2800=$2C00.
    #[default]
    Horizontal,
    /// $2000=$2800, $2400=$2C00.
    Vertical,
    /// All four quadrants show one 1K page (0..4).
    SingleScreen(u8),
    /// Four separate 1K nametables (cartridge supplies the extra 2K).
    FourScreen,
}

impl Mirroring {
    /// Nametable page (0..4) shown in each quadrant.
    #[must_use]
    pub const fn pages(self) -> [usize; 4] {
        match self {
            Self::Horizontal => [0, 0, 1, 1],
            Self::Vertical => [0, 1, 0, 1],
            Self::SingleScreen(page) => {
                let page = (page & 3) as usize;
                [page; 4]
            }
            Self::FourScreen => [0, 1, 2, 3],
        }
    }

    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::Horizontal => 0,
            Self::Vertical => 1,
            Self::FourScreen => 2,
            Self::SingleScreen(page) => 4 + (page & 3),
        }
    }

    pub(crate) const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Vertical,
            2 => Self::FourScreen,
            4..=7 => Self::SingleScreen(code - 4),
            _ => Self::Horizontal,
        }
    }
}

/// Decoded cartridge contents.
#[derive(Debug, Clone, Default)]
pub struct CartridgeImage {
    pub title: String,
    pub mapper_number: u16,
    pub mirroring: Mirroring,
    pub prg: Vec<u8>,
    /// Empty when the board carries CHR RAM instead.
    pub chr: Vec<u8>,
    /// 512-byte trainer, copied to $7000 at load.
    pub trainer: Option<Vec<u8>>,
    /// Save RAM is battery backed and outlives the session.
    pub battery: bool,
}

impl CartridgeImage {
    #[must_use]
    pub fn new(prg: Vec<u8>, chr: Vec<u8>, mirroring: Mirroring) -> Self {
        Self {
            title: String::new(),
            mapper_number: 0,
            mirroring,
            prg,
            chr,
            trainer: None,
            battery: false,
        }
    }

    #[must_use]
    pub fn trainer_crc32(&self) -> u32 {
        self.trainer.as_deref().map_or(0, crc32)
    }

    #[must_use]
    pub fn prg_crc32(&self) -> u32 {
        crc32(&self.prg)
    }

    #[must_use]
    pub fn chr_crc32(&self) -> u32 {
        crc32(&self.chr)
    }

    /// Title as the 16-byte zero-padded field of a save state header.
    #[must_use]
    pub fn title_field(&self) -> [u8; 16] {
        let mut field = [0u8; 16];
        for (slot, byte) in field.iter_mut().zip(self.title.bytes()) {
            *slot = byte;
        }
        field
    }

    /// Build the mapper for this image, or `None` if the board is not
    /// supported.
    #[must_use]
    pub fn create_mapper(&self) -> Option<Box<dyn Mapper>> {
        match self.mapper_number {
            0 => Some(Box::new(NoMapper::new(self))),
            n => {
                log::warn!("mapper {n} is not supported");
                None
            }
        }
    }
}
