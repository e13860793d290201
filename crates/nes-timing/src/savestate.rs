//! FNSS save states.
//!
//! Layout, all little-endian:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | `"FNSS"`                                |
//! | 4      | 2    | version                                 |
//! | 6      | 16   | title, zero padded                      |
//! | 22     | 12   | CRC32 of trainer, PRG, CHR              |
//! | 34     | ...  | chunks: 4-byte tag, u32 length, payload |
//!
//! Chunk payloads are each device's own encoding. Unknown chunks are
//! skipped, which is how a replay carries its input stream after the
//! state it starts from.

use std::fs;
use std::path::Path;

use crate::cartridge::CartridgeImage;
use crate::cpu::{CpuCore, CpuTimeline, Registers};
use crate::error::{ChecksumKind, StateError};
use crate::input::Input;
use crate::machine::Machine;
use crate::state::{StateReader, StateWriter};
use crate::timing::{SAVE_RAM_SIZE, WORK_RAM_SIZE};

pub const SIGNATURE: [u8; 4] = *b"FNSS";

/// Newest version written and read.
pub const VERSION: u16 = 0x0101;

pub const HEADER_LEN: usize = 34;

pub mod tag {
    pub const CPU: [u8; 4] = *b"CPU\0";
    pub const PPU: [u8; 4] = *b"PPU\0";
    pub const APU: [u8; 4] = *b"APU\0";
    /// Older spelling of the APU chunk, accepted on load.
    pub const PAPU: [u8; 4] = *b"PAPU";
    pub const MMC: [u8; 4] = *b"MMC\0";
    pub const CTRL: [u8; 4] = *b"CTRL";
    pub const REPL: [u8; 4] = *b"REPL";
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub title: [u8; 16],
    pub trainer_crc: u32,
    pub prg_crc: u32,
    pub chr_crc: u32,
}

impl Header {
    #[must_use]
    pub fn for_image(image: &CartridgeImage) -> Self {
        Self {
            version: VERSION,
            title: image.title_field(),
            trainer_crc: image.trainer_crc32(),
            prg_crc: image.prg_crc32(),
            chr_crc: image.chr_crc32(),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&SIGNATURE);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.title);
        out.extend_from_slice(&self.trainer_crc.to_le_bytes());
        out.extend_from_slice(&self.prg_crc.to_le_bytes());
        out.extend_from_slice(&self.chr_crc.to_le_bytes());
    }

    /// Split `data` into its header and chunk area. Rejects a bad
    /// signature or a version newer than [`VERSION`].
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), StateError> {
        if data.len() < 4 || data[..4] != SIGNATURE {
            return Err(StateError::BadSignature);
        }
        let mut r = StateReader::new(&data[4..]);
        let version = r.u16()?;
        if version > VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        let mut title = [0u8; 16];
        r.bytes_into(&mut title)?;
        let header = Self {
            version,
            title,
            trainer_crc: r.u32()?,
            prg_crc: r.u32()?,
            chr_crc: r.u32()?,
        };
        Ok((header, r.remaining()))
    }

    /// The state belongs to `image`.
    pub fn check(&self, image: &CartridgeImage) -> Result<(), StateError> {
        let checks = [
            (ChecksumKind::Trainer, self.trainer_crc, image.trainer_crc32()),
            (ChecksumKind::Prg, self.prg_crc, image.prg_crc32()),
            (ChecksumKind::Chr, self.chr_crc, image.chr_crc32()),
        ];
        for (which, expected, found) in checks {
            if expected != found {
                return Err(StateError::ChecksumMismatch {
                    which,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Title up to the first NUL.
    #[must_use]
    pub fn title(&self) -> String {
        let end = self.title.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.title[..end]).into_owned()
    }
}

/// Title of a state or replay without loading it, for slot menus.
pub fn read_title(data: &[u8]) -> Result<String, StateError> {
    Header::parse(data).map(|(header, _)| header.title())
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

pub fn write_chunk(out: &mut Vec<u8>, tag: [u8; 4], payload: &[u8]) {
    out.extend_from_slice(&tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Every chunk in `body`, in file order.
pub fn parse_chunks(body: &[u8]) -> Result<Vec<([u8; 4], &[u8])>, StateError> {
    let mut chunks = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < 8 {
            return Err(StateError::Truncated);
        }
        let tag = [rest[0], rest[1], rest[2], rest[3]];
        let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let payload = rest.get(8..8 + len).ok_or(StateError::Truncated)?;
        chunks.push((tag, payload));
        rest = &rest[8 + len..];
    }
    Ok(chunks)
}

/// Payload of the first chunk with any of `tags`.
pub fn find_chunk<'a>(chunks: &[([u8; 4], &'a [u8])], tags: &[[u8; 4]]) -> Result<&'a [u8], StateError> {
    chunks
        .iter()
        .find(|(t, _)| tags.contains(t))
        .map(|&(_, payload)| payload)
        .ok_or_else(|| StateError::MissingChunk(tag_name(tags[0])))
}

fn tag_name(tag: [u8; 4]) -> String {
    String::from_utf8_lossy(&tag)
        .trim_end_matches('\0')
        .to_string()
}

// ---------------------------------------------------------------------------
// CPU chunk
// ---------------------------------------------------------------------------

/// The CPU chunk, decoded before anything in the machine is touched.
struct CpuChunk {
    timeline: CpuTimeline,
    registers: Registers,
    save_ram: Vec<u8>,
    work_ram: Vec<u8>,
}

impl CpuChunk {
    fn read(payload: &[u8], divider: u64) -> Result<Self, StateError> {
        let mut r = StateReader::new(payload);
        let mut timeline = CpuTimeline::new(divider);
        timeline.load_state(&mut r)?;
        let registers = Registers::load_state(&mut r)?;
        let mut save_ram = vec![0; SAVE_RAM_SIZE];
        r.bytes_into(&mut save_ram)?;
        let mut work_ram = vec![0; WORK_RAM_SIZE];
        r.bytes_into(&mut work_ram)?;
        Ok(Self {
            timeline,
            registers,
            save_ram,
            work_ram,
        })
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// Capture the machine. The PPU and APU are caught up first so neither is
/// saved mid-batch.
pub fn save_state<C: CpuCore>(machine: &mut Machine<C>) -> Vec<u8> {
    let header = Header::for_image(machine.image());
    let (cpu, bus) = machine.parts_mut();
    bus.settle_apu();
    bus.sync_ppu();

    let mut out = Vec::with_capacity(0x4000);
    header.write(&mut out);

    let mut w = StateWriter::new();
    bus.timeline.save_state(&mut w);
    cpu.registers().save_state(&mut w);
    w.bytes(bus.save_ram());
    w.bytes(bus.work_ram());
    write_chunk(&mut out, tag::CPU, &w.into_inner());

    let mut w = StateWriter::new();
    bus.ppu.save_state(&mut w);
    write_chunk(&mut out, tag::PPU, &w.into_inner());

    let mut w = StateWriter::new();
    bus.apu.save_state(&mut w);
    write_chunk(&mut out, tag::APU, &w.into_inner());

    let mut w = StateWriter::new();
    bus.mapper.save_state(&mut w);
    write_chunk(&mut out, tag::MMC, &w.into_inner());

    let mut w = StateWriter::new();
    bus.input.save_state(&mut w);
    write_chunk(&mut out, tag::CTRL, &w.into_inner());

    log::debug!("state saved: {} bytes at {}", out.len(), bus.timeline.now());
    out
}

/// Restore a capture made against the same cartridge.
///
/// The header, checksums and every chunk are decoded before anything
/// changes; on failure the machine is untouched. Then the machine is
/// reset, the chunks are loaded, and the PPU and APU clocks are rebased to
/// the restored CPU time.
pub fn load_state<C: CpuCore>(machine: &mut Machine<C>, data: &[u8]) -> Result<(), StateError> {
    let (header, body) = Header::parse(data).inspect_err(|e| log::warn!("save state rejected: {e}"))?;
    header
        .check(machine.image())
        .inspect_err(|e| log::warn!("save state rejected: {e}"))?;
    let chunks = parse_chunks(body)?;
    let cpu_chunk = find_chunk(&chunks, &[tag::CPU])?;
    let ppu_chunk = find_chunk(&chunks, &[tag::PPU])?;
    let apu_chunk = find_chunk(&chunks, &[tag::APU, tag::PAPU])?;
    let mmc_chunk = find_chunk(&chunks, &[tag::MMC])?;
    let ctrl_chunk = find_chunk(&chunks, &[tag::CTRL])?;
    let divider = machine.bus().timeline.divider();
    let restored = CpuChunk::read(cpu_chunk, divider)?;
    {
        let bus = machine.bus();
        bus.ppu.check_state(ppu_chunk)?;
        bus.apu.check_state(apu_chunk)?;
        bus.mapper.check_state(&mut StateReader::new(mmc_chunk))?;
        Input::check_state(ctrl_chunk)?;
    }

    machine.reset_devices();

    let (cpu, bus) = machine.parts_mut();
    bus.timeline = restored.timeline;
    cpu.set_registers(restored.registers);
    bus.save_ram_mut().copy_from_slice(&restored.save_ram);
    bus.work_ram_mut().copy_from_slice(&restored.work_ram);

    let now = bus.timeline.now();
    bus.ppu.load_state(&mut StateReader::new(ppu_chunk), now)?;
    bus.apu.load_state(&mut StateReader::new(apu_chunk), now)?;
    bus.mapper.load_state(&mut StateReader::new(mmc_chunk))?;
    bus.input.load_state(&mut StateReader::new(ctrl_chunk))?;

    log::debug!("state loaded: version {:#06X}, time {now}", header.version);
    Ok(())
}

/// [`save_state`] to a file.
pub fn save_state_file<C: CpuCore>(machine: &mut Machine<C>, path: &Path) -> Result<(), StateError> {
    let image = save_state(machine);
    fs::write(path, image)?;
    log::info!("state saved to {}", path.display());
    Ok(())
}

/// [`load_state`] from a file.
pub fn load_state_file<C: CpuCore>(machine: &mut Machine<C>, path: &Path) -> Result<(), StateError> {
    let data = fs::read(path)?;
    load_state(machine, &data)?;
    log::info!("state loaded from {}", path.display());
    Ok(())
}
