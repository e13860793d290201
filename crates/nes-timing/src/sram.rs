//! Battery-backed save RAM.
//!
//! Cartridges with a battery keep `$6000-$7FFF` between sessions. The file
//! is the raw 8K image with no header.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::cpu::CpuCore;
use crate::error::StateError;
use crate::machine::Machine;
use crate::timing::SAVE_RAM_SIZE;

/// Fill save RAM from `path`. Returns whether anything was loaded: a
/// cartridge without a battery, or a missing file, loads nothing. A short
/// file fills only its prefix; bytes past 8K are ignored.
pub fn load_sram<C: CpuCore>(machine: &mut Machine<C>, path: &Path) -> Result<bool, StateError> {
    if !machine.image().battery {
        return Ok(false);
    }
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!("no save RAM at {}", path.display());
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    let len = data.len().min(SAVE_RAM_SIZE);
    if len < SAVE_RAM_SIZE {
        log::warn!("save RAM {} is short: {len} of {SAVE_RAM_SIZE} bytes", path.display());
    }
    machine.bus_mut().save_ram_mut()[..len].copy_from_slice(&data[..len]);
    log::info!("loaded save RAM from {}", path.display());
    Ok(true)
}

/// Write save RAM to `path` if the cartridge has a battery.
pub fn save_sram<C: CpuCore>(machine: &Machine<C>, path: &Path) -> Result<bool, StateError> {
    if !machine.image().battery {
        return Ok(false);
    }
    fs::write(path, machine.bus().save_ram())?;
    log::info!("saved save RAM to {}", path.display());
    Ok(true)
}
