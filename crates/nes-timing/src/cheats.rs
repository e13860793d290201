//! Patch files and Game Genie codes.
//!
//! The patch table lives in [`MemoryMap`]; this module moves it to and from
//! disk and turns Game Genie letter codes into table entries. A patch file
//! is JSON:
//!
//! ```json
//! { "version": 256, "patches": [ { "title": "lives", "address": 117, "value": 9 } ] }
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CheatError;
use crate::memory_map::{MemoryMap, Patch, MAX_PATCHES};

/// Newest patch file version this build reads.
pub const PATCH_FILE_VERSION: u16 = 0x0100;

/// Titles longer than this are cut on load.
pub const MAX_TITLE_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct PatchFile {
    version: u16,
    patches: Vec<Patch>,
}

/// Replace the patch table with the contents of `path`. A missing file
/// leaves the table empty and returns `Ok(false)`. Entries past the table
/// size are dropped.
pub fn load_patches(memory: &mut MemoryMap, path: &Path) -> Result<bool, CheatError> {
    memory.clear_patches();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!("no patch file at {}", path.display());
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    let file: PatchFile = serde_json::from_str(&text)?;
    if file.version > PATCH_FILE_VERSION {
        return Err(CheatError::UnsupportedVersion(file.version));
    }
    if file.patches.len() > MAX_PATCHES {
        log::warn!(
            "{} holds {} patches, keeping the first {MAX_PATCHES}",
            path.display(),
            file.patches.len()
        );
    }
    for mut patch in file.patches.into_iter().take(MAX_PATCHES) {
        if let Some((cut, _)) = patch.title.char_indices().nth(MAX_TITLE_LEN) {
            patch.title.truncate(cut);
        }
        memory.add_patch(patch)?;
    }
    log::info!("loaded {} patches from {}", memory.patches().len(), path.display());
    Ok(true)
}

/// Write the patch table to `path`. An empty table removes any old file
/// and writes nothing.
pub fn save_patches(memory: &MemoryMap, path: &Path) -> Result<bool, CheatError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if memory.patches().is_empty() {
        return Ok(false);
    }
    let file = PatchFile {
        version: PATCH_FILE_VERSION,
        patches: memory.patches().to_vec(),
    };
    fs::write(path, serde_json::to_string_pretty(&file)?)?;
    log::info!("saved {} patches to {}", file.patches.len(), path.display());
    Ok(true)
}

const GENIE_LETTERS: &[u8; 16] = b"APZLGITYEOXUKSVN";

/// A decoded Game Genie code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenieCode {
    pub address: u16,
    pub value: u8,
    /// Eight-letter codes only apply over this byte.
    pub compare: Option<u8>,
}

impl GenieCode {
    /// Decode a six- or eight-letter code. Letters are case-insensitive.
    pub fn decode(code: &str) -> Result<Self, CheatError> {
        let invalid = || CheatError::InvalidCode(code.to_string());
        let mut n = [0u8; 8];
        let mut len = 0;
        for c in code.bytes() {
            let digit = GENIE_LETTERS
                .iter()
                .position(|&l| l == c.to_ascii_uppercase())
                .ok_or_else(invalid)?;
            *n.get_mut(len).ok_or_else(invalid)? = digit as u8;
            len += 1;
        }
        if len != 6 && len != 8 {
            return Err(invalid());
        }

        let address = 0x8000
            | (u16::from(n[3] & 7) << 12)
            | (u16::from(n[5] & 7) << 8)
            | (u16::from(n[4] & 8) << 8)
            | (u16::from(n[2] & 7) << 4)
            | (u16::from(n[1] & 8) << 4)
            | u16::from(n[4] & 7)
            | u16::from(n[3] & 8);
        let low = |last: u8| ((n[1] & 7) << 4) | ((n[0] & 8) << 4) | (n[0] & 7) | (last & 8);

        Ok(if len == 6 {
            Self {
                address,
                value: low(n[5]),
                compare: None,
            }
        } else {
            Self {
                address,
                value: low(n[7]),
                compare: Some(((n[7] & 7) << 4) | ((n[6] & 8) << 4) | (n[6] & 7) | (n[5] & 8)),
            }
        })
    }

    /// The patch this code installs. A six-letter code is pinned to the
    /// byte currently mapped at its address so a bank switch disarms it.
    #[must_use]
    pub fn to_patch(&self, title: impl Into<String>, memory: &MemoryMap) -> Patch {
        let compare = self.compare.or_else(|| memory.peek(self.address));
        Patch::new(title, self.address, self.value, compare)
    }
}

/// Decode `code` and add it to the patch table, titled with the code
/// itself. Returns the table index.
pub fn add_genie_code(memory: &mut MemoryMap, code: &str) -> Result<usize, CheatError> {
    let genie = GenieCode::decode(code)?;
    let patch = genie.to_patch(code.to_ascii_uppercase(), memory);
    log::debug!("Game Genie {code}: {:#06X} = {:#04X}", genie.address, genie.value);
    Ok(memory.add_patch(patch)?)
}
