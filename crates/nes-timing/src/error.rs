//! Error types for the persistence and configuration boundaries.
//!
//! Emulation itself never fails: unmapped accesses read zero, stale
//! predictions clamp to empty windows. Only loading data from outside can
//! go wrong, and those paths return these errors.

use thiserror::Error;

/// Which cartridge checksum a save state disagreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Trainer,
    Prg,
    Chr,
}

impl std::fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Trainer => "trainer",
            Self::Prg => "PRG",
            Self::Chr => "CHR",
        })
    }
}

/// A save state, rewind snapshot or replay could not be read.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("not a save state (bad signature)")]
    BadSignature,

    #[error("save state version {0:#06X} is newer than supported")]
    UnsupportedVersion(u16),

    #[error("{which} checksum mismatch: state has {expected:#010X}, cartridge has {found:#010X}")]
    ChecksumMismatch {
        which: ChecksumKind,
        expected: u32,
        found: u32,
    },

    #[error("save state has no {0} chunk")]
    MissingChunk(String),

    #[error("save state is truncated")]
    Truncated,

    #[error("no snapshot available")]
    Empty,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The cheat patch table rejected a request.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch table is full ({0} entries)")]
    TableFull(usize),

    #[error("no patch at index {0}")]
    NoSuchPatch(usize),
}

/// Configuration could not be loaded or saved.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A patch file or Game Genie code could not be used.
#[derive(Error, Debug)]
pub enum CheatError {
    #[error("patch file version {0:#06X} is newer than supported")]
    UnsupportedVersion(u16),

    #[error("invalid Game Genie code {0:?}")]
    InvalidCode(String),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed patch file: {0}")]
    Parse(#[from] serde_json::Error),
}
