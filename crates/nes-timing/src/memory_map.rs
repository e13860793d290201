//! CPU address decoding in 2K blocks.
//!
//! The 64K address space is split into 32 blocks. Reads and writes are
//! bound separately, so a mapper can put ROM under the read side of a
//! window and its control registers under the write side. A block is either
//! a direct view into a registered buffer, a named handler the bus routes to
//! a device, or unmapped.
//!
//! Cheat patches sit on top of direct reads as a 64K table of wrapping byte
//! deltas. Whenever a read block is rebound, every patch inside it is
//! checked against the byte now visible there and armed or disarmed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PatchError;

/// Size of one block.
pub const BLOCK_SIZE: usize = 0x800;

/// Number of blocks in the CPU address space.
pub const BLOCK_COUNT: usize = 0x10000 / BLOCK_SIZE;

/// Patch table capacity.
pub const MAX_PATCHES: usize = 15;

/// A buffer registered with [`MemoryMap::add_buffer`] or
/// [`MemoryMap::add_rom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

/// Device a handler block is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// PPU registers ($2000-$3FFF).
    Ppu,
    /// APU and controller ports ($4000-$47FF).
    ApuIo,
    /// The cartridge mapper's `cpu_read`/`cpu_write`.
    Mapper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    /// Reads return zero, writes are dropped.
    #[default]
    Unmapped,
    /// `buffer[offset + (address & 0x7FF)]`.
    Direct { buffer: BufferId, offset: usize },
    Handler(Handler),
}

/// Outcome of decoding a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    /// The byte, with any active patch applied.
    Value(u8),
    /// The bus must ask this device.
    Handler(Handler),
}

/// A cheat: force `address` to read as `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default = "untitled")]
    pub title: String,
    pub address: u16,
    pub value: u8,
    /// Only apply while the underlying byte equals this. `None` always
    /// applies.
    #[serde(default)]
    pub match_value: Option<u8>,
    #[serde(default)]
    pub enabled: bool,
    /// Currently armed in the overlay.
    #[serde(skip)]
    pub active: bool,
}

fn untitled() -> String {
    "?".to_string()
}

impl Patch {
    #[must_use]
    pub fn new(title: impl Into<String>, address: u16, value: u8, match_value: Option<u8>) -> Self {
        Self {
            title: title.into(),
            address,
            value,
            match_value,
            enabled: true,
            active: false,
        }
    }
}

/// Backing store of a registered buffer. ROM is shared with its owner and
/// never copied on re-registration.
#[derive(Debug, Clone)]
enum Storage {
    Ram(Vec<u8>),
    Rom(Arc<[u8]>),
}

#[derive(Debug, Clone)]
pub struct MemoryMap {
    buffers: Vec<Storage>,
    read_blocks: [Binding; BLOCK_COUNT],
    write_blocks: [Binding; BLOCK_COUNT],
    overlay: Vec<u8>,
    patches: Vec<Patch>,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            read_blocks: [Binding::Unmapped; BLOCK_COUNT],
            write_blocks: [Binding::Unmapped; BLOCK_COUNT],
            overlay: vec![0; 0x10000],
            patches: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Buffers
    // -----------------------------------------------------------------------

    /// Take ownership of a backing buffer.
    pub fn add_buffer(&mut self, data: Vec<u8>) -> BufferId {
        self.buffers.push(Storage::Ram(data));
        BufferId(self.buffers.len() - 1)
    }

    /// Register read-only data shared with the caller.
    pub fn add_rom(&mut self, data: Arc<[u8]>) -> BufferId {
        self.buffers.push(Storage::Rom(data));
        BufferId(self.buffers.len() - 1)
    }

    /// Empty slice for an unknown id.
    #[must_use]
    pub fn buffer(&self, id: BufferId) -> &[u8] {
        match self.buffers.get(id.0) {
            Some(Storage::Ram(data)) => data,
            Some(Storage::Rom(data)) => data,
            None => &[],
        }
    }

    /// Empty slice for an unknown id or a ROM buffer.
    pub fn buffer_mut(&mut self, id: BufferId) -> &mut [u8] {
        match self.buffers.get_mut(id.0) {
            Some(Storage::Ram(data)) => data,
            _ => &mut [],
        }
    }

    /// Drop every binding and buffer. Patches are kept but disarmed.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.read_blocks = [Binding::Unmapped; BLOCK_COUNT];
        self.write_blocks = [Binding::Unmapped; BLOCK_COUNT];
        self.overlay.fill(0);
        for patch in &mut self.patches {
            patch.active = false;
        }
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    /// Bind the read side of `block`. Patches in the block are revalidated.
    pub fn bind_read(&mut self, block: usize, binding: Binding) {
        let block = block % BLOCK_COUNT;
        self.read_blocks[block] = binding;
        self.revalidate_block(block);
    }

    pub fn bind_write(&mut self, block: usize, binding: Binding) {
        self.write_blocks[block % BLOCK_COUNT] = binding;
    }

    /// Bind both sides of `block` to the same target.
    pub fn bind(&mut self, block: usize, binding: Binding) {
        self.bind_write(block, binding);
        self.bind_read(block, binding);
    }

    /// Bind `buffer[offset..]` directly to both sides of the blocks covering
    /// `start..start+len`, consecutive blocks taking consecutive 2K slices.
    pub fn map_direct(&mut self, start: u16, len: usize, buffer: BufferId, offset: usize) {
        let first = usize::from(start) / BLOCK_SIZE;
        for i in 0..len.div_ceil(BLOCK_SIZE) {
            self.bind(
                first + i,
                Binding::Direct {
                    buffer,
                    offset: offset + i * BLOCK_SIZE,
                },
            );
        }
    }

    /// As [`map_direct`](Self::map_direct), read side only. Writes to the
    /// blocks are dropped.
    pub fn map_rom(&mut self, start: u16, len: usize, buffer: BufferId, offset: usize) {
        let first = usize::from(start) / BLOCK_SIZE;
        for i in 0..len.div_ceil(BLOCK_SIZE) {
            self.bind_write(first + i, Binding::Unmapped);
            self.bind_read(
                first + i,
                Binding::Direct {
                    buffer,
                    offset: offset + i * BLOCK_SIZE,
                },
            );
        }
    }

    /// Bind a 2K buffer to every block in `start..start+len` (RAM mirrors).
    pub fn map_mirrored(&mut self, start: u16, len: usize, buffer: BufferId) {
        let first = usize::from(start) / BLOCK_SIZE;
        for i in 0..len.div_ceil(BLOCK_SIZE) {
            self.bind(first + i, Binding::Direct { buffer, offset: 0 });
        }
    }

    /// Route both sides of the blocks in `start..start+len` to a handler.
    pub fn map_handler(&mut self, start: u16, len: usize, handler: Handler) {
        let first = usize::from(start) / BLOCK_SIZE;
        for i in 0..len.div_ceil(BLOCK_SIZE) {
            self.bind(first + i, Binding::Handler(handler));
        }
    }

    #[must_use]
    pub fn read_binding(&self, address: u16) -> Binding {
        self.read_blocks[usize::from(address) / BLOCK_SIZE]
    }

    #[must_use]
    pub fn write_binding(&self, address: u16) -> Binding {
        self.write_blocks[usize::from(address) / BLOCK_SIZE]
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    fn direct_byte(&self, buffer: BufferId, offset: usize, address: u16) -> u8 {
        self.buffer(buffer)
            .get(offset + (usize::from(address) & (BLOCK_SIZE - 1)))
            .copied()
            .unwrap_or(0)
    }

    /// The byte a direct read block holds at `address`, without patches.
    #[must_use]
    pub fn peek(&self, address: u16) -> Option<u8> {
        match self.read_binding(address) {
            Binding::Direct { buffer, offset } => Some(self.direct_byte(buffer, offset, address)),
            Binding::Unmapped => Some(0),
            Binding::Handler(_) => None,
        }
    }

    #[must_use]
    pub fn read(&self, address: u16) -> Read {
        match self.read_binding(address) {
            Binding::Direct { buffer, offset } => Read::Value(
                self.direct_byte(buffer, offset, address)
                    .wrapping_add(self.overlay[usize::from(address)]),
            ),
            Binding::Unmapped => Read::Value(0),
            Binding::Handler(handler) => Read::Handler(handler),
        }
    }

    /// Store to a direct block, or name the handler that must take it.
    /// Writes to unmapped blocks vanish.
    pub fn write(&mut self, address: u16, value: u8) -> Option<Handler> {
        match self.write_binding(address) {
            Binding::Direct { buffer, offset } => {
                let index = offset + (usize::from(address) & (BLOCK_SIZE - 1));
                if let Some(slot) = self.buffer_mut(buffer).get_mut(index) {
                    *slot = value;
                }
                None
            }
            Binding::Unmapped => None,
            Binding::Handler(handler) => Some(handler),
        }
    }

    // -----------------------------------------------------------------------
    // Patches
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Add a patch and arm it if its condition already holds.
    pub fn add_patch(&mut self, patch: Patch) -> Result<usize, PatchError> {
        if self.patches.len() >= MAX_PATCHES {
            log::warn!("patch table full, dropping \"{}\"", patch.title);
            return Err(PatchError::TableFull(MAX_PATCHES));
        }
        self.patches.push(patch);
        let index = self.patches.len() - 1;
        self.validate_patch(index);
        Ok(index)
    }

    pub fn remove_patch(&mut self, index: usize) -> Result<Patch, PatchError> {
        if index >= self.patches.len() {
            return Err(PatchError::NoSuchPatch(index));
        }
        let patch = self.patches.remove(index);
        if patch.active {
            self.overlay[usize::from(patch.address)] = 0;
        }
        Ok(patch)
    }

    /// Drop every patch and its overlay entry.
    pub fn clear_patches(&mut self) {
        for patch in self.patches.drain(..) {
            if patch.active {
                self.overlay[usize::from(patch.address)] = 0;
            }
        }
    }

    pub fn set_patch_enabled(&mut self, index: usize, enabled: bool) -> Result<(), PatchError> {
        let patch = self
            .patches
            .get_mut(index)
            .ok_or(PatchError::NoSuchPatch(index))?;
        patch.enabled = enabled;
        self.validate_patch(index);
        Ok(())
    }

    fn revalidate_block(&mut self, block: usize) {
        let start = block * BLOCK_SIZE;
        let range = start..start + BLOCK_SIZE;
        for index in 0..self.patches.len() {
            if range.contains(&usize::from(self.patches[index].address)) {
                self.validate_patch(index);
            }
        }
    }

    /// Disarm, then rearm against the live byte if enabled and matching.
    fn validate_patch(&mut self, index: usize) {
        let address = self.patches[index].address;
        let slot = usize::from(address);
        if self.patches[index].active {
            self.patches[index].active = false;
            self.overlay[slot] = 0;
        }
        if !self.patches[index].enabled {
            return;
        }
        let Some(live) = self.peek(address) else {
            return;
        };
        let patch = &mut self.patches[index];
        if patch.match_value.is_none_or(|m| m == live) {
            patch.active = true;
            self.overlay[slot] = patch.value.wrapping_sub(live);
        }
    }
}
