//! CPU-visible memory and I/O bus.

/// CPU-visible memory and I/O bus.
///
/// Processors access memory and memory-mapped devices through this trait.
/// The bus handles address decoding and routing to the appropriate device,
/// including any catch-up the device needs before it can answer.
pub trait Bus {
    /// Read a byte from the given address.
    fn read(&mut self, address: u16) -> u8;

    /// Write a byte to the given address.
    fn write(&mut self, address: u16, value: u8);

    /// Read a little-endian word from two consecutive addresses.
    fn read_word(&mut self, address: u16) -> u16 {
        let lo = self.read(address);
        let hi = self.read(address.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }
}
