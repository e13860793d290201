//! Bank lookup with power-of-two mirroring.
//!
//! Cartridges rarely carry a power-of-two number of banks the mapper can
//! address. The table rounds the page count up to the next power of two and
//! fills the extra slots by mirroring earlier pages, so any bank number a
//! mapper register produces resolves to a real page after masking.

/// One page of a backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Byte offset of the page in the backing buffer.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTable {
    pages: Vec<Page>,
    page_size: usize,
    overflow_mask: usize,
}

impl PageTable {
    /// Split a buffer of `buffer_len` bytes into `page_size` pages.
    ///
    /// A buffer shorter than one page still yields a single page at offset
    /// zero; reads past its end are the caller's concern.
    #[must_use]
    pub fn new(buffer_len: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let real = buffer_len.div_ceil(page_size).max(1);
        let len = real.next_power_of_two();
        let pages = (0..len)
            .map(|i| Page {
                offset: (i % real) * page_size,
            })
            .collect();
        Self {
            pages,
            page_size,
            overflow_mask: len - 1,
        }
    }

    /// Page for a bank number. Out-of-range numbers wrap by the mask.
    #[must_use]
    pub fn page(&self, index: usize) -> Page {
        self.pages[index & self.overflow_mask]
    }

    /// Byte offset of `address_in_page` within bank `index`.
    #[must_use]
    pub fn offset(&self, index: usize, address_in_page: usize) -> usize {
        self.page(index).offset + (address_in_page % self.page_size)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn overflow_mask(&self) -> usize {
        self.overflow_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_pages_round_up_to_four() {
        let table = PageTable::new(3 * 0x4000, 0x4000);
        assert_eq!(table.len(), 4);
        assert_eq!(table.overflow_mask(), 3);
        assert_eq!(table.page(2).offset, 0x8000);
        // Slot 3 mirrors page 0.
        assert_eq!(table.page(3).offset, 0);
        assert_eq!(table.page(6).offset, 0x8000);
    }

    #[test]
    fn single_16k_bank_mirrors_into_32k_window() {
        let table = PageTable::new(0x4000, 0x4000);
        assert_eq!(table.offset(0, 0x0123), 0x0123);
        assert_eq!(table.offset(1, 0x0123), 0x0123);
    }

    #[test]
    fn empty_buffer_still_has_a_page() {
        let table = PageTable::new(0, 0x2000);
        assert_eq!(table.len(), 1);
        assert_eq!(table.page(99).offset, 0);
    }
}
