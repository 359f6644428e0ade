//! Sparse, page-granular storage for a physical memory snapshot.

use std::collections::HashMap;

use crate::SnapError;

/// A sparse physical memory image.
///
/// The image is a linear byte space of `total_size` bytes split into
/// [`PAGE_SIZE`] pages. Pages that were never loaded read as zero, so a read
/// cannot tell an uncaptured page from a genuinely zeroed one.
///
/// Offsets are image offsets, not guest physical addresses. The mapping from
/// one to the other is owned by [`MemoryLayout`].
///
/// [`PAGE_SIZE`]: Self::PAGE_SIZE
/// [`MemoryLayout`]: crate::MemoryLayout
#[derive(Debug, Default)]
pub struct PagedImage {
    pages: HashMap<u64, Box<[u8]>>,
    total_size: u64,
}

impl PagedImage {
    /// Size of a single image page.
    pub const PAGE_SIZE: u64 = 0x1000;

    /// Creates an empty image with the declared total size.
    pub fn new(total_size: u64) -> Self {
        Self {
            pages: HashMap::new(),
            total_size,
        }
    }

    /// Returns the declared size of the image in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Returns the number of pages covered by the declared size.
    pub fn page_count(&self) -> u64 {
        self.total_size.div_ceil(Self::PAGE_SIZE)
    }

    /// Returns the number of pages that were actually loaded.
    pub fn loaded_pages(&self) -> usize {
        self.pages.len()
    }

    /// Checks whether the page at `index` was loaded.
    pub fn contains_page(&self, index: u64) -> bool {
        self.pages.contains_key(&index)
    }

    /// Returns the contents of a loaded page.
    pub fn page(&self, index: u64) -> Option<&[u8]> {
        self.pages.get(&index).map(|page| &page[..])
    }

    /// Stores a page, replacing any page previously stored at `index`.
    ///
    /// `data` must be exactly one page long.
    pub fn add_page(&mut self, index: u64, data: &[u8]) -> Result<(), SnapError> {
        if data.len() as u64 != Self::PAGE_SIZE {
            return Err(SnapError::SizeMismatch {
                expected: Self::PAGE_SIZE as usize,
                actual: data.len(),
            });
        }

        if index >= self.page_count() {
            return Err(SnapError::OutOfRange {
                offset: index.saturating_mul(Self::PAGE_SIZE),
                length: Self::PAGE_SIZE,
                size: self.total_size,
            });
        }

        self.pages.insert(index, data.into());
        Ok(())
    }

    /// Fills `buffer` with the bytes starting at `offset`.
    pub fn read_into(&self, offset: u64, buffer: &mut [u8]) -> Result<(), SnapError> {
        let length = buffer.len() as u64;

        match offset.checked_add(length) {
            Some(end) if end <= self.total_size => {}
            _ => {
                return Err(SnapError::OutOfRange {
                    offset,
                    length,
                    size: self.total_size,
                });
            }
        }

        let mut position = 0usize;
        while position < buffer.len() {
            let current = offset + position as u64;
            let index = current / Self::PAGE_SIZE;
            let in_page = (current % Self::PAGE_SIZE) as usize;
            let size = (Self::PAGE_SIZE as usize - in_page).min(buffer.len() - position);
            let target = &mut buffer[position..position + size];

            match self.pages.get(&index) {
                Some(page) => target.copy_from_slice(&page[in_page..in_page + size]),
                None => target.fill(0),
            }

            position += size;
        }

        Ok(())
    }

    /// Reads `length` bytes starting at `offset`.
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, SnapError> {
        let mut buffer = vec![0u8; length];
        self.read_into(offset, &mut buffer)?;
        Ok(buffer)
    }

    /// Reads a little-endian 32-bit value.
    pub fn read_u32(&self, offset: u64) -> Result<u32, SnapError> {
        let mut buffer = [0u8; 4];
        self.read_into(offset, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a little-endian 64-bit value.
    pub fn read_u64(&self, offset: u64) -> Result<u64, SnapError> {
        let mut buffer = [0u8; 8];
        self.read_into(offset, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads an ASCII string of at most `max_length` bytes.
    ///
    /// See [`printable_string`] for how the bytes are filtered.
    pub fn read_string(&self, offset: u64, max_length: usize) -> Result<Option<String>, SnapError> {
        let length = (max_length as u64).min(self.total_size.saturating_sub(offset)) as usize;
        let buffer = self.read(offset, length)?;
        Ok(printable_string(&buffer))
    }
}

/// Extracts a printable ASCII string from raw bytes.
///
/// The string ends at the first NUL byte. Non-printable bytes are dropped.
/// Without a terminator the bytes are accepted only if at least three
/// quarters of them are printable.
pub fn printable_string(bytes: &[u8]) -> Option<String> {
    let is_printable = |b: &u8| (0x20..0x7f).contains(b);

    let bytes = match memchr::memchr(0, bytes) {
        Some(position) => &bytes[..position],
        None => {
            let printable = bytes.iter().filter(|b| is_printable(b)).count();
            if bytes.is_empty() || printable * 4 < bytes.len() * 3 {
                return None;
            }

            bytes
        }
    };

    Some(
        bytes
            .iter()
            .copied()
            .filter(is_printable)
            .map(char::from)
            .collect(),
    )
}
