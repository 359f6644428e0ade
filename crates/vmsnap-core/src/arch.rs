//! Architecture abstraction.

use std::fmt::Debug;

use crate::{Gfn, Pa, SnapCore, SnapError, Va};

/// CPU architecture specific paging constants and operations.
///
/// Implementors describe one paging scheme (page size, table levels, index
/// extraction) and the page table walk that uses it. [`SnapCore`] handles
/// the linear map fast path and caching before delegating to
/// [`translate_address`].
///
/// [`translate_address`]: Self::translate_address
pub trait Architecture: Sized {
    /// The size of a memory page in bytes.
    ///
    /// # Architecture-specific
    ///
    /// - **AArch64** (4 KB granule): `0x1000`
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between page numbers and
    /// physical addresses.
    ///
    /// # Architecture-specific
    ///
    /// - **AArch64** (4 KB granule): `12`
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page number from a full address.
    const PAGE_MASK: u64;

    /// The levels of the page table hierarchy.
    ///
    /// # Architecture-specific
    ///
    /// - **AArch64**: L0, L1, L2, L3
    type PageTableLevel: Debug + Clone + Copy;

    /// Converts a guest physical address to a guest frame number.
    fn gfn_from_pa(pa: Pa) -> Gfn;

    /// Converts a guest frame number to a guest physical address.
    fn pa_from_gfn(gfn: Gfn) -> Pa;

    /// Extracts the offset within a page from a physical address.
    fn pa_offset(pa: Pa) -> u64;

    /// Extracts the offset within a page from a virtual address.
    fn va_offset(va: Va) -> u64;

    /// Calculates the offset of `va` within a block mapped at `level`.
    fn va_offset_for(va: Va, level: Self::PageTableLevel) -> u64;

    /// Calculates the index into the table at `level` for `va`.
    fn va_index_for(va: Va, level: Self::PageTableLevel) -> u64;

    /// Performs a full page table walk to translate a virtual address to a
    /// physical address.
    fn translate_address(core: &SnapCore<Self>, va: Va, root: Pa) -> Result<Pa, SnapError>;
}
