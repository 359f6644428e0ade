mod aarch64;

use std::ops::Range;

use vmsnap_core::{Architecture, Pa, SnapCore, Va};

/// Architecture hooks needed by the Linux scanner.
pub trait ArchAdapter: Architecture {
    /// Virtual address range of user space.
    const USER_RANGE: Range<Va>;

    /// Lowest address of kernel space.
    const KERNEL_BASE: Va;

    /// Converts an `mm_struct.pgd` value into the physical address of the
    /// root table.
    ///
    /// `kernel_root` resolves kernel addresses outside the linear map.
    fn root_from_pgd(core: &SnapCore<Self>, pgd: Va, kernel_root: Option<Pa>) -> Option<Pa>;

    /// Checks whether the page at `pa` looks like a page table.
    fn is_table_candidate(core: &SnapCore<Self>, pa: Pa) -> bool;
}
