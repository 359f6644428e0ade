use std::ops::Range;

use vmsnap_arch_aarch64::{Aarch64, PageTableEntry};
use vmsnap_core::{AddressContext, Pa, SnapCore, Va};

use super::ArchAdapter;

impl ArchAdapter for Aarch64 {
    const USER_RANGE: Range<Va> = Va(0)..Va(0x0001_0000_0000_0000);
    const KERNEL_BASE: Va = Va(0xffff_0000_0000_0000);

    fn root_from_pgd(core: &SnapCore<Self>, pgd: Va, kernel_root: Option<Pa>) -> Option<Pa> {
        if pgd.is_null() {
            return None;
        }

        if let Some(pa) = core.layout().linear_to_pa(pgd) {
            return Some(pa);
        }

        if pgd >= Self::KERNEL_BASE {
            let root = kernel_root?;
            return core
                .translate_address(AddressContext::new(pgd, root))
                .ok();
        }

        // Some dumps store the physical address of the table instead.
        match pgd.0 & PageTableEntry::ADDRESS_MASK {
            0 => None,
            pa => Some(Pa(pa)),
        }
    }

    fn is_table_candidate(core: &SnapCore<Self>, pa: Pa) -> bool {
        Aarch64::is_table_candidate(core, pa)
    }
}
