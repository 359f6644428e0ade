use vmsnap_core::{MemoryAccess, Pa, PageSize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The levels in the page table hierarchy (4 KB granule, 48-bit VA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Level 3 - the lowest level, pointing directly to 4 KB pages.
    L3,

    /// Level 2 - points to L3 tables or 2 MB blocks.
    L2,

    /// Level 1 - points to L2 tables or 1 GB blocks.
    L1,

    /// Level 0 - the root table, points to L1 tables only.
    L0,
}

impl PageTableLevel {
    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::L3 => None,
            Self::L2 => Some(Self::L3),
            Self::L1 => Some(Self::L2),
            Self::L0 => Some(Self::L1),
        }
    }

    /// Returns the position of the lowest VA bit indexing this level.
    pub fn shift(self) -> u64 {
        match self {
            Self::L3 => 12,
            Self::L2 => 21,
            Self::L1 => 30,
            Self::L0 => 39,
        }
    }

    /// Returns the number of bytes covered by a single entry.
    pub fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// Returns the size class of a leaf at this level, if leaves are allowed.
    pub fn page_size(self) -> Option<PageSize> {
        match self {
            Self::L3 => Some(PageSize::Size4K),
            Self::L2 => Some(PageSize::Size2M),
            Self::L1 => Some(PageSize::Size1G),
            Self::L0 => None,
        }
    }
}

/// How a descriptor is interpreted at its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Not a valid descriptor.
    Invalid,

    /// Points to the next level table.
    Table,

    /// Maps a 1 GB or 2 MB block.
    Block,

    /// Maps a 4 KB page.
    Page,
}

/// A page table descriptor.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Mask of the output address bits (47:12).
    pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    /// Returns the descriptor type tag (bits 1:0).
    pub fn tag(self) -> u64 {
        self.0 & 0b11
    }

    /// Checks the valid bit.
    pub fn valid(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks whether the tag reads as a table descriptor (`0b11`).
    ///
    /// At level 3 the same tag denotes a page.
    pub fn is_table(self) -> bool {
        self.tag() == 0b11
    }

    /// Checks whether the tag reads as a block descriptor (`0b01`).
    pub fn is_block(self) -> bool {
        self.tag() == 0b01
    }

    /// Decodes the descriptor kind for the given level.
    pub fn kind(self, level: PageTableLevel) -> DescriptorKind {
        match (level, self.tag()) {
            (PageTableLevel::L3, 0b11) => DescriptorKind::Page,
            (PageTableLevel::L3, _) => DescriptorKind::Invalid,
            (_, 0b11) => DescriptorKind::Table,
            (PageTableLevel::L1 | PageTableLevel::L2, 0b01) => DescriptorKind::Block,
            _ => DescriptorKind::Invalid,
        }
    }

    /// Returns the output address with control bits removed.
    pub fn address(self) -> Pa {
        Pa(self.0 & Self::ADDRESS_MASK)
    }

    /// AP\[1\]: accessible from EL0.
    pub fn user(self) -> bool {
        (self.0 >> 6) & 1 != 0
    }

    /// AP\[2\]: read-only.
    pub fn read_only(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Access flag.
    pub fn accessed(self) -> bool {
        (self.0 >> 10) & 1 != 0
    }

    /// Not-global: the mapping belongs to an ASID.
    pub fn not_global(self) -> bool {
        (self.0 >> 11) & 1 != 0
    }

    /// Dirty bit modifier (hardware dirty state management).
    pub fn dbm(self) -> bool {
        (self.0 >> 51) & 1 != 0
    }

    /// Privileged execute-never.
    pub fn pxn(self) -> bool {
        (self.0 >> 53) & 1 != 0
    }

    /// Unprivileged execute-never.
    pub fn uxn(self) -> bool {
        (self.0 >> 54) & 1 != 0
    }

    /// Linux software dirty bit.
    pub fn software_dirty(self) -> bool {
        (self.0 >> 55) & 1 != 0
    }

    /// Checks whether the page has been written to.
    ///
    /// Either the software dirty bit is set, or hardware DBM is in use and
    /// the page has been made writable.
    pub fn dirty(self) -> bool {
        self.software_dirty() || (self.dbm() && !self.read_only())
    }

    /// Returns the access rights of a leaf entry.
    ///
    /// Execute permission is taken from UXN for EL0 mappings and from PXN
    /// otherwise.
    pub fn access(self) -> MemoryAccess {
        let mut access = MemoryAccess::R;

        if !self.read_only() {
            access |= MemoryAccess::W;
        }

        let execute_never = match self.user() {
            true => self.uxn(),
            false => self.pxn(),
        };

        if !execute_never {
            access |= MemoryAccess::X;
        }

        access
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("tag", &self.tag())
            .field("address", &self.address())
            .field("user", &self.user())
            .field("read_only", &self.read_only())
            .field("accessed", &self.accessed())
            .field("pxn", &self.pxn())
            .field("uxn", &self.uxn())
            .field("dirty", &self.dirty())
            .finish()
    }
}
