use smallvec::SmallVec;
use vmsnap_core::{Pa, PageSize, Va};

use super::{DescriptorKind, PageTableEntry, PageTableLevel};

/// A single descriptor visited during a page table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// The level of the table holding the descriptor.
    pub level: PageTableLevel,

    /// The descriptor itself.
    pub entry: PageTableEntry,

    /// The physical address where the descriptor is stored.
    pub entry_address: Pa,
}

impl TranslationEntry {
    /// Checks if the descriptor maps memory directly (block or page).
    pub fn is_leaf(&self) -> bool {
        matches!(
            self.entry.kind(self.level),
            DescriptorKind::Block | DescriptorKind::Page
        )
    }
}

/// Descriptors visited during a walk, root first.
pub type TranslationEntries = SmallVec<[TranslationEntry; 4]>;

/// The result of a page table walk.
#[derive(Debug)]
pub struct VaTranslation {
    pub(super) entries: TranslationEntries,
    pub(super) pa: Option<Pa>,
}

impl VaTranslation {
    /// Returns the descriptors visited during the walk.
    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    /// Returns the translated physical address, if the walk reached a leaf.
    pub fn pa(&self) -> Option<Pa> {
        self.pa
    }

    /// Returns the leaf descriptor, if the walk reached one.
    pub fn leaf(&self) -> Option<&TranslationEntry> {
        self.entries.last().filter(|entry| entry.is_leaf())
    }

    /// Returns the size class of the mapping.
    pub fn page_size(&self) -> Option<PageSize> {
        self.leaf().and_then(|entry| entry.level.page_size())
    }
}

/// A leaf mapping found while enumerating an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafMapping {
    /// First virtual address of the mapping.
    pub va: Va,

    /// First physical address of the mapping.
    pub pa: Pa,

    /// Size class of the mapping.
    pub size: PageSize,

    /// The leaf descriptor.
    pub entry: PageTableEntry,
}

/// How many of the leading descriptors of a page decode as valid table or
/// block descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableScore {
    /// Number of valid descriptors.
    pub valid: usize,

    /// Number of descriptors examined.
    pub examined: usize,
}

impl TableScore {
    /// Minimum number of valid descriptors for a page table candidate.
    pub const THRESHOLD: usize = 2;

    /// Checks whether the page looks like a page table.
    pub fn is_candidate(&self) -> bool {
        self.valid >= Self::THRESHOLD
    }
}
