//! AArch64 paging for snapshot introspection.
//!
//! Supports the 4 KB translation granule with 48-bit virtual addresses: four
//! table levels (L0-L3) indexed by VA bits 47:39, 38:30, 29:21 and 20:12,
//! with 1 GB blocks at L1 and 2 MB blocks at L2.

mod paging;
mod translation;

use std::{collections::HashSet, ops::ControlFlow, ops::Range};

use vmsnap_core::{AccessContext, Architecture, Gfn, Pa, SnapCore, SnapError, Va};
use zerocopy::FromBytes;

pub use self::{
    paging::{DescriptorKind, PageTableEntry, PageTableLevel},
    translation::{LeafMapping, TableScore, TranslationEntries, TranslationEntry, VaTranslation},
};

/// AArch64 architecture.
#[derive(Debug)]
pub struct Aarch64;

impl Architecture for Aarch64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    type PageTableLevel = PageTableLevel;

    fn gfn_from_pa(pa: Pa) -> Gfn {
        Gfn(pa.0 >> Self::PAGE_SHIFT)
    }

    fn pa_from_gfn(gfn: Gfn) -> Pa {
        Pa(gfn.0 << Self::PAGE_SHIFT)
    }

    fn pa_offset(pa: Pa) -> u64 {
        pa.0 & !Self::PAGE_MASK
    }

    fn va_offset(va: Va) -> u64 {
        Self::va_offset_for(va, PageTableLevel::L3)
    }

    fn va_offset_for(va: Va, level: Self::PageTableLevel) -> u64 {
        va.0 & (level.entry_span() - 1)
    }

    fn va_index_for(va: Va, level: Self::PageTableLevel) -> u64 {
        (va.0 >> level.shift()) & 0x1ff
    }

    fn translate_address(core: &SnapCore<Self>, va: Va, root: Pa) -> Result<Pa, SnapError> {
        Self::translation(core, va, root)
            .pa()
            .ok_or_else(|| SnapError::page_fault((va, root)))
    }
}

impl Aarch64 {
    /// Number of leading descriptors examined by [`score_table`].
    ///
    /// [`score_table`]: Self::score_table
    pub const SCORE_ENTRIES: usize = 5;

    /// Number of descriptors in a 4 KB table.
    pub const TABLE_ENTRIES: usize = 512;

    /// Sign-extends bit 47 of a virtual address.
    pub fn va_canonical(va: Va) -> Va {
        match (va.0 >> 47) & 1 {
            1 => Va(va.0 | 0xffff_0000_0000_0000),
            _ => Va(va.0 & 0x0000_ffff_ffff_ffff),
        }
    }

    /// Walks the page tables for `va`, recording every visited descriptor.
    ///
    /// The walk stops at the first invalid descriptor or unreadable table;
    /// in that case [`VaTranslation::pa`] is `None`.
    pub fn translation(core: &SnapCore<Self>, va: Va, root: Pa) -> VaTranslation {
        let mut entries = TranslationEntries::new();
        let mut table = Pa(root.0 & PageTableEntry::ADDRESS_MASK);
        let mut level = PageTableLevel::L0;

        loop {
            let entry_address = table + Self::va_index_for(va, level) * 8;
            let entry = match core.read_u64(AccessContext::direct(entry_address)) {
                Ok(value) => PageTableEntry(value),
                Err(err) => {
                    tracing::trace!(%va, %root, ?level, %entry_address, %err, "table not readable");
                    return VaTranslation { entries, pa: None };
                }
            };

            entries.push(TranslationEntry {
                level,
                entry,
                entry_address,
            });

            match entry.kind(level) {
                DescriptorKind::Invalid => return VaTranslation { entries, pa: None },
                DescriptorKind::Table => {
                    table = entry.address();
                    level = match level.next() {
                        Some(next) => next,
                        None => return VaTranslation { entries, pa: None },
                    };
                }
                DescriptorKind::Block | DescriptorKind::Page => {
                    let base = entry.address().align_down(level.entry_span());
                    let pa = base + Self::va_offset_for(va, level);
                    return VaTranslation {
                        entries,
                        pa: Some(pa),
                    };
                }
            }
        }
    }

    /// Decodes a table page into its descriptors.
    ///
    /// Copies the entries out, so `page` needs no particular alignment.
    /// Returns `None` unless `page` is exactly one table long.
    fn table_entries(page: &[u8]) -> Option<[PageTableEntry; Self::TABLE_ENTRIES]> {
        <[PageTableEntry; Self::TABLE_ENTRIES]>::read_from_bytes(page).ok()
    }

    /// Scores a page as a page table candidate.
    ///
    /// Reads the first [`SCORE_ENTRIES`] descriptors and counts those tagged
    /// as table or block.
    ///
    /// [`SCORE_ENTRIES`]: Self::SCORE_ENTRIES
    pub fn score_table(core: &SnapCore<Self>, pa: Pa) -> Result<TableScore, SnapError> {
        let page = core.read_page(Self::gfn_from_pa(pa))?;
        let entries = Self::table_entries(page)
            .ok_or(SnapError::Other("page is not a descriptor array"))?;

        let examined = Self::SCORE_ENTRIES.min(entries.len());
        let valid = entries[..examined]
            .iter()
            .filter(|entry| entry.is_table() || entry.is_block())
            .count();

        Ok(TableScore { valid, examined })
    }

    /// Checks whether the page at `pa` looks like a page table.
    ///
    /// A page is a candidate when at least 2 of its first 5 descriptors are
    /// tagged as table or block. Unreadable pages are not candidates.
    pub fn is_table_candidate(core: &SnapCore<Self>, pa: Pa) -> bool {
        Self::score_table(core, pa).is_ok_and(|score| score.is_candidate())
    }

    /// Enumerates all leaf mappings under `root` that intersect `range`.
    ///
    /// Mappings are reported in ascending VA order. The callback returns
    /// `false` to stop the enumeration. Unreadable tables are skipped and
    /// every table is visited at most once, so a malformed hierarchy cannot
    /// loop.
    ///
    /// Returns the number of reported mappings.
    pub fn enumerate_mappings(
        core: &SnapCore<Self>,
        root: Pa,
        range: Range<Va>,
        mut callback: impl FnMut(LeafMapping) -> bool,
    ) -> usize {
        let mut walker = MappingWalker {
            core,
            range,
            visited: HashSet::new(),
            reported: 0,
            callback: &mut callback,
        };

        let root = Pa(root.0 & PageTableEntry::ADDRESS_MASK);
        let _ = walker.walk(root, PageTableLevel::L0, Va(0));
        walker.reported
    }
}

struct MappingWalker<'a, F>
where
    F: FnMut(LeafMapping) -> bool,
{
    core: &'a SnapCore<Aarch64>,
    range: Range<Va>,
    visited: HashSet<Pa>,
    reported: usize,
    callback: &'a mut F,
}

impl<F> MappingWalker<'_, F>
where
    F: FnMut(LeafMapping) -> bool,
{
    fn walk(&mut self, table: Pa, level: PageTableLevel, base: Va) -> ControlFlow<()> {
        if !self.visited.insert(table) {
            tracing::debug!(%table, ?level, "table already visited");
            return ControlFlow::Continue(());
        }

        let page = match self.core.read_page(Aarch64::gfn_from_pa(table)) {
            Ok(page) => page,
            Err(err) => {
                tracing::trace!(%table, ?level, %err, "skipping unreadable table");
                return ControlFlow::Continue(());
            }
        };

        let entries = match Aarch64::table_entries(page) {
            Some(entries) => entries,
            None => return ControlFlow::Continue(()),
        };

        let span = level.entry_span();

        for (index, entry) in entries.iter().enumerate() {
            let va = Aarch64::va_canonical(base + (index as u64) * span);
            let end = va.0.checked_add(span).unwrap_or(u64::MAX);

            if va >= self.range.end || end <= self.range.start.0 {
                continue;
            }

            match entry.kind(level) {
                DescriptorKind::Invalid => {}
                DescriptorKind::Table => {
                    if let Some(next) = level.next() {
                        self.walk(entry.address(), next, va)?;
                    }
                }
                DescriptorKind::Block | DescriptorKind::Page => {
                    let size = match level.page_size() {
                        Some(size) => size,
                        None => continue,
                    };

                    let mapping = LeafMapping {
                        va,
                        pa: entry.address().align_down(span),
                        size,
                        entry: *entry,
                    };

                    self.reported += 1;
                    if !(self.callback)(mapping) {
                        return ControlFlow::Break(());
                    }
                }
            }
        }

        ControlFlow::Continue(())
    }
}
