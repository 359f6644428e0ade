//! Page registry.
//!
//! Aggregates translation results from every process into one record per
//! physical page: who maps it, at which virtual address, with which rights,
//! and what the page holds. Three indices are kept consistent after every
//! mutation:
//!
//! - physical address -> [`PageInfo`] (the arena, an [`IndexMap`]),
//! - `(pid, page-aligned va)` -> physical address,
//! - pid -> set of physical addresses.
//!
//! Running aggregates are maintained by folding [`StatsEvent`]s into a
//! [`RegistryStats`], so [`PageRegistry::stats`] never rescans the records.
//!
//! # Content classification
//!
//! A page's content is taken from region information when any mapping has
//! it ([`PageRegistry::record_region_info`]). Otherwise it falls back to
//! the permissions of the first mapping, see [`ContentType::from_access`].
//! The fallback is coarse and never overrides region-derived data.

#[cfg(all(feature = "os-linux", feature = "arch-aarch64"))]
pub mod linux;
mod stats;
mod view;

use std::{
    collections::{HashMap, HashSet},
    fmt::Write as _,
    ops::Range,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use vmsnap_core::{MemoryAccess, MemoryLayout, Pa, PageSize, Va};

pub use self::{
    stats::{RegistryStats, StatsEvent},
    view::CompactedView,
};

/// What a physical page holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// Executable code.
    Code,

    /// Read-only data.
    ReadOnlyData,

    /// Writable data.
    Data,

    /// Stack.
    Stack,

    /// Heap.
    Heap,

    /// File-backed mapping.
    MappedFile,

    /// A labelled kernel structure.
    KernelStructure,

    /// Nothing is known about the page.
    Unclassified,
}

impl ContentType {
    /// Number of classifications.
    pub const COUNT: usize = 8;

    /// All classifications.
    pub const ALL: [ContentType; Self::COUNT] = [
        Self::Code,
        Self::ReadOnlyData,
        Self::Data,
        Self::Stack,
        Self::Heap,
        Self::MappedFile,
        Self::KernelStructure,
        Self::Unclassified,
    ];

    /// Returns the histogram bucket of the classification.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Fallback classification from mapping permissions.
    ///
    /// `x` without `w` is code, neither is read-only data, `w` without `x`
    /// is data. Writable and executable pages are unclassified.
    pub fn from_access(access: MemoryAccess) -> Self {
        match (
            access.contains(MemoryAccess::W),
            access.contains(MemoryAccess::X),
        ) {
            (false, true) => Self::Code,
            (false, false) => Self::ReadOnlyData,
            (true, false) => Self::Data,
            (true, true) => Self::Unclassified,
        }
    }

    /// Returns a short display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::ReadOnlyData => "rodata",
            Self::Data => "data",
            Self::Stack => "stack",
            Self::Heap => "heap",
            Self::MappedFile => "file",
            Self::KernelStructure => "kernel",
            Self::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Mappings at or above this physical address are dropped.
    ///
    /// Filters out device and MMIO mappings that would otherwise be
    /// recorded as RAM.
    pub max_physical_address: Pa,
}

impl RegistryConfig {
    /// Amount of RAM assumed above the RAM base by default.
    pub const DEFAULT_RAM_SIZE: u64 = 4 << 30;

    /// Accepts physical addresses up to `DEFAULT_RAM_SIZE` past the RAM base
    /// of `layout`.
    pub fn for_layout(layout: &MemoryLayout) -> Self {
        Self {
            max_physical_address: layout.ram_base + Self::DEFAULT_RAM_SIZE,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::for_layout(&MemoryLayout::default())
    }
}

/// A translation result to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEvent {
    /// Process id.
    pub pid: u32,

    /// Process name.
    pub name: String,

    /// Virtual address.
    pub va: Va,

    /// Physical address.
    pub pa: Pa,

    /// Access rights of the mapping.
    pub access: MemoryAccess,

    /// Size class of the mapping.
    pub size: PageSize,

    /// Whether the page was written to.
    pub dirty: bool,
}

/// One virtual mapping of a physical page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMapping {
    /// Process id.
    pub pid: u32,

    /// Process name.
    pub name: String,

    /// Virtual address, aligned to `size`.
    pub va: Va,

    /// Size class of the mapping.
    ///
    /// May be smaller than the record holding it, when a large record covers
    /// the mapped range.
    pub size: PageSize,

    /// Offset of the mapped range inside its record.
    pub offset: u64,

    /// Access rights.
    pub access: MemoryAccess,

    /// Section classification.
    pub content: ContentType,

    /// Bounds of the region the mapping belongs to, if known.
    pub region: Option<Range<Va>>,
}

impl PageMapping {
    /// Checks whether the classification came from region information.
    pub fn has_region(&self) -> bool {
        self.region.is_some()
    }
}

/// Everything known about one physical page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pa: Pa,
    size: PageSize,
    mappings: Vec<PageMapping>,
    content: ContentType,
    kernel: bool,
    label: Option<String>,
    hit_count: u64,
    dirty: bool,
}

impl PageInfo {
    fn new(pa: Pa, size: PageSize) -> Self {
        Self {
            pa,
            size,
            mappings: Vec::new(),
            content: ContentType::Unclassified,
            kernel: false,
            label: None,
            hit_count: 0,
            dirty: false,
        }
    }

    /// Returns the base physical address.
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Returns the size class.
    pub fn size(&self) -> PageSize {
        self.size
    }

    /// Returns the mappings of the page.
    pub fn mappings(&self) -> &[PageMapping] {
        &self.mappings
    }

    /// Returns the content classification.
    pub fn content(&self) -> ContentType {
        self.content
    }

    /// Checks whether the page is kernel memory.
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Returns the kernel structure label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Returns the number of accepted mapping events for the page.
    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    /// Checks whether any mapping reported the page as written.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Checks whether the page has more than one mapping.
    pub fn is_shared(&self) -> bool {
        self.mappings.len() > 1
    }

    /// Checks whether `pa` lies inside the page.
    pub fn contains(&self, pa: Pa) -> bool {
        self.pa <= pa && pa - self.pa < self.size.bytes()
    }

    fn mapping(&self, pid: u32, va: Va) -> Option<&PageMapping> {
        self.mappings
            .iter()
            .find(|mapping| mapping.pid == pid && mapping.va == va)
    }

    fn mapping_mut(&mut self, pid: u32, va: Va) -> Option<&mut PageMapping> {
        self.mappings
            .iter_mut()
            .find(|mapping| mapping.pid == pid && mapping.va == va)
    }

    fn maps_pid(&self, pid: u32) -> bool {
        self.mappings.iter().any(|mapping| mapping.pid == pid)
    }

    fn derive_content(&self) -> ContentType {
        if self.label.is_some() {
            return ContentType::KernelStructure;
        }

        if let Some(mapping) = self.mappings.iter().find(|mapping| mapping.has_region()) {
            return mapping.content;
        }

        match self.mappings.first() {
            Some(mapping) => mapping.content,
            None => ContentType::Unclassified,
        }
    }

    /// Recomputes the content classification.
    fn refresh(&mut self) -> Option<StatsEvent> {
        let from = self.content;
        let to = self.derive_content();

        if from == to {
            return None;
        }

        self.content = to;
        Some(StatsEvent::ContentChanged { from, to })
    }

    /// Returns a multi-line description of the page for display.
    pub fn summary(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "Physical page {} ({})", self.pa, self.size);
        let _ = writeln!(out, "  content: {}", self.content);

        if self.kernel {
            match &self.label {
                Some(label) => {
                    let _ = writeln!(out, "  kernel: {label}");
                }
                None => {
                    let _ = writeln!(out, "  kernel: yes");
                }
            }
        }

        let _ = writeln!(
            out,
            "  hits: {}, dirty: {}",
            self.hit_count,
            if self.dirty { "yes" } else { "no" }
        );

        if self.mappings.is_empty() {
            let _ = writeln!(out, "  no mappings");
        }

        for mapping in &self.mappings {
            let _ = write!(
                out,
                "  pid {} ({}) {} {} {}",
                mapping.pid, mapping.name, mapping.va, mapping.access, mapping.content
            );

            if let Some(region) = &mapping.region {
                let _ = write!(out, " [{}-{}]", region.start, region.end);
            }

            out.push('\n');
        }

        out
    }
}

/// The canonical per-page view of a snapshot.
///
/// Records never overlap. A mapping whose range lies inside an existing
/// larger record is added to that record, and a new large record absorbs
/// the smaller records it covers.
#[derive(Debug, Default)]
pub struct PageRegistry {
    config: RegistryConfig,
    pages: IndexMap<Pa, PageInfo>,
    by_va: HashMap<(u32, Va), Pa>,
    by_pid: HashMap<u32, HashSet<Pa>>,
    stats: RegistryStats,
}

impl PageRegistry {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns a snapshot of the running aggregates.
    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    /// Returns the number of page records.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Checks whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterates over the page records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PageInfo> {
        self.pages.values()
    }

    fn emit(stats: &mut RegistryStats, event: Option<StatsEvent>) {
        if let Some(event) = event {
            *stats = stats.apply(event);
        }
    }

    /// Records a translation result.
    ///
    /// Physical addresses at or above [`max_physical_address`] are dropped
    /// and `false` is returned. Otherwise the mapping is keyed by `(pid,
    /// va)`, with `va` aligned to the mapping size: recording the same key
    /// again updates it in place, and recording it with a different
    /// physical address moves it to the new page.
    ///
    /// [`max_physical_address`]: RegistryConfig::max_physical_address
    pub fn record_mapping(&mut self, event: MappingEvent) -> bool {
        if event.pa >= self.config.max_physical_address {
            tracing::trace!(pid = event.pid, va = %event.va, pa = %event.pa, "mapping dropped");
            Self::emit(&mut self.stats, Some(StatsEvent::Dropped));
            return false;
        }

        let bytes = event.size.bytes();
        let pa = event.pa.align_down(bytes);
        let va = event.va.align_down(bytes);
        let key = (event.pid, va);

        let base = self.record_for(pa, event.size);
        let offset = pa - base;

        match self.by_va.get(&key).copied() {
            Some(old) if old == base => {
                let unchanged = self
                    .pages
                    .get(&base)
                    .and_then(|page| page.mapping(event.pid, va))
                    .is_some_and(|mapping| mapping.offset == offset && mapping.size == event.size);

                if unchanged {
                    if let Some(page) = self.pages.get_mut(&base) {
                        page.hit_count += 1;
                        page.dirty |= event.dirty;

                        if let Some(mapping) = page.mapping_mut(event.pid, va) {
                            mapping.name = event.name;
                            mapping.access = event.access;

                            if !mapping.has_region() {
                                mapping.content = ContentType::from_access(event.access);
                            }
                        }

                        Self::emit(&mut self.stats, page.refresh());
                    }

                    return true;
                }

                self.remove_mapping(old, event.pid, va);
            }
            Some(old) => self.remove_mapping(old, event.pid, va),
            None => {}
        }

        let page = match self.pages.get_mut(&base) {
            Some(page) => page,
            None => return false,
        };

        page.mappings.push(PageMapping {
            pid: event.pid,
            name: event.name,
            va,
            size: event.size,
            offset,
            access: event.access,
            content: ContentType::from_access(event.access),
            region: None,
        });
        page.hit_count += 1;
        page.dirty |= event.dirty;

        Self::emit(
            &mut self.stats,
            Some(StatsEvent::MappingAdded {
                count_after: page.mappings.len(),
            }),
        );
        Self::emit(&mut self.stats, page.refresh());

        self.by_va.insert(key, base);

        let pages = self.by_pid.entry(event.pid).or_insert_with(|| {
            Self::emit(&mut self.stats, Some(StatsEvent::ProcessAdded));
            HashSet::new()
        });
        pages.insert(base);

        true
    }

    /// Returns the base of the record that holds a mapping of `size` at
    /// `pa`.
    ///
    /// An existing record of at least `size` that covers `pa` is reused.
    /// Otherwise a new record is created, and the smaller records inside its
    /// range are folded into it.
    fn record_for(&mut self, pa: Pa, size: PageSize) -> Pa {
        let existing = PageSize::ALL
            .iter()
            .filter(|&&candidate| candidate >= size)
            .map(|candidate| (pa.align_down(candidate.bytes()), *candidate))
            .find(|(base, candidate)| {
                self.pages
                    .get(base)
                    .is_some_and(|page| page.size == *candidate)
            });

        if let Some((base, _)) = existing {
            return base;
        }

        tracing::trace!(%pa, %size, "page created");
        Self::emit(&mut self.stats, Some(StatsEvent::PageCreated));

        let mut page = PageInfo::new(pa, size);

        if size != PageSize::Size4K {
            let end = pa + size.bytes();
            let covered: Vec<Pa> = self
                .pages
                .keys()
                .copied()
                .filter(|&base| pa <= base && base < end)
                .collect();

            for base in covered {
                if let Some(absorbed) = self.pages.shift_remove(&base) {
                    self.absorb(&mut page, absorbed);
                }
            }

            if page.kernel {
                Self::emit(&mut self.stats, Some(StatsEvent::KernelMarked));
            }
        }

        Self::emit(&mut self.stats, page.refresh());
        self.pages.insert(pa, page);
        pa
    }

    /// Moves the mappings of `absorbed` into the covering record `page`.
    fn absorb(&mut self, page: &mut PageInfo, absorbed: PageInfo) {
        tracing::trace!(pa = %absorbed.pa, into = %page.pa, "page absorbed");

        let delta = absorbed.pa - page.pa;
        let mut remaining = absorbed.mappings.len();

        for mut mapping in absorbed.mappings {
            remaining -= 1;
            Self::emit(
                &mut self.stats,
                Some(StatsEvent::MappingRemoved {
                    count_after: remaining,
                }),
            );

            mapping.offset += delta;
            self.by_va.insert((mapping.pid, mapping.va), page.pa);

            if let Some(pages) = self.by_pid.get_mut(&mapping.pid) {
                pages.remove(&absorbed.pa);
                pages.insert(page.pa);
            }

            page.mappings.push(mapping);
            Self::emit(
                &mut self.stats,
                Some(StatsEvent::MappingAdded {
                    count_after: page.mappings.len(),
                }),
            );
        }

        Self::emit(
            &mut self.stats,
            Some(StatsEvent::PageAbsorbed {
                content: absorbed.content,
                kernel: absorbed.kernel,
            }),
        );

        page.hit_count += absorbed.hit_count;
        page.dirty |= absorbed.dirty;
        page.kernel |= absorbed.kernel;

        if page.label.is_none() {
            page.label = absorbed.label;
        }
    }

    /// Removes the mapping `(pid, va)` from the page at `pa`.
    fn remove_mapping(&mut self, pa: Pa, pid: u32, va: Va) {
        self.by_va.remove(&(pid, va));

        let page = match self.pages.get_mut(&pa) {
            Some(page) => page,
            None => return,
        };

        let before = page.mappings.len();
        page.mappings
            .retain(|mapping| !(mapping.pid == pid && mapping.va == va));

        if page.mappings.len() == before {
            return;
        }

        tracing::trace!(pid, %va, %pa, "mapping moved");

        Self::emit(
            &mut self.stats,
            Some(StatsEvent::MappingRemoved {
                count_after: page.mappings.len(),
            }),
        );
        Self::emit(&mut self.stats, page.refresh());

        if !page.maps_pid(pid) {
            if let Some(pages) = self.by_pid.get_mut(&pid) {
                pages.remove(&pa);
            }
        }
    }

    /// Applies region information to existing mappings of `pid` inside
    /// `range`.
    ///
    /// Overwrites classification, permissions and region bounds; never
    /// creates mappings. Returns the number of updated mappings.
    pub fn record_region_info(
        &mut self,
        pid: u32,
        range: Range<Va>,
        content: ContentType,
        access: MemoryAccess,
    ) -> usize {
        let targets = self.mappings_in(pid, &range);

        for &(pa, va) in &targets {
            if let Some(page) = self.pages.get_mut(&pa) {
                if let Some(mapping) = page.mapping_mut(pid, va) {
                    mapping.content = content;
                    mapping.access = access;
                    mapping.region = Some(range.clone());
                }

                Self::emit(&mut self.stats, page.refresh());
            }
        }

        targets.len()
    }

    /// Collects the `(pa, va)` keys of the mappings of `pid` that start
    /// inside `range`.
    ///
    /// Walks whichever is smaller: the pages of the range or the pages of
    /// the process.
    fn mappings_in(&self, pid: u32, range: &Range<Va>) -> Vec<(Pa, Va)> {
        let pid_pages = match self.by_pid.get(&pid) {
            Some(pages) => pages,
            None => return Vec::new(),
        };

        let start = range.start.align_down(PageSize::Size4K.bytes());
        let range_pages = match range.end > start {
            true => (range.end - start).div_ceil(PageSize::Size4K.bytes()),
            false => 0,
        };

        let mut result = Vec::new();

        if range_pages <= pid_pages.len() as u64 {
            let mut seen = HashSet::new();

            for index in 0..range_pages {
                let va = start + index * PageSize::Size4K.bytes();

                if let Some((page, mapping, _)) = self.lookup_va(pid, va) {
                    if range.contains(&mapping.va) && seen.insert(mapping.va) {
                        result.push((page.pa, mapping.va));
                    }
                }
            }
        }
        else {
            for pa in pid_pages {
                if let Some(page) = self.pages.get(pa) {
                    result.extend(
                        page.mappings
                            .iter()
                            .filter(|mapping| mapping.pid == pid && range.contains(&mapping.va))
                            .map(|mapping| (*pa, mapping.va)),
                    );
                }
            }

            result.sort_unstable_by_key(|&(_, va)| va);
        }

        result
    }

    /// Marks the page containing `pa` as kernel memory.
    ///
    /// With a label, the page is reclassified as
    /// [`ContentType::KernelStructure`]. Returns `false` if no record covers
    /// `pa`.
    pub fn mark_kernel_page(&mut self, pa: Pa, label: Option<&str>) -> bool {
        let base = match self.page(pa) {
            Some(page) => page.pa,
            None => return false,
        };

        let page = match self.pages.get_mut(&base) {
            Some(page) => page,
            None => return false,
        };

        if !page.kernel {
            page.kernel = true;
            Self::emit(&mut self.stats, Some(StatsEvent::KernelMarked));
        }

        if let Some(label) = label {
            page.label = Some(label.to_owned());
        }

        Self::emit(&mut self.stats, page.refresh());
        true
    }

    // region: Queries

    /// Returns the record covering `pa`.
    ///
    /// Finds 4 KB records as well as 2 MB and 1 GB records containing `pa`.
    pub fn page(&self, pa: Pa) -> Option<&PageInfo> {
        PageSize::ALL.iter().find_map(|size| {
            self.pages
                .get(&pa.align_down(size.bytes()))
                .filter(|page| page.size == *size)
        })
    }

    /// Finds the mapping of `pid` covering `va`, its record and the offset
    /// of `va` inside the record.
    fn lookup_va(&self, pid: u32, va: Va) -> Option<(&PageInfo, &PageMapping, u64)> {
        PageSize::ALL.iter().find_map(|size| {
            let base = va.align_down(size.bytes());
            let pa = self.by_va.get(&(pid, base))?;
            let page = self.pages.get(pa)?;
            let mapping = page.mapping(pid, base).filter(|mapping| mapping.size == *size)?;
            Some((page, mapping, mapping.offset + (va - base)))
        })
    }

    /// Returns the record mapped at `va` by `pid` and the offset of `va`
    /// inside it.
    pub fn page_for_va(&self, pid: u32, va: Va) -> Option<(&PageInfo, u64)> {
        self.lookup_va(pid, va)
            .map(|(page, _, offset)| (page, offset))
    }

    /// Returns the mapping of `pid` covering `va`.
    pub fn mapping(&self, pid: u32, va: Va) -> Option<&PageMapping> {
        self.lookup_va(pid, va).map(|(_, mapping, _)| mapping)
    }

    /// Translates `va` of `pid` to a physical address, keeping the offset.
    pub fn translate_va(&self, pid: u32, va: Va) -> Option<Pa> {
        let (page, _, offset) = self.lookup_va(pid, va)?;
        Some(page.pa + offset)
    }

    /// Returns the offset of `va` inside the page that `pid` maps there.
    pub fn mapping_offset(&self, pid: u32, va: Va) -> Option<u64> {
        self.lookup_va(pid, va).map(|(_, _, offset)| offset)
    }

    /// Returns the pages mapped by `pid`, sorted by physical address.
    pub fn process_pages(&self, pid: u32) -> Vec<&PageInfo> {
        let mut result: Vec<_> = match self.by_pid.get(&pid) {
            Some(pages) => pages.iter().filter_map(|pa| self.pages.get(pa)).collect(),
            None => Vec::new(),
        };

        result.sort_unstable_by_key(|page| page.pa);
        result
    }

    /// Returns the pages with more than one mapping.
    pub fn shared_pages(&self) -> impl Iterator<Item = &PageInfo> {
        self.pages.values().filter(|page| page.is_shared())
    }

    /// Returns the pids with at least one recorded mapping, sorted.
    pub fn pids(&self) -> Vec<u32> {
        let mut result: Vec<_> = self
            .by_pid
            .iter()
            .filter(|(_, pages)| !pages.is_empty())
            .map(|(&pid, _)| pid)
            .collect();

        result.sort_unstable();
        result
    }

    /// Builds a compacted view over the records accepted by `filter`.
    pub fn compacted_view(&self, filter: impl Fn(&PageInfo) -> bool) -> CompactedView {
        CompactedView::new(
            self.pages
                .values()
                .filter(|page| filter(page))
                .map(|page| (page.pa, page.size.bytes()))
                .collect(),
        )
    }

    // endregion
}
