//! Filling a [`PageRegistry`] from the Linux scanner.

use vmsnap_arch_aarch64::Aarch64;
use vmsnap_core::{MemoryAccess, PageSize};
use vmsnap_os_linux::{ArchAdapter, LinuxScanner, Region, RegionKind, TaskCandidate};

use super::{ContentType, MappingEvent, PageRegistry};

/// Label given to pages holding a `task_struct`.
pub const TASK_STRUCT_LABEL: &str = "task_struct";

/// Returns the page classification of a memory region.
pub fn region_content(region: &Region) -> ContentType {
    match region.kind {
        RegionKind::Code | RegionKind::Vdso => ContentType::Code,
        RegionKind::Stack => ContentType::Stack,
        RegionKind::Heap => ContentType::Heap,
        RegionKind::MappedFile | RegionKind::Library => ContentType::MappedFile,
        RegionKind::Data => ContentType::Data,
        RegionKind::ReadOnly => ContentType::ReadOnlyData,
        RegionKind::Anonymous => ContentType::from_access(region.access()),
    }
}

/// Records the user address space of `task`.
///
/// Every leaf mapping below the task's root table is recorded, then the
/// task's memory regions refine the classification of the recorded pages.
/// Kernel threads and tasks whose root table cannot be resolved record
/// nothing.
///
/// Returns the number of accepted mappings.
pub fn populate(
    registry: &mut PageRegistry,
    scanner: &LinuxScanner<'_, Aarch64>,
    task: &TaskCandidate,
) -> usize {
    let root = match scanner.process_root(task) {
        Some(root) => root,
        None => {
            tracing::debug!(pid = task.pid, name = %task.name, "no address space");
            return 0;
        }
    };

    let mut accepted = 0;
    let reported = Aarch64::enumerate_mappings(
        scanner.core(),
        root,
        <Aarch64 as ArchAdapter>::USER_RANGE,
        |mapping| {
            let event = MappingEvent {
                pid: task.pid,
                name: task.name.clone(),
                va: mapping.va,
                pa: mapping.pa,
                access: mapping.entry.access(),
                size: mapping.size,
                dirty: mapping.entry.dirty(),
            };

            if registry.record_mapping(event) {
                accepted += 1;
            }

            true
        },
    );

    let mut classified = 0;
    for region in scanner.regions(task) {
        classified += registry.record_region_info(
            task.pid,
            region.start..region.end,
            region_content(&region),
            region.access(),
        );
    }

    tracing::debug!(
        pid = task.pid,
        name = %task.name,
        %root,
        reported,
        accepted,
        classified,
        "address space recorded"
    );

    accepted
}

/// Records the address spaces of all `tasks`.
///
/// Returns the total number of accepted mappings.
pub fn populate_all<'t>(
    registry: &mut PageRegistry,
    scanner: &LinuxScanner<'_, Aarch64>,
    tasks: impl IntoIterator<Item = &'t TaskCandidate>,
) -> usize {
    tasks
        .into_iter()
        .filter(|task| !task.is_kernel_thread())
        .map(|task| populate(registry, scanner, task))
        .sum()
}

/// Records the page holding the `task_struct` of `task` as a labelled
/// kernel structure.
///
/// The page is recorded as a pid 0 mapping at its linear map address.
/// Returns `false` when the page falls outside the linear map or is
/// rejected by the registry.
pub fn mark_task(
    registry: &mut PageRegistry,
    scanner: &LinuxScanner<'_, Aarch64>,
    task: &TaskCandidate,
) -> bool {
    let va = match scanner.core().layout().pa_to_linear(task.pa) {
        Some(va) => va,
        None => return false,
    };

    let event = MappingEvent {
        pid: 0,
        name: String::from("kernel"),
        va,
        pa: task.pa,
        access: MemoryAccess::RW,
        size: PageSize::Size4K,
        dirty: false,
    };

    registry.record_mapping(event) && registry.mark_kernel_page(task.pa, Some(TASK_STRUCT_LABEL))
}

#[cfg(test)]
mod tests {
    use vmsnap_core::{MemoryLayout, Pa, PagedImage, SnapCore, SnapError, Va};
    use vmsnap_os_linux::{Profile, VmFlags};

    use super::*;
    use crate::registry::RegistryConfig;

    const RAM_BASE: u64 = 0x4000_0000;
    const PAGES: u64 = 64;

    const PAGE: u64 = 0b11;
    const AF: u64 = 1 << 10;
    const USER: u64 = 1 << 6;
    const READ_ONLY: u64 = 1 << 7;
    const UXN: u64 = 1 << 54;
    const SOFTWARE_DIRTY: u64 = 1 << 55;

    fn pa(page: u64, offset: u64) -> Pa {
        Pa(RAM_BASE + page * PagedImage::PAGE_SIZE + offset)
    }

    fn linear(pa: Pa) -> u64 {
        0xffff_0000_0000_0000 + (pa.0 - RAM_BASE)
    }

    struct ImageBuilder {
        image: PagedImage,
    }

    impl ImageBuilder {
        fn new() -> Self {
            Self {
                image: PagedImage::new(PAGES * PagedImage::PAGE_SIZE),
            }
        }

        fn write_bytes(&mut self, pa: Pa, data: &[u8]) -> Result<(), SnapError> {
            let offset = pa.0 - RAM_BASE;
            let index = offset / PagedImage::PAGE_SIZE;
            let in_page = (offset % PagedImage::PAGE_SIZE) as usize;

            let mut page = match self.image.page(index) {
                Some(page) => page.to_vec(),
                None => vec![0u8; PagedImage::PAGE_SIZE as usize],
            };

            page[in_page..in_page + data.len()].copy_from_slice(data);
            self.image.add_page(index, &page)
        }

        fn write_u64(&mut self, pa: Pa, value: u64) -> Result<(), SnapError> {
            self.write_bytes(pa, &value.to_le_bytes())
        }

        /// Maps a user page at `va` through the tables in pages 1 to 4.
        fn map_user_page(&mut self, va: u64, target: Pa, attributes: u64) -> Result<(), SnapError> {
            let index = |shift: u64| (va >> shift) & 0x1ff;

            self.write_u64(pa(1, index(39) * 8), pa(2, 0).0 | PAGE)?;
            self.write_u64(pa(2, index(30) * 8), pa(3, 0).0 | PAGE)?;
            self.write_u64(pa(3, index(21) * 8), pa(4, 0).0 | PAGE)?;
            self.write_u64(pa(4, index(12) * 8), target.0 | PAGE | AF | USER | attributes)
        }

        fn build(self) -> SnapCore<Aarch64> {
            SnapCore::new(self.image, MemoryLayout::default())
        }
    }

    /// A single task with a two page code region and one data page outside
    /// any region.
    fn snapshot(profile: &Profile) -> Result<SnapCore<Aarch64>, SnapError> {
        let mut builder = ImageBuilder::new();

        let task = pa(10, 0);
        let mm = pa(20, 0);
        let vma = pa(21, 0);

        let __task = &profile.task;
        let mut comm = [0u8; 16];
        comm[..4].copy_from_slice(b"bash");

        builder.write_bytes(task + __task.pid, &100u32.to_le_bytes())?;
        builder.write_bytes(task + __task.comm, &comm)?;
        builder.write_u64(task + __task.tasks, linear(task + __task.tasks))?;
        builder.write_u64(task + __task.tasks + 8, linear(task + __task.tasks))?;
        builder.write_u64(task + __task.mm, linear(mm))?;

        builder.write_u64(mm + profile.mm.pgd, linear(pa(1, 0)))?;
        builder.write_u64(mm, linear(vma))?;

        let __vma = &profile.vma;
        builder.write_u64(vma + __vma.vm_start, 0x40_0000)?;
        builder.write_u64(vma + __vma.vm_end, 0x40_2000)?;
        builder.write_u64(vma + __vma.vm_flags, (VmFlags::READ | VmFlags::EXEC).bits())?;
        builder.write_u64(vma + __vma.vm_file, 0xffff_0000_dead_0000)?;

        builder.map_user_page(0x40_0000, pa(30, 0), READ_ONLY)?;
        builder.map_user_page(0x40_1000, pa(31, 0), READ_ONLY)?;
        builder.map_user_page(0x50_0000, pa(32, 0), UXN | SOFTWARE_DIRTY)?;

        // Filled so the pages exist in the image.
        for page in 30..33 {
            builder.write_u64(pa(page, 0), page)?;
        }

        Ok(builder.build())
    }

    #[test]
    fn populate_records_and_classifies() -> Result<(), SnapError> {
        let profile = Profile::arm64_5_15();
        let core = snapshot(&profile)?;
        let scanner = LinuxScanner::new(&core, profile);

        let task = scanner
            .read_task(pa(10, 0))
            .ok_or(SnapError::Other("no task"))?;

        let mut registry = PageRegistry::new(RegistryConfig::default());
        assert_eq!(populate(&mut registry, &scanner, &task), 3);

        let stats = registry.stats();
        assert_eq!(stats.total_pages, 3);
        assert_eq!(stats.total_mappings, 3);
        assert_eq!(stats.processes, 1);
        assert_eq!(stats.pages_with(ContentType::Code), 2);
        assert_eq!(stats.pages_with(ContentType::Data), 1);

        assert_eq!(
            registry.translate_va(100, Va(0x40_1010)),
            Some(pa(31, 0x10))
        );

        let code = registry.mapping(100, Va(0x40_0000));
        assert_eq!(code.map(|mapping| mapping.access), Some(MemoryAccess::RX));
        assert_eq!(
            code.and_then(|mapping| mapping.region.clone()),
            Some(Va(0x40_0000)..Va(0x40_2000))
        );

        let data = registry.page(pa(32, 0));
        assert_eq!(data.map(|page| page.is_dirty()), Some(true));
        assert_eq!(data.map(|page| page.content()), Some(ContentType::Data));

        // Recording the same address space again changes nothing.
        populate(&mut registry, &scanner, &task);
        assert_eq!(registry.stats(), stats);

        Ok(())
    }

    #[test]
    fn task_struct_page_is_labelled() -> Result<(), SnapError> {
        let profile = Profile::arm64_5_15();
        let core = snapshot(&profile)?;
        let scanner = LinuxScanner::new(&core, profile);

        let task = scanner
            .read_task(pa(10, 0))
            .ok_or(SnapError::Other("no task"))?;

        let mut registry = PageRegistry::new(RegistryConfig::default());
        assert!(mark_task(&mut registry, &scanner, &task));

        let page = registry.page(task.pa);
        assert_eq!(page.and_then(|page| page.label()), Some(TASK_STRUCT_LABEL));
        assert_eq!(page.map(|page| page.is_kernel()), Some(true));
        assert_eq!(registry.stats().pages_with(ContentType::KernelStructure), 1);

        Ok(())
    }

    #[test]
    fn kernel_threads_are_skipped() -> Result<(), SnapError> {
        let profile = Profile::arm64_5_15();
        let core = snapshot(&profile)?;
        let scanner = LinuxScanner::new(&core, profile);

        let mut task = scanner
            .read_task(pa(10, 0))
            .ok_or(SnapError::Other("no task"))?;
        task.mm = Va(0);

        let mut registry = PageRegistry::new(RegistryConfig::default());
        assert_eq!(populate_all(&mut registry, &scanner, [&task]), 0);
        assert!(registry.is_empty());

        Ok(())
    }
}
