//! Symbol-free discovery of Linux kernel structures in a memory snapshot.
//!
//! Without debug symbols, kernel objects are located by pattern matching
//! raw memory against the field offsets of a [`Profile`]. Every discovery
//! function is best-effort:
//!
//! - false positives occur when unrelated data happens to hold the sought
//!   pid next to a printable name;
//! - false negatives occur when an object sits at a slab sub-offset the
//!   profile does not list, or when its page is missing from the image.
//!
//! "Not found" is reported as `None` or an empty list, never as an error.

mod arch;
mod error;
mod maple_tree;
mod profile;
mod region;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use vmsnap_core::{
    AccessContext, Architecture, Pa, PagedImage, SnapCore, SnapError, TranslationMechanism, Va,
};

pub use self::{
    arch::ArchAdapter,
    error::LinuxError,
    maple_tree::{MapleLimits, MapleTree},
    profile::{MapleOffsets, MmOffsets, Profile, SlabLayout, TaskOffsets, VmaIndex, VmaOffsets},
    region::{MmBounds, Region, RegionKind, VmFlags, classify},
};

/// Length of `task_struct.comm`.
pub const TASK_COMM_LEN: usize = 16;

/// Scanner limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Maximum number of page table candidates collected by a full scan.
    pub table_candidate_limit: usize,

    /// Maximum number of tasks followed through the process list.
    pub task_list_limit: usize,

    /// Maximum number of maple tree nodes, or list VMAs, read per process.
    pub maple_node_budget: usize,

    /// Maximum maple tree depth.
    pub maple_max_depth: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            table_candidate_limit: 100,
            task_list_limit: 10000,
            maple_node_budget: 4096,
            maple_max_depth: 8,
        }
    }
}

impl ScannerConfig {
    fn maple_limits(&self) -> MapleLimits {
        MapleLimits {
            node_budget: self.maple_node_budget,
            max_depth: self.maple_max_depth,
        }
    }
}

/// A `task_struct` found in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCandidate {
    /// Physical address of the `task_struct`.
    pub pa: Pa,

    /// `task_struct.pid`.
    pub pid: u32,

    /// `task_struct.comm`.
    pub name: String,

    /// `task_struct.mm`; null for kernel threads.
    pub mm: Va,

    /// `task_struct.real_parent`.
    pub parent: Va,

    /// `task_struct.tasks.next`.
    pub tasks_next: Va,

    /// `task_struct.tasks.prev`.
    pub tasks_prev: Va,
}

impl TaskCandidate {
    /// Checks whether the task is a kernel thread (no user address space).
    pub fn is_kernel_thread(&self) -> bool {
        self.mm.is_null()
    }
}

/// Validates a raw `comm` field.
///
/// Every byte must be printable ASCII or NUL, and at least one byte must be
/// printable. Returns the name up to the first NUL.
pub fn parse_comm(comm: &[u8]) -> Option<String> {
    if !comm.iter().all(|&b| b == 0 || (0x20..0x7f).contains(&b)) {
        return None;
    }

    let len = memchr::memchr(0, comm).unwrap_or(comm.len());
    if len == 0 {
        return None;
    }

    Some(String::from_utf8_lossy(&comm[..len]).into_owned())
}

/// Heuristic discovery of Linux kernel objects.
///
/// Physical scans read the image directly. Kernel pointers are resolved
/// through the linear map; addresses outside it need a kernel page table
/// root, see [`with_kernel_root`].
///
/// [`with_kernel_root`]: Self::with_kernel_root
pub struct LinuxScanner<'a, Arch>
where
    Arch: Architecture + ArchAdapter,
{
    core: &'a SnapCore<Arch>,
    profile: Profile,
    config: ScannerConfig,
    kernel_root: Option<Pa>,
}

impl<'a, Arch> LinuxScanner<'a, Arch>
where
    Arch: Architecture + ArchAdapter,
{
    /// Creates a new scanner.
    pub fn new(core: &'a SnapCore<Arch>, profile: Profile) -> Self {
        Self {
            core,
            profile,
            config: ScannerConfig::default(),
            kernel_root: None,
        }
    }

    /// Sets the scanner limits.
    pub fn with_config(self, config: ScannerConfig) -> Self {
        Self { config, ..self }
    }

    /// Sets the kernel page table root (`TTBR1_EL1` on ARM64).
    pub fn with_kernel_root(self, kernel_root: Pa) -> Self {
        Self {
            kernel_root: Some(kernel_root),
            ..self
        }
    }

    /// Returns the snapshot.
    pub fn core(&self) -> &'a SnapCore<Arch> {
        self.core
    }

    /// Returns the profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Returns the scanner limits.
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Returns the kernel page table root, if known.
    pub fn kernel_root(&self) -> Option<Pa> {
        self.kernel_root
    }

    /// Returns an access context for a kernel virtual address.
    pub fn kernel_context(&self, va: Va) -> AccessContext {
        AccessContext {
            address: va.0,
            mechanism: TranslationMechanism::Paging {
                root: self.kernel_root,
            },
        }
    }

    // region: Process descriptors

    /// Reads and validates a `task_struct` at `pa`.
    ///
    /// The name must pass [`parse_comm`] and both `tasks` links must be
    /// kernel pointers.
    pub fn read_task(&self, pa: Pa) -> Option<TaskCandidate> {
        let __task = &self.profile.task;

        let pid = self.core.read_u32(pa + __task.pid).ok()?;

        let mut comm = [0u8; TASK_COMM_LEN];
        self.core.read(pa + __task.comm, &mut comm).ok()?;
        let name = parse_comm(&comm)?;

        let tasks_next = self.core.read_va(pa + __task.tasks).ok()?;
        let tasks_prev = self.core.read_va(pa + __task.tasks + 8).ok()?;

        if tasks_next < Arch::KERNEL_BASE || tasks_prev < Arch::KERNEL_BASE {
            return None;
        }

        let mm = self.core.read_va(pa + __task.mm).ok()?;
        let parent = self.core.read_va(pa + __task.parent).ok()?;

        Some(TaskCandidate {
            pa,
            pid,
            name,
            mm,
            parent,
            tasks_next,
            tasks_prev,
        })
    }

    /// Iterates over every slab slot of every loaded page.
    fn slots(&self) -> impl Iterator<Item = Pa> + '_ {
        let image = self.core.image();
        let layout = self.core.layout();

        (0..image.page_count())
            .filter(move |&index| image.contains_page(index))
            .flat_map(move |index| {
                let base = layout.pa_from_offset(index * PagedImage::PAGE_SIZE);
                self.profile
                    .slab
                    .sub_offsets
                    .iter()
                    .map(move |&sub_offset| base + sub_offset)
            })
    }

    fn pid_at(&self, slot: Pa) -> Option<u32> {
        self.core.read_u32(slot + self.profile.task.pid).ok()
    }

    /// Finds the `task_struct` of a specific pid.
    ///
    /// Scans every loaded page at each slab sub-offset and stops at the first
    /// slot whose pid matches and whose name is plausible.
    pub fn find_task_by_pid(&self, pid: u32) -> Option<TaskCandidate> {
        let result = self
            .slots()
            .filter(|&slot| self.pid_at(slot) == Some(pid))
            .find_map(|slot| self.read_task(slot));

        match &result {
            Some(task) => tracing::debug!(pid, pa = %task.pa, name = %task.name, "task found"),
            None => tracing::debug!(pid, "task not found"),
        }

        result
    }

    /// Collects plausible `task_struct` objects with pids in
    /// `1..=pid_max`, up to `limit` results.
    pub fn enumerate_tasks(&self, limit: usize) -> Vec<TaskCandidate> {
        let pid_max = self.profile.slab.pid_max;

        let result: Vec<_> = self
            .slots()
            .filter(|&slot| {
                self.pid_at(slot)
                    .is_some_and(|pid| (1..=pid_max).contains(&pid))
            })
            .filter_map(|slot| self.read_task(slot))
            .take(limit)
            .collect();

        tracing::debug!(count = result.len(), limit, "tasks enumerated");
        result
    }

    /// Finds the idle task of the boot CPU (`init_task`, pid 0, `swapper`).
    pub fn find_init_task(&self) -> Option<TaskCandidate> {
        self.slots()
            .filter(|&slot| self.pid_at(slot) == Some(0))
            .filter_map(|slot| self.read_task(slot))
            .find(|task| task.name.starts_with("swapper"))
    }

    /// Resolves a list link to the `task_struct` it is embedded in, given
    /// the offset of the `list_head` member.
    fn task_from_link(&self, link: Va, member: u64) -> Option<Pa> {
        let task = link - member;

        match self.core.translate_access_context(self.kernel_context(task)) {
            Ok(pa) => Some(pa),
            Err(err) => {
                tracing::trace!(%link, %err, "task link not translatable");
                None
            }
        }
    }

    fn follow(
        &self,
        start: &TaskCandidate,
        visited: &mut HashSet<Pa>,
        result: &mut Vec<TaskCandidate>,
        backward: bool,
    ) -> bool {
        let mut link = match backward {
            true => start.tasks_prev,
            false => start.tasks_next,
        };

        while visited.len() < self.config.task_list_limit {
            let pa = match self.task_from_link(link, self.profile.task.tasks) {
                Some(pa) => pa,
                None => return false,
            };

            if pa == start.pa {
                return true;
            }

            if !visited.insert(pa) {
                tracing::debug!(%pa, "task list loops without reaching the start");
                return false;
            }

            let task = match self.read_task(pa) {
                Some(task) => task,
                None => return false,
            };

            link = match backward {
                true => task.tasks_prev,
                false => task.tasks_next,
            };

            result.push(task);
        }

        tracing::warn!(limit = self.config.task_list_limit, "task list limit reached");
        false
    }

    /// Walks the process list (`task_struct.tasks`) starting at `start`.
    ///
    /// Follows `tasks.next` until the list returns to `start`. When the
    /// forward walk breaks on an unreadable or implausible entry, the rest
    /// of the list is recovered backwards through `tasks.prev`.
    ///
    /// The result starts with `start` and holds every task at most once.
    pub fn walk_task_list(&self, start: &TaskCandidate) -> Vec<TaskCandidate> {
        let mut visited = HashSet::from([start.pa]);
        let mut forward = Vec::new();

        if self.follow(start, &mut visited, &mut forward, false) {
            tracing::debug!(count = forward.len() + 1, "task list closed");
        }
        else {
            let mut backward = Vec::new();
            self.follow(start, &mut visited, &mut backward, true);
            tracing::debug!(
                forward = forward.len(),
                backward = backward.len(),
                "task list walk broken"
            );

            backward.reverse();
            forward.extend(backward);
        }

        let mut result = Vec::with_capacity(forward.len() + 1);
        result.push(start.clone());
        result.extend(forward);
        result
    }

    /// Walks the thread group (`task_struct.thread_group`) of `leader`.
    ///
    /// The result starts with `leader`, followed by its threads in list
    /// order. The walk stops early on an unreadable entry or a loop that
    /// does not pass through `leader`.
    pub fn threads(&self, leader: &TaskCandidate) -> Vec<TaskCandidate> {
        let member = self.profile.task.thread_group;
        let mut visited = HashSet::from([leader.pa]);
        let mut result = vec![leader.clone()];

        let mut link = match self.core.read_va(leader.pa + member) {
            Ok(link) => link,
            Err(err) => {
                tracing::debug!(pid = leader.pid, %err, "thread group not readable");
                return result;
            }
        };

        while visited.len() < self.config.task_list_limit {
            let pa = match self.task_from_link(link, member) {
                Some(pa) => pa,
                None => break,
            };

            if pa == leader.pa {
                break;
            }

            if !visited.insert(pa) {
                tracing::debug!(%pa, "thread group loops without reaching the leader");
                break;
            }

            let task = match self.read_task(pa) {
                Some(task) => task,
                None => break,
            };

            let next = self.core.read_va(pa + member);
            result.push(task);

            link = match next {
                Ok(next) => next,
                Err(_) => break,
            };
        }

        tracing::debug!(pid = leader.pid, count = result.len(), "thread group walked");
        result
    }

    // endregion

    // region: Address spaces

    /// Returns the page table root of a task's address space.
    ///
    /// Returns `None` for kernel threads (null `mm`) and when the `mm_struct`
    /// cannot be read.
    pub fn process_root(&self, task: &TaskCandidate) -> Option<Pa> {
        if task.is_kernel_thread() {
            return None;
        }

        let pgd = self
            .core
            .read_va(self.kernel_context(task.mm + self.profile.mm.pgd))
            .ok()?;

        Arch::root_from_pgd(self.core, pgd, self.kernel_root)
    }

    /// Reads the address space bounds of a task.
    pub fn mm_bounds(&self, task: &TaskCandidate) -> Option<MmBounds> {
        if task.is_kernel_thread() {
            return None;
        }

        let __mm = &self.profile.mm;
        let read = |offset: u64| self.core.read_va(self.kernel_context(task.mm + offset));

        Some(MmBounds {
            code: (read(__mm.start_code).ok()?, read(__mm.end_code).ok()?),
            data: (read(__mm.start_data).ok()?, read(__mm.end_data).ok()?),
            brk: (read(__mm.start_brk).ok()?, read(__mm.brk).ok()?),
            start_stack: read(__mm.start_stack).ok()?,
        })
    }

    /// Scans the image for pages that look like page tables.
    ///
    /// Collects at most [`table_candidate_limit`] physical addresses, in
    /// ascending order.
    ///
    /// [`table_candidate_limit`]: ScannerConfig::table_candidate_limit
    pub fn find_table_candidates(&self) -> Vec<Pa> {
        let limit = self.config.table_candidate_limit;
        let image = self.core.image();
        let layout = self.core.layout();

        let result: Vec<_> = (0..image.page_count())
            .filter(|&index| image.contains_page(index))
            .map(|index| layout.pa_from_offset(index * PagedImage::PAGE_SIZE))
            .filter(|&pa| Arch::is_table_candidate(self.core, pa))
            .take(limit)
            .collect();

        tracing::debug!(count = result.len(), limit, "page table candidates");
        result
    }

    // endregion

    // region: Regions

    /// Collects the `vm_area_struct` pointers of an address space.
    fn vma_pointers(&self, mm: Va) -> Result<Vec<Va>, SnapError> {
        let mut result = Vec::new();

        match self.profile.vma_index {
            VmaIndex::MapleTree { mm_mt } => {
                let tree = MapleTree::new(
                    self.core,
                    &self.profile.maple,
                    self.kernel_root,
                    self.config.maple_limits(),
                );

                tree.enumerate(mm + mm_mt, |vma| {
                    result.push(vma);
                    true
                })?;
            }
            VmaIndex::List { mmap, vm_next } => {
                let mut visited = HashSet::new();
                let mut vma = self.core.read_va(self.kernel_context(mm + mmap))?;

                while !vma.is_null() && visited.insert(vma) {
                    if visited.len() > self.config.maple_node_budget {
                        tracing::warn!(%mm, "VMA list budget exhausted");
                        break;
                    }

                    result.push(vma);

                    vma = match self.core.read_va(self.kernel_context(vma + vm_next)) {
                        Ok(next) => next,
                        Err(err) => {
                            tracing::trace!(%vma, %err, "VMA list broken");
                            break;
                        }
                    };
                }
            }
        }

        Ok(result)
    }

    fn read_region(&self, vma: Va, bounds: &MmBounds) -> Option<Region> {
        let __vma = &self.profile.vma;
        let read = |offset: u64| self.core.read_u64(self.kernel_context(vma + offset)).ok();

        let start = Va(read(__vma.vm_start)?);
        let end = Va(read(__vma.vm_end)?);
        let flags = VmFlags::from_bits_retain(read(__vma.vm_flags)?);
        let file_backed = read(__vma.vm_file)? != 0;

        if start >= end || end > Arch::USER_RANGE.end {
            tracing::trace!(%vma, %start, %end, "implausible VMA bounds");
            return None;
        }

        Some(Region {
            start,
            end,
            flags,
            file_backed,
            kind: classify(start, end, flags, file_backed, bounds),
        })
    }

    /// Lists the memory regions of a task, sorted by start address.
    ///
    /// Kernel threads and unreadable address spaces yield no regions.
    pub fn regions(&self, task: &TaskCandidate) -> Vec<Region> {
        let bounds = match self.mm_bounds(task) {
            Some(bounds) => bounds,
            None => return Vec::new(),
        };

        let pointers = match self.vma_pointers(task.mm) {
            Ok(pointers) => pointers,
            Err(err) => {
                tracing::debug!(pid = task.pid, %err, "VMA index not readable");
                return Vec::new();
            }
        };

        let mut result: Vec<_> = pointers
            .into_iter()
            .filter_map(|vma| self.read_region(vma, &bounds))
            .collect();

        result.sort_by_key(|region| region.start);
        result.dedup_by_key(|region| region.start);
        result
    }

    // endregion
}

/// Picks the built-in profile whose `task_struct` layout fits the object at
/// `pa`.
///
/// Used when the address of one task is known (for example the current task
/// of a CPU) but the kernel build is not. A profile fits when the name is
/// plausible and the pid is below 100000.
pub fn detect_profile<Arch>(core: &SnapCore<Arch>, pa: Pa) -> Option<Profile>
where
    Arch: Architecture + ArchAdapter,
{
    Profile::BUILTIN
        .iter()
        .filter_map(|name| Profile::by_name(name).ok())
        .find(|profile| {
            let scanner = LinuxScanner::new(core, profile.clone());
            scanner.read_task(pa).is_some_and(|task| task.pid < 100000)
        })
}

#[cfg(test)]
mod scanner_tests;
