use vmsnap_arch_aarch64::Aarch64;
use vmsnap_core::{MemoryLayout, Pa, PagedImage, SnapCore, SnapError, Va};

use super::*;

const RAM_BASE: u64 = 0x4000_0000;
const PAGES: u64 = 64;

const VALID: u64 = 0b11;
const AF: u64 = 1 << 10;

fn pa(page: u64, offset: u64) -> Pa {
    Pa(RAM_BASE + page * PagedImage::PAGE_SIZE + offset)
}

fn linear(pa: Pa) -> Va {
    Va(0xffff_0000_0000_0000 + (pa.0 - RAM_BASE))
}

struct ImageBuilder {
    data: Vec<u8>,
    touched: HashSet<u64>,
    profile: Profile,
}

impl ImageBuilder {
    fn new(profile: Profile) -> Self {
        Self {
            data: vec![0; (PAGES * PagedImage::PAGE_SIZE) as usize],
            touched: HashSet::new(),
            profile,
        }
    }

    fn write_bytes(&mut self, pa: Pa, bytes: &[u8]) {
        let offset = (pa.0 - RAM_BASE) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);

        let first = offset as u64 / PagedImage::PAGE_SIZE;
        let last = (offset + bytes.len() - 1) as u64 / PagedImage::PAGE_SIZE;
        self.touched.extend(first..=last);
    }

    fn write_u32(&mut self, pa: Pa, value: u32) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    fn write_u64(&mut self, pa: Pa, value: u64) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    /// Writes a `task_struct` whose `tasks` links point at the `tasks`
    /// members of `next` and `prev`.
    fn task(&mut self, at: Pa, pid: u32, name: &str, next: Va, prev: Va, mm: Va) {
        let __task = self.profile.task;

        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..name.len()].copy_from_slice(name.as_bytes());

        self.write_u32(at + __task.pid, pid);
        self.write_bytes(at + __task.comm, &comm);
        self.write_u64(at + __task.tasks, (next + __task.tasks).0);
        self.write_u64(at + __task.tasks + 8, (prev + __task.tasks).0);
        self.write_u64(at + __task.mm, mm.0);
        self.write_u64(at + __task.parent, 0xffff_0000_0000_0000);
    }

    fn vma(&mut self, at: Pa, start: u64, end: u64, flags: VmFlags, file: bool, next: Va) {
        let __vma = self.profile.vma;

        self.write_u64(at + __vma.vm_start, start);
        self.write_u64(at + __vma.vm_end, end);
        self.write_u64(at + __vma.vm_flags, flags.bits());
        self.write_u64(at + __vma.vm_file, if file { 0xffff_0000_dead_0000 } else { 0 });

        if let VmaIndex::List { vm_next, .. } = self.profile.vma_index {
            self.write_u64(at + vm_next, next.0);
        }
    }

    /// Maps a 4 KB page at `va` using tables in pages 1 to 4.
    fn map_kernel_page(&mut self, va: Va, target: Pa) {
        let index = |shift: u64| (va.0 >> shift) & 0x1ff;

        self.write_u64(pa(1, index(39) * 8), pa(2, 0).0 | VALID);
        self.write_u64(pa(2, index(30) * 8), pa(3, 0).0 | VALID);
        self.write_u64(pa(3, index(21) * 8), pa(4, 0).0 | VALID);
        self.write_u64(pa(4, index(12) * 8), target.0 | VALID | AF);
    }

    fn build(self) -> Result<SnapCore<Aarch64>, SnapError> {
        let mut image = PagedImage::new(self.data.len() as u64);

        for index in self.touched {
            let offset = (index * PagedImage::PAGE_SIZE) as usize;
            let page = &self.data[offset..offset + PagedImage::PAGE_SIZE as usize];
            image.add_page(index, page)?;
        }

        Ok(SnapCore::new(image, MemoryLayout::default()))
    }
}

///////////////////////////////////////////////////////////////////////////////
// Process descriptors
///////////////////////////////////////////////////////////////////////////////

#[test]
fn comm_validation() {
    assert_eq!(parse_comm(b"bash\0\0\0\0\0\0\0\0\0\0\0\0"), Some("bash".into()));
    assert_eq!(parse_comm(b"kworker/0:1H-kbl"), Some("kworker/0:1H-kbl".into()));
    assert_eq!(parse_comm(&[0; 16]), None);
    assert_eq!(parse_comm(b"ba\x01h\0\0\0\0\0\0\0\0\0\0\0\0"), None);
    assert_eq!(parse_comm(b"bash\0\xff\0\0\0\0\0\0\0\0\0\0"), None);
}

#[test]
fn find_task_by_pid_at_sub_offset() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());
    let task = pa(10, 0x200);
    builder.task(task, 42, "sshd", linear(task), linear(task), Va(0));

    // Right pid, unprintable name.
    let decoy = pa(8, 0x100);
    builder.task(decoy, 42, "\x07\x07", linear(decoy), linear(decoy), Va(0));

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, Profile::arm64_5_15());

    let found = scanner.find_task_by_pid(42);
    assert_eq!(found.as_ref().map(|task| task.pa), Some(task));
    assert_eq!(found.map(|task| task.name), Some("sshd".into()));
    assert_eq!(scanner.find_task_by_pid(43), None);

    Ok(())
}

#[test]
fn task_off_the_slab_grid_is_missed() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());
    let task = pa(10, 0x280);
    builder.task(task, 42, "sshd", linear(task), linear(task), Va(0));

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, Profile::arm64_5_15());
    assert_eq!(scanner.find_task_by_pid(42), None);

    Ok(())
}

#[test]
fn enumerate_tasks_filters_pid_range_and_caps() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());

    for (page, pid) in [(10, 1), (11, 300), (12, 0), (13, 40000), (14, 7)] {
        let task = pa(page, 0);
        builder.task(task, pid, "init", linear(task), linear(task), Va(0));
    }

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, Profile::arm64_5_15());

    let pids: Vec<_> = scanner
        .enumerate_tasks(100)
        .iter()
        .map(|task| task.pid)
        .collect();
    assert_eq!(pids, vec![1, 300, 7]);

    assert_eq!(scanner.enumerate_tasks(2).len(), 2);

    Ok(())
}

#[test]
fn init_task_is_pid_zero_swapper() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());

    let idle = pa(11, 0);
    builder.task(idle, 0, "kthreadd", linear(idle), linear(idle), Va(0));

    let init = pa(12, 0x300);
    builder.task(init, 0, "swapper/0", linear(init), linear(init), Va(0));

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, Profile::arm64_5_15());

    assert_eq!(scanner.find_init_task().map(|task| task.pa), Some(init));

    Ok(())
}

#[test]
fn detects_profile_from_known_task() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_10());
    let task = pa(20, 0);
    builder.task(task, 812, "systemd-journal", linear(task), linear(task), Va(0));

    let core = builder.build()?;
    assert_eq!(
        detect_profile(&core, task).map(|profile| profile.name),
        Some("arm64-5.10".into())
    );
    assert_eq!(detect_profile(&core, pa(21, 0)), None);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Process list
///////////////////////////////////////////////////////////////////////////////

#[test]
fn walk_closed_task_list() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());

    let a = pa(10, 0);
    let b = pa(11, 0x100);
    let c = pa(12, 0x200);
    builder.task(a, 0, "swapper/0", linear(b), linear(c), Va(0));
    builder.task(b, 1, "init", linear(c), linear(a), Va(0));
    builder.task(c, 2, "kthreadd", linear(a), linear(b), Va(0));

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, Profile::arm64_5_15());

    let start = scanner.read_task(a).ok_or(SnapError::Other("no start"))?;
    let pids: Vec<_> = scanner
        .walk_task_list(&start)
        .iter()
        .map(|task| task.pid)
        .collect();
    assert_eq!(pids, vec![0, 1, 2]);

    Ok(())
}

#[test]
fn broken_forward_link_recovers_backwards() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());

    let a = pa(10, 0);
    let b = pa(11, 0);
    let c = pa(12, 0);
    let d = pa(13, 0);

    // b.next points outside the linear map and no kernel root is set.
    builder.task(a, 0, "swapper/0", linear(b), linear(d), Va(0));
    builder.task(b, 1, "init", Va(0xffff_8000_1234_0000), linear(a), Va(0));
    builder.task(c, 2, "kthreadd", linear(d), linear(b), Va(0));
    builder.task(d, 3, "rcu_gp", linear(a), linear(c), Va(0));

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, Profile::arm64_5_15());

    let start = scanner.read_task(a).ok_or(SnapError::Other("no start"))?;
    let pids: Vec<_> = scanner
        .walk_task_list(&start)
        .iter()
        .map(|task| task.pid)
        .collect();
    assert_eq!(pids, vec![0, 1, 2, 3]);

    Ok(())
}

#[test]
fn kernel_root_resolves_image_addresses() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());

    // init_task lives in the kernel image, outside the linear map.
    let init_va = Va(0xffff_8000_0a00_0000);
    let init = pa(10, 0);
    let a = pa(11, 0);
    let b = pa(12, 0);
    builder.map_kernel_page(init_va, init);
    builder.task(a, 1, "init", init_va, linear(b), Va(0));
    builder.task(init, 0, "swapper/0", linear(b), linear(a), Va(0));
    builder.task(b, 2, "kthreadd", linear(a), init_va, Va(0));

    let core = builder.build()?;
    let walk = |scanner: LinuxScanner<'_, Aarch64>| -> Result<Vec<u32>, SnapError> {
        let start = scanner.read_task(a).ok_or(SnapError::Other("no start"))?;
        Ok(scanner
            .walk_task_list(&start)
            .iter()
            .map(|task| task.pid)
            .collect())
    };

    let without_root = LinuxScanner::new(&core, Profile::arm64_5_15());
    assert_eq!(walk(without_root)?, vec![1, 2]);

    let with_root = LinuxScanner::new(&core, Profile::arm64_5_15()).with_kernel_root(pa(1, 0));
    assert_eq!(walk(with_root)?, vec![1, 0, 2]);

    Ok(())
}

#[test]
fn task_list_limit_bounds_the_walk() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());

    let tasks: Vec<_> = (10..20).map(|page| pa(page, 0)).collect();
    for (i, &task) in tasks.iter().enumerate() {
        let next = tasks[(i + 1) % tasks.len()];
        let prev = tasks[(i + tasks.len() - 1) % tasks.len()];
        builder.task(task, i as u32 + 1, "worker", linear(next), linear(prev), Va(0));
    }

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, Profile::arm64_5_15()).with_config(ScannerConfig {
        task_list_limit: 4,
        ..Default::default()
    });

    let start = scanner.read_task(tasks[0]).ok_or(SnapError::Other("no start"))?;
    assert_eq!(scanner.walk_task_list(&start).len(), 4);

    Ok(())
}

#[test]
fn thread_group_returns_to_the_leader() -> Result<(), SnapError> {
    let profile = Profile::arm64_5_15();
    let mut builder = ImageBuilder::new(profile.clone());
    let member = profile.task.thread_group;

    let leader = pa(10, 0);
    let first = pa(11, 0);
    let second = pa(12, 0);
    let mm = linear(pa(20, 0));

    builder.task(leader, 300, "server", linear(leader), linear(leader), mm);
    builder.task(first, 301, "worker", linear(first), linear(first), mm);
    builder.task(second, 302, "worker", linear(second), linear(second), mm);

    for (task, next) in [(leader, first), (first, second), (second, leader)] {
        builder.write_u64(task + member, (linear(next) + member).0);
    }

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, profile);

    let leader = scanner.read_task(leader).ok_or(SnapError::Other("no leader"))?;
    let pids: Vec<_> = scanner.threads(&leader).iter().map(|task| task.pid).collect();
    assert_eq!(pids, vec![300, 301, 302]);

    Ok(())
}

#[test]
fn single_threaded_group_holds_the_leader() -> Result<(), SnapError> {
    let profile = Profile::arm64_5_15();
    let mut builder = ImageBuilder::new(profile.clone());
    let member = profile.task.thread_group;

    let leader = pa(10, 0);
    builder.task(leader, 400, "init", linear(leader), linear(leader), Va(0));
    builder.write_u64(leader + member, (linear(leader) + member).0);

    // A group whose link points at a garbage task stops there.
    let broken = pa(11, 0);
    builder.task(broken, 401, "broken", linear(broken), linear(broken), Va(0));
    builder.write_u64(broken + member, (linear(pa(30, 0)) + member).0);

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, profile);

    let leader = scanner.read_task(leader).ok_or(SnapError::Other("no leader"))?;
    assert_eq!(scanner.threads(&leader).len(), 1);

    let broken = scanner.read_task(broken).ok_or(SnapError::Other("no task"))?;
    assert_eq!(scanner.threads(&broken).len(), 1);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Address spaces
///////////////////////////////////////////////////////////////////////////////

#[test]
fn process_root_follows_mm_pgd() -> Result<(), SnapError> {
    let profile = Profile::arm64_5_15();
    let mut builder = ImageBuilder::new(profile.clone());

    let task = pa(10, 0);
    let kthread = pa(11, 0);
    let mm = pa(20, 0x400);
    let pgd = pa(30, 0);

    builder.task(task, 100, "bash", linear(task), linear(task), linear(mm));
    builder.task(kthread, 2, "kthreadd", linear(kthread), linear(kthread), Va(0));
    builder.write_u64(mm + profile.mm.pgd, linear(pgd).0);

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, profile);

    let task = scanner.read_task(task).ok_or(SnapError::Other("no task"))?;
    assert_eq!(scanner.process_root(&task), Some(pgd));

    let kthread = scanner.read_task(kthread).ok_or(SnapError::Other("no task"))?;
    assert!(kthread.is_kernel_thread());
    assert_eq!(scanner.process_root(&kthread), None);

    Ok(())
}

#[test]
fn table_candidates_are_capped() -> Result<(), SnapError> {
    let mut builder = ImageBuilder::new(Profile::arm64_5_15());

    for page in [5, 9, 12] {
        builder.write_u64(pa(page, 0), pa(40, 0).0 | 0b11);
        builder.write_u64(pa(page, 8), pa(41, 0).0 | 0b01);
    }

    // A single valid descriptor is not enough.
    builder.write_u64(pa(7, 0), pa(40, 0).0 | 0b11);

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, Profile::arm64_5_15());

    assert_eq!(
        scanner.find_table_candidates(),
        vec![pa(5, 0), pa(9, 0), pa(12, 0)]
    );

    let scanner = scanner.with_config(ScannerConfig {
        table_candidate_limit: 2,
        ..Default::default()
    });
    assert_eq!(scanner.find_table_candidates(), vec![pa(5, 0), pa(9, 0)]);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Regions
///////////////////////////////////////////////////////////////////////////////

#[test]
fn regions_from_vma_list() -> Result<(), SnapError> {
    let profile = Profile::arm64_5_15();
    let mut builder = ImageBuilder::new(profile.clone());

    let task = pa(10, 0);
    let mm = pa(20, 0);
    let code = pa(21, 0);
    let heap = pa(21, 0x200);
    let stack = pa(21, 0x400);

    builder.task(task, 100, "bash", linear(task), linear(task), linear(mm));
    builder.write_u64(mm + profile.mm.start_brk, 0x60_0000);
    builder.write_u64(mm + profile.mm.brk, 0x62_0000);
    builder.write_u64(mm + profile.mm.start_stack, 0x7fff_fff0_0100);

    // The list is not sorted; regions() sorts by start.
    builder.write_u64(mm, linear(stack).0);
    let rw = VmFlags::READ | VmFlags::WRITE;
    let stack_flags = rw | VmFlags::GROWSDOWN;
    builder.vma(stack, 0x7fff_fff0_0000, 0x7fff_fff2_0000, stack_flags, false, linear(code));
    builder.vma(code, 0x40_0000, 0x48_0000, VmFlags::READ | VmFlags::EXEC, true, linear(heap));
    builder.vma(heap, 0x60_0000, 0x62_0000, rw, false, Va(0));

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, profile);

    let task = scanner.read_task(task).ok_or(SnapError::Other("no task"))?;
    let regions = scanner.regions(&task);

    let summary: Vec<_> = regions
        .iter()
        .map(|region| (region.start, region.kind))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Va(0x40_0000), RegionKind::Code),
            (Va(0x60_0000), RegionKind::Heap),
            (Va(0x7fff_fff0_0000), RegionKind::Stack),
        ]
    );
    assert_eq!(regions[0].size(), 0x8_0000);
    assert!(regions[0].file_backed);

    Ok(())
}

#[test]
fn looping_vma_list_terminates() -> Result<(), SnapError> {
    let profile = Profile::arm64_5_15();
    let mut builder = ImageBuilder::new(profile.clone());

    let task = pa(10, 0);
    let mm = pa(20, 0);
    let first = pa(21, 0);
    let second = pa(21, 0x200);

    builder.task(task, 100, "bash", linear(task), linear(task), linear(mm));
    builder.write_u64(mm, linear(first).0);
    builder.vma(first, 0x1000, 0x2000, VmFlags::READ, false, linear(second));
    builder.vma(second, 0x3000, 0x4000, VmFlags::READ, false, linear(first));

    let core = builder.build()?;
    let scanner = LinuxScanner::new(&core, profile);

    let task = scanner.read_task(task).ok_or(SnapError::Other("no task"))?;
    assert_eq!(scanner.regions(&task).len(), 2);

    Ok(())
}

fn maple_profile() -> Profile {
    Profile {
        name: "arm64-maple".into(),
        vma_index: VmaIndex::MapleTree { mm_mt: 0x100 },
        ..Profile::arm64_5_15()
    }
}

/// Builds an `mm_struct` whose maple tree has a range64 root with two leaf64
/// children, each holding one VMA.
fn maple_image() -> Result<(SnapCore<Aarch64>, Pa), SnapError> {
    const RANGE64: u64 = 2 << 3 | 2;
    const LEAF64: u64 = 1 << 3 | 2;

    let profile = maple_profile();
    let mut builder = ImageBuilder::new(profile.clone());

    let task = pa(10, 0);
    let mm = pa(20, 0);
    let root = pa(22, 0);
    let left = pa(22, 0x100);
    let right = pa(22, 0x200);
    let code = pa(23, 0);
    let data = pa(23, 0x200);

    builder.task(task, 100, "bash", linear(task), linear(task), linear(mm));
    builder.write_u64(mm + 0x100 + 8, linear(root).0 | RANGE64);

    // Root: [0, 0x0fff_ffff] -> left, [0x1000_0000, MAX] -> right.
    builder.write_u64(root + 0x08, 0x0fff_ffff);
    builder.write_u64(root + 0x10, u64::MAX);
    builder.write_u64(root + 0x80, linear(left).0 | LEAF64);
    builder.write_u64(root + 0x88, linear(right).0 | LEAF64);

    // Left leaf: code VMA over the whole child range.
    builder.write_u64(left + 0x08, 0x0fff_ffff);
    builder.write_u64(left + 0x80, linear(code).0);

    // Right leaf: a gap, then the data VMA.
    builder.write_u64(right + 0x08, 0x2000_ffff);
    builder.write_u64(right + 0x10, 0x2001_ffff);
    builder.write_u64(right + 0x88, linear(data).0);

    builder.vma(code, 0x40_0000, 0x48_0000, VmFlags::READ | VmFlags::EXEC, true, Va(0));
    builder.vma(data, 0x2001_0000, 0x2002_0000, VmFlags::READ | VmFlags::WRITE, false, Va(0));

    Ok((builder.build()?, task))
}

#[test]
fn regions_from_maple_tree() -> Result<(), SnapError> {
    let (core, task) = maple_image()?;
    let scanner = LinuxScanner::new(&core, maple_profile());

    let task = scanner.read_task(task).ok_or(SnapError::Other("no task"))?;
    let summary: Vec<_> = scanner
        .regions(&task)
        .iter()
        .map(|region| (region.start, region.end, region.kind))
        .collect();

    assert_eq!(
        summary,
        vec![
            (Va(0x40_0000), Va(0x48_0000), RegionKind::Code),
            (Va(0x2001_0000), Va(0x2002_0000), RegionKind::Data),
        ]
    );

    Ok(())
}

#[test]
fn maple_limits_cut_traversal() -> Result<(), SnapError> {
    let (core, task) = maple_image()?;

    for config in [
        ScannerConfig {
            maple_max_depth: 0,
            ..Default::default()
        },
        ScannerConfig {
            maple_node_budget: 1,
            ..Default::default()
        },
    ] {
        let scanner = LinuxScanner::new(&core, maple_profile()).with_config(config);
        let task = scanner.read_task(task).ok_or(SnapError::Other("no task"))?;
        assert!(scanner.regions(&task).is_empty());
    }

    let scanner = LinuxScanner::new(&core, maple_profile()).with_config(ScannerConfig {
        maple_node_budget: 2,
        ..Default::default()
    });
    let task = scanner.read_task(task).ok_or(SnapError::Other("no task"))?;
    assert_eq!(scanner.regions(&task).len(), 1);

    Ok(())
}
