//! Declarative field offsets for symbol-free structure discovery.
//!
//! A [`Profile`] describes where the fields the scanner needs live inside
//! `task_struct`, `mm_struct`, `vm_area_struct` and maple tree nodes, and
//! how `task_struct` objects are laid out inside their slab pages. Nothing in
//! the scanner hard-codes an offset; everything flows from the profile.

use serde::{Deserialize, Serialize};

use crate::LinuxError;

/// Offsets of `task_struct` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOffsets {
    /// `task_struct.pid` (`i32`).
    pub pid: u64,

    /// `task_struct.comm` (16 bytes).
    pub comm: u64,

    /// `task_struct.tasks` (`struct list_head`).
    pub tasks: u64,

    /// `task_struct.mm` (`struct mm_struct *`).
    pub mm: u64,

    /// `task_struct.real_parent` (`struct task_struct *`).
    pub parent: u64,

    /// `task_struct.thread_group` (`struct list_head`).
    pub thread_group: u64,
}

/// Offsets of `mm_struct` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmOffsets {
    /// `mm_struct.pgd`.
    pub pgd: u64,

    /// `mm_struct.start_code`.
    pub start_code: u64,

    /// `mm_struct.end_code`.
    pub end_code: u64,

    /// `mm_struct.start_data`.
    pub start_data: u64,

    /// `mm_struct.end_data`.
    pub end_data: u64,

    /// `mm_struct.start_brk`.
    pub start_brk: u64,

    /// `mm_struct.brk`.
    pub brk: u64,

    /// `mm_struct.start_stack`.
    pub start_stack: u64,
}

/// How an `mm_struct` indexes its memory regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmaIndex {
    /// Linux 6.1+: `mm_struct.mm_mt` is a maple tree of VMAs.
    MapleTree {
        /// Offset of `mm_struct.mm_mt`.
        mm_mt: u64,
    },

    /// Before 6.1: `mm_struct.mmap` heads a singly linked VMA list.
    List {
        /// Offset of `mm_struct.mmap`.
        mmap: u64,

        /// Offset of `vm_area_struct.vm_next`.
        vm_next: u64,
    },
}

/// Offsets of `vm_area_struct` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmaOffsets {
    /// `vm_area_struct.vm_start`.
    pub vm_start: u64,

    /// `vm_area_struct.vm_end`.
    pub vm_end: u64,

    /// `vm_area_struct.vm_flags`.
    pub vm_flags: u64,

    /// `vm_area_struct.vm_file`.
    pub vm_file: u64,
}

/// Offsets inside `struct maple_tree` and `struct maple_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapleOffsets {
    /// `maple_tree.ma_root`.
    pub ma_root: u64,

    /// `maple_range_64.pivot`, relative to the node.
    pub range64_pivot: u64,

    /// `maple_range_64.slot`, relative to the node.
    pub range64_slot: u64,

    /// `maple_arange_64.pivot`, relative to the node.
    pub arange64_pivot: u64,

    /// `maple_arange_64.slot`, relative to the node.
    pub arange64_slot: u64,

    /// `maple_node.slot` of dense nodes.
    pub dense_slot: u64,
}

impl Default for MapleOffsets {
    fn default() -> Self {
        Self {
            ma_root: 0x8,
            range64_pivot: 0x8,
            range64_slot: 0x80,
            arange64_pivot: 0x8,
            arange64_slot: 0x50,
            dense_slot: 0x8,
        }
    }
}

/// Placement of `task_struct` objects inside slab pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabLayout {
    /// Offsets from the start of each page where a `task_struct` may begin.
    pub sub_offsets: Vec<u64>,

    /// Largest plausible pid.
    pub pid_max: u32,
}

impl Default for SlabLayout {
    fn default() -> Self {
        Self {
            sub_offsets: (0..0x1000).step_by(0x100).collect(),
            pid_max: 32768,
        }
    }
}

/// A kernel build description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name.
    pub name: String,

    /// `task_struct` offsets.
    pub task: TaskOffsets,

    /// `mm_struct` offsets.
    pub mm: MmOffsets,

    /// VMA index.
    pub vma_index: VmaIndex,

    /// `vm_area_struct` offsets.
    pub vma: VmaOffsets,

    /// Maple tree offsets.
    #[serde(default)]
    pub maple: MapleOffsets,

    /// Slab layout.
    #[serde(default)]
    pub slab: SlabLayout,
}

const MM_5X: MmOffsets = MmOffsets {
    pgd: 0x48,
    start_code: 0x80,
    end_code: 0x88,
    start_data: 0x90,
    end_data: 0x98,
    start_brk: 0xa0,
    brk: 0xa8,
    start_stack: 0xb0,
};

const MM_5X_X86: MmOffsets = MmOffsets {
    pgd: 0x50,
    start_code: 0x88,
    end_code: 0x90,
    start_data: 0x98,
    end_data: 0xa0,
    start_brk: 0xa8,
    brk: 0xb0,
    start_stack: 0xb8,
};

const VMA_5X: VmaOffsets = VmaOffsets {
    vm_start: 0x0,
    vm_end: 0x8,
    vm_flags: 0x50,
    vm_file: 0xa0,
};

const MMAP_5X: VmaIndex = VmaIndex::List {
    mmap: 0x0,
    vm_next: 0x10,
};

impl Profile {
    /// Names of the built-in profiles, in probing order.
    pub const BUILTIN: &'static [&'static str] = &[
        "arm64-5.15",
        "arm64-5.15-alt",
        "arm64-5.10",
        "arm64-5.4",
        "x86_64-5.x",
    ];

    fn builtin(name: &str, task: TaskOffsets, mm: MmOffsets) -> Self {
        Self {
            name: name.into(),
            task,
            mm,
            vma_index: MMAP_5X,
            vma: VMA_5X,
            maple: MapleOffsets::default(),
            slab: SlabLayout::default(),
        }
    }

    /// ARM64, Linux 5.15.
    pub fn arm64_5_15() -> Self {
        Self::builtin(
            "arm64-5.15",
            TaskOffsets {
                pid: 0x4e8,
                comm: 0x738,
                tasks: 0x3a0,
                mm: 0x520,
                parent: 0x2e8,
                thread_group: 0x320,
            },
            MM_5X,
        )
    }

    /// ARM64, Linux 5.15 with a shifted `task_struct` head.
    pub fn arm64_5_15_alt() -> Self {
        Self::builtin(
            "arm64-5.15-alt",
            TaskOffsets {
                pid: 0x4e0,
                comm: 0x730,
                tasks: 0x398,
                mm: 0x518,
                parent: 0x2e0,
                thread_group: 0x318,
            },
            MM_5X,
        )
    }

    /// ARM64, Linux 5.10.
    pub fn arm64_5_10() -> Self {
        Self::builtin(
            "arm64-5.10",
            TaskOffsets {
                pid: 0x398,
                comm: 0x5c8,
                tasks: 0x2e0,
                mm: 0x3f0,
                parent: 0x250,
                thread_group: 0x280,
            },
            MM_5X,
        )
    }

    /// ARM64, Linux 5.4.
    pub fn arm64_5_4() -> Self {
        Self::builtin(
            "arm64-5.4",
            TaskOffsets {
                pid: 0x3a0,
                comm: 0x5d0,
                tasks: 0x2e8,
                mm: 0x3f8,
                parent: 0x258,
                thread_group: 0x288,
            },
            MM_5X,
        )
    }

    /// x86-64, Linux 5.x.
    pub fn x86_64_5_x() -> Self {
        Self::builtin(
            "x86_64-5.x",
            TaskOffsets {
                pid: 0x398,
                comm: 0x5e0,
                tasks: 0x2f0,
                mm: 0x400,
                parent: 0x260,
                thread_group: 0x290,
            },
            MM_5X_X86,
        )
    }

    /// Returns a built-in profile by name.
    pub fn by_name(name: &str) -> Result<Self, LinuxError> {
        match name {
            "arm64-5.15" => Ok(Self::arm64_5_15()),
            "arm64-5.15-alt" => Ok(Self::arm64_5_15_alt()),
            "arm64-5.10" => Ok(Self::arm64_5_10()),
            "arm64-5.4" => Ok(Self::arm64_5_4()),
            "x86_64-5.x" => Ok(Self::x86_64_5_x()),
            _ => Err(LinuxError::UnknownProfile(name.into())),
        }
    }

    /// Parses a profile from JSON.
    ///
    /// `maple` and `slab` may be omitted and take their defaults.
    pub fn from_json(json: &str) -> Result<Self, LinuxError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the profile to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, LinuxError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
