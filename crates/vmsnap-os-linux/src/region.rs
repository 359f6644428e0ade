use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use vmsnap_core::{MemoryAccess, Va};

bitflags! {
    /// `vm_area_struct.vm_flags` bits used for classification.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct VmFlags: u64 {
        /// `VM_READ`
        const READ = 0x0000_0001;

        /// `VM_WRITE`
        const WRITE = 0x0000_0002;

        /// `VM_EXEC`
        const EXEC = 0x0000_0004;

        /// `VM_SHARED`
        const SHARED = 0x0000_0008;

        /// `VM_GROWSDOWN`
        const GROWSDOWN = 0x0000_0100;
    }
}

impl VmFlags {
    /// Returns the access rights encoded in the flags.
    pub fn access(self) -> MemoryAccess {
        let mut access = MemoryAccess::empty();

        if self.contains(Self::READ) {
            access |= MemoryAccess::R;
        }

        if self.contains(Self::WRITE) {
            access |= MemoryAccess::W;
        }

        if self.contains(Self::EXEC) {
            access |= MemoryAccess::X;
        }

        access
    }
}

/// What a memory region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    /// Executable image text.
    Code,

    /// A thread stack.
    Stack,

    /// The `brk` heap.
    Heap,

    /// A file mapping that is not a shared library.
    MappedFile,

    /// A shared library mapping.
    Library,

    /// Writable data.
    Data,

    /// Read-only data.
    ReadOnly,

    /// Private anonymous memory.
    Anonymous,

    /// A kernel-provided special mapping (`[vdso]`, `[vvar]`, `[vsyscall]`).
    Vdso,
}

impl RegionKind {
    /// Classifies a region by its `/proc/<pid>/maps` style name.
    ///
    /// Returns `None` for names that carry no classification, such as
    /// unknown bracketed names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" => Some(Self::Anonymous),
            "[heap]" => Some(Self::Heap),
            "[vdso]" | "[vvar]" | "[vsyscall]" => Some(Self::Vdso),
            _ if name.starts_with("[stack") => Some(Self::Stack),
            _ if name.ends_with(".so") || name.contains(".so.") => Some(Self::Library),
            _ if name.starts_with('/') => Some(Self::MappedFile),
            _ => None,
        }
    }

    /// Returns a short display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Stack => "stack",
            Self::Heap => "heap",
            Self::MappedFile => "file",
            Self::Library => "library",
            Self::Data => "data",
            Self::ReadOnly => "rodata",
            Self::Anonymous => "anon",
            Self::Vdso => "vdso",
        }
    }
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address space bounds read from `mm_struct`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmBounds {
    /// `start_code..end_code`.
    pub code: (Va, Va),

    /// `start_data..end_data`.
    pub data: (Va, Va),

    /// `start_brk..brk`.
    pub brk: (Va, Va),

    /// `start_stack`.
    pub start_stack: Va,
}

/// A virtual memory region of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address of the region.
    pub start: Va,

    /// One past the last address of the region.
    pub end: Va,

    /// Raw `vm_flags`.
    pub flags: VmFlags,

    /// Whether the region is backed by a file.
    pub file_backed: bool,

    /// Classification.
    pub kind: RegionKind,
}

impl Region {
    /// Returns the size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns the access rights of the region.
    pub fn access(&self) -> MemoryAccess {
        self.flags.access()
    }

    /// Checks whether `va` lies inside the region.
    pub fn contains(&self, va: Va) -> bool {
        self.start <= va && va < self.end
    }
}

/// Classifies a region from its flags, its backing and the `mm_struct`
/// bounds.
pub fn classify(
    start: Va,
    end: Va,
    flags: VmFlags,
    file_backed: bool,
    mm: &MmBounds,
) -> RegionKind {
    let (brk_start, brk_end) = mm.brk;
    let overlaps_brk = brk_start < brk_end && start < brk_end && brk_start < end;
    let has_stack = start <= mm.start_stack && mm.start_stack < end;

    if flags.contains(VmFlags::EXEC) {
        RegionKind::Code
    }
    else if flags.contains(VmFlags::GROWSDOWN) || has_stack {
        RegionKind::Stack
    }
    else if overlaps_brk {
        RegionKind::Heap
    }
    else if file_backed {
        RegionKind::MappedFile
    }
    else if flags.contains(VmFlags::WRITE) {
        RegionKind::Data
    }
    else if flags.contains(VmFlags::READ) {
        RegionKind::ReadOnly
    }
    else {
        RegionKind::Anonymous
    }
}
