use serde::{Deserialize, Serialize};

/// Size class of a mapped page.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PageSize {
    /// 4 KB page.
    #[default]
    Size4K,

    /// 2 MB block.
    Size2M,

    /// 1 GB block.
    Size1G,
}

impl PageSize {
    /// All size classes, smallest first.
    pub const ALL: [PageSize; 3] = [PageSize::Size4K, PageSize::Size2M, PageSize::Size1G];

    /// Returns the size in bytes.
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 0x1000,
            Self::Size2M => 0x20_0000,
            Self::Size1G => 0x4000_0000,
        }
    }

    /// Returns the size class with the given size in bytes.
    pub const fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            0x1000 => Some(Self::Size4K),
            0x20_0000 => Some(Self::Size2M),
            0x4000_0000 => Some(Self::Size1G),
            _ => None,
        }
    }
}

impl std::fmt::Display for PageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Size4K => f.write_str("4KB"),
            Self::Size2M => f.write_str("2MB"),
            Self::Size1G => f.write_str("1GB"),
        }
    }
}
