use crate::{Pa, Va};

/// An error that can occur when working with a memory snapshot.
#[derive(thiserror::Error, Debug)]
pub enum SnapError {
    /// An OS-specific error occurred.
    #[error(transparent)]
    Os(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The requested byte range lies outside the declared image size.
    #[error("Range {offset:#x}+{length:#x} is outside the image (size {size:#x})")]
    OutOfRange {
        /// Image offset of the first requested byte.
        offset: u64,

        /// Number of requested bytes.
        length: u64,

        /// Declared image size.
        size: u64,
    },

    /// A virtual address could not be translated.
    ///
    /// Covers absent entries, malformed entries and tables outside the image
    /// alike.
    #[error("Page not present ({:?}, len: {})", .0[0], .0.len())]
    PageFault(PageFaults),

    /// A fixed-size input had the wrong length.
    #[error("Size mismatch (expected {expected}, got {actual})")]
    SizeMismatch {
        /// Expected length in bytes.
        expected: usize,

        /// Actual length in bytes.
        actual: usize,
    },

    /// A paging translation was requested without a root outside the linear
    /// map window.
    #[error("Root not present")]
    RootNotPresent,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// A page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFault {
    /// The virtual address that failed to translate.
    pub address: Va,

    /// The root of the page table hierarchy.
    pub root: Pa,
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[PageFault; 1]>;

impl From<(Va, Pa)> for PageFault {
    fn from((address, root): (Va, Pa)) -> Self {
        Self { address, root }
    }
}

impl SnapError {
    /// Creates a new page fault error.
    pub fn page_fault(pf: impl Into<PageFault>) -> Self {
        Self::PageFault(smallvec::smallvec![pf.into()])
    }

    /// Returns `true` if the error is a translation failure.
    pub fn is_page_fault(&self) -> bool {
        matches!(self, Self::PageFault(_))
    }
}
