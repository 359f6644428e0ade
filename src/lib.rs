//! Offline introspection of guest physical memory snapshots.
//!
//! The facade re-exports the member crates:
//!
//! - [`vmsnap_core`] at the crate root: the paged image, the loader and
//!   [`SnapCore`] for physical and virtual reads,
//! - [`arch`]: page table formats (feature `arch-aarch64`),
//! - [`os`]: symbol-free kernel structure discovery (feature `os-linux`),
//! - [`utils`]: the page registry and helpers (feature `utils`).

pub use vmsnap_core::*;

pub mod arch {
    //! Architecture-specific paging.

    #[cfg(feature = "arch-aarch64")]
    pub use vmsnap_arch_aarch64 as aarch64;
}

pub mod os {
    //! Operating system structure discovery.

    #[cfg(feature = "os-linux")]
    pub use vmsnap_os_linux as linux;
}

#[cfg(feature = "utils")]
pub use vmsnap_utils as utils;
