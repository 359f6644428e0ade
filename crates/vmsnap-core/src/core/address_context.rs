use serde::{Deserialize, Serialize};

use super::{Pa, Va};

/// A virtual address paired with the translation root it belongs to.
///
/// Snapshots hold many address spaces at once (the kernel and every process),
/// so each translation names its root explicitly instead of relying on some
/// "current" root.
///
/// # Example
///
/// ```
/// # use vmsnap_core::{AddressContext, Pa, Va};
/// let ctx = AddressContext::new(Va(0x0000_aaaa_0000_1000), Pa(0x4100_0000));
/// assert_eq!((ctx + 0x10).va, Va(0x0000_aaaa_0000_1010));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressContext {
    /// The virtual address.
    pub va: Va,

    /// The translation root, the physical address of the level 0 table
    /// (`TTBR0_EL1`/`TTBR1_EL1` base on ARM64).
    pub root: Pa,
}

impl AddressContext {
    /// Creates a new `AddressContext` with the given virtual address and
    /// translation root.
    pub fn new(va: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            va: va.into(),
            root: root.into(),
        }
    }
}

impl From<(Va, Pa)> for AddressContext {
    fn from(value: (Va, Pa)) -> Self {
        Self {
            va: value.0,
            root: value.1,
        }
    }
}

impl ::std::ops::Add<u64> for AddressContext {
    type Output = AddressContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            va: self.va + rhs,
            ..self
        }
    }
}

impl ::std::fmt::Display for AddressContext {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{} @ {}", self.va, self.root)
    }
}
