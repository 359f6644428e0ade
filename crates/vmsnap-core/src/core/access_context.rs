use serde::{Deserialize, Serialize};

use super::macros::impl_address;
use crate::AddressContext;

impl_address!(Gfn, "Guest Frame Number");
impl_address!(Pa, "Guest Physical Address");
impl_address!(Va, "Guest Virtual Address");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The mechanism used for translating an address to a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TranslationMechanism {
    /// The address is already a guest physical address.
    Direct,

    /// The address is virtual and is resolved through the paging structures.
    Paging {
        /// Root of the paging structures.
        ///
        /// If `None`, only addresses inside the linear map window can be
        /// resolved; anything else fails with
        /// [`SnapError::RootNotPresent`].
        ///
        /// [`SnapError::RootNotPresent`]: crate::SnapError::RootNotPresent
        root: Option<Pa>,
    },
}

/// The address and translation mechanism of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessContext {
    /// The address to access.
    ///
    /// Interpreted as physical or virtual depending on [`mechanism`].
    ///
    /// [`mechanism`]: Self::mechanism
    pub address: u64,

    /// The mechanism used for address translation.
    pub mechanism: TranslationMechanism,
}

impl AccessContext {
    /// Creates a new `AccessContext` for a physical address.
    pub fn direct(address: impl Into<Pa>) -> Self {
        Self {
            address: u64::from(address.into()),
            mechanism: TranslationMechanism::Direct,
        }
    }

    /// Creates a new `AccessContext` with paging-based translation.
    pub fn paging(address: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Paging {
                root: Some(root.into()),
            },
        }
    }

    /// Creates a new `AccessContext` for a kernel address inside the linear
    /// map window, for which no root is needed.
    pub fn linear(address: impl Into<Va>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Paging { root: None },
        }
    }
}

impl From<Pa> for AccessContext {
    fn from(value: Pa) -> Self {
        Self::direct(value)
    }
}

impl From<(Va, Pa)> for AccessContext {
    fn from(value: (Va, Pa)) -> Self {
        Self::paging(value.0, value.1)
    }
}

impl From<AddressContext> for AccessContext {
    fn from(value: AddressContext) -> Self {
        Self::paging(value.va, value.root)
    }
}

impl ::std::ops::Add<u64> for AccessContext {
    type Output = AccessContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            address: self.address.wrapping_add(rhs),
            ..self
        }
    }
}

impl ::std::ops::AddAssign<u64> for AccessContext {
    fn add_assign(&mut self, rhs: u64) {
        self.address = self.address.wrapping_add(rhs);
    }
}

impl ::std::ops::BitAnd<u64> for AccessContext {
    type Output = AccessContext;

    fn bitand(self, rhs: u64) -> Self::Output {
        Self {
            address: self.address & rhs,
            ..self
        }
    }
}
