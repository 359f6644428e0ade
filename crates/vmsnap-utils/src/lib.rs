//! vmsnap utilities

#[cfg(feature = "registry")]
pub mod registry;

mod hexdump;
pub use self::hexdump::{Representation, hexdump};
