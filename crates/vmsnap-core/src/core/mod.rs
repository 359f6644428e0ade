mod access_context;
mod address_context;
mod hex;
pub(crate) mod macros;
mod memory_access;
mod page_size;

pub use self::{
    access_context::{AccessContext, Gfn, Pa, TranslationMechanism, Va},
    address_context::AddressContext,
    hex::Hex,
    memory_access::MemoryAccess,
    page_size::PageSize,
};
