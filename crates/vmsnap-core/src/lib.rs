//! Core functionality for offline introspection of guest memory snapshots.
//!
//! The crate provides the [`PagedImage`] that stores a sparse snapshot, the
//! [`ImageLoader`] that builds one from streamed chunks, and [`SnapCore`],
//! which reads guest memory through physical or virtual addresses using an
//! [`Architecture`] implementation for page table walks.

pub mod arch;
mod core;
mod error;
mod image;
mod layout;
mod loader;

use std::{cell::RefCell, marker::PhantomData, num::NonZeroUsize};

use lru::LruCache;
use zerocopy::{FromBytes, IntoBytes};

pub use self::{
    arch::Architecture,
    core::{
        AccessContext, AddressContext, Gfn, Hex, MemoryAccess, Pa, PageSize, TranslationMechanism,
        Va,
    },
    error::{PageFault, PageFaults, SnapError},
    image::{PagedImage, printable_string},
    layout::MemoryLayout,
    loader::{ImageLoader, LoadProgress},
};

static ZERO_PAGE: [u8; PagedImage::PAGE_SIZE as usize] = [0; PagedImage::PAGE_SIZE as usize];

struct Cache {
    enabled: bool,
    v2p: RefCell<LruCache<AccessContext, Pa>>,
}

impl Cache {
    const DEFAULT_SIZE: NonZeroUsize = NonZeroUsize::new(8192).unwrap();

    fn new() -> Self {
        Self {
            enabled: true,
            v2p: RefCell::new(LruCache::new(Self::DEFAULT_SIZE)),
        }
    }
}

/// Read access to a guest memory snapshot.
///
/// Combines the [`PagedImage`], its [`MemoryLayout`] and an [`Architecture`]
/// to read memory through physical or virtual addresses.
///
/// Virtual addresses inside the layout's linear map window are resolved
/// directly. Other virtual addresses go through a page table walk whose
/// results are kept in a V2P cache keyed by page and root, so switching
/// between address spaces never returns a translation of another root.
pub struct SnapCore<Arch>
where
    Arch: Architecture,
{
    image: PagedImage,
    layout: MemoryLayout,
    cache: Cache,
    _marker: PhantomData<Arch>,
}

impl<Arch> SnapCore<Arch>
where
    Arch: Architecture,
{
    /// Creates a new `SnapCore` over a loaded image.
    ///
    /// The V2P cache is enabled by default with a capacity of 8192 entries.
    pub fn new(image: PagedImage, layout: MemoryLayout) -> Self {
        tracing::debug!(
            ram_base = %layout.ram_base,
            total_size = image.total_size(),
            loaded_pages = image.loaded_pages(),
            "snapshot opened"
        );

        Self {
            image,
            layout,
            cache: Cache::new(),
            _marker: PhantomData,
        }
    }

    /// Returns the underlying image.
    pub fn image(&self) -> &PagedImage {
        &self.image
    }

    /// Returns the memory layout.
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Enables the V2P cache with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn with_v2p_cache(self, size: usize) -> Self {
        let size = NonZeroUsize::new(size).expect("V2P cache size must be non-zero");

        Self {
            cache: Cache {
                enabled: true,
                v2p: RefCell::new(LruCache::new(size)),
            },
            ..self
        }
    }

    /// Enables the V2P cache.
    pub fn enable_v2p_cache(&mut self) {
        self.cache.enabled = true;
    }

    /// Disables the V2P cache.
    ///
    /// Subsequent translations always walk the page tables.
    pub fn disable_v2p_cache(&mut self) {
        self.cache.enabled = false;
        self.flush_v2p_cache();
    }

    /// Removes the cached translation of the page containing `ctx`.
    pub fn flush_v2p_cache_entry(&self, ctx: AccessContext) -> Option<Pa> {
        self.cache
            .v2p
            .borrow_mut()
            .pop(&(ctx & Arch::PAGE_MASK))
    }

    /// Clears the entire V2P cache.
    pub fn flush_v2p_cache(&self) {
        self.cache.v2p.borrow_mut().clear();
    }

    /// Returns the contents of the page with the given frame number.
    ///
    /// Pages absent from the image read as zero.
    pub fn read_page(&self, gfn: Gfn) -> Result<&[u8], SnapError> {
        let pa = Arch::pa_from_gfn(gfn);
        let offset = self.layout.image_offset(pa, &self.image)?;

        if offset
            .checked_add(PagedImage::PAGE_SIZE)
            .is_none_or(|end| end > self.image.total_size())
        {
            return Err(SnapError::OutOfRange {
                offset,
                length: PagedImage::PAGE_SIZE,
                size: self.image.total_size(),
            });
        }

        Ok(self
            .image
            .page(offset / PagedImage::PAGE_SIZE)
            .unwrap_or(&ZERO_PAGE))
    }

    /// Reads memory from the snapshot.
    pub fn read(&self, ctx: impl Into<AccessContext>, buffer: &mut [u8]) -> Result<(), SnapError> {
        let ctx = ctx.into();
        let mut position = 0usize;

        while position < buffer.len() {
            let address = self.translate_access_context(ctx + position as u64)?;
            let offset = self.layout.image_offset(address, &self.image)?;
            let in_page = Arch::pa_offset(address) as usize;

            let size = (Arch::PAGE_SIZE as usize - in_page).min(buffer.len() - position);
            self.image
                .read_into(offset, &mut buffer[position..position + size])?;

            position += size;
        }

        Ok(())
    }

    /// Reads a single byte.
    pub fn read_u8(&self, ctx: impl Into<AccessContext>) -> Result<u8, SnapError> {
        let mut buffer = [0u8; 1];
        self.read(ctx, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 16-bit unsigned integer.
    pub fn read_u16(&self, ctx: impl Into<AccessContext>) -> Result<u16, SnapError> {
        let mut buffer = [0u8; 2];
        self.read(ctx, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer.
    pub fn read_u32(&self, ctx: impl Into<AccessContext>) -> Result<u32, SnapError> {
        let mut buffer = [0u8; 4];
        self.read(ctx, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer.
    pub fn read_u64(&self, ctx: impl Into<AccessContext>) -> Result<u64, SnapError> {
        let mut buffer = [0u8; 8];
        self.read(ctx, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads a 64-bit virtual address.
    pub fn read_va(&self, ctx: impl Into<AccessContext>) -> Result<Va, SnapError> {
        Ok(Va(self.read_u64(ctx)?))
    }

    /// Reads a struct.
    pub fn read_struct<T>(&self, ctx: impl Into<AccessContext>) -> Result<T, SnapError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(ctx, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Reads a printable ASCII string of at most `limit` bytes.
    ///
    /// Returns `None` if the bytes do not look like a string, see
    /// [`printable_string`].
    pub fn read_string_limited(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<Option<String>, SnapError> {
        let mut buffer = vec![0u8; limit];
        self.read(ctx, &mut buffer)?;
        Ok(printable_string(&buffer))
    }

    /// Translates a virtual address to a physical address.
    pub fn translate_address(&self, ctx: impl Into<AddressContext>) -> Result<Pa, SnapError> {
        self.translate_access_context(AccessContext::from(ctx.into()))
    }

    /// Translates an access context to a physical address.
    ///
    /// Linear map addresses are resolved directly and never cached.
    pub fn translate_access_context(&self, ctx: AccessContext) -> Result<Pa, SnapError> {
        let root = match ctx.mechanism {
            TranslationMechanism::Direct => return Ok(Pa(ctx.address)),
            TranslationMechanism::Paging { root } => root,
        };

        let va = Va(ctx.address);
        if let Some(pa) = self.layout.linear_to_pa(va) {
            return Ok(pa);
        }

        let root = root.ok_or(SnapError::RootNotPresent)?;

        if !self.cache.enabled {
            return Arch::translate_address(self, va, root);
        }

        let key = ctx & Arch::PAGE_MASK;
        let mut cache = self.cache.v2p.borrow_mut();
        let page = cache.try_get_or_insert(key, || {
            Arch::translate_address(self, Va(key.address), root)
        })?;

        Ok(*page + Arch::va_offset(va))
    }
}
