//! Progressive loading of a snapshot from a stream of chunks.

use crate::{PagedImage, SnapError};

/// Progress of an [`ImageLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    /// Number of complete pages consumed so far.
    pub pages: u64,

    /// Number of bytes consumed so far.
    pub bytes: u64,

    /// Declared size of the image.
    pub total_size: u64,
}

impl LoadProgress {
    /// Returns the completed fraction in the `0.0..=1.0` range.
    pub fn fraction(&self) -> f64 {
        if self.total_size == 0 {
            return 1.0;
        }

        self.bytes as f64 / self.total_size as f64
    }
}

type ProgressCallback<'a> = Box<dyn FnMut(LoadProgress) + 'a>;

/// Builds a [`PagedImage`] from chunks of arbitrary length.
///
/// Chunks are consumed in order and may end in the middle of a page. The
/// progress callback runs once every `progress_interval` completed pages
/// instead of once per page.
///
/// # Example
///
/// ```
/// # use vmsnap_core::{ImageLoader, SnapError};
/// # fn main() -> Result<(), SnapError> {
/// let mut loader = ImageLoader::new(8192);
/// loader.push(&[0x41; 5000])?;
/// loader.push(&[0x42; 3192])?;
///
/// let image = loader.finish()?;
/// assert_eq!(image.read(4999, 2)?, [0x41, 0x42]);
/// # Ok(())
/// # }
/// ```
pub struct ImageLoader<'a> {
    image: PagedImage,
    pending: Vec<u8>,
    next_page: u64,
    bytes: u64,
    skip_zero_pages: bool,
    progress_interval: u64,
    progress: Option<ProgressCallback<'a>>,
}

impl<'a> ImageLoader<'a> {
    /// Default number of pages between progress callbacks (64 MB).
    pub const DEFAULT_PROGRESS_INTERVAL: u64 = 16384;

    /// Creates a loader for an image of the declared size.
    pub fn new(total_size: u64) -> Self {
        Self {
            image: PagedImage::new(total_size),
            pending: Vec::with_capacity(PagedImage::PAGE_SIZE as usize),
            next_page: 0,
            bytes: 0,
            skip_zero_pages: true,
            progress_interval: Self::DEFAULT_PROGRESS_INTERVAL,
            progress: None,
        }
    }

    /// Sets the progress callback and the number of pages between calls.
    ///
    /// An interval of zero is treated as one.
    pub fn with_progress(
        self,
        interval: u64,
        callback: impl FnMut(LoadProgress) + 'a,
    ) -> Self {
        Self {
            progress_interval: interval.max(1),
            progress: Some(Box::new(callback)),
            ..self
        }
    }

    /// Controls whether pages consisting only of zero bytes are stored.
    ///
    /// Skipped pages still read as zero. Enabled by default.
    pub fn with_skip_zero_pages(self, skip: bool) -> Self {
        Self {
            skip_zero_pages: skip,
            ..self
        }
    }

    /// Returns the current progress.
    pub fn progress(&self) -> LoadProgress {
        LoadProgress {
            pages: self.next_page,
            bytes: self.bytes,
            total_size: self.image.total_size(),
        }
    }

    /// Consumes the next chunk of the snapshot.
    pub fn push(&mut self, mut chunk: &[u8]) -> Result<(), SnapError> {
        let end = self.bytes.saturating_add(chunk.len() as u64);
        if end > self.image.total_size() {
            return Err(SnapError::OutOfRange {
                offset: self.bytes,
                length: chunk.len() as u64,
                size: self.image.total_size(),
            });
        }

        let page_size = PagedImage::PAGE_SIZE as usize;

        // Complete a page left over from the previous chunk.
        if !self.pending.is_empty() {
            let needed = page_size - self.pending.len();
            let take = needed.min(chunk.len());
            self.pending.extend_from_slice(&chunk[..take]);
            self.bytes += take as u64;
            chunk = &chunk[take..];

            if self.pending.len() == page_size {
                let page = std::mem::take(&mut self.pending);
                self.store_page(&page)?;
                self.pending = page;
                self.pending.clear();
            }
        }

        let mut pages = chunk.chunks_exact(page_size);
        for page in &mut pages {
            self.bytes += page.len() as u64;
            self.store_page(page)?;
        }

        let remainder = pages.remainder();
        self.pending.extend_from_slice(remainder);
        self.bytes += remainder.len() as u64;

        Ok(())
    }

    /// Finishes loading and returns the image.
    ///
    /// A trailing partial page is padded with zeros.
    pub fn finish(mut self) -> Result<PagedImage, SnapError> {
        if !self.pending.is_empty() {
            tracing::debug!(
                length = self.pending.len(),
                "padding trailing partial page"
            );

            let mut page = std::mem::take(&mut self.pending);
            page.resize(PagedImage::PAGE_SIZE as usize, 0);
            self.store_page(&page)?;
        }

        if self.bytes < self.image.total_size() {
            tracing::warn!(
                loaded = self.bytes,
                total_size = self.image.total_size(),
                "image is only partially loaded"
            );
        }

        tracing::debug!(
            pages = self.next_page,
            stored = self.image.loaded_pages(),
            "image loaded"
        );

        Ok(self.image)
    }

    fn store_page(&mut self, page: &[u8]) -> Result<(), SnapError> {
        let index = self.next_page;
        self.next_page += 1;

        if !(self.skip_zero_pages && page.iter().all(|&b| b == 0)) {
            self.image.add_page(index, page)?;
        }

        if self.next_page % self.progress_interval == 0 {
            let progress = self.progress();
            if let Some(callback) = &mut self.progress {
                callback(progress);
            }
        }

        Ok(())
    }
}
