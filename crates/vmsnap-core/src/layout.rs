use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{PagedImage, Pa, SnapError, Va};

/// Placement of the snapshot in the guest physical address space, and the
/// kernel's linear map window.
///
/// Defaults match an ARM64 QEMU `virt` guest: RAM starts at `0x4000_0000` and
/// the kernel maps it linearly at `0xffff_0000_0000_0000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLayout {
    /// Guest physical address of the first byte of the image.
    pub ram_base: Pa,

    /// Half-open range of kernel virtual addresses mapped linearly onto RAM.
    ///
    /// `va` in this range resolves to `va - linear_map.start + ram_base`.
    pub linear_map: Range<Va>,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            ram_base: Pa(0x4000_0000),
            linear_map: Va(0xffff_0000_0000_0000)..Va(0xffff_8000_0000_0000),
        }
    }
}

impl MemoryLayout {
    /// Sets the guest physical address of the first image byte.
    pub fn with_ram_base(self, ram_base: Pa) -> Self {
        Self { ram_base, ..self }
    }

    /// Sets the linear map window.
    pub fn with_linear_map(self, linear_map: Range<Va>) -> Self {
        Self { linear_map, ..self }
    }

    /// Checks whether `va` lies inside the linear map window.
    pub fn is_linear(&self, va: Va) -> bool {
        self.linear_map.contains(&va)
    }

    /// Resolves a linear map address without a table walk.
    pub fn linear_to_pa(&self, va: Va) -> Option<Pa> {
        if !self.is_linear(va) {
            return None;
        }

        Some(self.ram_base + (va - self.linear_map.start))
    }

    /// Returns the linear map address of a physical address.
    pub fn pa_to_linear(&self, pa: Pa) -> Option<Va> {
        let offset = pa.0.checked_sub(self.ram_base.0)?;
        let va = self.linear_map.start.checked_add(offset)?;
        self.is_linear(va).then_some(va)
    }

    /// Converts a guest physical address to an image offset.
    pub fn image_offset(&self, pa: Pa, image: &PagedImage) -> Result<u64, SnapError> {
        match pa.0.checked_sub(self.ram_base.0) {
            Some(offset) => Ok(offset),
            None => Err(SnapError::OutOfRange {
                offset: pa.0,
                length: 0,
                size: image.total_size(),
            }),
        }
    }

    /// Converts an image offset to a guest physical address.
    pub fn pa_from_offset(&self, offset: u64) -> Pa {
        self.ram_base + offset
    }

    /// Returns the physical address range covered by `image`.
    pub fn physical_range(&self, image: &PagedImage) -> Range<Pa> {
        self.ram_base..self.ram_base + image.total_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_window_is_half_open() {
        let layout = MemoryLayout::default();

        assert_eq!(
            layout.linear_to_pa(Va(0xffff_0000_0000_0000)),
            Some(Pa(0x4000_0000))
        );
        assert_eq!(
            layout.linear_to_pa(Va(0xffff_0000_0012_3456)),
            Some(Pa(0x4012_3456))
        );
        assert_eq!(layout.linear_to_pa(Va(0xffff_8000_0000_0000)), None);
        assert_eq!(layout.linear_to_pa(Va(0xfffe_ffff_ffff_ffff)), None);
    }

    #[test]
    fn linear_round_trip() {
        let layout = MemoryLayout::default();

        let va = layout.pa_to_linear(Pa(0x4123_4000));
        assert_eq!(va, Some(Va(0xffff_0000_0123_4000)));
        assert_eq!(layout.pa_to_linear(Pa(0x1000)), None);
    }
}
