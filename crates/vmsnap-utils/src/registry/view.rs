use std::cmp::Reverse;

use vmsnap_core::Pa;

/// A dense offset space over a sorted subset of registry pages.
///
/// Offset `0` is the first byte of the lowest page; every page occupies as
/// many offsets as it has bytes, and gaps between pages take none. Lets a
/// caller walk only the mapped parts of a mostly empty physical address
/// space.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactedView {
    /// `(pa, size)` pairs, sorted by `pa`.
    pages: Vec<(Pa, u64)>,

    /// Offset of the first byte of each page.
    starts: Vec<u64>,

    size: u64,
}

impl CompactedView {
    /// Builds a view from `(pa, size)` pairs in any order.
    ///
    /// Pages are naturally aligned, so two pages either nest or are
    /// disjoint. A page starting inside an earlier, larger page is dropped
    /// and every physical address maps to exactly one offset.
    pub fn new(mut pages: Vec<(Pa, u64)>) -> Self {
        pages.sort_unstable_by_key(|&(pa, length)| (pa, Reverse(length)));

        let mut end = None;
        pages.retain(|&(pa, length)| {
            if end.is_some_and(|end| pa < end) {
                return false;
            }

            end = Some(pa + length);
            true
        });

        let mut starts = Vec::with_capacity(pages.len());
        let mut size = 0;

        for &(_, length) in &pages {
            starts.push(size);
            size += length;
        }

        Self {
            pages,
            starts,
            size,
        }
    }

    /// Returns the number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Checks whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns the size of the offset space in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the pages of the view, sorted by physical address.
    pub fn pages(&self) -> impl ExactSizeIterator<Item = Pa> + '_ {
        self.pages.iter().map(|&(pa, _)| pa)
    }

    /// Converts a view offset to a physical address.
    pub fn offset_to_pa(&self, offset: u64) -> Option<Pa> {
        if offset >= self.size {
            return None;
        }

        let index = self.starts.partition_point(|&start| start <= offset) - 1;
        let (pa, _) = self.pages[index];
        Some(pa + (offset - self.starts[index]))
    }

    /// Converts a physical address to a view offset.
    ///
    /// Returns `None` if no page of the view contains `pa`.
    pub fn pa_to_offset(&self, pa: Pa) -> Option<u64> {
        let index = self.pages.partition_point(|&(base, _)| base <= pa);
        let index = index.checked_sub(1)?;

        let (base, length) = self.pages[index];
        let delta = pa - base;
        (delta < length).then(|| self.starts[index] + delta)
    }

    /// Converts a physical address to a view offset, snapping addresses
    /// that fall into a gap to the nearest page edge.
    ///
    /// Returns `None` only for an empty view.
    pub fn nearest_offset(&self, pa: Pa) -> Option<u64> {
        if let Some(offset) = self.pa_to_offset(pa) {
            return Some(offset);
        }

        let index = self.pages.partition_point(|&(base, _)| base <= pa);

        let before = index.checked_sub(1).map(|prev| {
            let (base, length) = self.pages[prev];
            let last = base + (length - 1);
            (pa - last, self.starts[prev] + length - 1)
        });

        let after = self.pages.get(index).map(|&(base, _)| (base - pa, self.starts[index]));

        match (before, after) {
            (Some(before), Some(after)) if after.0 < before.0 => Some(after.1),
            (Some(before), _) => Some(before.1),
            (None, Some(after)) => Some(after.1),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> CompactedView {
        CompactedView::new(vec![
            (Pa(0x4010_0000), 0x1000),
            (Pa(0x4000_0000), 0x1000),
            (Pa(0x4020_0000), 0x20_0000),
        ])
    }

    #[test]
    fn offsets_are_dense() {
        let view = view();

        assert_eq!(view.len(), 3);
        assert_eq!(view.size(), 0x20_2000);
        assert_eq!(view.offset_to_pa(0), Some(Pa(0x4000_0000)));
        assert_eq!(view.offset_to_pa(0x1234), Some(Pa(0x4010_0234)));
        assert_eq!(view.offset_to_pa(0x2010), Some(Pa(0x4020_0010)));
        assert_eq!(view.offset_to_pa(0x20_2000), None);

        assert_eq!(view.pa_to_offset(Pa(0x4010_0234)), Some(0x1234));
        assert_eq!(view.pa_to_offset(Pa(0x4021_0000)), Some(0x1_2000));
        assert_eq!(view.pa_to_offset(Pa(0x4000_1000)), None);
        assert_eq!(view.pa_to_offset(Pa(0x3fff_ffff)), None);
    }

    #[test]
    fn gaps_snap_to_nearest_edge() {
        let view = view();

        assert_eq!(view.nearest_offset(Pa(0x4000_1800)), Some(0x0fff));
        assert_eq!(view.nearest_offset(Pa(0x400f_f000)), Some(0x1000));
        assert_eq!(view.nearest_offset(Pa(0x1000)), Some(0));
        assert_eq!(view.nearest_offset(Pa(0x9000_0000)), Some(0x20_1fff));
        assert_eq!(CompactedView::default().nearest_offset(Pa(0)), None);
    }

    #[test]
    fn nested_pages_are_counted_once() {
        let view = CompactedView::new(vec![
            (Pa(0x4020_1000), 0x1000),
            (Pa(0x4020_0000), 0x1000),
            (Pa(0x4020_0000), 0x20_0000),
            (Pa(0x4040_0000), 0x1000),
        ]);

        assert_eq!(view.len(), 2);
        assert_eq!(view.size(), 0x20_1000);
        assert_eq!(view.pa_to_offset(Pa(0x4020_1010)), Some(0x1010));
        assert_eq!(view.offset_to_pa(0x1010), Some(Pa(0x4020_1010)));
        assert_eq!(view.pa_to_offset(Pa(0x4040_0000)), Some(0x20_0000));

        for offset in [0, 0x1fff, 0x20_0000, 0x20_0fff] {
            let pa = view.offset_to_pa(offset);
            assert_eq!(pa.and_then(|pa| view.pa_to_offset(pa)), Some(offset));
        }
    }
}
