//! Read-only traversal of the Linux kernel maple tree.
//!
//! The maple tree indexes a process's VMAs since Linux 6.1. Nodes are 256
//! bytes; an encoded node pointer (`maple_enode`) carries the node type in
//! bits 3..7 and the node address in the remaining bits above bit 8.
//!
//! Traversal uses an explicit worklist bounded by a node budget and a depth
//! limit. Well-formed trees are far below both limits; they only stop
//! garbage pointers from producing unbounded work.
//!
//! # References
//!
//! - [Linux Kernel Source - maple_tree.h](https://elixir.bootlin.com/linux/v6.10.5/source/include/linux/maple_tree.h)
//! - [Kernel Documentation - Maple Tree](https://docs.kernel.org/core-api/maple_tree.html)

use vmsnap_core::{AccessContext, Architecture, Pa, SnapCore, SnapError, TranslationMechanism, Va};

use crate::profile::MapleOffsets;

/// Size of a `struct maple_node`.
const MAPLE_NODE_SIZE: usize = 256;
const MAPLE_NODE_WORDS: usize = MAPLE_NODE_SIZE / 8;

const MAPLE_NODE_SLOTS: usize = 31;
const MAPLE_RANGE64_SLOTS: usize = 16;
const MAPLE_ARANGE64_SLOTS: usize = 10;

/// Node types encoded in a `maple_enode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapleType {
    /// Directly addressable slots.
    Dense,

    /// Leaf with 64-bit pivots.
    Leaf64,

    /// Internal node with 64-bit pivots.
    Range64,

    /// Internal node with 64-bit pivots and gap tracking.
    Arange64,
}

impl MapleType {
    fn is_leaf(self) -> bool {
        matches!(self, Self::Dense | Self::Leaf64)
    }
}

const fn xa_mk_internal(v: u64) -> u64 {
    (v << 2) | 2
}

const fn xa_is_internal(entry: u64) -> bool {
    (entry & 3) == 2
}

const fn xa_is_value(entry: u64) -> bool {
    (entry & 1) == 1
}

const fn xa_is_zero(entry: u64) -> bool {
    entry == xa_mk_internal(257)
}

const fn xa_is_node(entry: u64) -> bool {
    xa_is_internal(entry) && entry > 4096
}

const fn mte_node_type(entry: u64) -> Option<MapleType> {
    match (entry >> 3) & 0x0f {
        0x00 => Some(MapleType::Dense),
        0x01 => Some(MapleType::Leaf64),
        0x02 => Some(MapleType::Range64),
        0x03 => Some(MapleType::Arange64),
        _ => None,
    }
}

const fn mte_to_node(entry: u64) -> Va {
    Va(entry & !0xff)
}

/// Checks whether a slot holds a plain object pointer.
const fn is_pointer(entry: u64) -> bool {
    entry != 0 && !xa_is_value(entry) && !xa_is_internal(entry) && !xa_is_zero(entry)
}

/// A pending node on the worklist.
#[derive(Debug, Clone, Copy)]
struct Pending {
    entry: u64,
    min: u64,
    max: u64,
    depth: usize,
}

/// Bounds on a single traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapleLimits {
    /// Maximum number of nodes read.
    pub node_budget: usize,

    /// Maximum node depth below the root.
    pub max_depth: usize,
}

impl Default for MapleLimits {
    fn default() -> Self {
        Self {
            node_budget: 4096,
            max_depth: 8,
        }
    }
}

/// A maple tree reader.
pub struct MapleTree<'a, Arch>
where
    Arch: Architecture,
{
    core: &'a SnapCore<Arch>,
    offsets: &'a MapleOffsets,
    root: Option<Pa>,
    limits: MapleLimits,
}

impl<'a, Arch> MapleTree<'a, Arch>
where
    Arch: Architecture,
{
    /// Creates a new reader.
    ///
    /// `root` is the kernel page table root used for addresses outside the
    /// linear map window.
    pub fn new(
        core: &'a SnapCore<Arch>,
        offsets: &'a MapleOffsets,
        root: Option<Pa>,
        limits: MapleLimits,
    ) -> Self {
        Self {
            core,
            offsets,
            root,
            limits,
        }
    }

    fn context(&self, va: Va) -> AccessContext {
        AccessContext {
            address: va.0,
            mechanism: TranslationMechanism::Paging { root: self.root },
        }
    }

    /// Enumerates the object pointers stored in the tree at `mt`.
    ///
    /// Entries are reported in index order. The callback returns `false` to
    /// stop. Unreadable nodes are skipped; only a failure to read `ma_root`
    /// itself is an error.
    ///
    /// Returns the number of nodes read.
    pub fn enumerate(
        &self,
        mt: Va,
        mut callback: impl FnMut(Va) -> bool,
    ) -> Result<usize, SnapError> {
        let entry = self.core.read_u64(self.context(mt + self.offsets.ma_root))?;

        if !xa_is_node(entry) {
            if is_pointer(entry) {
                callback(Va(entry));
            }

            return Ok(0);
        }

        let mut worklist = vec![Pending {
            entry,
            min: 0,
            max: u64::MAX,
            depth: 0,
        }];
        let mut visited = 0;

        while let Some(pending) = worklist.pop() {
            if visited >= self.limits.node_budget {
                tracing::warn!(%mt, visited, "maple tree node budget exhausted");
                break;
            }

            visited += 1;

            let node = mte_to_node(pending.entry);
            let words: [u64; MAPLE_NODE_WORDS] = match self.core.read_struct(self.context(node)) {
                Ok(words) => words,
                Err(err) => {
                    tracing::trace!(%node, %err, "skipping unreadable maple node");
                    continue;
                }
            };

            let typ = match mte_node_type(pending.entry) {
                Some(typ) => typ,
                None => {
                    tracing::warn!(entry = pending.entry, "unknown maple node type");
                    continue;
                }
            };

            let mut children = Vec::new();
            let mut stop = false;

            {
                let mut visit = |slot: u64, first: u64, last: u64| {
                    if stop {
                        return;
                    }

                    if typ.is_leaf() {
                        if is_pointer(slot) && !callback(Va(slot)) {
                            stop = true;
                        }
                    }
                    else if xa_is_node(slot) {
                        children.push((slot, first, last));
                    }
                };

                match typ {
                    MapleType::Dense => {
                        for i in 0..MAPLE_NODE_SLOTS {
                            let slot = word(&words, self.offsets.dense_slot, i);
                            visit(slot, pending.min, pending.max);
                        }
                    }
                    MapleType::Leaf64 | MapleType::Range64 => walk_pivots(
                        &words,
                        self.offsets.range64_pivot,
                        self.offsets.range64_slot,
                        MAPLE_RANGE64_SLOTS,
                        false,
                        pending.min,
                        pending.max,
                        &mut visit,
                    ),
                    MapleType::Arange64 => walk_pivots(
                        &words,
                        self.offsets.arange64_pivot,
                        self.offsets.arange64_slot,
                        MAPLE_ARANGE64_SLOTS,
                        true,
                        pending.min,
                        pending.max,
                        &mut visit,
                    ),
                }
            }

            if stop {
                break;
            }

            if pending.depth + 1 > self.limits.max_depth && !children.is_empty() {
                tracing::warn!(%node, depth = pending.depth, "maple tree depth limit reached");
                continue;
            }

            for (entry, min, max) in children.into_iter().rev() {
                worklist.push(Pending {
                    entry,
                    min,
                    max,
                    depth: pending.depth + 1,
                });
            }
        }

        Ok(visited)
    }
}

fn word(words: &[u64; MAPLE_NODE_WORDS], offset: u64, index: usize) -> u64 {
    (offset as usize / 8)
        .checked_add(index)
        .and_then(|index| words.get(index))
        .copied()
        .unwrap_or(0)
}

/// Visits the slots of a pivot node with their index ranges.
///
/// A zero pivot past the first slot ends the node, as does reaching `max`.
#[allow(clippy::too_many_arguments)]
fn walk_pivots(
    words: &[u64; MAPLE_NODE_WORDS],
    pivot_offset: u64,
    slot_offset: u64,
    slots: usize,
    allocation_range: bool,
    min: u64,
    max: u64,
    visit: &mut impl FnMut(u64, u64, u64),
) {
    let mut first = min;

    for i in 0..slots {
        let slot = word(words, slot_offset, i);
        let mut last = max;

        if i < slots - 1 {
            last = word(words, pivot_offset, i);
        }
        else if slot == 0 && (allocation_range || max != u64::MAX) {
            break;
        }

        if last == 0 && i > 0 {
            break;
        }

        visit(slot, first, last);

        if last == max {
            break;
        }

        first = last.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_tags() {
        assert!(xa_is_node(0xffff_0000_1234_5616));
        assert!(!xa_is_node(xa_mk_internal(257)));
        assert!(xa_is_zero(xa_mk_internal(257)));
        assert!(!is_pointer(0x0000_0000_0000_0081));
        assert!(is_pointer(0xffff_0000_1234_5600));
        assert_eq!(mte_node_type(0xffff_0000_1234_5600 | (2 << 3) | 2), Some(MapleType::Range64));
        assert_eq!(mte_to_node(0xffff_0000_1234_561e), Va(0xffff_0000_1234_5600));
    }

    #[test]
    fn pivots_stop_at_max() {
        let mut words = [0u64; MAPLE_NODE_WORDS];
        // pivots at +8, slots at +128
        words[1] = 0x0fff;
        words[2] = u64::MAX;
        words[16] = 0xaaa0;
        words[17] = 0xbbb0;
        words[18] = 0xccc0;

        let mut seen = Vec::new();
        walk_pivots(&words, 8, 128, 16, false, 0, u64::MAX, &mut |slot, first, last| {
            seen.push((slot, first, last))
        });

        assert_eq!(seen, vec![(0xaaa0, 0, 0x0fff), (0xbbb0, 0x1000, u64::MAX)]);
    }
}
