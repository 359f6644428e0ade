use serde::{Deserialize, Serialize};

use super::ContentType;

/// A change to the registry that affects its aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsEvent {
    /// A page record was created. New pages start unclassified.
    PageCreated,

    /// A mapping was added to a page that now has `count_after` mappings.
    MappingAdded {
        /// Mapping count of the page after the addition.
        count_after: usize,
    },

    /// A mapping was removed from a page that now has `count_after`
    /// mappings.
    MappingRemoved {
        /// Mapping count of the page after the removal.
        count_after: usize,
    },

    /// A page changed its content classification.
    ContentChanged {
        /// Previous classification.
        from: ContentType,

        /// New classification.
        to: ContentType,
    },

    /// A page was marked as kernel memory for the first time.
    KernelMarked,

    /// A page record was folded into a larger record covering it.
    ///
    /// Its mappings are moved with their own removal and addition events.
    PageAbsorbed {
        /// Classification of the absorbed page.
        content: ContentType,

        /// Whether the absorbed page was kernel memory.
        kernel: bool,
    },

    /// The first mapping of a process was recorded.
    ProcessAdded,

    /// A mapping was dropped by the physical address filter.
    Dropped,
}

/// Point-in-time aggregates of a [`PageRegistry`].
///
/// Produced by folding [`StatsEvent`]s with [`apply`]; never re-derived from
/// the page records.
///
/// [`PageRegistry`]: super::PageRegistry
/// [`apply`]: Self::apply
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Number of page records.
    pub total_pages: usize,

    /// Number of distinct `(pid, va)` mappings.
    pub total_mappings: usize,

    /// Number of pages with more than one mapping.
    pub shared_pages: usize,

    /// Number of pages marked as kernel memory.
    pub kernel_pages: usize,

    /// Number of processes with at least one recorded mapping.
    pub processes: usize,

    /// Number of mappings rejected by the physical address filter.
    pub dropped: usize,

    /// Number of pages per content classification.
    pub content: [usize; ContentType::COUNT],
}

impl RegistryStats {
    /// Returns the aggregates after `event`.
    pub fn apply(self, event: StatsEvent) -> Self {
        let mut next = self;

        match event {
            StatsEvent::PageCreated => {
                next.total_pages += 1;
                next.content[ContentType::Unclassified.index()] += 1;
            }
            StatsEvent::MappingAdded { count_after } => {
                next.total_mappings += 1;

                if count_after == 2 {
                    next.shared_pages += 1;
                }
            }
            StatsEvent::MappingRemoved { count_after } => {
                next.total_mappings = next.total_mappings.saturating_sub(1);

                if count_after == 1 {
                    next.shared_pages = next.shared_pages.saturating_sub(1);
                }
            }
            StatsEvent::ContentChanged { from, to } => {
                let from = &mut next.content[from.index()];
                *from = from.saturating_sub(1);
                next.content[to.index()] += 1;
            }
            StatsEvent::KernelMarked => next.kernel_pages += 1,
            StatsEvent::PageAbsorbed { content, kernel } => {
                next.total_pages = next.total_pages.saturating_sub(1);

                let bucket = &mut next.content[content.index()];
                *bucket = bucket.saturating_sub(1);

                if kernel {
                    next.kernel_pages = next.kernel_pages.saturating_sub(1);
                }
            }
            StatsEvent::ProcessAdded => next.processes += 1,
            StatsEvent::Dropped => next.dropped += 1,
        }

        next
    }

    /// Returns the number of pages with the given classification.
    pub fn pages_with(&self, content: ContentType) -> usize {
        self.content[content.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(events: &[StatsEvent]) -> RegistryStats {
        events
            .iter()
            .fold(RegistryStats::default(), |stats, &event| stats.apply(event))
    }

    #[test]
    fn shared_transition_happens_once() {
        let stats = fold(&[
            StatsEvent::PageCreated,
            StatsEvent::MappingAdded { count_after: 1 },
            StatsEvent::MappingAdded { count_after: 2 },
            StatsEvent::MappingAdded { count_after: 3 },
        ]);

        assert_eq!(stats.total_pages, 1);
        assert_eq!(stats.total_mappings, 3);
        assert_eq!(stats.shared_pages, 1);

        let stats = stats
            .apply(StatsEvent::MappingRemoved { count_after: 2 })
            .apply(StatsEvent::MappingRemoved { count_after: 1 });
        assert_eq!(stats.total_mappings, 1);
        assert_eq!(stats.shared_pages, 0);
    }

    #[test]
    fn histogram_moves_between_buckets() {
        let stats = fold(&[
            StatsEvent::PageCreated,
            StatsEvent::PageCreated,
            StatsEvent::ContentChanged {
                from: ContentType::Unclassified,
                to: ContentType::Code,
            },
            StatsEvent::ContentChanged {
                from: ContentType::Code,
                to: ContentType::KernelStructure,
            },
        ]);

        assert_eq!(stats.pages_with(ContentType::Unclassified), 1);
        assert_eq!(stats.pages_with(ContentType::Code), 0);
        assert_eq!(stats.pages_with(ContentType::KernelStructure), 1);
        assert_eq!(stats.content.iter().sum::<usize>(), stats.total_pages);
    }

    #[test]
    fn drops_and_processes() {
        let stats = fold(&[
            StatsEvent::Dropped,
            StatsEvent::Dropped,
            StatsEvent::ProcessAdded,
            StatsEvent::KernelMarked,
        ]);

        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.processes, 1);
        assert_eq!(stats.kernel_pages, 1);
        assert_eq!(stats.total_pages, 0);
    }

    #[test]
    fn absorbed_page_leaves_every_aggregate() {
        let stats = fold(&[
            StatsEvent::PageCreated,
            StatsEvent::ContentChanged {
                from: ContentType::Unclassified,
                to: ContentType::Heap,
            },
            StatsEvent::KernelMarked,
            StatsEvent::PageCreated,
            StatsEvent::PageAbsorbed {
                content: ContentType::Heap,
                kernel: true,
            },
        ]);

        assert_eq!(stats.total_pages, 1);
        assert_eq!(stats.kernel_pages, 0);
        assert_eq!(stats.pages_with(ContentType::Heap), 0);
        assert_eq!(stats.content.iter().sum::<usize>(), stats.total_pages);
    }
}
