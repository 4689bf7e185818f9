//! Per-segment page state tracking.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::addr::{PageIndex, PageSize};

/// One `Unmapped`/`Mapped` slot per page of a segment's memory footprint.
///
/// Slots only ever move from unmapped to mapped. They are atomics so the fault
/// handler can update them through a shared reference; the table takes no locks.
pub struct SegmentPageTable {
    pages: Box<[AtomicBool]>,
}

impl SegmentPageTable {
    /// Allocates `ceil(mem_size / page_size)` unmapped slots.
    pub fn new(mem_size: u64, page_size: PageSize) -> Self {
        let pages = (0..page_size.pages_for(mem_size))
            .map(|_| AtomicBool::new(false))
            .collect();
        Self { pages }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Whether `page` has been materialized. Out-of-range pages are never mapped.
    pub fn is_mapped(&self, page: PageIndex) -> bool {
        self.pages
            .get(page.as_usize())
            .is_some_and(|slot| slot.load(Ordering::Acquire))
    }

    /// Records `page` as materialized. Out-of-range pages are ignored.
    pub fn mark_mapped(&self, page: PageIndex) {
        if let Some(slot) = self.pages.get(page.as_usize()) {
            slot.store(true, Ordering::Release);
        }
    }

    pub fn mapped_count(&self) -> usize {
        self.pages
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_to_cover_memory_footprint() {
        let ps = PageSize::DEFAULT;
        assert_eq!(SegmentPageTable::new(8192, ps).len(), 2);
        assert_eq!(SegmentPageTable::new(8193, ps).len(), 3);
        assert_eq!(SegmentPageTable::new(1, ps).len(), 1);
        assert!(SegmentPageTable::new(0, ps).is_empty());
    }

    #[test]
    fn transitions_are_monotonic() {
        let table = SegmentPageTable::new(3 * 4096, PageSize::DEFAULT);
        let page = PageIndex::new(1);
        assert!(!table.is_mapped(page));
        assert_eq!(table.mapped_count(), 0);

        table.mark_mapped(page);
        assert!(table.is_mapped(page));
        table.mark_mapped(page);
        assert!(table.is_mapped(page));
        assert!(!table.is_mapped(PageIndex::new(0)));
        assert_eq!(table.mapped_count(), 1);
    }

    #[test]
    fn out_of_range_is_unmapped() {
        let table = SegmentPageTable::new(4096, PageSize::DEFAULT);
        table.mark_mapped(PageIndex::new(5));
        assert!(!table.is_mapped(PageIndex::new(5)));
        assert_eq!(table.mapped_count(), 0);
    }
}
