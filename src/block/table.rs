//! Per-block record of active view mappings.
//!
//! The [`ViewTable`] tracks which page-aligned sub-ranges of a view-compatible block
//! currently alias which backing store, as a sorted sequence of non-overlapping
//! intervals. Inserting a mapping splits or removes whatever it overlaps, so every page
//! is accounted for by at most one current view; removal only touches intervals tagged
//! with the store being unmapped, which is what makes unmapping idempotent at the block
//! layer.
//!
//! Operations are O(intervals touched) after a binary search; the syscall issued next
//! to every structural change dominates the cost regardless.

use std::sync::Arc;

use super::BackingStore;

/// One active view mapping: `length` bytes at `offset` in the viewing block alias
/// `store` starting at `store_offset`.
pub(crate) struct ViewMapping {
    /// Offset within the viewing block
    pub offset: u64,
    /// Length of the aliased range in bytes
    pub length: u64,
    /// The backing store the range resolves to
    pub store: Arc<BackingStore>,
    /// Offset within the backing store
    pub store_offset: u64,
}

impl ViewMapping {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Ordered, non-overlapping record of a block's active view mappings.
pub(crate) struct ViewTable {
    entries: Vec<ViewMapping>,
}

impl ViewTable {
    pub(crate) fn new() -> Self {
        ViewTable {
            entries: Vec::new(),
        }
    }

    /// Index of the first entry that ends after `offset`.
    fn first_candidate(&self, offset: u64) -> usize {
        self.entries.partition_point(|entry| entry.end() <= offset)
    }

    /// Records a new mapping, splitting or evicting whatever it overlaps, then
    /// coalescing with neighbours that continue the same store contiguously.
    pub(crate) fn insert(&mut self, mapping: ViewMapping) {
        let start = mapping.offset;
        let end = mapping.end();

        let mut i = self.first_candidate(start);
        while i < self.entries.len() && self.entries[i].offset < end {
            let entry = &self.entries[i];
            if entry.offset < start && entry.end() > end {
                // The new mapping punches a hole in the middle of this entry.
                let right = ViewMapping {
                    offset: end,
                    length: entry.end() - end,
                    store: Arc::clone(&entry.store),
                    store_offset: entry.store_offset + (end - entry.offset),
                };
                self.entries[i].length = start - self.entries[i].offset;
                self.entries.insert(i + 1, right);
                break;
            } else if entry.offset < start {
                // Overlaps our head: keep its left part.
                let keep = start - entry.offset;
                self.entries[i].length = keep;
                i += 1;
            } else if entry.end() > end {
                // Overlaps our tail: keep its right part.
                let cut = end - entry.offset;
                self.entries[i].offset = end;
                self.entries[i].store_offset += cut;
                self.entries[i].length -= cut;
                break;
            } else {
                // Fully covered by the new mapping.
                self.entries.remove(i);
            }
        }

        let position = self.entries.partition_point(|entry| entry.offset < start);
        self.entries.insert(position, mapping);
        self.coalesce_around(position);
    }

    /// Merges the entry at `position` with direct neighbours that alias the same store
    /// at contiguous offsets.
    fn coalesce_around(&mut self, position: usize) {
        let mut position = position;
        if position > 0 {
            let (left, right) = (&self.entries[position - 1], &self.entries[position]);
            if Arc::ptr_eq(&left.store, &right.store)
                && left.end() == right.offset
                && left.store_offset + left.length == right.store_offset
            {
                let merged = self.entries[position].length;
                self.entries[position - 1].length += merged;
                self.entries.remove(position);
                position -= 1;
            }
        }
        if position + 1 < self.entries.len() {
            let (left, right) = (&self.entries[position], &self.entries[position + 1]);
            if Arc::ptr_eq(&left.store, &right.store)
                && left.end() == right.offset
                && left.store_offset + left.length == right.store_offset
            {
                let merged = self.entries[position + 1].length;
                self.entries[position].length += merged;
                self.entries.remove(position + 1);
            }
        }
    }

    /// Returns the sub-ranges of `[offset, offset + length)` currently aliased to
    /// `store`, as `(offset, length)` pairs in ascending order.
    pub(crate) fn aliased_ranges(
        &self,
        store: &Arc<BackingStore>,
        offset: u64,
        length: u64,
    ) -> Vec<(u64, u64)> {
        let end = offset + length;
        let mut ranges = Vec::new();

        let mut i = self.first_candidate(offset);
        while i < self.entries.len() && self.entries[i].offset < end {
            let entry = &self.entries[i];
            if Arc::ptr_eq(&entry.store, store) {
                let from = entry.offset.max(offset);
                let to = entry.end().min(end);
                ranges.push((from, to - from));
            }
            i += 1;
        }
        ranges
    }

    /// Removes the portions of entries tagged with `store` that intersect
    /// `[offset, offset + length)`, leaving differently-tagged and non-intersecting
    /// portions untouched.
    pub(crate) fn remove(&mut self, store: &Arc<BackingStore>, offset: u64, length: u64) {
        let start = offset;
        let end = offset + length;

        let mut i = self.first_candidate(start);
        while i < self.entries.len() && self.entries[i].offset < end {
            let entry = &self.entries[i];
            if !Arc::ptr_eq(&entry.store, store) {
                i += 1;
                continue;
            }

            if entry.offset < start && entry.end() > end {
                let right = ViewMapping {
                    offset: end,
                    length: entry.end() - end,
                    store: Arc::clone(&entry.store),
                    store_offset: entry.store_offset + (end - entry.offset),
                };
                self.entries[i].length = start - self.entries[i].offset;
                self.entries.insert(i + 1, right);
                break;
            } else if entry.offset < start {
                let keep = start - entry.offset;
                self.entries[i].length = keep;
                i += 1;
            } else if entry.end() > end {
                let cut = end - entry.offset;
                self.entries[i].offset = end;
                self.entries[i].store_offset += cut;
                self.entries[i].length -= cut;
                break;
            } else {
                self.entries.remove(i);
            }
        }
    }

    /// Returns the store and store offset backing `offset`, if any view covers it.
    pub(crate) fn backing_at(&self, offset: u64) -> Option<(Arc<BackingStore>, u64)> {
        let i = self.first_candidate(offset);
        let entry = self.entries.get(i)?;
        if entry.offset <= offset {
            Some((
                Arc::clone(&entry.store),
                entry.store_offset + (offset - entry.offset),
            ))
        } else {
            None
        }
    }

    /// Removes and returns every entry; used during block teardown.
    pub(crate) fn drain_all(&mut self) -> Vec<ViewMapping> {
        std::mem::take(&mut self.entries)
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<(u64, u64, u64)> {
        self.entries
            .iter()
            .map(|entry| (entry.offset, entry.length, entry.store_offset))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 0x1000;

    fn store() -> Arc<BackingStore> {
        Arc::new(BackingStore::new(PAGE * 64).unwrap())
    }

    fn mapping(store: &Arc<BackingStore>, offset: u64, length: u64, store_offset: u64) -> ViewMapping {
        ViewMapping {
            offset,
            length,
            store: Arc::clone(store),
            store_offset,
        }
    }

    #[test]
    fn insert_keeps_entries_sorted() {
        let s = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&s, PAGE * 8, PAGE, 0));
        table.insert(mapping(&s, PAGE * 2, PAGE, PAGE * 4));
        table.insert(mapping(&s, PAGE * 5, PAGE, PAGE * 2));

        assert_eq!(
            table.ranges(),
            vec![
                (PAGE * 2, PAGE, PAGE * 4),
                (PAGE * 5, PAGE, PAGE * 2),
                (PAGE * 8, PAGE, 0),
            ]
        );
    }

    #[test]
    fn insert_splits_overlapped_middle() {
        let s = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&s, 0, PAGE * 4, 0));
        table.insert(mapping(&s, PAGE, PAGE, PAGE * 10));

        // The original entry survives as its head and tail around the new view.
        assert_eq!(
            table.ranges(),
            vec![
                (0, PAGE, 0),
                (PAGE, PAGE, PAGE * 10),
                (PAGE * 2, PAGE * 2, PAGE * 2),
            ]
        );
    }

    #[test]
    fn insert_trims_head_and_tail_overlaps() {
        let s = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&s, 0, PAGE * 2, 0));
        table.insert(mapping(&s, PAGE * 3, PAGE * 2, PAGE * 8));
        table.insert(mapping(&s, PAGE, PAGE * 3, PAGE * 20));

        assert_eq!(
            table.ranges(),
            vec![
                (0, PAGE, 0),
                (PAGE, PAGE * 3, PAGE * 20),
                (PAGE * 4, PAGE, PAGE * 9),
            ]
        );
    }

    #[test]
    fn insert_evicts_fully_covered_entries() {
        let s = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&s, PAGE, PAGE, 0));
        table.insert(mapping(&s, PAGE * 2, PAGE, PAGE * 5));
        table.insert(mapping(&s, 0, PAGE * 4, PAGE * 16));

        assert_eq!(table.ranges(), vec![(0, PAGE * 4, PAGE * 16)]);
    }

    #[test]
    fn insert_coalesces_contiguous_same_store_neighbours() {
        let s = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&s, 0, PAGE, 0));
        table.insert(mapping(&s, PAGE, PAGE, PAGE));

        assert_eq!(table.ranges(), vec![(0, PAGE * 2, 0)]);

        // Contiguous in the block but not in the store: stays separate.
        table.insert(mapping(&s, PAGE * 2, PAGE, PAGE * 8));
        assert_eq!(table.ranges().len(), 2);
    }

    #[test]
    fn remove_only_touches_the_matching_store() {
        let a = store();
        let b = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&a, 0, PAGE * 2, 0));
        table.insert(mapping(&b, PAGE * 2, PAGE * 2, 0));

        table.remove(&a, 0, PAGE * 4);

        assert_eq!(table.ranges(), vec![(PAGE * 2, PAGE * 2, 0)]);
        assert!(table.backing_at(PAGE * 2).is_some());
        assert!(table.backing_at(0).is_none());
    }

    #[test]
    fn remove_splits_partially_covered_entries() {
        let s = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&s, 0, PAGE * 4, 0));
        table.remove(&s, PAGE, PAGE * 2);

        assert_eq!(
            table.ranges(),
            vec![(0, PAGE, 0), (PAGE * 3, PAGE, PAGE * 3)]
        );
    }

    #[test]
    fn aliased_ranges_reports_exact_intersections() {
        let s = store();
        let other = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&s, 0, PAGE * 2, 0));
        table.insert(mapping(&other, PAGE * 2, PAGE, 0));
        table.insert(mapping(&s, PAGE * 3, PAGE * 2, PAGE * 6));

        let ranges = table.aliased_ranges(&s, PAGE, PAGE * 3);
        assert_eq!(ranges, vec![(PAGE, PAGE), (PAGE * 3, PAGE)]);

        // Nothing of `s` inside a range only covering `other`.
        assert!(table.aliased_ranges(&s, PAGE * 2, PAGE).is_empty());
    }

    #[test]
    fn backing_at_translates_store_offsets() {
        let s = store();
        let mut table = ViewTable::new();

        table.insert(mapping(&s, PAGE * 2, PAGE * 2, PAGE * 10));

        let (_, store_offset) = table.backing_at(PAGE * 3).unwrap();
        assert_eq!(store_offset, PAGE * 11);
        assert!(table.backing_at(PAGE * 4).is_none());
    }
}
