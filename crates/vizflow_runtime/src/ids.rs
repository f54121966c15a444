// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dense integer identifier allocation.
//!
//! Ids are handed out as contiguous ranges from `[first, limit)`. Freed ranges
//! go to an ordered free-list and are coalesced with their neighbours; a free
//! range touching the high-water mark lowers it instead.

use std::collections::BTreeMap;
use std::ops::Range;

/// Allocator of small dense ids
#[derive(Debug, Clone)]
pub struct IdAllocator {
    first: u32,
    limit: u32,
    next: u32,
    free: BTreeMap<u32, u32>,
}

impl IdAllocator {
    /// Create an allocator handing out ids in `[first, limit)`
    pub fn new(first: u32, limit: u32) -> Self {
        Self {
            first,
            limit: limit.max(first),
            next: first,
            free: BTreeMap::new(),
        }
    }

    /// Allocate a single id
    pub fn allocate(&mut self) -> Option<u32> {
        self.allocate_range(1).map(|range| range.start)
    }

    /// Allocate `count` contiguous ids. An empty request yields an empty range.
    pub fn allocate_range(&mut self, count: u32) -> Option<Range<u32>> {
        if count == 0 {
            return Some(self.next..self.next);
        }

        // First fit in the free-list.
        let fit = self
            .free
            .iter()
            .find(|(_, len)| **len >= count)
            .map(|(start, len)| (*start, *len));
        if let Some((start, len)) = fit {
            self.free.remove(&start);
            if len > count {
                self.free.insert(start + count, len - count);
            }
            return Some(start..start + count);
        }

        // A free block right below the high-water mark can be extended.
        let mut start = self.next;
        if let Some((&s, &len)) = self.free.last_key_value() {
            if s + len == self.next {
                start = s;
            }
        }
        let end = start.checked_add(count).filter(|end| *end <= self.limit)?;
        self.free.remove(&start);
        self.next = end;
        Some(start..end)
    }

    /// Grow an allocated range in place by `extra` ids. Returns false if the
    /// ids right after it are taken.
    pub fn try_extend(&mut self, range: &Range<u32>, extra: u32) -> bool {
        if extra == 0 {
            return true;
        }
        if range.end == self.next {
            return match self.next.checked_add(extra) {
                Some(end) if end <= self.limit => {
                    self.next = end;
                    true
                }
                _ => false,
            };
        }
        match self.free.get(&range.end).copied() {
            Some(len) if len >= extra => {
                self.free.remove(&range.end);
                if len > extra {
                    self.free.insert(range.end + extra, len - extra);
                }
                true
            }
            Some(len) if range.end + len == self.next => {
                // The free block reaches the high-water mark: take it and grow.
                let end = range.end + extra;
                if end > self.limit {
                    return false;
                }
                self.free.remove(&range.end);
                self.next = end;
                true
            }
            _ => false,
        }
    }

    /// Return a range to the allocator
    pub fn release_range(&mut self, range: Range<u32>) {
        if range.is_empty() {
            return;
        }
        if range.start < self.first || range.end > self.next || self.overlaps_free(&range) {
            tracing::warn!("Ignoring release of ids {range:?} that are not allocated");
            return;
        }

        let (mut start, mut end) = (range.start, range.end);
        if let Some((&s, &len)) = self.free.range(..start).next_back() {
            if s + len == start {
                self.free.remove(&s);
                start = s;
            }
        }
        if let Some(len) = self.free.remove(&end) {
            end += len;
        }

        if end == self.next {
            self.next = start;
        } else {
            self.free.insert(start, end - start);
        }
    }

    /// Return a single id
    pub fn release(&mut self, id: u32) {
        self.release_range(id..id.saturating_add(1));
    }

    fn overlaps_free(&self, range: &Range<u32>) -> bool {
        self.free
            .range(..range.end)
            .next_back()
            .is_some_and(|(&s, &len)| s + len > range.start)
    }

    /// Whether an id is currently handed out
    pub fn is_allocated(&self, id: u32) -> bool {
        id >= self.first && id < self.next && !self.overlaps_free(&(id..id + 1))
    }

    /// Number of ids currently handed out
    pub fn allocated(&self) -> u32 {
        let free: u32 = self.free.values().sum();
        self.next - self.first - free
    }

    /// Ids that can still be handed out
    pub fn available(&self) -> u32 {
        self.limit - self.first - self.allocated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_densely_from_first() {
        let mut ids = IdAllocator::new(1, 100);
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate_range(3), Some(2..5));
        assert_eq!(ids.allocated(), 4);
        assert!(ids.is_allocated(4));
        assert!(!ids.is_allocated(5));
        assert!(!ids.is_allocated(0));
    }

    #[test]
    fn released_ids_are_reused_first_fit() {
        let mut ids = IdAllocator::new(0, 100);
        let a = ids.allocate_range(4).unwrap();
        let _b = ids.allocate_range(4).unwrap();
        ids.release_range(a);
        assert_eq!(ids.allocate_range(2), Some(0..2));
        assert_eq!(ids.allocate_range(2), Some(2..4));
        assert_eq!(ids.allocate_range(1), Some(8..9));
    }

    #[test]
    fn neighbours_coalesce_and_high_water_drops() {
        let mut ids = IdAllocator::new(0, 100);
        let a = ids.allocate_range(2).unwrap();
        let b = ids.allocate_range(2).unwrap();
        let c = ids.allocate_range(2).unwrap();
        ids.release_range(a);
        ids.release_range(c);
        ids.release_range(b);
        assert_eq!(ids.allocated(), 0);
        assert_eq!(ids.allocate_range(6), Some(0..6));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut ids = IdAllocator::new(1, 4);
        assert_eq!(ids.allocate_range(3), Some(1..4));
        assert_eq!(ids.allocate(), None);
        assert_eq!(ids.available(), 0);
        ids.release(2);
        assert_eq!(ids.allocate_range(2), None);
        assert_eq!(ids.allocate(), Some(2));
    }

    #[test]
    fn extend_in_place_only_when_free() {
        let mut ids = IdAllocator::new(0, 10);
        let a = ids.allocate_range(2).unwrap();
        assert!(ids.try_extend(&a, 2));
        let a = a.start..a.end + 2;
        let b = ids.allocate_range(2).unwrap();
        assert!(!ids.try_extend(&a, 1));
        ids.release_range(b);
        assert!(ids.try_extend(&a, 3));
        assert!(!ids.try_extend(&(0..7), 4));
    }

    #[test]
    fn double_release_is_ignored() {
        let mut ids = IdAllocator::new(0, 10);
        let a = ids.allocate_range(3).unwrap();
        let _b = ids.allocate_range(3).unwrap();
        ids.release_range(a.clone());
        ids.release_range(a);
        assert_eq!(ids.allocated(), 3);
    }
}
