//! Object-id allocator: the shared id space stat-data items key off of,
//! represented on disk as a list of used `[start, end)` intervals rather
//! than a bitmap, since object ids are sparse over a 32-bit space
//! (spec.md §4.3; ported from `objmap.c`, SPEC_FULL.md §2).
//!
//! Intervals are kept sorted and merged: no two stored intervals are
//! adjacent or overlapping. `mark`/`unmark` absorb or split neighbors as
//! `objmap.c` does, so a lone freed id between two used ranges doesn't
//! leave a one-wide gap in the on-disk interval list.

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct ObjectIdMap {
    /// Sorted, non-adjacent, non-overlapping used ranges.
    used: Vec<(u32, u32)>,
    max: u32,
}

impl ObjectIdMap {
    /// A fresh map with a single reserved range `[0, first_free)` — id 0
    /// is never valid, ids below `first_free` are taken by the root
    /// directory and its lost+found reservation.
    pub fn new(first_free: u32, max: u32) -> ObjectIdMap {
        let used = if first_free > 0 { vec![(0, first_free)] } else { Vec::new() };
        ObjectIdMap { used, max }
    }

    pub fn from_used_ranges(used: Vec<(u32, u32)>, max: u32) -> ObjectIdMap {
        ObjectIdMap { used, max }
    }

    pub fn used_ranges(&self) -> &[(u32, u32)] {
        &self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    fn index_containing(&self, id: u32) -> Result<usize, usize> {
        self.used.binary_search_by(|&(s, e)| {
            if id < s {
                std::cmp::Ordering::Greater
            } else if id >= e {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }

    pub fn test(&self, id: u32) -> bool {
        self.index_containing(id).is_ok()
    }

    /// Mark `id` used, merging with an adjacent used interval on either
    /// side (or both, if `id` was the sole gap between two of them).
    pub fn mark(&mut self, id: u32) {
        if self.test(id) {
            return;
        }
        let insert_at = self.used.partition_point(|&(s, _)| s <= id);
        let touches_left = insert_at > 0 && self.used[insert_at - 1].1 == id;
        let touches_right = insert_at < self.used.len() && self.used[insert_at].0 == id + 1;

        match (touches_left, touches_right) {
            (true, true) => {
                let right_end = self.used[insert_at].1;
                self.used[insert_at - 1].1 = right_end;
                self.used.remove(insert_at);
            }
            (true, false) => {
                self.used[insert_at - 1].1 = id + 1;
            }
            (false, true) => {
                self.used[insert_at].0 = id;
            }
            (false, false) => {
                self.used.insert(insert_at, (id, id + 1));
            }
        }
    }

    /// Mark `id` free again (the inverse of [`mark`]): shrinks, splits, or
    /// removes the used interval `id` belongs to.
    pub fn unmark(&mut self, id: u32) {
        let idx = match self.index_containing(id) {
            Ok(i) => i,
            Err(_) => return,
        };
        let (start, end) = self.used[idx];
        match (id == start, id + 1 == end) {
            (true, true) => {
                self.used.remove(idx);
            }
            (true, false) => {
                self.used[idx].0 = id + 1;
            }
            (false, true) => {
                self.used[idx].1 = id;
            }
            (false, false) => {
                self.used[idx] = (start, id);
                self.used.insert(idx + 1, (id + 1, end));
            }
        }
    }

    /// Smallest unused id at or above `cursor`, or `None` if every id up
    /// to `max` is taken.
    pub fn next_free(&self, cursor: u32) -> Option<u32> {
        let mut candidate = cursor;
        loop {
            if candidate >= self.max {
                return None;
            }
            match self.index_containing(candidate) {
                Ok(idx) => candidate = self.used[idx].1,
                Err(_) => return Some(candidate),
            }
        }
    }

    pub fn alloc(&mut self, cursor: &mut u32) -> CoreResult<u32> {
        let id = self.next_free(*cursor).ok_or(CoreError::NoDiskSpace)?;
        self.mark(id);
        *cursor = id + 1;
        Ok(id)
    }

    pub fn flush(&self) -> Vec<(u32, u32)> {
        self.used.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_map_reserves_below_first_free() {
        let m = ObjectIdMap::new(10, 1000);
        assert!(m.test(0));
        assert!(m.test(9));
        assert!(!m.test(10));
    }

    #[test]
    fn mark_extends_adjacent_interval() {
        let mut m = ObjectIdMap::new(10, 1000);
        assert!(!m.test(10));
        m.mark(10);
        assert!(m.test(10));
        assert!(!m.test(11));
        assert_eq!(m.used_ranges(), &[(0, 11)]);
    }

    #[test]
    fn mark_merges_surrounding_intervals() {
        let mut m = ObjectIdMap::new(0, 1000);
        m.mark(5);
        m.mark(7);
        assert!(!m.test(6));
        m.mark(6);
        assert!(m.test(5));
        assert!(m.test(6));
        assert!(m.test(7));
        assert!(!m.test(8));
        assert_eq!(m.used_ranges(), &[(5, 8)]);
    }

    #[test]
    fn alloc_advances_cursor_and_skips_used() {
        let mut m = ObjectIdMap::new(3, 1000);
        let mut cursor = 0;
        let a = m.alloc(&mut cursor).unwrap();
        assert_eq!(a, 3);
        let b = m.alloc(&mut cursor).unwrap();
        assert_eq!(b, 4);
    }

    #[test]
    fn alloc_fails_when_exhausted() {
        let mut m = ObjectIdMap::new(0, 2);
        let mut cursor = 0;
        m.alloc(&mut cursor).unwrap();
        m.alloc(&mut cursor).unwrap();
        assert!(m.alloc(&mut cursor).is_err());
    }

    #[test]
    fn unmark_splits_interior_id() {
        let mut m = ObjectIdMap::new(10, 1000);
        m.unmark(5);
        assert!(!m.test(5));
        assert!(m.test(4));
        assert!(m.test(6));
        assert_eq!(m.used_ranges(), &[(0, 5), (6, 10)]);
    }

    #[test]
    fn unmark_removes_singleton_interval() {
        let mut m = ObjectIdMap::new(0, 1000);
        m.mark(5);
        m.unmark(5);
        assert!(m.used_ranges().is_empty());
    }
}
