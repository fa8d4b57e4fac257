use std::collections::BTreeMap;
use std::collections::btree_map::Range;

/// Interval map over the 64 bit address space, ordered by range start.
/// Every set the checkers juggle (pending/seen/reada/nodes, shared subtree
/// nodes, extent and inode record populations, corrupt blocks, pinned
/// ranges) is one of these with a different payload type.
///
/// Ranges never overlap within one tree; `insert` refuses an overlapping
/// range rather than merging, coalescing is the caller's business.
pub struct CacheTree<T> {
    map: BTreeMap<u64, CacheEntry<T>>,
}

struct CacheEntry<T> {
    size: u64,
    value: T,
}

impl<T> Default for CacheTree<T> {
    fn default() -> Self {
        CacheTree::new()
    }
}

impl<T> CacheTree<T> {
    pub fn new() -> CacheTree<T> {
        CacheTree {
            map: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// insert [start, start + size); fails without touching the tree when
    /// the range overlaps an existing entry
    pub fn insert(&mut self, start: u64, size: u64, value: T) -> Result<(), T> {
        if let Some((_, _, _)) = self.find(start, size.max(1)) {
            return Err(value);
        }
        self.map.insert(start, CacheEntry { size, value });
        Ok(())
    }

    /// find the entry overlapping [start, start + min_size)
    pub fn find(&self, start: u64, min_size: u64) -> Option<(u64, u64, &T)> {
        let end = start.saturating_add(min_size.max(1));
        // candidate at or below start first, then the first entry above
        if let Some((&s, e)) = self.map.range(..=start).next_back() {
            if s + e.size > start {
                return Some((s, e.size, &e.value));
            }
        }
        if let Some((&s, e)) = self.range_from(start.saturating_add(1)).next() {
            if s < end {
                return Some((s, e.size, &e.value));
            }
        }
        None
    }

    pub fn find_mut(&mut self, start: u64, min_size: u64) -> Option<(u64, u64, &mut T)> {
        let key = self.find(start, min_size).map(|(s, _, _)| s)?;
        let e = self.map.get_mut(&key).unwrap();
        Some((key, e.size, &mut e.value))
    }

    /// first entry whose end lies beyond min_start
    pub fn find_first(&self, min_start: u64) -> Option<(u64, u64, &T)> {
        if let Some((&s, e)) = self.map.range(..=min_start).next_back() {
            if s + e.size > min_start {
                return Some((s, e.size, &e.value));
            }
        }
        self.range_from(min_start)
            .next()
            .map(|(&s, e)| (s, e.size, &e.value))
    }

    /// first entry at or after `start` by range start, ignoring extents
    /// that merely straddle it
    pub fn next_after(&self, start: u64) -> Option<(u64, u64, &T)> {
        self.range_from(start.checked_add(1)?)
            .next()
            .map(|(&s, e)| (s, e.size, &e.value))
    }

    pub fn get(&self, start: u64) -> Option<&T> {
        self.map.get(&start).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, start: u64) -> Option<&mut T> {
        self.map.get_mut(&start).map(|e| &mut e.value)
    }

    pub fn remove(&mut self, start: u64) -> Option<(u64, T)> {
        self.map.remove(&start).map(|e| (e.size, e.value))
    }

    pub fn pop_first(&mut self) -> Option<(u64, u64, T)> {
        let (&start, _) = self.map.iter().next()?;
        let e = self.map.remove(&start).unwrap();
        Some((start, e.size, e.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &T)> {
        self.map.iter().map(|(&s, e)| (s, e.size, &e.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, u64, &mut T)> {
        self.map.iter_mut().map(|(&s, e)| (s, e.size, &mut e.value))
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    fn range_from(&self, start: u64) -> Range<u64, CacheEntry<T>> {
        self.map.range(start..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_overlap() {
        let mut t = CacheTree::new();
        t.insert(100, 50, "a").unwrap();
        assert!(t.insert(120, 10, "b").is_err());
        assert!(t.insert(90, 20, "c").is_err());
        assert!(t.insert(99, 1, "d").is_ok());
        assert!(t.insert(150, 1, "e").is_ok());
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn find_hits_straddling_range() {
        let mut t = CacheTree::new();
        t.insert(4096, 4096, ()).unwrap();
        assert!(t.find(4096, 1).is_some());
        assert!(t.find(8191, 1).is_some());
        assert!(t.find(8192, 1).is_none());
        assert!(t.find(0, 4097).is_some());
        assert!(t.find(0, 4096).is_none());
    }

    #[test]
    fn find_first_and_ordering() {
        let mut t = CacheTree::new();
        for start in [300_u64, 100, 200] {
            t.insert(start, 10, start).unwrap();
        }
        assert_eq!(t.find_first(0).unwrap().0, 100);
        assert_eq!(t.find_first(105).unwrap().0, 100);
        assert_eq!(t.find_first(110).unwrap().0, 200);
        let starts: Vec<u64> = t.iter().map(|(s, _, _)| s).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn pop_first_drains_in_order() {
        let mut t = CacheTree::new();
        t.insert(2, 1, ()).unwrap();
        t.insert(1, 1, ()).unwrap();
        assert_eq!(t.pop_first().unwrap().0, 1);
        assert_eq!(t.pop_first().unwrap().0, 2);
        assert!(t.pop_first().is_none());
    }
}
