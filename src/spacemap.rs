//! Per-blob free-interval bookkeeping.
//!
//! A space map tracks which byte ranges of one blob file are allocated. Free
//! intervals partition `[0, capacity)` together with the allocated ranges;
//! all ranges are half-open. Allocation is lowest-offset first-fit, release
//! coalesces with adjacent free intervals.
//!
//! ```text
//! offset:   0        100       200       300            capacity
//!           +---------+---------+---------+----------------+
//!           | alloc   |  free   | alloc   |   free tail    |
//!           +---------+---------+---------+----------------+
//!                                         ^
//!                                         used_boundary
//! ```
//!
//! Two representations are available behind the same interface: a B-tree
//! keyed by interval offset, and a sorted vector of `(offset, len)` runs.
//! They differ only in lookup cost.

use std::collections::BTreeMap;

use crate::errlogic;
use crate::error::Result;

/// Space-map representation selector. Semantics are identical; only the
/// backing structure differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceMapKind {
    IntervalTree,
    SortedList,
}

/// Free-interval map over `[0, capacity)` for a single blob file.
#[derive(Debug, Clone)]
pub struct SpaceMap {
    repr: Repr,
    capacity: u64,
}

#[derive(Debug, Clone)]
enum Repr {
    Tree(BTreeMap<u64, u64>),
    List(Vec<(u64, u64)>),
}

impl SpaceMap {
    pub fn new(kind: SpaceMapKind, capacity: u64) -> Self {
        let repr = match kind {
            SpaceMapKind::IntervalTree => {
                let mut free = BTreeMap::new();
                if capacity > 0 {
                    free.insert(0, capacity);
                }
                Repr::Tree(free)
            }
            SpaceMapKind::SortedList => {
                let mut free = Vec::new();
                if capacity > 0 {
                    free.push((0, capacity));
                }
                Repr::List(free)
            }
        };
        Self { repr, capacity }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocates `size` contiguous bytes at the lowest offset where they fit.
    /// Returns `None` when no free interval is large enough.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        debug_assert!(size > 0, "zero-sized allocation");
        match &mut self.repr {
            Repr::Tree(free) => {
                let (off, len) = free
                    .iter()
                    .find(|(_, &len)| len >= size)
                    .map(|(&off, &len)| (off, len))?;
                free.remove(&off);
                if len > size {
                    free.insert(off + size, len - size);
                }
                Some(off)
            }
            Repr::List(free) => {
                let idx = free.iter().position(|&(_, len)| len >= size)?;
                let (off, len) = free[idx];
                if len > size {
                    free[idx] = (off + size, len - size);
                } else {
                    free.remove(idx);
                }
                Some(off)
            }
        }
    }

    /// Marks `[offset, offset + size)` free again, coalescing neighbors.
    /// Releasing a range that is not fully allocated is a `Logic` error.
    pub fn release(&mut self, offset: u64, size: u64) -> Result<()> {
        let end = offset + size;
        if size == 0 || end > self.capacity {
            return Err(errlogic!(
                "release out of bounds, offset={offset} size={size} capacity={}",
                self.capacity
            ));
        }

        // Locate free neighbors and reject overlap before touching anything.
        let (prev, next) = self.neighbors(offset);
        if let Some((poff, plen)) = prev {
            if poff + plen > offset {
                return Err(errlogic!(
                    "release of unallocated range, offset={offset} size={size} overlaps free [{poff}, {})",
                    poff + plen
                ));
            }
        }
        if let Some((noff, nlen)) = next {
            if noff < end {
                return Err(errlogic!(
                    "release of unallocated range, offset={offset} size={size} overlaps free [{noff}, {})",
                    noff + nlen
                ));
            }
        }

        let mut start = offset;
        let mut stop = end;
        if let Some((poff, plen)) = prev {
            if poff + plen == offset {
                self.remove_interval(poff);
                start = poff;
            }
        }
        if let Some((noff, nlen)) = next {
            if noff == end {
                self.remove_interval(noff);
                stop = noff + nlen;
            }
        }
        self.insert_interval(start, stop - start);
        Ok(())
    }

    /// Carves `[offset, offset + size)` out of the free space. Used when
    /// rebuilding the map from directory entries at startup; the range must
    /// be entirely free.
    pub fn mark_used(&mut self, offset: u64, size: u64) -> Result<()> {
        let end = offset + size;
        if size == 0 || end > self.capacity {
            return Err(errlogic!(
                "mark_used out of bounds, offset={offset} size={size} capacity={}",
                self.capacity
            ));
        }

        let (prev, _) = self.neighbors(end);
        let (foff, flen) = match prev {
            Some((foff, flen)) if foff <= offset && foff + flen >= end => (foff, flen),
            _ => {
                return Err(errlogic!(
                    "mark_used of non-free range, offset={offset} size={size}"
                ))
            }
        };

        self.remove_interval(foff);
        if offset > foff {
            self.insert_interval(foff, offset - foff);
        }
        if foff + flen > end {
            self.insert_interval(end, foff + flen - end);
        }
        Ok(())
    }

    /// Highest offset ever allocated into and not since released from the
    /// tail. Everything at or beyond it is free.
    pub fn used_boundary(&self) -> u64 {
        let last = match &self.repr {
            Repr::Tree(free) => free.iter().next_back().map(|(&off, &len)| (off, len)),
            Repr::List(free) => free.last().copied(),
        };
        match last {
            Some((off, len)) if off + len == self.capacity => off,
            _ => self.capacity,
        }
    }

    /// Size of the largest free interval. A capacity hint, not a promise.
    pub fn max_free_extent(&self) -> u64 {
        match &self.repr {
            Repr::Tree(free) => free.values().max().copied().unwrap_or(0),
            Repr::List(free) => free.iter().map(|&(_, len)| len).max().unwrap_or(0),
        }
    }

    /// Free intervals at or before `pos` (the last starting at `<= pos`) and
    /// strictly after it.
    fn neighbors(&self, pos: u64) -> (Option<(u64, u64)>, Option<(u64, u64)>) {
        match &self.repr {
            Repr::Tree(free) => {
                let prev = free.range(..=pos).next_back().map(|(&o, &l)| (o, l));
                let next = free
                    .range(pos + 1..)
                    .next()
                    .map(|(&o, &l)| (o, l));
                (prev, next)
            }
            Repr::List(free) => {
                let idx = free.partition_point(|&(off, _)| off <= pos);
                let prev = idx.checked_sub(1).map(|i| free[i]);
                let next = free.get(idx).copied();
                (prev, next)
            }
        }
    }

    fn remove_interval(&mut self, offset: u64) {
        match &mut self.repr {
            Repr::Tree(free) => {
                free.remove(&offset);
            }
            Repr::List(free) => {
                if let Ok(idx) = free.binary_search_by_key(&offset, |&(off, _)| off) {
                    free.remove(idx);
                }
            }
        }
    }

    fn insert_interval(&mut self, offset: u64, len: u64) {
        match &mut self.repr {
            Repr::Tree(free) => {
                free.insert(offset, len);
            }
            Repr::List(free) => {
                let idx = free.partition_point(|&(off, _)| off < offset);
                free.insert(idx, (offset, len));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds() -> [SpaceMapKind; 2] {
        [SpaceMapKind::IntervalTree, SpaceMapKind::SortedList]
    }

    #[test]
    fn test_first_fit_lowest_offset() {
        for kind in kinds() {
            let mut smap = SpaceMap::new(kind, 1000);

            assert_eq!(smap.allocate(100), Some(0));
            assert_eq!(smap.allocate(100), Some(100));
            assert_eq!(smap.allocate(100), Some(200));
            assert_eq!(smap.used_boundary(), 300);

            // Free the middle interval; the next same-sized allocation must
            // reuse it instead of extending the tail.
            smap.release(100, 100).unwrap();
            assert_eq!(smap.allocate(100), Some(100));
            assert_eq!(smap.used_boundary(), 300);
        }
    }

    #[test]
    fn test_allocation_too_large() {
        for kind in kinds() {
            let mut smap = SpaceMap::new(kind, 100);
            assert_eq!(smap.allocate(101), None);
            assert_eq!(smap.allocate(100), Some(0));
            assert_eq!(smap.allocate(1), None);
        }
    }

    #[test]
    fn test_release_coalesces_neighbors() {
        for kind in kinds() {
            let mut smap = SpaceMap::new(kind, 300);
            assert_eq!(smap.allocate(300), Some(0));
            assert_eq!(smap.used_boundary(), 300);

            smap.release(0, 100).unwrap();
            smap.release(200, 100).unwrap();
            // Filling the gap merges all three into [0, 300).
            smap.release(100, 100).unwrap();

            assert_eq!(smap.used_boundary(), 0);
            assert_eq!(smap.max_free_extent(), 300);
            assert_eq!(smap.allocate(300), Some(0));
        }
    }

    #[test]
    fn test_double_release_is_logic_error() {
        for kind in kinds() {
            let mut smap = SpaceMap::new(kind, 100);
            assert_eq!(smap.allocate(50), Some(0));
            smap.release(0, 50).unwrap();
            assert!(smap.release(0, 50).is_err());
            // Releasing a range overlapping the free tail is just as invalid.
            assert!(smap.release(60, 10).is_err());
        }
    }

    #[test]
    fn test_used_boundary_tracks_tail_releases() {
        for kind in kinds() {
            let mut smap = SpaceMap::new(kind, 1000);
            assert_eq!(smap.used_boundary(), 0);

            smap.allocate(100).unwrap();
            smap.allocate(100).unwrap();
            assert_eq!(smap.used_boundary(), 200);

            // Releasing the tail allocation pulls the boundary back.
            smap.release(100, 100).unwrap();
            assert_eq!(smap.used_boundary(), 100);
            smap.release(0, 100).unwrap();
            assert_eq!(smap.used_boundary(), 0);
        }
    }

    #[test]
    fn test_mark_used_carves_free_space() {
        for kind in kinds() {
            let mut smap = SpaceMap::new(kind, 500);
            smap.mark_used(100, 50).unwrap();
            smap.mark_used(300, 100).unwrap();
            assert_eq!(smap.used_boundary(), 400);

            // Overlapping an already-used range fails.
            assert!(smap.mark_used(120, 10).is_err());
            assert!(smap.mark_used(90, 20).is_err());

            // First-fit skips the carved-out holes.
            assert_eq!(smap.allocate(100), Some(150));
            smap.release(100, 50).unwrap();
            assert_eq!(smap.allocate(40), Some(100));
        }
    }

    #[test]
    fn test_max_free_extent_lags_fragmentation() {
        for kind in kinds() {
            let mut smap = SpaceMap::new(kind, 400);
            for i in 0..4 {
                assert_eq!(smap.allocate(100), Some(i * 100));
            }
            assert_eq!(smap.max_free_extent(), 0);

            smap.release(0, 100).unwrap();
            smap.release(200, 100).unwrap();
            // Two 100-byte holes: the largest extent is 100, not 200.
            assert_eq!(smap.max_free_extent(), 100);
        }
    }

    #[test]
    fn test_randomized_against_reference() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        for kind in kinds() {
            let mut rng = StdRng::seed_from_u64(0x5eed);
            let capacity = 1 << 12;
            let mut smap = SpaceMap::new(kind, capacity);
            // Reference model: one bool per byte.
            let mut used = vec![false; capacity as usize];
            let mut live: Vec<(u64, u64)> = Vec::new();

            for _ in 0..2000 {
                if rng.gen_bool(0.6) || live.is_empty() {
                    let size = rng.gen_range(1..=64u64);
                    if let Some(off) = smap.allocate(size) {
                        for b in &mut used[off as usize..(off + size) as usize] {
                            assert!(!*b, "allocated over live bytes");
                            *b = true;
                        }
                        live.push((off, size));
                    } else {
                        let max_run = used
                            .split(|&b| b)
                            .map(|run| run.len() as u64)
                            .max()
                            .unwrap_or(0);
                        assert!(max_run < size, "allocate refused a fitting run");
                    }
                } else {
                    let idx = rng.gen_range(0..live.len());
                    let (off, size) = live.swap_remove(idx);
                    smap.release(off, size).unwrap();
                    for b in &mut used[off as usize..(off + size) as usize] {
                        *b = false;
                    }
                }

                let boundary = used
                    .iter()
                    .rposition(|&b| b)
                    .map(|i| i as u64 + 1)
                    .unwrap_or(0);
                assert_eq!(smap.used_boundary(), boundary);
            }
        }
    }
}
