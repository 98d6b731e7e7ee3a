//! Disjoint time-interval set with merge-on-insert
//!
//! One `TimeRange` tracks the wall-clock windows charged to a single
//! (subject, stack) bucket. A task can sleep in the same stack many times,
//! and separately recorded episodes may overlap or touch; inserting merges
//! so the running total never double-counts a window.

use std::collections::BTreeMap;

/// Set of non-overlapping, non-touching `[start, end]` intervals in
/// microseconds, with a running total duration.
///
/// Invariant: stored intervals are pairwise disjoint and non-adjacent, and
/// `total` equals the sum of their lengths. Both are maintained
/// incrementally on insert.
#[derive(Debug, Clone, Default)]
pub struct TimeRange {
    ranges: BTreeMap<u64, u64>,
    total: u64,
}

impl TimeRange {
    pub fn new(start_us: u64, end_us: u64) -> Self {
        let mut tr = Self::default();
        tr.insert(start_us, end_us);
        tr
    }

    /// Insert an interval, absorbing every stored interval it overlaps or
    /// touches. A single insert may bridge an arbitrary chain of
    /// previously-disjoint intervals; the absorb loop runs until no
    /// neighbor is left to merge.
    pub fn insert(&mut self, start_us: u64, end_us: u64) {
        if end_us <= start_us {
            return;
        }
        let mut start = start_us;
        let mut end = end_us;
        loop {
            // Candidates all have start <= end; the rightmost of them is
            // the only one that can overlap without having been absorbed
            // on an earlier pass.
            let hit = self
                .ranges
                .range(..=end)
                .next_back()
                .filter(|&(_, &e)| e >= start)
                .map(|(&s, &e)| (s, e));
            match hit {
                Some((s, e)) => {
                    if s <= start && e >= end {
                        return; // already fully covered
                    }
                    self.ranges.remove(&s);
                    self.total -= e - s;
                    start = start.min(s);
                    end = end.max(e);
                }
                None => {
                    self.ranges.insert(start, end);
                    self.total += end - start;
                    return;
                }
            }
        }
    }

    /// Total covered duration in microseconds
    pub fn total_us(&self) -> u64 {
        self.total
    }

    pub fn total_secs(&self) -> f64 {
        self.total as f64 / 1_000_000.0
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Stored intervals in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }
}
