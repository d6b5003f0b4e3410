//! Half-open byte ranges and a set that refuses overlapping members.
//!
//! Offsets and lengths inside raw containers are fully attacker-controlled. Every parser that
//! carves regions out of a shared value area registers them here first, so two directory
//! entries (or two `mdat` chunks) can never claim the same bytes.

use std::collections::BTreeSet;
use std::ops::Bound;

/// A half-open range `[begin, begin + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    begin: u64,
    size: u64,
}

impl Range {
    /// Create a new range.
    pub fn new(begin: u64, size: u64) -> Self {
        Self { begin, size }
    }

    /// The first position in the range.
    pub fn begin(&self) -> u64 {
        self.begin
    }

    /// One past the last position in the range.
    pub fn end(&self) -> u64 {
        self.begin.saturating_add(self.size)
    }

    /// The length of the range.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `pos` lies inside the range.
    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.begin && pos < self.end()
    }

    /// Whether two ranges overlap.
    ///
    /// Ranges that start at the same position always overlap, even if one of them is empty.
    pub fn overlaps(&self, other: &Range) -> bool {
        let (first, second) = if self.begin <= other.begin {
            (self, other)
        } else {
            (other, self)
        };

        first.begin == second.begin || first.end() > second.begin
    }
}

/// A set of mutually non-overlapping ranges.
#[derive(Debug, Clone, Default)]
pub struct NORangesSet {
    elts: BTreeSet<(u64, u64)>,
}

impl NORangesSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `range` overlaps any member of the set.
    pub fn overlaps(&self, range: &Range) -> bool {
        // Members are disjoint, so only the direct neighbours need to be checked.
        let before = self
            .elts
            .range(..=(range.begin, u64::MAX))
            .next_back()
            .map(|&(begin, end)| Range::new(begin, end - begin));
        let after = self
            .elts
            .range((Bound::Excluded((range.begin, u64::MAX)), Bound::Unbounded))
            .next()
            .map(|&(begin, end)| Range::new(begin, end - begin));

        before.is_some_and(|r| r.overlaps(range)) || after.is_some_and(|r| r.overlaps(range))
    }

    /// Insert `range` if it does not overlap any member. Returns whether it was inserted.
    pub fn insert(&mut self, range: Range) -> bool {
        if self.overlaps(&range) {
            return false;
        }

        self.elts.insert((range.begin, range.end()))
    }

    /// The number of ranges in the set.
    pub fn len(&self) -> usize {
        self.elts.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.elts.is_empty()
    }
}
