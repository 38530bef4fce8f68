//! Extent ledger
//!
//! An appendable list of allocation-status ranges covering one query
//! window. Backends answer block-status requests by adding extents in
//! ascending, contiguous order; the ledger truncates them to the window
//! and coalesces neighbours of equal type so the result can be encoded
//! as-is.

use std::fmt;

use crate::error::{BackendError, BackendResult};

/// Default cap on stored entries, keeping replies and memory bounded
/// when a backend reports frequent alternations.
pub const MAX_EXTENTS: usize = 1024 * 1024;

/// Largest offset or length a ledger accepts
const MAX_OFFSET: u64 = i64::MAX as u64;

/// Allocation-status bits of an extent
///
/// An empty set means "allocated data". Any bit may only be reported
/// when it holds for the whole range, so the bitwise AND of two types is
/// always a safe type for the merged range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExtentType(u32);

impl ExtentType {
    /// Allocated data
    pub const ALLOCATED: Self = Self(0);
    /// Range is a hole (unallocated)
    pub const HOLE: Self = Self(1 << 0);
    /// Range reads as zeroes
    pub const ZERO: Self = Self(1 << 1);
    /// Hole that reads as zeroes (sparse region)
    pub const SPARSE: Self = Self(Self::HOLE.0 | Self::ZERO.0);

    const KNOWN: u32 = Self::HOLE.0 | Self::ZERO.0;

    /// Create from raw bits, dropping bits this crate does not know
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::KNOWN)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Check if hole flag is set
    pub fn is_hole(&self) -> bool {
        self.0 & Self::HOLE.0 != 0
    }

    /// Check if zero flag is set
    pub fn is_zero(&self) -> bool {
        self.0 & Self::ZERO.0 != 0
    }

    /// Type of a range made by merging ranges of both types
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

impl std::ops::BitAnd for ExtentType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl std::ops::BitOr for ExtentType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ExtentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_hole(), self.is_zero()) {
            (false, false) => write!(f, "allocated"),
            (true, false) => write!(f, "hole"),
            (false, true) => write!(f, "zero"),
            (true, true) => write!(f, "hole,zero"),
        }
    }
}

/// A contiguous byte range tagged with allocation-status bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Allocation status
    pub ty: ExtentType,
}

impl Extent {
    /// Create a new extent
    pub fn new(offset: u64, length: u64, ty: ExtentType) -> Self {
        Self { offset, length, ty }
    }

    /// Get the end offset
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Check if offset falls within this extent
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Ordered, coalescing list of extents over the window `[start, end)`
#[derive(Debug, Clone)]
pub struct Extents {
    extents: Vec<Extent>,
    start: u64,
    end: u64,
    /// Where the next extent must begin. Updated even when an extent is
    /// dropped so that API misuse is always caught.
    next: Option<u64>,
    max_extents: usize,
    truncated: bool,
}

impl Extents {
    /// Create an empty ledger for `[start, end)`
    pub fn new(start: u64, end: u64) -> BackendResult<Self> {
        Self::with_limit(start, end, MAX_EXTENTS)
    }

    /// Create an empty ledger with a custom cap on stored entries
    pub fn with_limit(start: u64, end: u64, max_extents: usize) -> BackendResult<Self> {
        if start > MAX_OFFSET || end > MAX_OFFSET {
            return Err(BackendError::Range(format!(
                "start ({start}) or end ({end}) > {MAX_OFFSET}"
            )));
        }
        // start == end is a valid, empty window
        if start > end {
            return Err(BackendError::Range(format!(
                "start ({start}) > end ({end})"
            )));
        }
        if max_extents == 0 {
            return Err(BackendError::Range("extent limit must be non-zero".to_string()));
        }

        Ok(Self {
            extents: Vec::new(),
            start,
            end,
            next: None,
            max_extents,
            truncated: false,
        })
    }

    /// Start of the window
    pub fn start(&self) -> u64 {
        self.start
    }

    /// End of the window (exclusive)
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Offset the next added extent must start at, if any were added
    pub fn next_offset(&self) -> Option<u64> {
        self.next
    }

    /// Number of stored extents
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Check if no extents are stored
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Get the extent at `index`
    pub fn get(&self, index: usize) -> Option<Extent> {
        self.extents.get(index).copied()
    }

    /// Stored extents in ascending order
    pub fn as_slice(&self) -> &[Extent] {
        &self.extents
    }

    /// Iterate over stored extents
    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter()
    }

    /// Whether extents were dropped because the entry cap was reached.
    ///
    /// A truncated ledger is still a valid answer: it covers
    /// `[start, covered_end())` and callers report only that prefix.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// End of the contiguous range covered by stored extents
    pub fn covered_end(&self) -> u64 {
        self.extents.last().map_or(self.start, Extent::end)
    }

    /// Add an extent
    ///
    /// Extents must be added in strictly ascending, contiguous order.
    /// Zero-length extents and extents beyond the window are accepted and
    /// ignored. The first stored extent must cover `start`.
    pub fn add(&mut self, offset: u64, length: u64, ty: ExtentType) -> BackendResult<()> {
        let expected = self.next;
        self.next = Some(offset.saturating_add(length));

        if let Some(expected) = expected {
            if expected != offset {
                return Err(BackendError::Ordering {
                    expected,
                    found: offset,
                });
            }
        }

        if length == 0 {
            return Ok(());
        }

        if offset >= self.end {
            return Ok(());
        }
        if self.extents.len() >= self.max_extents {
            self.truncated = true;
            return Ok(());
        }

        let mut offset = offset;
        let mut length = length.min(self.end - offset);

        if self.extents.is_empty() {
            if offset + length <= self.start {
                return Ok(());
            }
            if offset > self.start {
                return Err(BackendError::Range(format!(
                    "first extent must not be > start ({})",
                    self.start
                )));
            }
            let overlap = self.start - offset;
            length -= overlap;
            offset += overlap;
        }

        match self.extents.last_mut() {
            Some(last) if last.ty == ty => last.length += length,
            _ => self.extents.push(Extent::new(offset, length, ty)),
        }
        Ok(())
    }

    pub(crate) fn first_mut(&mut self) -> Option<&mut Extent> {
        self.extents.first_mut()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Extent> {
        self.extents.get_mut(index)
    }

    pub(crate) fn remove(&mut self, index: usize) -> Extent {
        self.extents.remove(index)
    }

    /// Keep only the first `len` extents and move the cursor to the end of
    /// the last one kept.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.extents.truncate(len);
        if let Some(last) = self.extents.last() {
            self.next = Some(last.end());
        }
    }

    /// Replace the stored extents wholesale
    pub(crate) fn replace(&mut self, extents: Vec<Extent>) {
        self.extents = extents;
        self.next = self.extents.last().map(Extent::end).or(self.next);
    }

    pub(crate) fn into_vec(self) -> Vec<Extent> {
        self.extents
    }
}

impl<'a> IntoIterator for &'a Extents {
    type Item = &'a Extent;
    type IntoIter = std::slice::Iter<'a, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.extents.iter()
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_type() -> impl Strategy<Value = ExtentType> {
        (0u32..4).prop_map(ExtentType::from_bits_truncate)
    }

    proptest! {
        /// Property: contiguous insertions always yield a sorted,
        /// non-overlapping, in-window, fully coalesced list
        #[test]
        fn ledger_invariants(
            start in 0u64..1000,
            window in 0u64..2000,
            first_back in 0u64..500,
            runs in prop::collection::vec((1u64..300, arb_type()), 0..50)
        ) {
            let end = start + window;
            let mut exts = Extents::new(start, end).unwrap();
            let mut offset = start.saturating_sub(first_back);
            for (length, ty) in &runs {
                exts.add(offset, *length, *ty).unwrap();
                offset += length;
            }

            let list = exts.as_slice();
            for e in list {
                prop_assert!(e.length > 0);
                prop_assert!(e.offset >= start);
                prop_assert!(e.end() <= end);
            }
            for pair in list.windows(2) {
                prop_assert_eq!(pair[0].end(), pair[1].offset);
                prop_assert_ne!(pair[0].ty, pair[1].ty);
            }
            if let Some(first) = list.first() {
                prop_assert_eq!(first.offset, start);
            }
            let covered: u64 = list.iter().map(|e| e.length).sum();
            let expected = offset.min(end).saturating_sub(start);
            prop_assert_eq!(covered, expected);
        }

        /// Property: any gap or overlap is an ordering error
        #[test]
        fn ledger_rejects_discontiguous(
            first in 1u64..100,
            skew in prop_oneof![1i64..50, -50i64..0]
        ) {
            let mut exts = Extents::new(0, 1000).unwrap();
            exts.add(0, first, ExtentType::ALLOCATED).unwrap();
            let bad = (first as i64 + skew).max(0) as u64;
            prop_assume!(bad != first);
            let result = exts.add(bad, 10, ExtentType::HOLE);
            let is_ordering = matches!(result, Err(BackendError::Ordering { .. }));
            prop_assert!(is_ordering);
            prop_assert_eq!(exts.next_offset(), Some(bad + 10));
        }
    }
}
