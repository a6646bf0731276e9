//! A sorted, disjoint, half-open interval collection over an integer index
//! domain. Used throughout this crate to represent sample validity and the
//! missing-sample regions a read transaction must zero-fill.
//!
//! Invariants: sorted, disjoint, non-adjacent, half-open. `include`/
//! `exclude` use an equal-range search under a `less`/`less_equal`
//! comparator to find the intervals a new range touches or splits.
//! `marshal` writes a leading count followed by raw `(begin, end)` pairs,
//! over `Vec` with `bytes::{Buf, BufMut}` rather than raw pointer casts.

use std::fmt;
use std::ops::{Add, BitAnd, BitOr, Div, Rem, Sub};

use bytes::{Buf, BufMut, NativeEndian};
use failure::Fail;

/// The arithmetic a [`SparseIntervalSet`] index type needs: ordering,
/// addition/subtraction for `shift`, and division/remainder for `shrink`'s
/// floor/ceil rounding.
pub trait IntervalIndex:
    Copy + Ord + fmt::Debug + Add<Output = Self> + Sub<Output = Self> + Div<Output = Self> + Rem<Output = Self>
{
    const ZERO: Self;
    const ONE: Self;
}

macro_rules! impl_interval_index {
    ($($t:ty),*) => {
        $(
            impl IntervalIndex for $t {
                const ZERO: Self = 0;
                const ONE: Self = 1;
            }
        )*
    };
}

impl_interval_index!(u32, u64, i32, i64);

/// A sample-time index. Monotonically increasing, never wraps semantically;
/// only `ring_buffer` addressing wraps it modulo `R`.
pub type TimeStamp = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Range<T> {
    begin: T,
    end: T,
}

impl<T: IntervalIndex> Range<T> {
    fn new(begin: T, end: T) -> Self {
        Self { begin, end }
    }

}

/// A sorted, disjoint, half-open interval set over `T`.
///
/// Invariants (checked by `debug_assert_invariants` in tests): intervals are
/// sorted by `begin`, pairwise disjoint and non-adjacent, and every stored
/// interval has `begin < end`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SparseIntervalSet<T> {
    ranges: Vec<Range<T>>,
}

impl<T: IntervalIndex> Default for SparseIntervalSet<T> {
    fn default() -> Self {
        Self { ranges: Vec::new() }
    }
}

#[derive(Debug, Fail)]
pub enum MarshalError {
    #[fail(display = "buffer too small to marshal {} ranges ({} bytes needed, {} available)", ranges, needed, available)]
    BufferTooSmall {
        ranges: usize,
        needed: usize,
        available: usize,
    },
}

impl<T: IntervalIndex> SparseIntervalSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(index: T) -> Self {
        let mut set = Self::new();
        set.include(index, index + T::ONE);
        set
    }

    /// Add `[a, b)`. No-op if `a >= b`. Merges with any interval that
    /// overlaps or touches the new range, found via an equal-range search
    /// under a touching-is-overlapping comparator.
    pub fn include(&mut self, a: T, b: T) {
        if a >= b {
            return;
        }

        // start: first range whose end is not strictly before `a`.
        let start = self.ranges.partition_point(|r| r.end < a);
        // end: first range whose begin is strictly after `b`.
        let end = self.ranges.partition_point(|r| r.begin <= b);

        if start == end {
            self.ranges.insert(start, Range::new(a, b));
        } else {
            let begin = a.min(self.ranges[start].begin);
            let new_end = b.max(self.ranges[end - 1].end);
            self.ranges.splice(start..end, std::iter::once(Range::new(begin, new_end)));
        }
    }

    /// Remove `[a, b)`. No-op if `a >= b`. Splits an interval when the
    /// removed range sits strictly inside it; merely-adjacent intervals are
    /// left untouched.
    pub fn exclude(&mut self, a: T, b: T) {
        if a >= b {
            return;
        }

        // start: first range whose end is strictly after `a`.
        let start = self.ranges.partition_point(|r| r.end <= a);
        // end: first range whose begin is not strictly before `b`.
        let end = self.ranges.partition_point(|r| r.begin < b);

        if start >= end {
            return;
        }

        if end - start == 1 && a > self.ranges[start].begin && b < self.ranges[start].end {
            let tail = Range::new(b, self.ranges[start].end);
            self.ranges[start].end = a;
            self.ranges.insert(start + 1, tail);
            return;
        }

        let mut new_start = start;
        let mut new_end = end;

        if a > self.ranges[new_start].begin {
            self.ranges[new_start].end = a;
            new_start += 1;
        }

        if new_end > new_start && b < self.ranges[new_end - 1].end {
            self.ranges[new_end - 1].begin = b;
            new_end -= 1;
        }

        self.ranges.drain(new_start..new_end);
    }

    /// `true` iff some interval contains `i`.
    pub fn test(&self, i: T) -> bool {
        match self.ranges.binary_search_by(|r| {
            if r.end <= i {
                std::cmp::Ordering::Less
            } else if r.begin > i {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    pub fn count(&self) -> T {
        let mut total = T::ZERO;
        for r in &self.ranges {
            total = total + (r.end - r.begin);
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate the stored `(begin, end)` pairs in order.
    pub fn ranges(&self) -> impl Iterator<Item = (T, T)> + '_ {
        self.ranges.iter().map(|r| (r.begin, r.end))
    }

    /// Translate all endpoints by `+c`.
    pub fn shift_forward(&mut self, c: T) {
        for r in &mut self.ranges {
            r.begin = r.begin + c;
            r.end = r.end + c;
        }
    }

    /// Translate all endpoints by `-c`. Precondition: the first interval's
    /// `begin >= c` (checked with `debug_assert!`, per this crate's policy
    /// of asserting rather than recovering from programming errors).
    pub fn shift_backward(&mut self, c: T) {
        debug_assert!(
            self.ranges.is_empty() || self.ranges[0].begin >= c,
            "shift_backward({:?}) underflows first interval {:?}",
            c,
            self.ranges.first()
        );
        for r in &mut self.ranges {
            r.begin = r.begin - c;
            r.end = r.end - c;
        }
    }

    /// Divide all endpoints by `f`: `begin -> floor(begin/f)`, `end ->
    /// ceil(end/f)`. Re-merges neighbors that may now touch or overlap.
    /// `f = 1` (or `f = 0`, the identity) is a no-op.
    pub fn shrink(&mut self, f: T) {
        if f == T::ONE {
            return;
        }

        let mut shrunk: Vec<Range<T>> = Vec::with_capacity(self.ranges.len());
        for r in &self.ranges {
            let begin = r.begin / f;
            let rem = r.end % f;
            let end = if rem == T::ZERO { r.end / f } else { r.end / f + T::ONE };

            if let Some(last) = shrunk.last_mut() {
                if last.end >= begin {
                    last.end = last.end.max(end);
                    continue;
                }
            }
            shrunk.push(Range::new(begin, end));
        }
        self.ranges = shrunk;
    }

    /// The complement within `[lo, hi)`.
    pub fn invert(&self, lo: T, hi: T) -> Self {
        let mut inverted = Self::new();
        let mut cursor = lo;
        for r in &self.ranges {
            inverted.include(cursor, r.begin);
            cursor = r.end;
        }
        inverted.include(cursor, hi);
        inverted
    }

    /// The intersection with `[lo, hi)`.
    pub fn subset(&self, lo: T, hi: T) -> Self {
        self & &Self::from_single_range(lo, hi)
    }

    fn from_single_range(a: T, b: T) -> Self {
        let mut set = Self::new();
        set.include(a, b);
        set
    }

    /// Writes a 32-bit count followed by `n` raw `(begin, end)` pairs.
    pub fn marshal<B: BufMut>(&self, buf: &mut B) -> Result<usize, MarshalError>
    where
        T: Into<u64>,
    {
        let needed = 4 + self.ranges.len() * 16;
        if buf.remaining_mut() < needed {
            return Err(MarshalError::BufferTooSmall {
                ranges: self.ranges.len(),
                needed,
                available: buf.remaining_mut(),
            });
        }

        buf.put_u32::<NativeEndian>(self.ranges.len() as u32);
        for r in &self.ranges {
            buf.put_u64::<NativeEndian>(r.begin.into());
            buf.put_u64::<NativeEndian>(r.end.into());
        }

        Ok(needed)
    }

    /// Inverse of `marshal`. Trusts the leading count.
    pub fn unmarshal<B: Buf>(buf: &mut B) -> Self
    where
        T: From<u64>,
    {
        let n = buf.get_u32::<NativeEndian>() as usize;
        let mut ranges = Vec::with_capacity(n);
        for _ in 0..n {
            let begin = T::from(buf.get_u64::<NativeEndian>());
            let end = T::from(buf.get_u64::<NativeEndian>());
            ranges.push(Range::new(begin, end));
        }
        Self { ranges }
    }

    #[cfg(test)]
    fn debug_assert_invariants(&self) {
        for w in self.ranges.windows(2) {
            assert!(w[0].end < w[1].begin, "ranges not disjoint/non-adjacent: {:?}", self.ranges);
        }
        for r in &self.ranges {
            assert!(r.begin < r.end, "zero/negative-width range: {:?}", r);
        }
    }
}

impl<T: IntervalIndex> BitOr<&SparseIntervalSet<T>> for &SparseIntervalSet<T> {
    type Output = SparseIntervalSet<T>;

    fn bitor(self, other: &SparseIntervalSet<T>) -> SparseIntervalSet<T> {
        let mut result = Vec::new();
        let (mut i, mut j) = (0, 0);

        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];

            if a.end < b.begin {
                result.push(a);
                i += 1;
            } else if b.end < a.begin {
                result.push(b);
                j += 1;
            } else {
                let mut begin = a.begin.min(b.begin);
                let mut end = a.end.max(b.end);
                i += 1;
                j += 1;
                loop {
                    let mut merged = false;
                    if i < self.ranges.len() && self.ranges[i].begin <= end {
                        end = end.max(self.ranges[i].end);
                        begin = begin.min(self.ranges[i].begin);
                        i += 1;
                        merged = true;
                    }
                    if j < other.ranges.len() && other.ranges[j].begin <= end {
                        end = end.max(other.ranges[j].end);
                        begin = begin.min(other.ranges[j].begin);
                        j += 1;
                        merged = true;
                    }
                    if !merged {
                        break;
                    }
                }
                result.push(Range::new(begin, end));
            }
        }

        result.extend_from_slice(&self.ranges[i..]);
        result.extend_from_slice(&other.ranges[j..]);
        SparseIntervalSet { ranges: result }
    }
}

impl<T: IntervalIndex> BitAnd<&SparseIntervalSet<T>> for &SparseIntervalSet<T> {
    type Output = SparseIntervalSet<T>;

    fn bitand(self, other: &SparseIntervalSet<T>) -> SparseIntervalSet<T> {
        let mut result = Vec::new();
        let (mut i, mut j) = (0, 0);

        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];

            if a.end < b.begin {
                i += 1;
            } else if b.end < a.begin {
                j += 1;
            } else {
                result.push(Range::new(a.begin.max(b.begin), a.end.min(b.end)));
                if a.end < b.end {
                    i += 1;
                } else {
                    j += 1;
                }
            }
        }

        SparseIntervalSet { ranges: result }
    }
}
