//! Interval coalescing.
//!
//! Periodic position sampling of one continuous viewing produces many small,
//! often overlapping or duplicated intervals. Coalescing them into disjoint
//! runs is what keeps a session from being counted twice.

use serde::{Deserialize, Serialize};

/// A `[start, end)` range of unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: i64,
    pub end: i64,
}

impl Span {
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Length in seconds, zero for empty or inverted spans. Saturates at `i64::MAX`.
    #[must_use]
    pub const fn len(&self) -> i64 {
        if self.end > self.start {
            self.end.saturating_sub(self.start)
        } else {
            0
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Merges spans into disjoint, ascending runs.
///
/// Spans that overlap or touch (`next.start <= current.end`) are joined.
/// Empty and inverted spans are ignored.
#[must_use]
pub fn coalesce(spans: &[Span]) -> Vec<Span> {
    let mut sorted: Vec<Span> = spans.iter().filter(|s| !s.is_empty()).copied().collect();
    if sorted.is_empty() {
        return sorted;
    }
    sorted.sort_unstable_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));

    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        if let Some(last) = merged.last_mut() {
            if span.start <= last.end {
                last.end = last.end.max(span.end);
            } else {
                merged.push(span);
            }
        } else {
            merged.push(span);
        }
    }
    merged
}

/// Total seconds covered by the spans, each second counted once.
#[must_use]
pub fn coalesced_seconds(spans: &[Span]) -> i64 {
    saturating_total(coalesce(spans).iter())
}

/// Naive sum of span lengths, counting overlaps repeatedly.
#[must_use]
pub fn raw_seconds(spans: &[Span]) -> i64 {
    saturating_total(spans.iter())
}

/// Sums span lengths, saturating at `i64::MAX`.
fn saturating_total<'a>(spans: impl Iterator<Item = &'a Span>) -> i64 {
    spans.map(Span::len).fold(0, i64::saturating_add)
}
