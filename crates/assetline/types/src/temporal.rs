//! Timestamped values and validity windows.
//!
//! A validity window is `[not_before, not_after)`; either bound may be open,
//! in which case it stands for -inf / +inf. Comparisons take a tolerance
//! within which two instants count as equal.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A value observed at (or scheduled for) an instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    pub timestamp: DateTime<Utc>,
    pub value: T,
}

impl<T> Timestamped<T> {
    pub fn new(timestamp: DateTime<Utc>, value: T) -> Self {
        Self { timestamp, value }
    }
}

/// Capability of values that are only valid for a window of time.
pub trait Validity {
    /// Earliest instant the value applies; `None` means since forever.
    fn not_before(&self) -> Option<DateTime<Utc>>;

    /// Instant the value stops applying; `None` means open-ended.
    fn not_after(&self) -> Option<DateTime<Utc>>;

    /// The bounds as a plain window.
    fn window(&self) -> ValidityWindow {
        ValidityWindow::new(self.not_before(), self.not_after())
    }

    /// Whether `at` falls inside the window, widened by `tolerance` on both
    /// bounds.
    fn is_valid_at(&self, at: DateTime<Utc>, tolerance: StdDuration) -> bool {
        let tol = to_signed(tolerance);
        let after_start = match self.not_before() {
            Some(start) => start.checked_sub_signed(tol).map_or(true, |s| at >= s),
            None => true,
        };
        let before_end = match self.not_after() {
            Some(end) => end.checked_add_signed(tol).map_or(true, |e| at < e),
            None => true,
        };
        after_start && before_end
    }

    /// Whether the two windows overlap by more than `tolerance`.
    ///
    /// Windows that touch, or overlap by no more than the tolerance, do not
    /// conflict. Open bounds reach to infinity and conflict with anything on
    /// that side.
    fn overlaps<O: Validity + ?Sized>(&self, other: &O, tolerance: StdDuration) -> bool
    where
        Self: Sized,
    {
        let tol = to_signed(tolerance);
        !(ends_before(self.not_after(), other.not_before(), tol)
            || ends_before(other.not_after(), self.not_before(), tol))
    }

    /// Whether both bounds equal the other's bounds within `tolerance`.
    fn same_window<O: Validity + ?Sized>(&self, other: &O, tolerance: StdDuration) -> bool
    where
        Self: Sized,
    {
        bound_matches(self.not_before(), other.not_before(), tolerance)
            && bound_matches(self.not_after(), other.not_after(), tolerance)
    }
}

/// Plain validity window, usable on its own or as a building block of
/// domain values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl ValidityWindow {
    pub fn new(not_before: Option<DateTime<Utc>>, not_after: Option<DateTime<Utc>>) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    /// `[start, end)`.
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(Some(start), Some(end))
    }

    /// `[start, +inf)`.
    pub fn starting(start: DateTime<Utc>) -> Self {
        Self::new(Some(start), None)
    }

    /// `(-inf, end)`.
    pub fn until(end: DateTime<Utc>) -> Self {
        Self::new(None, Some(end))
    }

    /// `(-inf, +inf)`.
    pub fn always() -> Self {
        Self::default()
    }
}

impl Validity for ValidityWindow {
    fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }
}

fn ends_before(end: Option<DateTime<Utc>>, start: Option<DateTime<Utc>>, tol: Duration) -> bool {
    match (end, start) {
        (Some(end), Some(start)) => start.checked_add_signed(tol).map_or(true, |s| end <= s),
        _ => false,
    }
}

fn bound_matches(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>, tolerance: StdDuration) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => (a - b).abs() <= to_signed(tolerance),
        _ => false,
    }
}

fn to_signed(tolerance: StdDuration) -> Duration {
    Duration::from_std(tolerance).unwrap_or_else(|_| Duration::max_value())
}
