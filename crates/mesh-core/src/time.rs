//! Modify-time tracking for cached entities.
//!
//! This module provides [`Timestamp`], the millisecond-resolution time used
//! for entity modify times and for every cache watermark.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
///
/// A zero timestamp is the "beginning of time" floor used for first loads
/// and full reloads. Subtracting a window never goes below zero.
///
/// # Example
///
/// ```rust
/// use mesh_core::Timestamp;
/// use std::time::Duration;
///
/// let t = Timestamp::from_millis(1_500);
/// assert_eq!(t.saturating_sub(Duration::from_secs(1)).as_millis(), 500);
/// assert_eq!(t.saturating_sub(Duration::from_secs(5)), Timestamp::ZERO);
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create a timestamp from Unix milliseconds. Negative values clamp to zero.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        if millis < 0 {
            Self::ZERO
        } else {
            Self(millis)
        }
    }

    /// Current wall-clock time of this process.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Get the raw millisecond value.
    #[inline]
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Check if this is the zero timestamp.
    #[inline]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Subtract a duration, saturating at zero.
    #[must_use]
    pub fn saturating_sub(&self, window: Duration) -> Self {
        let window = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(window).max(0))
    }

    /// Add a duration, saturating at `i64::MAX`.
    #[must_use]
    pub fn saturating_add(&self, delta: Duration) -> Self {
        let delta = i64::try_from(delta.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(delta))
    }

    /// Signed distance `self - other` in milliseconds.
    #[must_use]
    pub fn millis_since(&self, other: Timestamp) -> i64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(millis: i64) -> Self {
        Self::from_millis(millis)
    }
}

impl From<Timestamp> for i64 {
    fn from(t: Timestamp) -> Self {
        t.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_clamps_to_zero() {
        assert_eq!(Timestamp::from_millis(-5), Timestamp::ZERO);
        assert!(Timestamp::from_millis(-5).is_zero());
    }

    #[test]
    fn test_saturating_sub() {
        let t = Timestamp::from_millis(10_000);
        assert_eq!(t.saturating_sub(Duration::from_millis(250)).as_millis(), 9_750);
        assert_eq!(Timestamp::ZERO.saturating_sub(Duration::from_secs(1)), Timestamp::ZERO);
    }

    #[test]
    fn test_ordering() {
        let a = Timestamp::from_millis(1);
        let b = Timestamp::from_millis(2);
        assert!(a < b);
        assert_eq!(a.max(b), b);
        assert_eq!(b.millis_since(a), 1);
    }

    #[test]
    fn test_now_is_recent() {
        assert!(Timestamp::now().as_millis() > 1_600_000_000_000);
    }

    #[test]
    fn test_serde_transparent() {
        let t = Timestamp::from_millis(42);
        assert_eq!(serde_json::to_string(&t).unwrap(), "42");
    }
}
