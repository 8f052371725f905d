//! Core type definitions with validation.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// The window end does not come after its start.
    #[error("window end {end} must be after start {start}")]
    EmptyWindow { start: i64, end: i64 },

    /// Invalid play method value.
    #[error("invalid play method: {value}")]
    InvalidPlayMethod { value: String },

    /// Invalid grouping value.
    #[error("invalid grouping: {value} (expected item, user or series)")]
    InvalidGroupBy { value: String },

    /// A filter clause pairs an operator with a value it cannot take.
    #[error("invalid filter on {column}: {reason}")]
    InvalidFilter {
        column: &'static str,
        reason: &'static str,
    },

    /// A tuning parameter was out of range.
    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        name: &'static str,
        expected: &'static str,
        value: f64,
    },
}

/// How the media server delivered the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayMethod {
    DirectPlay,
    DirectStream,
    Transcode,
}

impl PlayMethod {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DirectPlay => "DirectPlay",
            Self::DirectStream => "DirectStream",
            Self::Transcode => "Transcode",
        }
    }
}

impl fmt::Display for PlayMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlayMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DirectPlay" => Ok(Self::DirectPlay),
            "DirectStream" => Ok(Self::DirectStream),
            "Transcode" => Ok(Self::Transcode),
            _ => Err(ValidationError::InvalidPlayMethod {
                value: s.to_string(),
            }),
        }
    }
}

/// The key watch time is summed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    /// One total per library item.
    Item,
    /// One total per user.
    User,
    /// Episode totals rolled up into their series.
    Series,
}

impl GroupBy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::User => "user",
            Self::Series => "series",
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GroupBy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "item" => Ok(Self::Item),
            "user" => Ok(Self::User),
            "series" => Ok(Self::Series),
            _ => Err(ValidationError::InvalidGroupBy {
                value: s.to_string(),
            }),
        }
    }
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A library item identifier as reported by the media server.
    ItemId, "item ID"
);

define_string_id!(
    /// A user identifier as reported by the media server.
    UserId, "user ID"
);

define_string_id!(
    /// The media server's own playback session identifier.
    ///
    /// Not unique on its own: one server session may play several items, so
    /// persisted sessions are keyed by `(session_id, item_id)`.
    SessionId, "session ID"
);

/// Sentinel end for windows that extend into the unbounded future.
pub const UNBOUNDED_END: i64 = i64::MAX;

/// A half-open `[start, end)` range of unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start: i64,
    end: i64,
}

impl TimeWindow {
    /// Creates a window, rejecting empty or inverted ranges.
    pub fn new(start: i64, end: i64) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::EmptyWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Everything from the epoch onward.
    ///
    /// The epoch is a floor: clamping drops any part of an interval before it.
    #[must_use]
    pub const fn all_time() -> Self {
        Self {
            start: 0,
            end: UNBOUNDED_END,
        }
    }

    /// The `days` days leading up to `now`.
    ///
    /// Zero days means all time, matching how reporting timeframes are parsed.
    #[must_use]
    pub fn last_days(now: DateTime<Utc>, days: u32) -> Self {
        if days == 0 {
            return Self::all_time();
        }
        let end = now.timestamp();
        let start = (now - Duration::days(i64::from(days))).timestamp();
        Self { start, end }
    }

    #[must_use]
    pub const fn start(&self) -> i64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> i64 {
        self.end
    }

    /// Returns true when the window has no upper bound.
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.end == UNBOUNDED_END
    }

    /// Clamps `[start, end)` to this window.
    ///
    /// Returns `None` when nothing positive remains.
    #[must_use]
    pub fn clamp(&self, start: i64, end: i64) -> Option<(i64, i64)> {
        let clamped_start = start.max(self.start);
        let clamped_end = end.min(self.end);
        (clamped_end > clamped_start).then_some((clamped_start, clamped_end))
    }

    /// Returns true when `[start, end)` shares at least one second with the window.
    #[must_use]
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.clamp(start, end).is_some()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "[{}, ∞)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}
