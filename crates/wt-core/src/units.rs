//! Unit-typed durations.
//!
//! Media servers report positions and runtimes in 100-nanosecond ticks while
//! wall-clock timestamps are unix seconds. Values cross between the two only
//! through the conversions below.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ticks in one second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks in one millisecond.
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Milliseconds in one second.
pub const MILLIS_PER_SECOND: i64 = 1_000;

/// Seconds in one hour.
pub const SECONDS_PER_HOUR: f64 = 3_600.0;

/// Errors from checked unit conversions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnitError {
    /// The converted value does not fit in an `i64`.
    #[error("{value} {from} overflows when converted to {to}")]
    Overflow {
        value: i64,
        from: &'static str,
        to: &'static str,
    },
}

macro_rules! define_unit {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Zero of this unit.
            pub const ZERO: Self = Self(0);

            /// Wraps a raw value already expressed in this unit.
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }

            /// Returns true when the value is strictly positive.
            #[must_use]
            pub const fn is_positive(self) -> bool {
                self.0 > 0
            }

            /// Subtraction that clamps at the numeric bounds.
            #[must_use]
            pub const fn saturating_sub(self, other: Self) -> Self {
                Self(self.0.saturating_sub(other.0))
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0.saturating_add(rhs.0))
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0.saturating_sub(rhs.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", self.0, $label)
            }
        }
    };
}

define_unit!(
    /// A media position or runtime in 100-nanosecond ticks.
    Ticks, "ticks"
);

define_unit!(
    /// A whole number of seconds.
    Seconds, "s"
);

define_unit!(
    /// A whole number of milliseconds.
    Millis, "ms"
);

impl Ticks {
    /// Whole seconds contained in this tick count, truncated toward zero.
    #[must_use]
    pub const fn to_seconds(self) -> Seconds {
        Seconds(self.0 / TICKS_PER_SECOND)
    }

    /// Whole milliseconds contained in this tick count, truncated toward zero.
    #[must_use]
    pub const fn to_millis(self) -> Millis {
        Millis(self.0 / TICKS_PER_MILLISECOND)
    }

    /// Fractional seconds, for sanity bounds that should not lose precision.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND as f64
    }
}

impl Seconds {
    /// Converts to ticks, failing instead of wrapping on overflow.
    pub fn to_ticks(self) -> Result<Ticks, UnitError> {
        self.0
            .checked_mul(TICKS_PER_SECOND)
            .map(Ticks)
            .ok_or(UnitError::Overflow {
                value: self.0,
                from: "seconds",
                to: "ticks",
            })
    }

    /// Converts to milliseconds, failing instead of wrapping on overflow.
    pub fn to_millis(self) -> Result<Millis, UnitError> {
        self.0
            .checked_mul(MILLIS_PER_SECOND)
            .map(Millis)
            .ok_or(UnitError::Overflow {
                value: self.0,
                from: "seconds",
                to: "milliseconds",
            })
    }

    /// Fractional hours.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_hours(self) -> f64 {
        self.0 as f64 / SECONDS_PER_HOUR
    }
}

impl Millis {
    /// Converts to ticks, failing instead of wrapping on overflow.
    pub fn to_ticks(self) -> Result<Ticks, UnitError> {
        self.0
            .checked_mul(TICKS_PER_MILLISECOND)
            .map(Ticks)
            .ok_or(UnitError::Overflow {
                value: self.0,
                from: "milliseconds",
                to: "ticks",
            })
    }

    /// Whole seconds, truncated toward zero.
    #[must_use]
    pub const fn to_seconds(self) -> Seconds {
        Seconds(self.0 / MILLIS_PER_SECOND)
    }
}

/// Converts fractional seconds to hours for reporting.
#[must_use]
pub fn seconds_to_hours(seconds: f64) -> f64 {
    seconds / SECONDS_PER_HOUR
}
