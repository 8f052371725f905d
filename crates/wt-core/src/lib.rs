//! Core domain logic for the watch-time ledger.
//!
//! This crate contains the fundamental types and logic for:
//! - Units: explicit conversions between ticks, seconds and milliseconds
//! - Aggregation: exact per-session merging and per-key summation
//! - Filters: whitelisted, parameterized predicates for report queries
//! - Live blending: the capability that supplies unpersisted playback

mod aggregation;
pub mod filter;
pub mod live;
pub mod merge;
pub mod types;
pub mod units;

pub use aggregation::{
    AggregationConfig, KeyTotal, SessionRef, SessionTotal, WatchInterval, WatchTotals,
    aggregate_watch_time, session_totals,
};
pub use filter::{Column, Op, Predicate};
pub use live::{LiveSegment, LiveWatchTimeSource, NoLiveSource, StaticLiveSource};
pub use merge::Span;
pub use types::{GroupBy, ItemId, PlayMethod, SessionId, TimeWindow, UserId, ValidationError};
pub use units::{Millis, Seconds, Ticks, UnitError};
