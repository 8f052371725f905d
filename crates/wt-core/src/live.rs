//! In-progress playback supplied from outside the store.
//!
//! The ingestion side tracks intervals that are still open and have not been
//! written yet. Reporting wants them blended in, so the aggregator takes them
//! through this capability instead of reaching for shared global state.

use serde::{Deserialize, Serialize};

use crate::aggregation::{SessionRef, WatchInterval};
use crate::units::Ticks;

/// An open playback segment not yet persisted as an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSegment {
    /// Row id of the persisted session the segment belongs to, if known.
    pub session_fk: Option<i64>,
    /// Source session identifier, used to keep unpersisted sessions apart.
    pub session_id: String,
    pub item_id: String,
    pub user_id: String,
    pub series_key: Option<String>,
    pub start_ts: i64,
    /// Usually "now" at the time the source was sampled.
    pub end_ts: i64,
    pub runtime_ticks: Option<Ticks>,
}

/// Capability that reports currently open playback segments.
pub trait LiveWatchTimeSource {
    fn open_segments(&self) -> Vec<LiveSegment>;
}

/// A source with nothing in progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLiveSource;

impl LiveWatchTimeSource for NoLiveSource {
    fn open_segments(&self) -> Vec<LiveSegment> {
        Vec::new()
    }
}

/// A fixed set of segments, for callers that sampled the live state up front.
#[derive(Debug, Clone, Default)]
pub struct StaticLiveSource {
    segments: Vec<LiveSegment>,
}

impl StaticLiveSource {
    #[must_use]
    pub const fn new(segments: Vec<LiveSegment>) -> Self {
        Self { segments }
    }
}

impl LiveWatchTimeSource for StaticLiveSource {
    fn open_segments(&self) -> Vec<LiveSegment> {
        self.segments.clone()
    }
}

impl WatchInterval for LiveSegment {
    fn item_id(&self) -> &str {
        &self.item_id
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn series_key(&self) -> Option<&str> {
        self.series_key.as_deref()
    }

    fn session(&self) -> SessionRef {
        self.session_fk.map_or_else(
            || SessionRef::Live(self.session_id.clone()),
            SessionRef::Persisted,
        )
    }

    fn start_ts(&self) -> i64 {
        self.start_ts
    }

    fn end_ts(&self) -> i64 {
        self.end_ts
    }

    fn runtime_ticks(&self) -> Option<Ticks> {
        self.runtime_ticks
    }
}
