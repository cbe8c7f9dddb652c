//! Event type constants for analysis progress.
//!
//! Used as the SSE `event:` name and as the `type` tag of serialized
//! progress events.

/// A progress snapshot was persisted.
pub const EVENT_ANALYSIS_PROGRESS: &str = "analysis.progress";

/// The analysis failed, or its progress could not be read.
pub const EVENT_ANALYSIS_ERROR: &str = "analysis.error";
