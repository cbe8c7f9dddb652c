//! Domain model for the threat-modeling pipeline.
//!
//! This crate has no I/O. It holds the vocabularies (component types,
//! threat categories, severities), the reconciliation logic that turns two
//! detection sets into one canonical component list, the progress state
//! machine, and the queue retry policy. Every other crate builds on it.

pub mod analysis;
pub mod canonical;
pub mod component;
pub mod error;
pub mod job_events;
pub mod merge;
pub mod progress;
pub mod queue;
pub mod threat;
pub mod types;
