//! Row types for the `analyses` and `analysis_queue` tables.

pub mod analysis;
pub mod queue_entry;
