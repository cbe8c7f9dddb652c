//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod analysis_repo;
pub mod queue_repo;

pub use analysis_repo::AnalysisRepo;
pub use queue_repo::QueueRepo;
