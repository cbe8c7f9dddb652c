//! Progress publication and the caller-facing progress stream.
//!
//! - [`ProgressBus`]: in-process publish/subscribe hub the worker writes
//!   every persisted snapshot to, backed by `tokio::sync::broadcast`.
//! - [`poll_progress`]: fixed-interval polling stream over the store.
//! - [`watch_progress`]: push stream fed by the bus, with store polling as
//!   the fallback when the worker runs in another process.
//!
//! Both streams end right after yielding a `completed` or `failed` view.

pub mod bus;
pub mod stream;

pub use bus::{ProgressBus, ProgressEvent};
pub use stream::{fetch_view, poll_progress, watch_progress, ProgressStream};
