//! In-process progress bus backed by a `tokio::sync::broadcast` channel.
//!
//! Shared as `Arc<ProgressBus>` between the worker pool and the API.

use serde::{Deserialize, Serialize};
use threatlens_core::job_events::EVENT_ANALYSIS_PROGRESS;
use threatlens_core::progress::ProgressView;
use threatlens_core::types::AnalysisId;
use tokio::sync::broadcast;

/// One published progress change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Dot-separated event name, `analysis.progress`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub view: ProgressView,
}

impl ProgressEvent {
    pub fn progress(view: ProgressView) -> Self {
        Self {
            event_type: EVENT_ANALYSIS_PROGRESS.to_string(),
            view,
        }
    }

    pub fn analysis_id(&self) -> AnalysisId {
        self.view.id
    }
}

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of [`ProgressEvent`]s to any number of subscribers.
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    /// Slow receivers beyond `capacity` observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped when nobody listens.
    pub fn publish(&self, view: ProgressView) {
        let _ = self.sender.send(ProgressEvent::progress(view));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
