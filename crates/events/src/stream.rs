//! Progress Stream Adapter.
//!
//! Turns persisted (and, when available, published) progress into a
//! caller-facing [`Stream`] of [`ProgressView`]s. Fetch failures become a
//! synthesized `failed` view instead of a silently ended stream. Every
//! stream ends right after its first terminal view.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use threatlens_core::progress::ProgressView;
use threatlens_core::types::AnalysisId;
use threatlens_db::AnalysisStore;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::bus::{ProgressBus, ProgressEvent};

pub type ProgressStream = BoxStream<'static, ProgressView>;

/// Read the current view of `id`, mapping every failure to a `failed` view.
pub async fn fetch_view(store: &dyn AnalysisStore, id: AnalysisId) -> ProgressView {
    match store.find(id).await {
        Ok(Some(job)) => job.view(),
        Ok(None) => ProgressView::fetch_failed(id, format!("Analysis {id} not found")),
        Err(e) => {
            tracing::warn!(analysis_id = %id, error = %e, "Failed to fetch progress");
            ProgressView::fetch_failed(id, e.to_string())
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

struct PollState {
    store: Arc<dyn AnalysisStore>,
    id: AnalysisId,
    ticker: Interval,
    done: bool,
}

/// Fetch immediately, then once every `period`, yielding each view.
pub fn poll_progress(
    store: Arc<dyn AnalysisStore>,
    id: AnalysisId,
    period: Duration,
) -> ProgressStream {
    let state = PollState {
        store,
        id,
        ticker: ticker(period),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        st.ticker.tick().await;
        let view = fetch_view(st.store.as_ref(), st.id).await;
        st.done = view.is_terminal();
        Some((view, st))
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// Push with polling fallback
// ---------------------------------------------------------------------------

enum Pushed {
    View(ProgressView),
    /// Events were missed; re-read the store.
    Resync,
}

enum Wake {
    Pushed(Pushed),
    Tick,
}

struct WatchState {
    store: Arc<dyn AnalysisStore>,
    id: AnalysisId,
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    ticker: Interval,
    last: Option<ProgressView>,
    started: bool,
    done: bool,
}

/// Wait for the next event about `id`. Never resolves once the bus closed.
async fn next_pushed(
    rx: &mut Option<broadcast::Receiver<ProgressEvent>>,
    id: AnalysisId,
) -> Pushed {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        let received = receiver.recv().await;
        match received {
            Ok(event) if event.analysis_id() == id => return Pushed::View(event.view),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(analysis_id = %id, skipped, "Progress subscriber lagged");
                return Pushed::Resync;
            }
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

/// Yield the current view, then every change pushed on `bus`.
///
/// The store is still polled every `fallback` so that progress written by
/// a worker in another process reaches the caller. Views equal to the
/// last one yielded are skipped.
pub fn watch_progress(
    store: Arc<dyn AnalysisStore>,
    bus: &ProgressBus,
    id: AnalysisId,
    fallback: Duration,
) -> ProgressStream {
    // Subscribe before the first fetch so nothing published in between is lost.
    let rx = bus.subscribe();
    let mut fallback_ticker = ticker(fallback);
    fallback_ticker.reset();

    let state = WatchState {
        store,
        id,
        rx: Some(rx),
        ticker: fallback_ticker,
        last: None,
        started: false,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            let view = if !st.started {
                st.started = true;
                fetch_view(st.store.as_ref(), st.id).await
            } else {
                let wake = tokio::select! {
                    pushed = next_pushed(&mut st.rx, st.id) => Wake::Pushed(pushed),
                    _ = st.ticker.tick() => Wake::Tick,
                };
                match wake {
                    Wake::Pushed(Pushed::View(view)) => view,
                    Wake::Pushed(Pushed::Resync) | Wake::Tick => {
                        fetch_view(st.store.as_ref(), st.id).await
                    }
                }
            };

            if st.last.as_ref() == Some(&view) {
                continue;
            }
            st.done = view.is_terminal();
            st.last = Some(view.clone());
            return Some((view, st));
        }
    })
    .boxed()
}
