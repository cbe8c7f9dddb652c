//! Worker pool and wiring for the analysis pipeline.
//!
//! Used by the headless `threatlens-worker` binary and embedded by the API
//! server, which shares its progress bus with the pool.

pub mod config;
pub mod pool;

use std::sync::Arc;

use threatlens_db::AnalysisStore;
use threatlens_detectors::{ObjectDetectorClient, VisionServiceClient};
use threatlens_events::ProgressBus;
use threatlens_pipeline::{AnalysisWorker, DetectionStage, ThreatEnumeration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConfigError, WorkerConfig};
pub use pool::WorkerPool;

/// Build an [`AnalysisWorker`] backed by the HTTP capability clients.
pub fn build_analysis_worker(
    config: &WorkerConfig,
    store: Arc<dyn AnalysisStore>,
    bus: Arc<ProgressBus>,
) -> AnalysisWorker {
    let vision = Arc::new(VisionServiceClient::new(
        config.vision_url.clone(),
        config.vision_timeout,
    ));
    let detector = Arc::new(ObjectDetectorClient::new(
        config.secondary_url.clone(),
        config.secondary_probe_timeout,
        config.secondary_detect_timeout,
    ));

    let detection = DetectionStage::new(vision.clone(), detector, config.detection_settings());
    let enumeration = ThreatEnumeration::new(vision);

    AnalysisWorker::new(store, detection, enumeration).with_bus(bus)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides `default_filter`. `LOG_FORMAT=json` switches to
/// JSON lines.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
