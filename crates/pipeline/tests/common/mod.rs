//! Scripted detectors and a worker wired to in-memory persistence.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use threatlens_core::analysis::{DiagramImage, Locale};
use threatlens_core::component::{ComponentType, DetectedComponent, DetectedConnection};
use threatlens_core::merge::SecondaryDetection;
use threatlens_core::threat::{Severity, StrideCategory, ThreatFinding};
use threatlens_core::types::AnalysisId;
use threatlens_db::{AnalysisStore, InMemoryAnalysisStore, NewAnalysis};
use threatlens_detectors::{
    AnalystError, DetectorError, PrimaryDetection, PrimaryDetector, SecondaryDetector,
    SecondaryPrediction, ThreatAnalyst, ThreatRequest,
};
use threatlens_events::ProgressBus;
use threatlens_pipeline::{
    AnalysisWorker, DetectionSettings, DetectionStage, ThreatEnumeration,
};

// ---------------------------------------------------------------------------
// Primary
// ---------------------------------------------------------------------------

pub struct FakePrimary {
    response: Result<PrimaryDetection, String>,
    pub calls: AtomicUsize,
}

impl FakePrimary {
    pub fn returning(detection: PrimaryDetection) -> Self {
        Self {
            response: Ok(detection),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrimaryDetector for FakePrimary {
    async fn detect(
        &self,
        _image: &DiagramImage,
        _locale: Locale,
    ) -> Result<PrimaryDetection, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response
            .clone()
            .map_err(DetectorError::Malformed)
    }
}

// ---------------------------------------------------------------------------
// Secondary
// ---------------------------------------------------------------------------

pub enum Probe {
    Up,
    Down,
    /// Never answers.
    Hang,
}

pub struct FakeSecondary {
    probe: Probe,
    detections: Vec<SecondaryDetection>,
    pub detect_calls: AtomicUsize,
}

impl FakeSecondary {
    pub fn up(detections: Vec<SecondaryDetection>) -> Self {
        Self {
            probe: Probe::Up,
            detections,
            detect_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_probe(probe: Probe) -> Self {
        Self {
            probe,
            detections: Vec::new(),
            detect_calls: AtomicUsize::new(0),
        }
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecondaryDetector for FakeSecondary {
    async fn probe(&self) -> Result<bool, DetectorError> {
        match self.probe {
            Probe::Up => Ok(true),
            Probe::Down => Err(DetectorError::Api {
                status: 503,
                body: "down".into(),
            }),
            Probe::Hang => std::future::pending().await,
        }
    }

    async fn detect(
        &self,
        _image: &DiagramImage,
        _confidence: f64,
    ) -> Result<SecondaryPrediction, DetectorError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SecondaryPrediction {
            total_detections: self.detections.len(),
            inference_time_ms: Some(15.0),
            detections: self.detections.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Analyst
// ---------------------------------------------------------------------------

/// Answers per component id; unscripted components get [`default_threats`].
#[derive(Default)]
pub struct ScriptedAnalyst {
    scripts: Mutex<HashMap<String, Result<Vec<ThreatFinding>, AnalystError>>>,
    pub requests: Mutex<Vec<ThreatRequest>>,
}

impl ScriptedAnalyst {
    pub fn script(&self, component_id: &str, answer: Result<Vec<ThreatFinding>, AnalystError>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(component_id.to_string(), answer);
    }

    pub fn clear(&self) {
        self.scripts.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn analyzed_ids(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.component.id.clone())
            .collect()
    }
}

/// One high-severity finding with more countermeasures than allowed.
pub fn default_threats() -> Vec<ThreatFinding> {
    let mut finding = ThreatFinding::new(
        StrideCategory::Tampering,
        Severity::High,
        "Requests can be altered in transit",
    );
    finding.countermeasures = (1..=7).map(|i| format!("measure {i}")).collect();
    vec![finding]
}

#[async_trait]
impl ThreatAnalyst for ScriptedAnalyst {
    async fn analyze(&self, request: &ThreatRequest) -> Result<Vec<ThreatFinding>, AnalystError> {
        self.requests.lock().unwrap().push(request.clone());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.component.id)
            .cloned();
        scripted.unwrap_or_else(|| Ok(default_threats()))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn components(n: usize) -> Vec<DetectedComponent> {
    (1..=n)
        .map(|i| DetectedComponent::new(format!("c{i}"), format!("Component {i}"), ComponentType::Server))
        .collect()
}

pub fn detection(components: Vec<DetectedComponent>) -> PrimaryDetection {
    let connections = components
        .windows(2)
        .map(|pair| DetectedConnection::new(pair[0].id.clone(), pair[1].id.clone(), "HTTPS"))
        .collect();
    PrimaryDetection {
        provider: "aws".into(),
        mitigations: vec!["WAF".into()],
        components,
        connections,
    }
}

pub struct Harness {
    pub store: Arc<InMemoryAnalysisStore>,
    pub bus: Arc<ProgressBus>,
    pub primary: Arc<FakePrimary>,
    pub secondary: Arc<FakeSecondary>,
    pub analyst: Arc<ScriptedAnalyst>,
    pub worker: AnalysisWorker,
}

impl Harness {
    pub fn new(primary: FakePrimary, secondary: FakeSecondary) -> Self {
        let store = Arc::new(InMemoryAnalysisStore::new());
        let bus = Arc::new(ProgressBus::default());
        let primary = Arc::new(primary);
        let secondary = Arc::new(secondary);
        let analyst = Arc::new(ScriptedAnalyst::default());

        let settings = DetectionSettings {
            probe_timeout: Duration::from_secs(5),
            detect_timeout: Duration::from_secs(30),
            confidence: 0.05,
        };
        let worker = AnalysisWorker::new(
            store.clone(),
            DetectionStage::new(primary.clone(), secondary.clone(), settings),
            ThreatEnumeration::new(analyst.clone()),
        )
        .with_bus(bus.clone());

        Self {
            store,
            bus,
            primary,
            secondary,
            analyst,
            worker,
        }
    }

    pub async fn create(&self) -> AnalysisId {
        self.store
            .create(NewAnalysis {
                image: DiagramImage::new("diagram.png", "image/png", vec![1, 2, 3]),
                language: Locale::EnUs,
            })
            .await
            .unwrap()
            .id
    }
}
