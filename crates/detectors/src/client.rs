//! HTTP clients for the detection and analysis services.
//!
//! [`VisionServiceClient`] talks to the vision-language service that backs
//! both the Primary Detector and the Threat Analyst.
//! [`ObjectDetectorClient`] talks to the object-detection service behind
//! the Secondary Detector.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use threatlens_core::analysis::{DiagramImage, Locale};
use threatlens_core::threat::ThreatFinding;

use crate::analyst::{ThreatAnalyst, ThreatRequest};
use crate::error::{AnalystError, DetectorError};
use crate::parser;
use crate::primary::{PrimaryDetection, PrimaryDetector};
use crate::secondary::{SecondaryDetector, SecondaryPrediction};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Send `request` with a per-call timeout, mapping reqwest timeouts to
/// [`DetectorError::Timeout`].
async fn send(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, DetectorError> {
    let response = request.timeout(timeout).send().await.map_err(|e| {
        if e.is_timeout() {
            DetectorError::Timeout(timeout)
        } else {
            DetectorError::Request(e)
        }
    })?;
    ensure_success(response).await
}

/// Return the response unchanged on 2xx, else an [`DetectorError::Api`]
/// carrying the status and body text.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, DetectorError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(DetectorError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

fn image_part(image: &DiagramImage) -> Result<Part, DetectorError> {
    Ok(Part::bytes(image.bytes.clone())
        .file_name(image.file_name.clone())
        .mime_str(&image.mime_type)?)
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Vision service
// ---------------------------------------------------------------------------

/// Client for the vision-language service.
#[derive(Debug, Clone)]
pub struct VisionServiceClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl VisionServiceClient {
    /// * `base_url` - e.g. `http://localhost:8100`.
    /// * `timeout` - applied to every call; model inference is slow.
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, timeout)
    }

    pub fn with_client(client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url: trim_base(base_url),
            timeout,
        }
    }

    async fn analyze_threats(
        &self,
        request: &ThreatRequest,
    ) -> Result<Vec<ThreatFinding>, DetectorError> {
        let response = send(
            self.client
                .post(format!("{}/analyze-threats", self.base_url))
                .json(request),
            self.timeout,
        )
        .await?;
        let text = response.text().await?;
        parser::parse_threats(&text)
    }
}

#[async_trait]
impl PrimaryDetector for VisionServiceClient {
    async fn detect(
        &self,
        image: &DiagramImage,
        locale: Locale,
    ) -> Result<PrimaryDetection, DetectorError> {
        let form = Form::new()
            .part("file", image_part(image)?)
            .text("locale", locale.as_tag());

        let response = send(
            self.client
                .post(format!("{}/detect-components", self.base_url))
                .multipart(form),
            self.timeout,
        )
        .await?;
        let text = response.text().await?;
        let detection = parser::parse_primary(&text)?;

        tracing::debug!(
            components = detection.components.len(),
            connections = detection.connections.len(),
            provider = %detection.provider,
            "Primary detection parsed",
        );
        Ok(detection)
    }
}

#[async_trait]
impl ThreatAnalyst for VisionServiceClient {
    async fn analyze(&self, request: &ThreatRequest) -> Result<Vec<ThreatFinding>, AnalystError> {
        self.analyze_threats(request)
            .await
            .map_err(AnalystError::from)
    }
}

// ---------------------------------------------------------------------------
// Object detector
// ---------------------------------------------------------------------------

/// Client for the object-detection service.
#[derive(Debug, Clone)]
pub struct ObjectDetectorClient {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    detect_timeout: Duration,
}

impl ObjectDetectorClient {
    pub fn new(base_url: String, probe_timeout: Duration, detect_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: trim_base(base_url),
            probe_timeout,
            detect_timeout,
        }
    }
}

#[async_trait]
impl SecondaryDetector for ObjectDetectorClient {
    async fn probe(&self) -> Result<bool, DetectorError> {
        let response = send(
            self.client.get(format!("{}/health", self.base_url)),
            self.probe_timeout,
        )
        .await?;
        let body: serde_json::Value = response.json().await?;
        Ok(parser::parse_health(body))
    }

    async fn detect(
        &self,
        image: &DiagramImage,
        confidence: f64,
    ) -> Result<SecondaryPrediction, DetectorError> {
        let form = Form::new().part("file", image_part(image)?);

        let response = send(
            self.client
                .post(format!("{}/predict", self.base_url))
                .query(&[("confidence", confidence)])
                .multipart(form),
            self.detect_timeout,
        )
        .await?;
        let body: serde_json::Value = response.json().await?;
        parser::parse_prediction(body)
    }
}
