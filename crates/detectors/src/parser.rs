//! Lenient parsing of capability responses into strict domain types.
//!
//! Capability output is model-generated. The body may be bare JSON, JSON
//! wrapped in a fenced code block, or JSON surrounded by prose. Field
//! names come in camelCase or snake_case. Lists are parsed one element at
//! a time: an element that does not fit the schema is logged and dropped
//! while its siblings survive.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use threatlens_core::component::{ComponentType, DetectedComponent, DetectedConnection};
use threatlens_core::merge::{NormalizedBox, PixelBox, SecondaryDetection};
use threatlens_core::threat::{Severity, StrideCategory, ThreatFinding};

use crate::error::DetectorError;
use crate::primary::{PrimaryDetection, UNKNOWN_PROVIDER};
use crate::secondary::SecondaryPrediction;

static FENCED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid regex"));

static FENCED_ANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)\s*```").expect("valid regex"));

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Find the JSON value in a capability response.
///
/// Tried in order: the whole body, a ```` ```json ```` block, any fenced
/// block, then the first `{` or `[` that starts a complete value.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    for re in [&*FENCED_JSON_RE, &*FENCED_ANY_RE] {
        for captures in re.captures_iter(trimmed) {
            if let Some(body) = captures.get(1) {
                if let Ok(value) = serde_json::from_str::<Value>(body.as_str()) {
                    return Some(value);
                }
            }
        }
    }

    trimmed
        .char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .find_map(|(start, _)| first_value(&trimmed[start..]))
}

/// Parse the leading JSON value of `text`, ignoring what follows it.
fn first_value(text: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
}

fn extract_object(text: &str, what: &str) -> Result<Value, DetectorError> {
    match extract_json(text) {
        Some(value @ Value::Object(_)) => Ok(value),
        Some(other) => Err(DetectorError::Malformed(format!(
            "{what}: expected a JSON object, got {}",
            kind(&other)
        ))),
        None => Err(DetectorError::Malformed(format!("{what}: no JSON found"))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Deserialize each element on its own, dropping those that fail.
fn parse_each<T: DeserializeOwned>(items: Vec<Value>, what: &str) -> Vec<T> {
    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<T>(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(index, error = %e, "Dropping malformed {what}");
                None
            }
        })
        .collect()
}

/// Elements of a loosely typed list field. `null`, a missing key or any
/// non-array value counts as an empty list.
fn list(value: Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// A free-text field; anything but a string counts as empty.
fn text(value: Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

/// Strings from a loosely typed list; non-strings are skipped.
fn strings(value: Option<Value>) -> Vec<String> {
    list(value)
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        })
        .collect()
}

/// Accept `"443"`, `443` or `null`.
fn port_string(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Primary detection
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePrimary {
    #[serde(alias = "detectedProvider", alias = "detected_provider")]
    provider: Option<String>,
    #[serde(alias = "existingMitigations", alias = "existing_mitigations")]
    mitigations: Option<Value>,
    components: Option<Value>,
    connections: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireComponent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default = "unknown_type")]
    component_type: ComponentType,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "availabilityZone")]
    availability_zone: Option<Value>,
    #[serde(default, alias = "availabilityZones")]
    availability_zones: Option<Value>,
    #[serde(default, alias = "existingSecurityControls")]
    existing_security_controls: Option<Value>,
    #[serde(default, alias = "isAutoScaling", alias = "autoScaling", alias = "auto_scaling")]
    is_auto_scaling: Option<bool>,
    #[serde(default, alias = "replicaOf")]
    replica_of: Option<String>,
}

fn unknown_type() -> ComponentType {
    ComponentType::Unknown
}

impl WireComponent {
    fn into_component(self) -> DetectedComponent {
        let id = self.id.unwrap_or_default();
        let name = match self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => id.clone(),
        };

        let mut zones = strings(self.availability_zones);
        if let Some(Value::String(zone)) = self.availability_zone {
            if !zone.trim().is_empty() && !zones.contains(&zone) {
                zones.push(zone);
            }
        }

        let mut component = DetectedComponent::new(id.trim(), name, self.component_type)
            .with_description(self.description.unwrap_or_default());
        component.provider = self.provider.filter(|p| !p.trim().is_empty());
        component.existing_security_controls = strings(self.existing_security_controls);
        component.auto_scaling = self.is_auto_scaling.unwrap_or(false);
        component.availability_zones = zones;
        component.replica_of = self
            .replica_of
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        component
    }
}

#[derive(Debug, Deserialize)]
struct WireConnection {
    from: String,
    to: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    port: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    encrypted: Option<bool>,
    #[serde(default)]
    bidirectional: Option<bool>,
}

impl WireConnection {
    fn into_connection(self) -> DetectedConnection {
        let mut connection = DetectedConnection::new(
            self.from.trim(),
            self.to.trim(),
            self.protocol.unwrap_or_default(),
        );
        connection.port = port_string(self.port);
        connection.description = self.description.unwrap_or_default();
        connection.encrypted = self.encrypted;
        connection.bidirectional = self.bidirectional.unwrap_or(false);
        connection
    }
}

/// Parse a Primary Detector response.
///
/// Fails only when no JSON object can be found at all. Missing lists
/// default to empty and the provider defaults to `unknown`.
pub fn parse_primary(text: &str) -> Result<PrimaryDetection, DetectorError> {
    let value = extract_object(text, "component detection")?;
    let wire: WirePrimary = serde_json::from_value(value)
        .map_err(|e| DetectorError::Malformed(format!("component detection: {e}")))?;

    let components = parse_each::<WireComponent>(list(wire.components), "component")
        .into_iter()
        .map(WireComponent::into_component)
        .collect();
    let connections = parse_each::<WireConnection>(list(wire.connections), "connection")
        .into_iter()
        .map(WireConnection::into_connection)
        .collect();

    Ok(PrimaryDetection {
        provider: wire
            .provider
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string()),
        mitigations: strings(wire.mitigations),
        components,
        connections,
    })
}

// ---------------------------------------------------------------------------
// Secondary detection
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePrediction {
    detections: Option<Value>,
    #[serde(alias = "inferenceTimeMs")]
    inference_time_ms: Option<f64>,
    #[serde(alias = "totalDetections")]
    total_detections: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(alias = "class_name", alias = "className")]
    label: String,
    #[serde(default, alias = "typeCode", alias = "backend_type", alias = "backendType")]
    type_code: Option<String>,
    confidence: f64,
    #[serde(default, alias = "bboxNormalized")]
    bbox_normalized: Option<NormalizedBox>,
    #[serde(default, alias = "bboxPixels")]
    bbox_pixels: Option<PixelBox>,
}

impl WireDetection {
    fn into_detection(self) -> SecondaryDetection {
        let type_code = match self.type_code.as_deref() {
            Some(code) if !code.trim().is_empty() => ComponentType::from_code(code),
            _ => ComponentType::from_code(&self.label),
        };
        SecondaryDetection {
            label: self.label,
            type_code,
            confidence: self.confidence.clamp(0.0, 1.0),
            bbox_normalized: self.bbox_normalized,
            bbox_pixels: self.bbox_pixels,
        }
    }
}

/// Parse a Secondary Detector predict response.
pub fn parse_prediction(value: Value) -> Result<SecondaryPrediction, DetectorError> {
    if !value.is_object() {
        return Err(DetectorError::Malformed(format!(
            "prediction: expected a JSON object, got {}",
            kind(&value)
        )));
    }
    let wire: WirePrediction = serde_json::from_value(value)
        .map_err(|e| DetectorError::Malformed(format!("prediction: {e}")))?;

    let detections: Vec<SecondaryDetection> =
        parse_each::<WireDetection>(list(wire.detections), "detection")
            .into_iter()
            .filter(|d| d.confidence.is_finite())
            .map(WireDetection::into_detection)
            .collect();

    Ok(SecondaryPrediction {
        total_detections: wire.total_detections.unwrap_or(detections.len()),
        inference_time_ms: wire.inference_time_ms,
        detections,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireHealth {
    #[serde(alias = "modelLoaded")]
    model_loaded: bool,
}

/// `true` iff the health body reports the model as loaded.
pub fn parse_health(value: Value) -> bool {
    serde_json::from_value::<WireHealth>(value)
        .map(|h| h.model_loaded)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Threat analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireThreats {
    threats: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireThreat {
    category: String,
    #[serde(default)]
    description: Option<Value>,
    severity: String,
    #[serde(default)]
    countermeasures: Option<Value>,
    #[serde(default, alias = "severityJustification")]
    severity_justification: Option<String>,
    #[serde(default, alias = "existingMitigation")]
    existing_mitigation: Option<String>,
    #[serde(default, alias = "affectedData")]
    affected_data: Option<String>,
}

impl WireThreat {
    fn into_finding(self) -> Option<ThreatFinding> {
        let Some(category) = StrideCategory::from_label(&self.category) else {
            tracing::warn!(category = %self.category, "Dropping threat with unknown category");
            return None;
        };
        let Some(severity) = Severity::from_label(&self.severity) else {
            tracing::warn!(severity = %self.severity, "Dropping threat with unknown severity");
            return None;
        };

        let mut finding = ThreatFinding::new(category, severity, text(self.description))
            .with_countermeasures(strings(self.countermeasures));
        finding.severity_justification = self.severity_justification;
        finding.existing_mitigation = self.existing_mitigation;
        finding.affected_data = self.affected_data;
        Some(finding)
    }
}

/// Parse a threat-analysis response.
///
/// A bare array is accepted as the threat list. Countermeasures are capped.
pub fn parse_threats(text: &str) -> Result<Vec<ThreatFinding>, DetectorError> {
    let threats = match extract_json(text) {
        Some(Value::Array(items)) => items,
        Some(value @ Value::Object(_)) => {
            let threats = serde_json::from_value::<WireThreats>(value)
                .map_err(|e| DetectorError::Malformed(format!("threat analysis: {e}")))?
                .threats;
            list(threats)
        }
        Some(other) => {
            return Err(DetectorError::Malformed(format!(
                "threat analysis: expected an object, got {}",
                kind(&other)
            )))
        }
        None => return Err(DetectorError::Malformed("threat analysis: no JSON found".into())),
    };

    Ok(parse_each::<WireThreat>(threats, "threat")
        .into_iter()
        .filter_map(WireThreat::into_finding)
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
