//! Detected architecture components and the connections between them.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Component type vocabulary
// ---------------------------------------------------------------------------

/// Closed vocabulary of component types.
///
/// Both detectors report types from this vocabulary; the Merge Engine
/// matches on equality of these values. Strings outside the vocabulary
/// deserialize to [`ComponentType::Unknown`] instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    User,
    Cdn,
    Waf,
    LoadBalancer,
    Server,
    Database,
    Cache,
    Storage,
    Search,
    Queue,
    Serverless,
    Monitoring,
    Security,
    Email,
    Backup,
    Network,
    Api,
    Firewall,
    ExternalService,
    Unknown,
}

impl ComponentType {
    /// Parse a type code leniently.
    ///
    /// Case, hyphens and spaces are ignored, and a few common aliases
    /// (`loadbalancer`, `lb`, `db`, `lambda`, ...) are accepted.
    pub fn from_code(code: &str) -> Self {
        let normalized: String = code
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_lowercase(),
            })
            .collect();

        match normalized.as_str() {
            "user" | "users" | "client" | "actor" => Self::User,
            "cdn" => Self::Cdn,
            "waf" => Self::Waf,
            "load_balancer" | "loadbalancer" | "lb" | "alb" | "nlb" | "elb" => Self::LoadBalancer,
            "server" | "compute" | "instance" | "container" | "vm" => Self::Server,
            "database" | "db" | "rds" => Self::Database,
            "cache" => Self::Cache,
            "storage" | "object_storage" | "bucket" | "filesystem" => Self::Storage,
            "search" => Self::Search,
            "queue" | "messaging" | "topic" | "message_queue" => Self::Queue,
            "serverless" | "function" | "lambda" => Self::Serverless,
            "monitoring" | "logging" => Self::Monitoring,
            "security" => Self::Security,
            "email" | "mail" => Self::Email,
            "backup" => Self::Backup,
            "network" | "vpc" | "subnet" => Self::Network,
            "api" | "api_gateway" | "gateway" => Self::Api,
            "firewall" => Self::Firewall,
            "external_service" | "external" | "third_party" => Self::ExternalService,
            _ => Self::Unknown,
        }
    }

    /// Canonical snake_case code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Cdn => "cdn",
            Self::Waf => "waf",
            Self::LoadBalancer => "load_balancer",
            Self::Server => "server",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Storage => "storage",
            Self::Search => "search",
            Self::Queue => "queue",
            Self::Serverless => "serverless",
            Self::Monitoring => "monitoring",
            Self::Security => "security",
            Self::Email => "email",
            Self::Backup => "backup",
            Self::Network => "network",
            Self::Api => "api",
            Self::Firewall => "firewall",
            Self::ExternalService => "external_service",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ComponentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(Self::from_code(&code))
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Which detector(s) identified a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Primary,
    Secondary,
    Hybrid,
}

impl Provenance {
    /// Whether components with this provenance carry a secondary confidence.
    pub fn carries_confidence(self) -> bool {
        matches!(self, Self::Secondary | Self::Hybrid)
    }
}

// ---------------------------------------------------------------------------
// DetectedComponent
// ---------------------------------------------------------------------------

/// One component of the canonical component list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedComponent {
    /// Unique within a single analysis.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub provenance: Provenance,
    /// Present iff `provenance` is `hybrid` or `secondary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_confidence: Option<f64>,
    #[serde(default)]
    pub description: String,
    /// Id of the component this one replicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub existing_security_controls: Vec<String>,
    #[serde(default)]
    pub auto_scaling: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_zones: Vec<String>,
}

impl DetectedComponent {
    /// Create a primary-provenance component with empty optional fields.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        component_type: ComponentType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            component_type,
            provenance: Provenance::Primary,
            secondary_confidence: None,
            description: String::new(),
            replica_of: None,
            provider: None,
            existing_security_controls: Vec::new(),
            auto_scaling: false,
            availability_zones: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_replica_of(mut self, id: impl Into<String>) -> Self {
        self.replica_of = Some(id.into());
        self
    }

    /// Tag as seen by the Primary Detector only.
    pub fn mark_primary(&mut self) {
        self.provenance = Provenance::Primary;
        self.secondary_confidence = None;
    }

    /// Tag as confirmed by a Secondary detection with `confidence`.
    pub fn mark_hybrid(&mut self, confidence: f64) {
        self.provenance = Provenance::Hybrid;
        self.secondary_confidence = Some(confidence);
    }

    /// `true` when provenance and confidence agree.
    pub fn provenance_consistent(&self) -> bool {
        self.provenance.carries_confidence() == self.secondary_confidence.is_some()
    }
}

// ---------------------------------------------------------------------------
// DetectedConnection
// ---------------------------------------------------------------------------

/// A data flow between two components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedConnection {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    #[serde(default)]
    pub bidirectional: bool,
}

impl DetectedConnection {
    pub fn new(from: impl Into<String>, to: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            protocol: protocol.into(),
            port: None,
            description: String::new(),
            encrypted: None,
            bidirectional: false,
        }
    }

    /// Whether either endpoint is `component_id`.
    pub fn touches(&self, component_id: &str) -> bool {
        self.from == component_id || self.to == component_id
    }

    /// One-line description, e.g. `web -> db (TCP:5432): orders`.
    pub fn summary_line(&self) -> String {
        let port = self
            .port
            .as_deref()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        format!(
            "{} -> {} ({}{}): {}",
            self.from, self.to, self.protocol, port, self.description
        )
    }
}

/// Text used when a component has no connections.
pub const NO_CONNECTIONS_SUMMARY: &str = "No connections identified";

/// Summarize every connection touching `component_id`, joined by `"; "`.
pub fn connection_summary(connections: &[DetectedConnection], component_id: &str) -> String {
    let lines: Vec<String> = connections
        .iter()
        .filter(|c| c.touches(component_id))
        .map(DetectedConnection::summary_line)
        .collect();

    if lines.is_empty() {
        NO_CONNECTIONS_SUMMARY.to_string()
    } else {
        lines.join("; ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
