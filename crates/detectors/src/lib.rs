//! Detection and analysis capabilities.
//!
//! Three external capabilities feed the pipeline, each behind an
//! `async-trait` seam so the pipeline can be driven by fakes in tests:
//!
//! - [`PrimaryDetector`]: semantically rich component and connection
//!   extraction from the diagram image.
//! - [`SecondaryDetector`]: fast object detection with calibrated
//!   confidences but no semantics.
//! - [`ThreatAnalyst`]: STRIDE findings for one component in context.
//!
//! [`client`] holds the `reqwest` implementations. Responses are parsed
//! leniently by [`parser`] into the strict domain types.

pub mod analyst;
pub mod client;
pub mod error;
pub mod parser;
pub mod primary;
pub mod secondary;

pub use analyst::{ThreatAnalyst, ThreatRequest};
pub use client::{ObjectDetectorClient, VisionServiceClient};
pub use error::{AnalystError, DetectorError};
pub use primary::{PrimaryDetection, PrimaryDetector};
pub use secondary::{SecondaryDetector, SecondaryPrediction};
