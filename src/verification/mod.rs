//! Prescription document verification
//!
//! Checks scanned pharmacy prescriptions against the registry record for
//! each execution: signatures, stamps, authenticity coupons and dosage
//! quantities, with placeholders for pages that were never scanned.
//!
//! ## Architecture
//!
//! ```text
//! VerificationOrchestrator ─ chunks ─▶ PerDocumentChecker (per prescription)
//!        │                                  ├─ SignatureDetector ─▶ RegionSegmenter
//!        │                                  ├─ StampDetector ─▶ StampModel
//!        │                                  ├─ CouponReader / PageTemplateMatcher
//!        │                                  └─ dosage rows ◀─ QuantityExtractionEngine
//!        └─ merge, dedupe, stack numbers, tape reconciliation ─▶ RunOutcome
//! ```
//!
//! Detection capabilities, registry access, progress and worker logging are
//! traits so the pipeline can be driven by mocks in tests.

pub mod error;
pub mod types;
pub mod traits;
pub mod config;
pub mod observability;
pub mod imaging;
pub mod segmenter;
pub mod signature;
pub mod stamps;
pub mod pages;
pub mod coupons;
pub mod quantity;
pub mod compliance;
pub mod tapes;
pub mod scan_index;
pub mod sources;
pub mod checker;
pub mod orchestrator;

pub use checker::{CheckState, Detectors, PerDocumentChecker};
pub use compliance::DosageCheck;
pub use config::{AppConfig, DetectorsConfig, OrchestratorConfig};
pub use coupons::PrecomputedCoupons;
pub use error::{ConfigError, DecodeFailure, DetectorError, ScanIndexError, VerificationError};
pub use observability::{ChannelLogger, LogRecord, ProgressCounter, TracingLogger};
pub use orchestrator::{CancelToken, VerificationOrchestrator};
pub use pages::TemplatePageMatcher;
pub use quantity::{Quantity, QuantityExtractionEngine, RuleId};
pub use scan_index::{ScanIndex, ScanPage};
pub use segmenter::{BoundingBox, Region, RegionSegmenter};
pub use signature::MaskSignatureDetector;
pub use sources::{InMemorySource, JsonDirSource};
pub use stamps::ModelStampDetector;
pub use traits::*;
pub use types::*;
