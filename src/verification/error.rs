//! Error types for the verification pipeline.
//!
//! One enum per concern:
//! - `DetectorError`: a capability (signature, stamp, coupon, page template)
//!   failed on one page. `Resource` is transient and retried at chunk level,
//!   `Failed` is skippable and the page is emitted with zeroed counts.
//! - `ConfigError`: loading or validating detector/orchestrator configuration.
//! - `ScanIndexError`: reading the `index.csv` that maps barcodes to scans.
//! - `VerificationError`: everything the checker and orchestrator surface.
//!   Page decode failures carry a `DecodeFailure` kind; only decoder limit
//!   failures are transient.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("Resource exhausted: {0}")]
    Resource(String),

    #[error("Detection failed: {0}")]
    Failed(String),
}

impl DetectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DetectorError::Resource(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ScanIndexError {
    #[error("I/O error reading scan index: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scan index is missing column {0:?}")]
    MissingColumn(&'static str),

    #[error("Scan index line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Why a scanned page could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailure {
    /// Missing file, unknown format or corrupt data.
    Unreadable,
    /// Dimensions beyond the per-page pixel budget. Retrying cannot help.
    Oversized,
    /// The decoder hit an allocation limit.
    Limits,
}

impl DecodeFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeFailure::Unreadable => "unreadable",
            DecodeFailure::Oversized => "oversized",
            DecodeFailure::Limits => "limits",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DecodeFailure::Limits)
    }
}

impl std::fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Image decoding failed for {path} ({kind}): {reason}")]
    ImageDecode {
        path: PathBuf,
        kind: DecodeFailure,
        reason: String,
    },

    #[error("Invalid execution digits: {0:?}")]
    InvalidExecutionDigits(String),

    #[error("Metadata extraction failed for prescription {prescription}: {reason}")]
    Metadata { prescription: String, reason: String },

    #[error("Scan index error: {0}")]
    ScanIndex(#[from] ScanIndexError),

    #[error("Invalid state transition for {prescription}/{execution}: {from} -> {to}")]
    InvalidTransition {
        prescription: String,
        execution: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Chunk {chunk} failed after retry: {reason}")]
    ChunkFailed { chunk: usize, reason: String },

    #[error("Worker panicked while checking chunk {0}")]
    WorkerPanicked(usize),

    #[error("Worker pool disconnected before all chunks reported")]
    PoolDisconnected,

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Verification cancelled")]
    Cancelled,
}

impl VerificationError {
    /// Transient failures earn one chunk-level retry after a resource hint.
    pub fn is_transient(&self) -> bool {
        match self {
            VerificationError::Detector(e) => e.is_transient(),
            VerificationError::ImageDecode { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Failures that abort one prescription but not the run.
    pub fn is_prescription_fatal(&self) -> bool {
        matches!(self, VerificationError::Metadata { .. })
    }
}
