//! Trait definitions for the verification pipeline.
//!
//! The checker only talks to the outside world through these seams:
//! - PrescriptionSource: registry metadata for one prescription
//! - SignatureDetector / StampDetector / CouponReader / PageTemplateMatcher:
//!   per-page detection capabilities
//! - StampModel: the external stamp localisation model
//! - Metrics / RunLogger: explicit observability handles scoped to one run

use image::{DynamicImage, GrayImage};

use super::config::CropBand;
use super::error::{DetectorError, VerificationError};
use super::observability::LogRecord;
use super::scan_index::ScanPage;
use super::segmenter::BoundingBox;
use super::types::{Prescription, PrescriptionId};

/// Where signatures are searched on a page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignatureAreas<'a> {
    /// Rows above this fraction of the height are ignored.
    pub vertical_crop_point: f64,
    /// Horizontal bands, left to right. The last one is the "right" area.
    pub bands: &'a [CropBand],
    /// Minimum judged ink area for the last band.
    pub min_right_area: u32,
}

/// Result of a signature search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignatureCount {
    /// Number of bands that hold at least one signature.
    pub count: u32,
    pub regions: Vec<BoundingBox>,
}

/// Loads registry metadata for a prescription.
pub trait PrescriptionSource: Send + Sync {
    /// A `VerificationError::Metadata` aborts only this prescription.
    fn load(&self, id: &PrescriptionId) -> Result<Prescription, VerificationError>;
}

/// Counts signature areas on a page.
pub trait SignatureDetector: Send + Sync {
    fn count_signatures(
        &self,
        page: &DynamicImage,
        areas: &SignatureAreas<'_>,
    ) -> Result<SignatureCount, DetectorError>;

    /// Drop caches before a retry after resource exhaustion.
    fn release_resources(&self) {}
}

/// Counts stamps on a page.
pub trait StampDetector: Send + Sync {
    fn count_stamps(&self, page: &DynamicImage, expected: u32) -> Result<u32, DetectorError>;

    fn release_resources(&self) {}
}

/// External model that localises stamp candidates on a grayscale crop.
pub trait StampModel: Send + Sync {
    fn predict(&self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Reads the barcodes printed on a coupon page.
pub trait CouponReader: Send + Sync {
    fn read_codes(&self, page: &ScanPage, image: &DynamicImage) -> Result<Vec<String>, DetectorError>;
}

/// Decides whether a pharmacist scan is the first page of its document.
pub trait PageTemplateMatcher: Send + Sync {
    fn is_first_page(&self, image: &DynamicImage) -> Result<bool, DetectorError>;
}

/// Progress handle shared by every worker of a run.
pub trait Metrics: Send + Sync {
    /// Called once per prescription, never per page.
    fn prescription_checked(&self, id: &PrescriptionId);

    /// Current progress value.
    fn progress(&self) -> u64;

    fn chunk_retried(&self, _chunk: usize) {}
}

/// Log sink handed to workers.
pub trait RunLogger: Send + Sync {
    fn log(&self, record: LogRecord);
}
