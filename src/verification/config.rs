//! Detector and orchestrator configuration.
//!
//! Every struct is a fixed shape with named fields and explicit defaults.
//! Partial JSON files fill the gaps from `Default`, unknown keys are
//! rejected at load time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

// ═══════════════════════════════════════════════════════════
// Signature detection
// ═══════════════════════════════════════════════════════════

/// Horizontal band `(start, end)` expressed as fractions of the page width.
pub type CropBand = (f64, f64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CropperConfig {
    /// Boxes with `w*h` at or below this are discarded.
    pub min_region_size: u32,
    /// Inset applied on every merge, as a fraction of `min(w, h)`.
    pub border_ratio: f64,
    /// Grows every candidate box before merging.
    pub increase_box_margin: u32,
    /// Keep a single region per vertical lane.
    pub clean_y_axis: bool,
    /// Extra pixels around each region when cropping its mask.
    pub crop_margin: u32,
}

impl Default for CropperConfig {
    fn default() -> Self {
        Self {
            min_region_size: 1000,
            border_ratio: 0.0,
            increase_box_margin: 0,
            clean_y_axis: true,
            crop_margin: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractSignaturesConfig {
    pub is_enabled: bool,
    pub primary_extractor_sensitivity: f64,
    /// Re-run extraction on inner areas that found nothing.
    pub secondary_extractor: bool,
    pub secondary_extractor_sensitivity: f64,
}

impl Default for ExtractSignaturesConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            primary_extractor_sensitivity: 3.6,
            secondary_extractor: true,
            secondary_extractor_sensitivity: 9.0,
        }
    }
}

/// Shape filters applied to each segmented region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JudgerConfig {
    pub min_size_ratio: f64,
    pub max_size_ratio: f64,
    pub min_pixel_ratio: f64,
    pub max_pixel_ratio: f64,
}

impl Default for JudgerConfig {
    fn default() -> Self {
        Self {
            min_size_ratio: 1.0,
            max_size_ratio: 4.0,
            min_pixel_ratio: 0.01,
            max_pixel_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignatureConfig {
    pub is_enabled: bool,
    pub doc_vertical_crop_point: f64,
    pub doc_horizontal_crop_points: Vec<CropBand>,
    pub pharma_vertical_crop_point: f64,
    pub pharma_horizontal_crop_points_1: Vec<CropBand>,
    pub pharma_horizontal_crop_points_2: Vec<CropBand>,
    pub pharma_horizontal_crop_points_3: Vec<CropBand>,
    /// Minimum judged ink area for inner bands.
    pub min_area: u32,
    /// Minimum judged ink area for the last band of a doctor page.
    pub doc_min_right_area: u32,
    /// Minimum judged ink area for the last band of a pharmacist page.
    pub min_right_area: u32,
    pub min_box_height: u32,
    /// Luminance at or above which a pixel is background.
    pub ink_threshold: u8,
    pub cropper: CropperConfig,
    pub extract_signatures: ExtractSignaturesConfig,
    pub judger: JudgerConfig,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            doc_vertical_crop_point: 0.85,
            doc_horizontal_crop_points: vec![(0.55, 0.95)],
            pharma_vertical_crop_point: 0.85,
            pharma_horizontal_crop_points_1: vec![(0.33, 0.95)],
            pharma_horizontal_crop_points_2: vec![(0.33, 0.55), (0.55, 0.95)],
            pharma_horizontal_crop_points_3: vec![(0.33, 0.45), (0.45, 0.65), (0.65, 0.95)],
            min_area: 2000,
            doc_min_right_area: 8000,
            min_right_area: 15000,
            min_box_height: 30,
            ink_threshold: 210,
            cropper: CropperConfig::default(),
            extract_signatures: ExtractSignaturesConfig::default(),
            judger: JudgerConfig::default(),
        }
    }
}

impl SignatureConfig {
    /// Bands for a pharmacist page: page 1 carries 2 or 3 signatures
    /// depending on the prototype flag, later pages carry 1.
    pub fn pharmacist_bands(&self, page: u32, is_prototype: bool) -> &[CropBand] {
        match (page, is_prototype) {
            (1, true) => &self.pharma_horizontal_crop_points_3,
            (1, false) => &self.pharma_horizontal_crop_points_2,
            _ => &self.pharma_horizontal_crop_points_1,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Stamps, coupons, page templates
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StampConfig {
    pub is_enabled: bool,
    pub horizontal_crop_point: f64,
    pub vertical_crop_point: f64,
    /// Predictions smaller than this fraction of the page are dropped.
    pub area_ratio_threshold: f64,
    pub max_rotation_angle: u32,
    /// Minimum share (percent) of dark pixels inside the first prediction.
    pub black_pixel_percentage: f64,
    pub binary_threshold_value: u8,
    pub template_matching_threshold: f64,
}

impl Default for StampConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            horizontal_crop_point: 0.35,
            vertical_crop_point: 0.85,
            area_ratio_threshold: 0.008,
            max_rotation_angle: 90,
            black_pixel_percentage: 12.0,
            binary_threshold_value: 220,
            template_matching_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MissingCouponsConfig {
    pub is_enabled: bool,
    pub template_matching: bool,
    pub template_matching_threshold: f64,
}

impl Default for MissingCouponsConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            template_matching: false,
            template_matching_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PagesConfig {
    /// Header templates that only appear on the first pharmacist page.
    pub template_file_paths: Vec<PathBuf>,
    pub template_matching_threshold: f64,
    /// Page and templates are shrunk by this factor before matching.
    pub downscale: u32,
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            template_file_paths: Vec::new(),
            template_matching_threshold: 0.5,
            downscale: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorsConfig {
    /// Skip detection on doctor pages of digital prescriptions.
    pub ignore_digital: bool,
    /// Skip all detection for 100%-coverage prescriptions.
    pub ignore_full_participation: bool,
    pub signature: SignatureConfig,
    pub stamp: StampConfig,
    pub missing_coupons: MissingCouponsConfig,
    pub pages: PagesConfig,
}

impl Default for DetectorsConfig {
    fn default() -> Self {
        Self {
            ignore_digital: true,
            ignore_full_participation: true,
            signature: SignatureConfig::default(),
            stamp: StampConfig::default(),
            missing_coupons: MissingCouponsConfig::default(),
            pages: PagesConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Parallel mode. Off means every run is sequential.
    pub turbo_mode: bool,
    /// Upper bound on worker threads.
    pub max_threads: usize,
    /// Runs with fewer prescriptions than this stay on the calling thread.
    pub sequential_threshold: usize,
    /// Bound of the worker log channel.
    pub log_channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            turbo_mode: true,
            max_threads: 4,
            sequential_threshold: 8,
            log_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub detectors: DetectorsConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load `~/Autoscription/config.json`, defaults when absent.
    pub fn load_user() -> Result<Self, ConfigError> {
        Self::load_or_default(&crate::config::config_file_path())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sig = &self.detectors.signature;
        check_fraction("signature.doc_vertical_crop_point", sig.doc_vertical_crop_point)?;
        check_fraction("signature.pharma_vertical_crop_point", sig.pharma_vertical_crop_point)?;
        check_bands("signature.doc_horizontal_crop_points", &sig.doc_horizontal_crop_points)?;
        check_bands("signature.pharma_horizontal_crop_points_1", &sig.pharma_horizontal_crop_points_1)?;
        check_bands("signature.pharma_horizontal_crop_points_2", &sig.pharma_horizontal_crop_points_2)?;
        check_bands("signature.pharma_horizontal_crop_points_3", &sig.pharma_horizontal_crop_points_3)?;
        if !(0.0..0.5).contains(&sig.cropper.border_ratio) {
            return Err(ConfigError::Invalid(format!(
                "signature.cropper.border_ratio must be in [0, 0.5), got {}",
                sig.cropper.border_ratio
            )));
        }

        let stamp = &self.detectors.stamp;
        check_fraction("stamp.horizontal_crop_point", stamp.horizontal_crop_point)?;
        check_fraction("stamp.vertical_crop_point", stamp.vertical_crop_point)?;

        if self.detectors.pages.downscale == 0 {
            return Err(ConfigError::Invalid("pages.downscale must be at least 1".into()));
        }
        if self.orchestrator.max_threads == 0 {
            return Err(ConfigError::Invalid("orchestrator.max_threads must be at least 1".into()));
        }
        if self.orchestrator.log_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.log_channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn check_fraction(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be in [0, 1], got {value}")))
    }
}

fn check_bands(name: &str, bands: &[CropBand]) -> Result<(), ConfigError> {
    if bands.is_empty() {
        return Err(ConfigError::Invalid(format!("{name} must not be empty")));
    }
    for &(start, end) in bands {
        check_fraction(name, start)?;
        check_fraction(name, end)?;
        if start >= end {
            return Err(ConfigError::Invalid(format!(
                "{name}: band start {start} must be before end {end}"
            )));
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
