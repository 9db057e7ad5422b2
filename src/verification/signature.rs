//! Signature counting on a decoded page.
//!
//! Pipeline per page:
//! 1. Ink mask from a luminance threshold.
//! 2. Connected-component cleaning that keeps blobs between a sensitivity
//!    quantile and the largest blob (drops specks and leaves table furniture
//!    to the segmenter's size filter).
//! 3. Per horizontal band below the vertical crop point: RegionSegmenter,
//!    then shape judging of every region.
//! 4. Inner bands that found nothing get one more try on a mask cleaned at
//!    the secondary sensitivity.

use std::collections::HashSet;

use image::{DynamicImage, GrayImage};

use super::config::SignatureConfig;
use super::error::DetectorError;
use super::imaging;
use super::segmenter::{BoundingBox, Region, RegionSegmenter};
use super::traits::{SignatureAreas, SignatureCount, SignatureDetector};

/// Components at or below this many pixels never take part in cleaning.
const MIN_COMPONENT_AREA: u32 = 10;

/// Lower area quantile kept by the extractor for a given sensitivity.
///
/// Higher sensitivity keeps more small blobs.
pub fn quartile_from_sensitivity(sensitivity: f64) -> f64 {
    let x = 10.0 - sensitivity;
    if x <= 0.0 {
        0.0
    } else if x >= 10.0 {
        1.0
    } else {
        1.0 / (1.0 + (-(x - 2.0)).exp())
    }
}

/// Keep ink components whose area lies between the sensitivity quantile and
/// the largest component.
pub fn clean_ink(mask: &GrayImage, sensitivity: f64) -> GrayImage {
    let (labels, components) = imaging::label_components(mask);
    let mut areas: Vec<u32> = components
        .iter()
        .map(|c| c.area)
        .filter(|&a| a > MIN_COMPONENT_AREA)
        .collect();
    if areas.is_empty() {
        return GrayImage::new(mask.width(), mask.height());
    }
    areas.sort_unstable();

    let n = areas.len();
    let quartile = quartile_from_sensitivity(sensitivity);
    let low_index = ((quartile * n as f64) as usize).saturating_sub(1);
    let low = areas[low_index.min(n - 1)];
    let high = areas[n - 1];

    let kept: HashSet<u32> = components
        .iter()
        .filter(|c| c.area >= low && c.area <= high)
        .map(|c| c.label)
        .collect();
    imaging::mask_from_labels(mask.width(), mask.height(), &labels, |label| {
        kept.contains(&label)
    })
}

/// Signature detector working on ink masks.
#[derive(Debug, Clone)]
pub struct MaskSignatureDetector {
    config: SignatureConfig,
    segmenter: RegionSegmenter,
}

impl MaskSignatureDetector {
    pub fn new(config: SignatureConfig) -> Self {
        let segmenter = RegionSegmenter::new(config.cropper.clone());
        Self { config, segmenter }
    }

    pub fn config(&self) -> &SignatureConfig {
        &self.config
    }

    /// Shape test on a region's cropped mask: aspect ratio and ink share.
    pub fn judge(&self, region: &Region) -> bool {
        let judger = &self.config.judger;
        let (w, h) = region.mask.dimensions();
        let (short, long) = (w.min(h), w.max(h));
        if short == 0 {
            return false;
        }
        let size_ratio = f64::from(long) / f64::from(short);
        if size_ratio < judger.min_size_ratio || size_ratio > judger.max_size_ratio {
            return false;
        }

        let ink = region.mask.pixels().filter(|p| p.0[0] > 0).count();
        let background = region.mask.pixels().count() - ink;
        if ink == 0 || background == 0 {
            return false;
        }
        let pixel_ratio = ink as f64 / background as f64;
        pixel_ratio >= judger.min_pixel_ratio && pixel_ratio <= judger.max_pixel_ratio
    }

    /// Judged signature boxes of one band, or nothing when their combined
    /// area does not exceed `min_check_area`.
    fn band_signatures(
        &self,
        mask: &GrayImage,
        vertical: f64,
        (start, end): (f64, f64),
        min_check_area: u32,
    ) -> Vec<BoundingBox> {
        let band = imaging::band_mask(mask, vertical, start, end);
        let min_height = self.config.min_box_height as i32;
        let judged: Vec<BoundingBox> = self
            .segmenter
            .segment(&band)
            .iter()
            .filter(|r| self.judge(r) && r.bbox.h > min_height)
            .map(|r| r.bbox)
            .collect();

        let total: i64 = judged.iter().map(BoundingBox::area).sum();
        if total > i64::from(min_check_area) {
            judged
        } else {
            Vec::new()
        }
    }
}

impl SignatureDetector for MaskSignatureDetector {
    fn count_signatures(
        &self,
        page: &DynamicImage,
        areas: &SignatureAreas<'_>,
    ) -> Result<SignatureCount, DetectorError> {
        let gray = page.to_luma8();
        if gray.width() == 0 || gray.height() == 0 {
            return Err(DetectorError::Failed("empty page".into()));
        }

        let extract = &self.config.extract_signatures;
        let ink = imaging::ink_mask(&gray, self.config.ink_threshold);
        let primary = if extract.is_enabled {
            clean_ink(&ink, extract.primary_extractor_sensitivity)
        } else {
            ink.clone()
        };
        let mut secondary: Option<GrayImage> = None;

        let mut result = SignatureCount::default();
        let last = areas.bands.len().saturating_sub(1);
        for (i, band) in areas.bands.iter().enumerate() {
            let right_area = i == last;
            let min_check_area = if right_area {
                areas.min_right_area
            } else {
                self.config.min_area
            };

            let mut found =
                self.band_signatures(&primary, areas.vertical_crop_point, *band, min_check_area);

            if found.is_empty() && !right_area && extract.is_enabled && extract.secondary_extractor {
                let mask = secondary.get_or_insert_with(|| {
                    tracing::debug!(
                        sensitivity = extract.secondary_extractor_sensitivity,
                        "Secondary signature extraction"
                    );
                    clean_ink(&ink, extract.secondary_extractor_sensitivity)
                });
                found = self.band_signatures(mask, areas.vertical_crop_point, *band, min_check_area);
            }

            if !found.is_empty() {
                result.count += 1;
            }
            result.regions.extend(found);
        }

        tracing::debug!(signatures = result.count, bands = areas.bands.len(), "Signatures counted");
        Ok(result)
    }
}
