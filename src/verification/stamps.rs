//! Stamp counting around an external localisation model.
//!
//! The model only proposes boxes. This module prepares the crop it sees
//! (printed templates and everything outside the bottom-right corner painted
//! white), filters small proposals, retries at a fan of rotations when
//! nothing is found, and rejects a hit whose box is mostly blank.

use image::{DynamicImage, GrayImage};

use super::config::StampConfig;
use super::error::DetectorError;
use super::imaging;
use super::segmenter::BoundingBox;
use super::traits::{StampDetector, StampModel};

/// Rotation step of the retry fan, in degrees.
const ROTATION_STEP: usize = 5;

/// Angles tried after an empty first pass: 0, -5, 10, -15, 20, ...
pub fn rotation_angles(max_rotation_angle: u32) -> Vec<i32> {
    (0..=max_rotation_angle as i32)
        .step_by(ROTATION_STEP)
        .map(|i| if i % 10 == 0 { i } else { -i })
        .collect()
}

pub struct ModelStampDetector {
    model: Box<dyn StampModel>,
    config: StampConfig,
    /// Printed boxes that look like stamps, matched at `template_downscale`.
    templates: Vec<GrayImage>,
    template_downscale: u32,
}

impl ModelStampDetector {
    pub fn new(model: Box<dyn StampModel>, config: StampConfig) -> Self {
        Self {
            model,
            config,
            templates: Vec::new(),
            template_downscale: 1,
        }
    }

    /// Templates are whitened wherever they match at or above
    /// `template_matching_threshold`. They must already be downscaled by
    /// `downscale`.
    pub fn with_templates(mut self, templates: Vec<GrayImage>, downscale: u32) -> Self {
        self.templates = templates;
        self.template_downscale = downscale.max(1);
        self
    }

    fn remove_templates(&self, gray: &mut GrayImage) {
        if self.templates.is_empty() {
            return;
        }
        let factor = self.template_downscale;
        let small = imaging::downscale(gray, factor);
        for template in &self.templates {
            let Some((score, x, y)) = imaging::best_match(&small, template) else {
                continue;
            };
            if score >= self.config.template_matching_threshold {
                tracing::debug!(score, x, y, "Printed template whitened before stamp detection");
                imaging::whiten_rect(
                    gray,
                    x * factor,
                    y * factor,
                    template.width() * factor,
                    template.height() * factor,
                );
            }
        }
    }

    fn large_enough(&self, boxes: Vec<BoundingBox>, image_area: f64) -> Vec<BoundingBox> {
        boxes
            .into_iter()
            .filter(|b| b.area() as f64 / image_area >= self.config.area_ratio_threshold)
            .collect()
    }
}

impl StampDetector for ModelStampDetector {
    fn count_stamps(&self, page: &DynamicImage, expected: u32) -> Result<u32, DetectorError> {
        let mut gray = page.to_luma8();
        if gray.width() == 0 || gray.height() == 0 {
            return Err(DetectorError::Failed("empty page".into()));
        }
        self.remove_templates(&mut gray);

        let corner = imaging::whiten_outside_corner(
            &gray,
            self.config.horizontal_crop_point,
            self.config.vertical_crop_point,
        );
        let image_area = f64::from(corner.width()) * f64::from(corner.height());

        let mut boxes = self.large_enough(self.model.predict(&corner)?, image_area);
        let mut seen = corner.clone();
        let mut angle = 0;
        if boxes.is_empty() {
            for candidate in rotation_angles(self.config.max_rotation_angle) {
                let rotated = imaging::rotate_about_center(&corner, f64::from(candidate), 255);
                boxes = self.large_enough(self.model.predict(&rotated)?, image_area);
                if !boxes.is_empty() {
                    seen = rotated;
                    angle = candidate;
                    break;
                }
            }
        }

        if let Some(first) = boxes.first() {
            let dark =
                imaging::dark_pixel_percentage(&seen, first, self.config.binary_threshold_value);
            if dark < self.config.black_pixel_percentage {
                tracing::debug!(dark, "Stamp candidate rejected as blank");
                boxes.clear();
            }
        }

        tracing::debug!(found = boxes.len(), expected, angle, "Stamps counted");
        Ok(boxes.len() as u32)
    }
}
