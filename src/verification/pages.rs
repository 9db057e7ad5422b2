//! First-page detection for multi-page pharmacist documents.
//!
//! The header printed on page 1 is matched against a small set of templates
//! at reduced resolution.

use image::{DynamicImage, GrayImage};

use super::config::PagesConfig;
use super::error::{ConfigError, DetectorError};
use super::imaging;
use super::traits::PageTemplateMatcher;

#[derive(Debug, Clone)]
pub struct TemplatePageMatcher {
    /// Already downscaled by `downscale`.
    templates: Vec<GrayImage>,
    threshold: f64,
    downscale: u32,
}

impl TemplatePageMatcher {
    /// Load and downscale every template listed in the configuration.
    pub fn load(config: &PagesConfig) -> Result<Self, ConfigError> {
        let mut templates = Vec::with_capacity(config.template_file_paths.len());
        for path in &config.template_file_paths {
            let image = image::open(path).map_err(|e| {
                ConfigError::Invalid(format!("page template {}: {e}", path.display()))
            })?;
            templates.push(imaging::downscale(&image.to_luma8(), config.downscale));
        }
        tracing::info!(templates = templates.len(), "Page templates loaded");
        Ok(Self::from_templates(
            templates,
            config.template_matching_threshold,
            config.downscale,
        ))
    }

    pub fn from_templates(templates: Vec<GrayImage>, threshold: f64, downscale: u32) -> Self {
        Self {
            templates,
            threshold,
            downscale: downscale.max(1),
        }
    }

    pub fn templates(&self) -> &[GrayImage] {
        &self.templates
    }

    pub fn downscale(&self) -> u32 {
        self.downscale
    }
}

impl PageTemplateMatcher for TemplatePageMatcher {
    /// No templates means no page can be recognised as the first.
    fn is_first_page(&self, image: &DynamicImage) -> Result<bool, DetectorError> {
        if self.templates.is_empty() {
            return Ok(false);
        }
        let page = imaging::downscale(&image.to_luma8(), self.downscale);
        for template in &self.templates {
            if let Some(score) = imaging::best_correlation(&page, template) {
                if score >= self.threshold {
                    tracing::debug!(score, "First-page template matched");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
