//! Coupon codes produced by the upstream barcode/OCR step.
//!
//! Decoding happens outside this crate; the results arrive as a JSON object
//! mapping scan file names to the codes read on that page.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use image::DynamicImage;

use super::error::{ConfigError, DetectorError};
use super::scan_index::ScanPage;
use super::traits::CouponReader;

#[derive(Debug, Clone, Default)]
pub struct PrecomputedCoupons {
    codes: HashMap<String, Vec<String>>,
}

impl PrecomputedCoupons {
    pub fn new(codes: HashMap<String, Vec<String>>) -> Self {
        Self { codes }
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let codes: HashMap<String, Vec<String>> = serde_json::from_str(s)?;
        Ok(Self { codes })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl CouponReader for PrecomputedCoupons {
    /// Pages without an entry read as having no codes.
    fn read_codes(&self, page: &ScanPage, _image: &DynamicImage) -> Result<Vec<String>, DetectorError> {
        Ok(self.codes.get(&page.file_name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use std::path::PathBuf;

    fn scan(name: &str) -> ScanPage {
        ScanPage::from_path(&PathBuf::from(format!("/scans/{name}"))).unwrap()
    }

    #[test]
    fn codes_by_file_name() {
        let coupons = PrecomputedCoupons::from_json_str(
            r#"{"20240105_2301011234567890111_001.jpg": ["A1", "B2"]}"#,
        )
        .unwrap();
        let image = DynamicImage::ImageLuma8(GrayImage::new(1, 1));

        let found = coupons
            .read_codes(&scan("20240105_2301011234567890111_001.jpg"), &image)
            .unwrap();
        assert_eq!(found, vec!["A1", "B2"]);

        let none = coupons
            .read_codes(&scan("20240105_2301011234567890111_002.jpg"), &image)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            PrecomputedCoupons::from_json_str("[1, 2]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coupons.json");
        std::fs::write(&path, r#"{"a_123_001.jpg": ["X"]}"#).unwrap();
        let coupons = PrecomputedCoupons::load(&path).unwrap();
        assert_eq!(coupons.len(), 1);
    }
}
