pub mod config;
pub mod verification;

use std::path::Path;

use tracing_subscriber::EnvFilter;

use verification::{
    AppConfig, ConfigError, Detectors, JsonDirSource, MaskSignatureDetector, ModelStampDetector,
    PerDocumentChecker, PrecomputedCoupons, QuantityExtractionEngine, StampModel,
    TemplatePageMatcher, VerificationOrchestrator,
};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the crate default. Safe to call more than once.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();
    if installed {
        tracing::info!("Autoscription v{}", config::APP_VERSION);
    }
}

/// Wire the standard detectors into an orchestrator.
///
/// Registry records are read from `<metadata_dir>/<id>.json`, scans from
/// `scan_dir`. The stamp localisation model and the decoded coupon codes
/// come from the caller.
pub fn build_orchestrator(
    app: &AppConfig,
    stamp_model: Box<dyn StampModel>,
    coupons: PrecomputedCoupons,
    scan_dir: &Path,
    metadata_dir: &Path,
) -> Result<VerificationOrchestrator, ConfigError> {
    app.validate()?;
    let detectors_config = app.detectors.clone();

    let detectors = Detectors {
        signature: Box::new(MaskSignatureDetector::new(detectors_config.signature.clone())),
        stamp: Box::new(ModelStampDetector::new(stamp_model, detectors_config.stamp.clone())),
        coupons: Box::new(coupons),
        pages: Box::new(TemplatePageMatcher::load(&detectors_config.pages)?),
    };
    let checker = PerDocumentChecker::new(
        detectors,
        detectors_config,
        QuantityExtractionEngine::new()?,
        scan_dir,
    );

    tracing::info!(
        scan_dir = %scan_dir.display(),
        metadata_dir = %metadata_dir.display(),
        turbo = app.orchestrator.turbo_mode,
        "Verification pipeline ready"
    );
    Ok(VerificationOrchestrator::new(
        checker,
        Box::new(JsonDirSource::new(metadata_dir)),
        app.orchestrator.clone(),
    ))
}

/// Build an orchestrator from the user configuration and the standard
/// data directories under `~/Autoscription/`.
pub fn build_default_orchestrator(
    stamp_model: Box<dyn StampModel>,
    coupons: PrecomputedCoupons,
) -> Result<VerificationOrchestrator, ConfigError> {
    let app = AppConfig::load_user()?;
    build_orchestrator(
        &app,
        stamp_model,
        coupons,
        &config::scans_dir(),
        &config::metadata_dir(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;
    use verification::{BoundingBox, DetectorError, PrescriptionId, ProgressCounter, Role};

    struct NoStamps;

    impl StampModel for NoStamps {
        fn predict(&self, _image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn init_tracing_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut app = AppConfig::default();
        app.orchestrator.max_threads = 0;
        let dir = tempfile::tempdir().unwrap();
        let result = build_orchestrator(
            &app,
            Box::new(NoStamps),
            PrecomputedCoupons::default(),
            dir.path(),
            dir.path(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn blank_scan_is_flagged_end_to_end() {
        let scans = tempfile::tempdir().unwrap();
        let metadata = tempfile::tempdir().unwrap();
        let id = "2301011234567890";
        let file_name = format!("20240105_{id}101_001.png");
        GrayImage::from_pixel(200, 200, image::Luma([255]))
            .save(scans.path().join(&file_name))
            .unwrap();
        std::fs::write(
            metadata.path().join(format!("{id}.json")),
            r#"{"id": "2301011234567890", "executions": {"101": {"execution": "101", "pages": 1, "is_digital": true}}}"#,
        )
        .unwrap();

        let coupons = PrecomputedCoupons::new(HashMap::from([(file_name.clone(), vec!["TAPE1".to_string()])]));
        let orchestrator = build_orchestrator(
            &AppConfig::default(),
            Box::new(NoStamps),
            coupons,
            scans.path(),
            metadata.path(),
        )
        .unwrap();

        let ids = BTreeSet::from([PrescriptionId::from(id)]);
        let outcome = orchestrator
            .run(&ids, None, Arc::new(ProgressCounter::new()))
            .unwrap();

        assert_eq!(outcome.pages.len(), 1);
        let page = &outcome.pages[0];
        assert_eq!(page.role, Role::Pharmacist);
        assert_eq!(page.file_name, file_name);
        assert_eq!(page.sign_found, Some(0));
        assert!(!page.sign_check);
        assert!(!page.stamps_check);
        assert_eq!(page.coupons_found, "TAPE1");
        assert_eq!(page.coupon_check, Some(false));
        assert_eq!(outcome.progress, 1);
    }
}
