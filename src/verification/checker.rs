//! PerDocumentChecker: turns one prescription's registry records and its
//! scanned pages into page rows.
//!
//! Each (prescription, execution) pair walks
//! `Unseen → RequirementsComputed → PagesScanned → Finalized`:
//! requirements are derived from the record, every matching scan is decoded
//! and run through the detectors, then placeholders are synthesized for
//! pages that never turned up.

use std::path::PathBuf;

use image::DynamicImage;

use super::compliance;
use super::config::DetectorsConfig;
use super::error::{DetectorError, VerificationError};
use super::imaging;
use super::observability::{LogLevel, LogRecord};
use super::quantity::QuantityExtractionEngine;
use super::scan_index::{discover_scans, ScanPage};
use super::tapes::authenticity_tapes;
use super::traits::*;
use super::types::*;

/// Detection capabilities used by the checker.
pub struct Detectors {
    pub signature: Box<dyn SignatureDetector>,
    pub stamp: Box<dyn StampDetector>,
    pub coupons: Box<dyn CouponReader>,
    pub pages: Box<dyn PageTemplateMatcher>,
}

impl Detectors {
    /// Resource hint before a retry.
    pub fn release_resources(&self) {
        self.signature.release_resources();
        self.stamp.release_resources();
    }
}

// ═══════════════════════════════════════════
// Per-execution state machine
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Unseen,
    RequirementsComputed,
    PagesScanned,
    Finalized,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unseen => "unseen",
            Self::RequirementsComputed => "requirements_computed",
            Self::PagesScanned => "pages_scanned",
            Self::Finalized => "finalized",
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Unseen => Some(Self::RequirementsComputed),
            Self::RequirementsComputed => Some(Self::PagesScanned),
            Self::PagesScanned => Some(Self::Finalized),
            Self::Finalized => None,
        }
    }
}

/// Accumulator owned by one (prescription, execution) check.
struct ExecutionCheck<'r> {
    prescription: &'r PrescriptionId,
    record: &'r DocumentRecord,
    state: CheckState,
    requirements: Requirements,
    found: FoundCounts,
    pages: Vec<PageCheckResult>,
    pharma_found: bool,
    doctor_found: bool,
}

impl<'r> ExecutionCheck<'r> {
    fn new(prescription: &'r PrescriptionId, record: &'r DocumentRecord) -> Self {
        Self {
            prescription,
            record,
            state: CheckState::Unseen,
            requirements: Requirements::default(),
            found: FoundCounts::default(),
            pages: Vec::new(),
            pharma_found: false,
            doctor_found: false,
        }
    }

    fn invalid(&self, to: CheckState) -> VerificationError {
        VerificationError::InvalidTransition {
            prescription: self.prescription.to_string(),
            execution: self.record.execution.to_string(),
            from: self.state.as_str(),
            to: to.as_str(),
        }
    }

    fn advance(&mut self, to: CheckState) -> Result<(), VerificationError> {
        if self.state.next() != Some(to) {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(())
    }

    fn compute_requirements(&mut self) -> Result<Requirements, VerificationError> {
        self.advance(CheckState::RequirementsComputed)?;
        self.requirements = Requirements::derive(self.record);
        Ok(self.requirements)
    }

    fn record_page(&mut self, page: PageCheckResult) -> Result<(), VerificationError> {
        if self.state != CheckState::RequirementsComputed {
            return Err(self.invalid(CheckState::PagesScanned));
        }
        self.found = self.found.with_page(
            page.role,
            page.sign_found.unwrap_or(0),
            page.stamps_found.unwrap_or(0),
        );
        self.pages.push(page);
        Ok(())
    }

    fn finish_scanning(&mut self) -> Result<(), VerificationError> {
        self.advance(CheckState::PagesScanned)
    }

    /// Append placeholders for missing pages and hand back the results.
    fn finalize(
        mut self,
    ) -> Result<(Requirements, FoundCounts, Vec<PageCheckResult>), VerificationError> {
        self.advance(CheckState::Finalized)?;
        let record = self.record;

        if !self.pharma_found {
            self.pages.push(not_found_page(self.prescription, record));
        }
        if !self.doctor_found && !record.is_digital && record.first_execution() {
            let mut doctor = not_found_page(self.prescription, record);
            doctor.role = Role::Doctor;
            doctor.scan_digits = Some(record.execution.doctor_counterpart());
            self.pages.push(doctor);
        }
        Ok((self.requirements, self.found, self.pages))
    }
}

// ═══════════════════════════════════════════
// Page rows
// ═══════════════════════════════════════════

fn base_page(prescription: &PrescriptionId, record: &DocumentRecord, role: Role) -> PageCheckResult {
    PageCheckResult {
        prescription: prescription.clone(),
        full_barcode: record.full_barcode(prescription),
        execution: record.execution.clone(),
        scan_digits: None,
        file_name: String::new(),
        role,
        page: 1,
        pages: record.pages,
        digital: record.is_digital,
        full_participation: record.full_participation,
        first_execution: record.first_execution(),
        sign_found: None,
        sign_required: None,
        stamps_found: None,
        stamps_required: None,
        coupons_found: String::new(),
        coupons_required: 0,
        sign_check: true,
        stamps_check: true,
        coupon_check: None,
        missing_tapes: String::new(),
        surplus_tapes: String::new(),
        doctor_name: record.doctor_name.clone(),
        patient_name: record.patient_name.clone(),
        category: record.category,
        category_name: record.category_name.clone(),
        unit: record.unit.clone(),
        pdf_file_name: record.pdf_file_name.clone(),
        insurance_amount: record.insurance_amount,
        patient_amount: record.patient_amount,
        stack_number: None,
    }
}

/// "File not found" row: no counts, checks pass, no coupon verdict.
fn not_found_page(prescription: &PrescriptionId, record: &DocumentRecord) -> PageCheckResult {
    base_page(prescription, record, Role::Pharmacist)
}

/// Row for a scan that was found, before any detection ran.
fn found_page(
    prescription: &PrescriptionId,
    record: &DocumentRecord,
    requirements: &Requirements,
    scan: &ScanPage,
) -> PageCheckResult {
    let role = scan.role();
    let pharmacist = role == Role::Pharmacist;
    PageCheckResult {
        scan_digits: Some(scan.scan_digits.clone()),
        file_name: scan.file_name.clone(),
        sign_found: Some(0),
        sign_required: Some(if pharmacist { 0 } else { requirements.doc_sign_required }),
        stamps_found: Some(0),
        stamps_required: Some(if pharmacist { 1 } else { requirements.doc_stamps_required }),
        coupons_required: if pharmacist { record.coupons } else { 0 },
        coupon_check: Some(true),
        ..base_page(prescription, record, role)
    }
}

// ═══════════════════════════════════════════
// Checker
// ═══════════════════════════════════════════

pub struct PerDocumentChecker {
    detectors: Detectors,
    config: DetectorsConfig,
    engine: QuantityExtractionEngine,
    scan_dir: PathBuf,
}

impl PerDocumentChecker {
    pub fn new(
        detectors: Detectors,
        config: DetectorsConfig,
        engine: QuantityExtractionEngine,
        scan_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            detectors,
            config,
            engine,
            scan_dir: scan_dir.into(),
        }
    }

    pub fn config(&self) -> &DetectorsConfig {
        &self.config
    }

    pub fn release_resources(&self) {
        self.detectors.release_resources();
    }

    /// Check every execution of a prescription against its scanned pages.
    ///
    /// Records come back with requirements, found counts and dosage rows
    /// filled in. Running twice on the same inputs gives the same rows.
    pub fn check_prescription(
        &self,
        mut prescription: Prescription,
        logger: &dyn RunLogger,
    ) -> Result<PrescriptionOutcome, VerificationError> {
        let id = prescription.id.clone();
        if let Some(record) = prescription.executions.values().find(|r| r.pages == 0) {
            return Err(VerificationError::Metadata {
                prescription: id.to_string(),
                reason: format!("execution {} reports zero pages", record.execution),
            });
        }

        let scans = self.scans_for(&id, logger)?;
        let mut pages = Vec::new();

        for record in prescription.executions.values_mut() {
            logger.log(
                LogRecord::new(LogLevel::Debug, "Checking execution")
                    .for_prescription(&id)
                    .field("execution", &record.execution),
            );
            let (requirements, found, rows) = self.check_execution(&id, record, &scans, logger)?;
            record.requirements = requirements;
            record.found = found;
            record.dosages = record
                .medicines
                .iter()
                .map(|line| compliance::build_row(line, &self.engine))
                .collect();
            pages.extend(rows);
        }
        compliance::aggregate_multiple_executions(&mut prescription);

        Ok(PrescriptionOutcome {
            prescription,
            pages,
        })
    }

    /// Parsed scans for a prescription; unparseable file names are logged and skipped.
    fn scans_for(
        &self,
        id: &PrescriptionId,
        logger: &dyn RunLogger,
    ) -> Result<Vec<ScanPage>, VerificationError> {
        let mut scans = Vec::new();
        for path in discover_scans(&self.scan_dir, id)? {
            match ScanPage::from_path(&path) {
                Ok(scan) => scans.push(scan),
                Err(e) => logger.log(
                    LogRecord::new(LogLevel::Warn, "Scan file name has no execution digits, skipping")
                        .for_prescription(id)
                        .field("path", path.display())
                        .field("error", &e),
                ),
            }
        }
        Ok(scans)
    }

    fn check_execution(
        &self,
        id: &PrescriptionId,
        record: &DocumentRecord,
        scans: &[ScanPage],
        logger: &dyn RunLogger,
    ) -> Result<(Requirements, FoundCounts, Vec<PageCheckResult>), VerificationError> {
        let mut check = ExecutionCheck::new(id, record);
        let requirements = check.compute_requirements()?;
        let skip_detection = record.full_participation && self.config.ignore_full_participation;

        for scan in scans {
            let role = scan.role();
            if role == Role::Pharmacist && scan.scan_digits != record.execution {
                continue;
            }
            match role {
                Role::Pharmacist => check.pharma_found = true,
                Role::Doctor => check.doctor_found = true,
            }

            let mut page = found_page(id, record, &requirements, scan);
            if role == Role::Pharmacist && self.config.signature.is_enabled {
                page.sign_required = Some(pharmacist_sign_required(1, record.is_prototype));
            }
            if skip_detection {
                check.pharma_found = true;
                page.sign_required = Some(0);
                page.stamps_required = Some(0);
            } else if let Some(image) = self.decode(id, scan, logger)? {
                match role {
                    Role::Pharmacist => {
                        self.detect_pharmacist(id, record, scan, &image, &mut page, logger)?
                    }
                    Role::Doctor => {
                        if !(record.is_digital && self.config.ignore_digital) {
                            self.detect_doctor(id, &requirements, scan, &image, &mut page, logger)?;
                        }
                    }
                }
            }

            if self.config.signature.is_enabled {
                page.sign_check = page.sign_found == page.sign_required;
            }
            if self.config.stamp.is_enabled {
                page.stamps_check = page.stamps_found == page.stamps_required;
            }
            check.record_page(page)?;
        }

        check.finish_scanning()?;
        check.finalize()
    }

    /// Decoded page, or `None` when the file is unreadable for a
    /// non-transient reason.
    fn decode(
        &self,
        id: &PrescriptionId,
        scan: &ScanPage,
        logger: &dyn RunLogger,
    ) -> Result<Option<DynamicImage>, VerificationError> {
        match imaging::decode_page(&scan.path) {
            Ok(image) => Ok(Some(image)),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                logger.log(
                    LogRecord::new(LogLevel::Warn, "Page could not be decoded, counts left at zero")
                        .for_prescription(id)
                        .field("file", &scan.file_name)
                        .field("error", &e),
                );
                Ok(None)
            }
        }
    }

    fn detect_pharmacist(
        &self,
        id: &PrescriptionId,
        record: &DocumentRecord,
        scan: &ScanPage,
        image: &DynamicImage,
        page: &mut PageCheckResult,
        logger: &dyn RunLogger,
    ) -> Result<(), VerificationError> {
        if record.pages > 1 {
            let first = skippable(
                self.detectors.pages.is_first_page(image),
                "page template match",
                id,
                scan,
                logger,
            )?;
            page.page = if first.unwrap_or(true) { 1 } else { 2 };
        }

        if self.config.missing_coupons.is_enabled {
            let codes = skippable(
                self.detectors.coupons.read_codes(scan, image),
                "coupon reading",
                id,
                scan,
                logger,
            )?
            .unwrap_or_default();
            let tapes = authenticity_tapes(&codes);
            if !tapes.is_empty() {
                page.coupon_check = Some(false);
            }
            page.coupons_found = tapes;
        }

        let signature = &self.config.signature;
        if signature.is_enabled {
            page.sign_required = Some(pharmacist_sign_required(page.page, record.is_prototype));
            let areas = SignatureAreas {
                vertical_crop_point: signature.pharma_vertical_crop_point,
                bands: signature.pharmacist_bands(page.page, record.is_prototype),
                min_right_area: signature.min_right_area,
            };
            page.sign_found = Some(self.count_signatures(id, scan, image, &areas, logger)?);
        }

        if self.config.stamp.is_enabled {
            let expected = page.stamps_required.unwrap_or(1);
            page.stamps_found = Some(self.count_stamps(id, scan, image, expected, logger)?);
        }
        Ok(())
    }

    fn detect_doctor(
        &self,
        id: &PrescriptionId,
        requirements: &Requirements,
        scan: &ScanPage,
        image: &DynamicImage,
        page: &mut PageCheckResult,
        logger: &dyn RunLogger,
    ) -> Result<(), VerificationError> {
        let signature = &self.config.signature;
        if signature.is_enabled {
            let areas = SignatureAreas {
                vertical_crop_point: signature.doc_vertical_crop_point,
                bands: &signature.doc_horizontal_crop_points,
                min_right_area: signature.doc_min_right_area,
            };
            page.sign_found = Some(self.count_signatures(id, scan, image, &areas, logger)?);
        }
        if self.config.stamp.is_enabled {
            let expected = requirements.doc_stamps_required;
            page.stamps_found = Some(self.count_stamps(id, scan, image, expected, logger)?);
        }
        Ok(())
    }

    fn count_signatures(
        &self,
        id: &PrescriptionId,
        scan: &ScanPage,
        image: &DynamicImage,
        areas: &SignatureAreas<'_>,
        logger: &dyn RunLogger,
    ) -> Result<u32, VerificationError> {
        let found = skippable(
            self.detectors.signature.count_signatures(image, areas),
            "signature detection",
            id,
            scan,
            logger,
        )?;
        Ok(found.map(|s| s.count).unwrap_or(0))
    }

    fn count_stamps(
        &self,
        id: &PrescriptionId,
        scan: &ScanPage,
        image: &DynamicImage,
        expected: u32,
        logger: &dyn RunLogger,
    ) -> Result<u32, VerificationError> {
        let found = skippable(
            self.detectors.stamp.count_stamps(image, expected),
            "stamp detection",
            id,
            scan,
            logger,
        )?;
        Ok(found.unwrap_or(0))
    }
}

/// Signatures expected on a pharmacist page.
fn pharmacist_sign_required(page: u32, is_prototype: bool) -> u32 {
    match (page, is_prototype) {
        (1, true) => 3,
        (1, false) => 2,
        _ => 1,
    }
}

/// `Failed` is logged and becomes `None`; `Resource` propagates.
fn skippable<T>(
    result: Result<T, DetectorError>,
    what: &str,
    id: &PrescriptionId,
    scan: &ScanPage,
    logger: &dyn RunLogger,
) -> Result<Option<T>, VerificationError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_transient() => Err(e.into()),
        Err(e) => {
            logger.log(
                LogRecord::new(LogLevel::Warn, format!("{what} failed, page kept"))
                    .for_prescription(id)
                    .field("file", &scan.file_name)
                    .field("error", &e),
            );
            Ok(None)
        }
    }
}
