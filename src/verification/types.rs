//! Core types for the prescription verification pipeline.
//!
//! These types model one verification run:
//! Prescription (registry data) → Requirements → scanned pages → PageCheckResult
//! → RunOutcome.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::compliance::DosageCheck;
use super::error::VerificationError;
use super::quantity::{Quantity, RuleId};

/// Barcodes the scanner could not read are filed under a run of zeros.
const UNRECOGNISED_MARKER: &str = "0000000000000000";

/// Units whose paper doctor documents need two stamps.
const HOSPITAL_UNIT_MARKER: &str = "νοσοκομ";

// ═══════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════

/// Prescription barcode (16 digits for recognised scans).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrescriptionId(String);

impl PrescriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for ids the barcode reader could not decode.
    pub fn is_unrecognised(&self) -> bool {
        self.0.contains(UNRECOGNISED_MARKER)
    }
}

impl fmt::Display for PrescriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrescriptionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Three-digit execution suffix.
///
/// The first digit is non-zero on pharmacist pages; the middle digit is the
/// dispensation position; a last digit of 0 or 1 marks a full or first execution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExecutionDigits(String);

impl ExecutionDigits {
    pub fn parse(s: &str) -> Result<Self, VerificationError> {
        if s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_string()))
        } else {
            Err(VerificationError::InvalidExecutionDigits(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn role(&self) -> Role {
        if self.0.starts_with('0') {
            Role::Doctor
        } else {
            Role::Pharmacist
        }
    }

    pub fn is_first_or_full(&self) -> bool {
        self.0.ends_with('0') || self.0.ends_with('1')
    }

    /// Digits of the doctor page that belongs with this execution: `0<position>0`.
    pub fn doctor_counterpart(&self) -> Self {
        let position = &self.0[1..2];
        Self(format!("0{position}0"))
    }
}

impl fmt::Display for ExecutionDigits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ExecutionDigits {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ExecutionDigits {
    type Error = VerificationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ExecutionDigits> for String {
    fn from(d: ExecutionDigits) -> Self {
        d.0
    }
}

// ═══════════════════════════════════════════
// Role
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Doctor,
    Pharmacist,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Doctor => "doctor",
            Self::Pharmacist => "pharmacist",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Dosage table
// ═══════════════════════════════════════════

/// One medicine line as read from the registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicineLine {
    pub description: String,
    /// "`<dose> <form> x <times> x <days>`", e.g. "1 ΔΙΣΚΙΑ x 2 φορές ημερησίως x 30 ημέρες".
    #[serde(default)]
    pub dosage: String,
    /// Raw boxes column; may hold parentheses or dashes.
    #[serde(default)]
    pub boxes_provided: String,
}

/// Derived dosage row. `dosage_check` is a pure function of the four numeric
/// inputs (`boxes_provided`, `boxes_required`, `dosage`, `dosage_qnt`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosageRow {
    pub description: String,
    pub normalized_description: String,
    pub category: String,
    pub dosage: f64,
    pub dosage_qnt: f64,
    pub dosage_repeat: f64,
    pub pills_required: f64,
    pub description_quantity: Quantity,
    pub matched_rule: Option<RuleId>,
    pub boxes_provided: Option<f64>,
    pub boxes_provided_multiple_executions: Option<f64>,
    pub boxes_required: u32,
    pub dosage_check: DosageCheck,
}

// ═══════════════════════════════════════════
// Document record
// ═══════════════════════════════════════════

/// Registry data for one execution of a prescription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub execution: ExecutionDigits,
    pub pages: u32,
    #[serde(default)]
    pub is_digital: bool,
    #[serde(default)]
    pub is_prototype: bool,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub category: Option<u8>,
    #[serde(default)]
    pub category_name: String,
    #[serde(default)]
    pub insurance_amount: Option<f64>,
    #[serde(default)]
    pub patient_amount: Option<f64>,
    /// 100% coverage exemption.
    #[serde(default)]
    pub full_participation: bool,
    /// Coupons the pharmacist must attach (sum of boxes provided).
    #[serde(default)]
    pub coupons: u32,
    #[serde(default)]
    pub doctor_name: String,
    #[serde(default)]
    pub patient_name: String,
    #[serde(default)]
    pub pdf_file_name: String,
    /// Authenticity tape codes the registry expects on the coupon page.
    #[serde(default)]
    pub expected_tapes: Vec<String>,
    #[serde(default)]
    pub medicines: Vec<MedicineLine>,
    #[serde(default)]
    pub dosages: Vec<DosageRow>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub found: FoundCounts,
}

impl DocumentRecord {
    /// Minimal record, used by sources and tests.
    pub fn new(execution: ExecutionDigits, pages: u32) -> Self {
        Self {
            execution,
            pages,
            is_digital: false,
            is_prototype: false,
            unit: String::new(),
            category: None,
            category_name: String::new(),
            insurance_amount: None,
            patient_amount: None,
            full_participation: false,
            coupons: 0,
            doctor_name: String::new(),
            patient_name: String::new(),
            pdf_file_name: String::new(),
            expected_tapes: Vec::new(),
            medicines: Vec::new(),
            dosages: Vec::new(),
            requirements: Requirements::default(),
            found: FoundCounts::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.execution.role()
    }

    pub fn first_execution(&self) -> bool {
        self.execution.is_first_or_full()
    }

    pub fn full_barcode(&self, id: &PrescriptionId) -> String {
        format!("{id}{}", self.execution)
    }
}

/// Required counts derived once per record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    pub pharm_sign_required: u32,
    pub doc_sign_required: u32,
    pub doc_stamps_required: u32,
}

impl Requirements {
    pub fn derive(record: &DocumentRecord) -> Self {
        let pharm_sign_required =
            2 + u32::from(record.is_prototype) + record.pages.saturating_sub(1);
        let (doc_sign_required, doc_stamps_required) = if record.is_digital {
            (0, 0)
        } else if record.unit.to_lowercase().contains(HOSPITAL_UNIT_MARKER) {
            (1, 2)
        } else {
            (1, 1)
        };
        Self {
            pharm_sign_required,
            doc_sign_required,
            doc_stamps_required,
        }
    }
}

/// Found counts accumulated across the pages of one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundCounts {
    pub pharm_sign_found: u32,
    pub doc_sign_found: u32,
    pub pharm_stamps_found: u32,
    pub doc_stamps_found: u32,
}

impl FoundCounts {
    /// New counts with one page's detections added.
    pub fn with_page(self, role: Role, signatures: u32, stamps: u32) -> Self {
        match role {
            Role::Pharmacist => Self {
                pharm_sign_found: self.pharm_sign_found + signatures,
                pharm_stamps_found: self.pharm_stamps_found + stamps,
                ..self
            },
            Role::Doctor => Self {
                doc_sign_found: self.doc_sign_found + signatures,
                doc_stamps_found: self.doc_stamps_found + stamps,
                ..self
            },
        }
    }
}

/// A prescription and its executions, keyed by registry execution digits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    pub id: PrescriptionId,
    pub executions: BTreeMap<ExecutionDigits, DocumentRecord>,
}

// ═══════════════════════════════════════════
// Page results
// ═══════════════════════════════════════════

/// One scanned page (or synthesized placeholder) and its checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCheckResult {
    pub prescription: PrescriptionId,
    pub full_barcode: String,
    pub execution: ExecutionDigits,
    /// Digits read from the scan file name; `None` for "file not found".
    pub scan_digits: Option<ExecutionDigits>,
    /// Scanned file name; empty for placeholders.
    pub file_name: String,
    pub role: Role,
    pub page: u32,
    pub pages: u32,
    pub digital: bool,
    pub full_participation: bool,
    pub first_execution: bool,
    pub sign_found: Option<u32>,
    pub sign_required: Option<u32>,
    pub stamps_found: Option<u32>,
    pub stamps_required: Option<u32>,
    pub coupons_found: String,
    pub coupons_required: u32,
    pub sign_check: bool,
    pub stamps_check: bool,
    pub coupon_check: Option<bool>,
    pub missing_tapes: String,
    pub surplus_tapes: String,
    pub doctor_name: String,
    pub patient_name: String,
    pub category: Option<u8>,
    pub category_name: String,
    pub unit: String,
    pub pdf_file_name: String,
    pub insurance_amount: Option<f64>,
    pub patient_amount: Option<f64>,
    /// Position of the scan in the physical stack, from `index.csv`.
    pub stack_number: Option<u32>,
}

/// Key used to drop duplicate page rows after merging worker output.
pub type PageKey = (String, PrescriptionId, Option<ExecutionDigits>, u32, ExecutionDigits);

impl PageCheckResult {
    pub fn key(&self) -> PageKey {
        (
            self.file_name.clone(),
            self.prescription.clone(),
            self.scan_digits.clone(),
            self.page,
            self.execution.clone(),
        )
    }
}

/// Checker output for one prescription.
#[derive(Debug, Clone, PartialEq)]
pub struct PrescriptionOutcome {
    pub prescription: Prescription,
    pub pages: Vec<PageCheckResult>,
}

/// A prescription whose metadata could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalFailure {
    pub prescription: PrescriptionId,
    pub reason: String,
}

/// Everything one `run()` produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: BTreeMap<PrescriptionId, BTreeMap<ExecutionDigits, DocumentRecord>>,
    pub pages: Vec<PageCheckResult>,
    pub failures: Vec<FatalFailure>,
    pub progress: u64,
    pub retried_chunks: u32,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digits(s: &str) -> ExecutionDigits {
        ExecutionDigits::parse(s).unwrap()
    }

    #[test]
    fn unrecognised_id_detected() {
        assert!(PrescriptionId::from("0000000000000000").is_unrecognised());
        assert!(PrescriptionId::from("x0000000000000000y").is_unrecognised());
        assert!(!PrescriptionId::from("2301011234567890").is_unrecognised());
    }

    #[test]
    fn execution_digits_validated() {
        assert!(ExecutionDigits::parse("101").is_ok());
        assert!(ExecutionDigits::parse("10").is_err());
        assert!(ExecutionDigits::parse("1a1").is_err());
        assert!(ExecutionDigits::parse("1011").is_err());
    }

    #[test]
    fn execution_digits_role() {
        assert_eq!(digits("101").role(), Role::Pharmacist);
        assert_eq!(digits("010").role(), Role::Doctor);
    }

    #[test]
    fn first_or_full_execution() {
        assert!(digits("110").is_first_or_full());
        assert!(digits("111").is_first_or_full());
        assert!(!digits("112").is_first_or_full());
    }

    #[test]
    fn doctor_counterpart_uses_position_digit() {
        assert_eq!(digits("121").doctor_counterpart().as_str(), "020");
        assert_eq!(digits("110").doctor_counterpart().as_str(), "010");
    }

    #[test]
    fn execution_digits_serde_rejects_invalid() {
        let ok: ExecutionDigits = serde_json::from_str("\"101\"").unwrap();
        assert_eq!(ok, digits("101"));
        assert!(serde_json::from_str::<ExecutionDigits>("\"1x1\"").is_err());
    }

    #[test]
    fn requirements_paper_clinic() {
        let mut record = DocumentRecord::new(digits("101"), 1);
        record.unit = "ΙΔΙΩΤΙΚΟ ΙΑΤΡΕΙΟ".into();
        let req = Requirements::derive(&record);
        assert_eq!(req.pharm_sign_required, 2);
        assert_eq!(req.doc_sign_required, 1);
        assert_eq!(req.doc_stamps_required, 1);
    }

    #[test]
    fn requirements_hospital_needs_two_stamps() {
        let mut record = DocumentRecord::new(digits("101"), 2);
        record.unit = "ΓΕΝΙΚΟ ΝΟΣΟΚΟΜΕΙΟ ΑΘΗΝΩΝ".into();
        record.is_prototype = true;
        let req = Requirements::derive(&record);
        assert_eq!(req.pharm_sign_required, 4);
        assert_eq!(req.doc_stamps_required, 2);
    }

    #[test]
    fn requirements_digital_needs_nothing_from_doctor() {
        let mut record = DocumentRecord::new(digits("101"), 1);
        record.is_digital = true;
        record.unit = "νοσοκομείο".into();
        let req = Requirements::derive(&record);
        assert_eq!(req.doc_sign_required, 0);
        assert_eq!(req.doc_stamps_required, 0);
    }

    #[test]
    fn found_counts_return_updated_copies() {
        let start = FoundCounts::default();
        let after = start
            .with_page(Role::Pharmacist, 2, 1)
            .with_page(Role::Doctor, 1, 0)
            .with_page(Role::Pharmacist, 1, 0);
        assert_eq!(start, FoundCounts::default());
        assert_eq!(after.pharm_sign_found, 3);
        assert_eq!(after.pharm_stamps_found, 1);
        assert_eq!(after.doc_sign_found, 1);
        assert_eq!(after.doc_stamps_found, 0);
    }

    #[test]
    fn record_parses_with_defaults() {
        let json = r#"{"execution": "101", "pages": 1}"#;
        let record: DocumentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.role(), Role::Pharmacist);
        assert!(record.first_execution());
        assert!(record.medicines.is_empty());
        assert_eq!(record.full_barcode(&"2301".into()), "2301101");
    }

    #[test]
    fn prescription_map_keys_are_digit_strings() {
        let json = r#"{"id": "2301", "executions": {"101": {"execution": "101", "pages": 1}}}"#;
        let p: Prescription = serde_json::from_str(json).unwrap();
        assert!(p.executions.contains_key(&digits("101")));
        let back = serde_json::to_string(&p).unwrap();
        assert!(back.contains("\"101\""));
    }
}
