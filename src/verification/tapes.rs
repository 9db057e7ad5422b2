//! Authenticity tapes: coupon codes read from pharmacist pages versus the
//! codes the registry expects for the execution.

use std::collections::{BTreeSet, HashMap};

use super::types::{ExecutionDigits, PageCheckResult, PrescriptionId, Role};

/// Barcodes at least this long are prescription barcodes, not tapes.
const PRESCRIPTION_BARCODE_LEN: usize = 16;

/// Comma-joined coupon codes shorter than a prescription barcode.
pub fn authenticity_tapes(codes: &[String]) -> String {
    codes
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty() && c.chars().count() < PRESCRIPTION_BARCODE_LEN)
        .collect::<Vec<_>>()
        .join(",")
}

fn split_codes(joined: &str) -> impl Iterator<Item = &str> {
    joined.split(',').map(str::trim).filter(|c| !c.is_empty())
}

/// Compare found tapes with expected tapes per (prescription, execution).
///
/// Pharmacist pages of the same execution share the found set. Doctor pages
/// and pages without an expectation entry get empty strings.
pub fn reconcile_tapes(
    pages: &mut [PageCheckResult],
    expected: &HashMap<(PrescriptionId, ExecutionDigits), Vec<String>>,
) {
    let mut found: HashMap<(PrescriptionId, ExecutionDigits), BTreeSet<String>> = HashMap::new();
    for page in pages.iter().filter(|p| p.role == Role::Pharmacist) {
        found
            .entry((page.prescription.clone(), page.execution.clone()))
            .or_default()
            .extend(split_codes(&page.coupons_found).map(str::to_string));
    }

    for page in pages.iter_mut() {
        page.missing_tapes.clear();
        page.surplus_tapes.clear();
        if page.role != Role::Pharmacist {
            continue;
        }

        let key = (page.prescription.clone(), page.execution.clone());
        let Some(expected_codes) = expected.get(&key) else {
            continue;
        };
        let expected_set: BTreeSet<&str> =
            expected_codes.iter().map(|c| c.trim()).filter(|c| !c.is_empty()).collect();
        let found_set: BTreeSet<&str> = found
            .get(&key)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let missing: Vec<&str> = expected_set.difference(&found_set).copied().collect();
        let surplus: Vec<&str> = found_set.difference(&expected_set).copied().collect();

        page.missing_tapes = missing.join(",");
        page.surplus_tapes = surplus.join(",");
        page.coupon_check = Some(missing.is_empty());
    }
}
