//! Dosage compliance: did the pharmacist hand out as many boxes as the
//! prescribed dosage needs?
//!
//! `check` is the tri-state verdict. The remaining functions derive its
//! inputs from the raw registry columns.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::quantity::normalize::clean_description;
use super::quantity::{Quantity, QuantityExtractionEngine};
use super::types::{DosageRow, MedicineLine, Prescription};

/// Sentinel meaning "not applicable" for dose quantity, or "single
/// administration" for the frequency column.
pub const NOT_APPLICABLE: f64 = 999.0;

/// Drops are counted as 0.05 ml each.
const DROP_ML: f64 = 0.05;

const DROP_TERMS: &[&str] = &[
    "ΟΦΘ.ΣΤΑΓΟΝΕΣ",
    "ΟΦΘΑΛΜΙΚΕΣ",
    "ΠΟΣ.ΣΤΑΓΟΝΕΣ",
    "ΠΟΣΙΜΕΣ",
    "ΟΤΙΚΟ",
    "ΥΠΟΓΛΩΣΣΙΕΣ",
    "ΕΝΑΙΩΡΗΜΑ",
];

static ORAL_ML: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.?\d*)\s*ΠΟΣ\D+(\d+\.?\d*)\s*ML").unwrap());
static ML: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+\.?\d*)\s*ML").unwrap());
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)/(\d+)|(\d+\.?\d*)").unwrap());
static PARENTHESISED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(.*?\)").unwrap());
static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

// ═══════════════════════════════════════════
// Verdict
// ═══════════════════════════════════════════

/// Tri-state dosage verdict. `Check` asks for human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DosageCheck {
    #[serde(rename = "True")]
    True,
    #[serde(rename = "False")]
    False,
    #[serde(rename = "CHECK")]
    Check,
}

impl DosageCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Check => "CHECK",
        }
    }
}

impl fmt::Display for DosageCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compare boxes provided against boxes required. First matching rule wins.
pub fn check(provided: Option<f64>, required: u32, dose_value: f64, dose_qnt: f64) -> DosageCheck {
    let Some(provided) = provided.filter(|p| p.is_finite()) else {
        return DosageCheck::False;
    };
    if provided <= 0.0 {
        return DosageCheck::False;
    }
    if provided == 1.0 {
        return DosageCheck::True;
    }
    if dose_qnt == NOT_APPLICABLE {
        return DosageCheck::True;
    }
    if dose_value == NOT_APPLICABLE || dose_value == 0.0 {
        return DosageCheck::False;
    }
    let required = f64::from(required);
    if provided > required {
        DosageCheck::False
    } else if provided == required {
        DosageCheck::True
    } else {
        DosageCheck::Check
    }
}

// ═══════════════════════════════════════════
// Column parsers
// ═══════════════════════════════════════════

/// Amount per administration from the dose column ("1 ΔΙΣΚΙΑ", "5 ΠΟΣ. ... 2.5 ML", "1/2").
pub fn dosage_value(text: &str) -> f64 {
    let row = text.trim().to_uppercase();
    if row.is_empty() {
        return 0.0;
    }

    if let Some(c) = ORAL_ML.captures(&row) {
        let n = c[1].parse::<f64>().unwrap_or(0.0);
        let m = c[2].parse::<f64>().unwrap_or(0.0);
        return n * m;
    }

    if let Some(c) = ML.captures(&row) {
        return c[1].parse::<f64>().unwrap_or(0.0);
    }

    let Some(c) = NUMBER.captures(&row) else {
        return 0.0;
    };
    let number = match (c.get(1), c.get(2), c.get(3)) {
        (Some(num), Some(den), _) => {
            let num = num.as_str().parse::<f64>().unwrap_or(0.0);
            let den = den.as_str().parse::<f64>().unwrap_or(0.0);
            if den == 0.0 {
                return 0.0;
            }
            num / den
        }
        (_, _, Some(n)) => n.as_str().parse::<f64>().unwrap_or(0.0),
        _ => return 0.0,
    };

    if DROP_TERMS.iter().any(|term| row.contains(term)) {
        number * DROP_ML
    } else {
        number
    }
}

/// Administrations per day from the frequency column
/// ("2 φορές ημερησίως", "κάθε 2 εβδομάδες", "εφάπαξ").
pub fn dosage_repeat(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    if text.contains("εφάπαξ") {
        return NOT_APPLICABLE;
    }
    let stripped = text.trim().replace("κάθε ", "");
    let token = stripped.split(' ').next().unwrap_or("");
    let n = token.parse::<u32>().ok().map(f64::from);

    if text.contains("εβδομάδα") {
        n.map(|n| n / 7.0).unwrap_or(1.0)
    } else if text.contains("εβδομάδες") {
        n.filter(|n| *n > 0.0).map(|n| 1.0 / (7.0 * n)).unwrap_or(1.0)
    } else {
        n.unwrap_or(1.0)
    }
}

/// Treatment days from the duration column ("30 ημέρες").
pub fn treatment_days(text: &str) -> f64 {
    text.trim()
        .split(' ')
        .next()
        .and_then(|t| t.parse::<u32>().ok())
        .map(f64::from)
        .unwrap_or(0.0)
}

/// Boxes handed out, from a column like "2 (δύο)" or "-1-".
pub fn boxes_provided(text: &str) -> Option<f64> {
    let cleaned = PARENTHESISED
        .replace_all(text, "")
        .replace('-', "")
        .replace('\n', "");
    INTEGER
        .find(&cleaned)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(f64::from)
}

/// Boxes the dosage needs given the pack size.
pub fn boxes_required(
    dosage_qnt: f64,
    quantity: Quantity,
    pills_required: f64,
    provided: Option<f64>,
) -> u32 {
    if dosage_qnt == NOT_APPLICABLE {
        return provided.map(|p| p as u32).unwrap_or(0);
    }
    match quantity {
        Quantity::Unidentified => 1,
        Quantity::NotApplicable => NOT_APPLICABLE as u32,
        Quantity::Units(units) if units > 0.0 => (pills_required / units).ceil().max(0.0) as u32,
        Quantity::Units(_) => 1,
    }
}

// ═══════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════

/// Derive a dosage row from a raw medicine line.
///
/// The dosage column reads "`<dose> <form> x <per-day> x <days>`"; the form
/// word selects the quantity chain.
pub fn build_row(line: &MedicineLine, engine: &QuantityExtractionEngine) -> DosageRow {
    let mut parts = line.dosage.splitn(3, 'x');
    let dose_part = parts.next().unwrap_or("");
    let frequency_part = parts.next().unwrap_or("");
    let duration_part = parts.next().unwrap_or("");

    let category = dose_part
        .trim()
        .split(' ')
        .nth(1)
        .unwrap_or("")
        .to_string();
    let normalized_description = clean_description(&line.description);
    let (description_quantity, matched_rule) = engine.extract(&category, &normalized_description);

    let dosage = dosage_value(dose_part);
    let dosage_qnt = dosage_repeat(frequency_part);
    let dosage_repeat = treatment_days(duration_part);
    let pills_required = dosage * dosage_qnt * dosage_repeat;

    let provided = boxes_provided(&line.boxes_provided);
    let required = boxes_required(dosage_qnt, description_quantity, pills_required, provided);

    DosageRow {
        description: line.description.clone(),
        normalized_description,
        category,
        dosage,
        dosage_qnt,
        dosage_repeat,
        pills_required,
        description_quantity,
        matched_rule,
        boxes_provided: provided,
        boxes_provided_multiple_executions: None,
        boxes_required: required,
        dosage_check: check(provided, required, dosage, dosage_qnt),
    }
}

/// Sum boxes provided for the same drug across all executions of a
/// prescription, then recompute every row's verdict from the sum.
pub fn aggregate_multiple_executions(prescription: &mut Prescription) {
    let mut totals: HashMap<String, Option<f64>> = HashMap::new();
    for record in prescription.executions.values() {
        for row in &record.dosages {
            let entry = totals.entry(row.normalized_description.clone()).or_insert(None);
            if let Some(p) = row.boxes_provided {
                *entry = Some(entry.unwrap_or(0.0) + p);
            }
        }
    }

    for record in prescription.executions.values_mut() {
        for row in &mut record.dosages {
            let total = totals.get(&row.normalized_description).copied().flatten();
            row.boxes_provided_multiple_executions = total;
            row.dosage_check = check(total, row.boxes_required, row.dosage, row.dosage_qnt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::quantity::RuleId;
    use crate::verification::types::{DocumentRecord, ExecutionDigits, PrescriptionId};
    use proptest::prelude::*;

    #[test]
    fn verdicts_for_required_ten() {
        assert_eq!(check(Some(10.0), 10, 1.0, 1.0), DosageCheck::True);
        assert_eq!(check(Some(8.0), 10, 1.0, 1.0), DosageCheck::Check);
        assert_eq!(check(Some(12.0), 10, 1.0, 1.0), DosageCheck::False);
    }

    #[test]
    fn single_box_always_passes() {
        assert_eq!(check(Some(1.0), 50, 0.0, 1.0), DosageCheck::True);
    }

    #[test]
    fn not_applicable_quantity_passes() {
        assert_eq!(check(Some(5.0), 1, 1.0, NOT_APPLICABLE), DosageCheck::True);
    }

    #[test]
    fn zero_or_sentinel_dose_fails() {
        assert_eq!(check(Some(2.0), 2, 0.0, 1.0), DosageCheck::False);
        assert_eq!(check(Some(2.0), 2, NOT_APPLICABLE, 1.0), DosageCheck::False);
    }

    #[test]
    fn missing_or_non_finite_provided_fails() {
        assert_eq!(check(None, 1, 1.0, 1.0), DosageCheck::False);
        assert_eq!(check(Some(f64::NAN), 1, 1.0, 1.0), DosageCheck::False);
    }

    #[test]
    fn verdict_strings() {
        assert_eq!(DosageCheck::Check.to_string(), "CHECK");
        assert_eq!(serde_json::to_string(&DosageCheck::True).unwrap(), "\"True\"");
    }

    #[test]
    fn dosage_value_forms() {
        assert_eq!(dosage_value(""), 0.0);
        assert_eq!(dosage_value("1 ΔΙΣΚΙΑ"), 1.0);
        assert_eq!(dosage_value("1/2 ΔΙΣΚΙΑ"), 0.5);
        assert_eq!(dosage_value("2 ΠΟΣ.ΔΙΑΛΥΜΑ 5 ml"), 10.0);
        assert_eq!(dosage_value("7.5 ml"), 7.5);
        assert!((dosage_value("2 ΟΦΘ.ΣΤΑΓΟΝΕΣ") - 0.1).abs() < 1e-12);
        assert_eq!(dosage_value("ΔΙΣΚΙΑ"), 0.0);
    }

    #[test]
    fn dosage_repeat_forms() {
        assert_eq!(dosage_repeat(""), 0.0);
        assert_eq!(dosage_repeat(" 2 φορές ημερησίως "), 2.0);
        assert_eq!(dosage_repeat("εφάπαξ"), NOT_APPLICABLE);
        assert!((dosage_repeat(" 1 φορά την εβδομάδα") - 1.0 / 7.0).abs() < 1e-12);
        assert!((dosage_repeat(" κάθε 2 εβδομάδες") - 1.0 / 14.0).abs() < 1e-12);
        assert_eq!(dosage_repeat("όταν χρειάζεται"), 1.0);
    }

    #[test]
    fn boxes_provided_forms() {
        assert_eq!(boxes_provided("2"), Some(2.0));
        assert_eq!(boxes_provided("(1 σταγόνα) 3"), Some(3.0));
        assert_eq!(boxes_provided("-\n4-"), Some(4.0));
        assert_eq!(boxes_provided("g"), None);
    }

    #[test]
    fn boxes_required_cases() {
        assert_eq!(boxes_required(NOT_APPLICABLE, Quantity::Units(10.0), 100.0, Some(3.0)), 3);
        assert_eq!(boxes_required(1.0, Quantity::Unidentified, 100.0, Some(3.0)), 1);
        assert_eq!(boxes_required(1.0, Quantity::NotApplicable, 100.0, Some(3.0)), 999);
        assert_eq!(boxes_required(1.0, Quantity::Units(28.0), 60.0, Some(3.0)), 3);
        assert_eq!(boxes_required(1.0, Quantity::Units(30.0), 60.0, Some(2.0)), 2);
    }

    fn line(description: &str, dosage: &str, boxes: &str) -> MedicineLine {
        MedicineLine {
            description: description.into(),
            dosage: dosage.into(),
            boxes_provided: boxes.into(),
        }
    }

    #[test]
    fn build_row_end_to_end() {
        let engine = QuantityExtractionEngine::new().unwrap();
        let row = build_row(
            &line(
                "NEXIUM GR.TAB 40MG/TAB BT X 28",
                "1 ΔΙΣΚΙΑ x 2 φορές ημερησίως x 28 ημέρες",
                "2",
            ),
            &engine,
        );
        assert_eq!(row.category, "ΔΙΣΚΙΑ");
        assert_eq!(row.description_quantity, Quantity::Units(28.0));
        assert_eq!(row.matched_rule, Some(RuleId::BtXNumber));
        assert_eq!(row.pills_required, 56.0);
        assert_eq!(row.boxes_required, 2);
        assert_eq!(row.dosage_check, DosageCheck::True);
    }

    #[test]
    fn build_row_unknown_form_needs_one_box() {
        let engine = QuantityExtractionEngine::new().unwrap();
        let row = build_row(&line("SOMETHING", "1 ΑΓΝΩΣΤΟ x 1 x 10", "3"), &engine);
        assert_eq!(row.description_quantity, Quantity::Unidentified);
        assert_eq!(row.boxes_required, 1);
        assert_eq!(row.dosage_check, DosageCheck::False);
    }

    #[test]
    fn aggregation_sums_across_executions() {
        let engine = QuantityExtractionEngine::new().unwrap();
        let mut p = Prescription {
            id: PrescriptionId::from("2301"),
            executions: Default::default(),
        };
        for (digits, boxes) in [("101", "1"), ("102", "1")] {
            let mut record = DocumentRecord::new(ExecutionDigits::parse(digits).unwrap(), 1);
            record.dosages.push(build_row(
                &line(
                    "NEXIUM GR.TAB 40MG/TAB BT X 28",
                    "1 ΔΙΣΚΙΑ x 2 φορές ημερησίως x 28 ημέρες",
                    boxes,
                ),
                &engine,
            ));
            p.executions.insert(record.execution.clone(), record);
        }

        aggregate_multiple_executions(&mut p);
        for record in p.executions.values() {
            let row = &record.dosages[0];
            assert_eq!(row.boxes_provided_multiple_executions, Some(2.0));
            assert_eq!(row.dosage_check, DosageCheck::True);
        }
    }

    proptest! {
        #[test]
        fn non_positive_provided_is_false(
            p in -1000.0f64..=0.0,
            r in 0u32..100,
            d in 0.0f64..10.0,
            q in 0.0f64..10.0,
        ) {
            prop_assert_eq!(check(Some(p), r, d, q), DosageCheck::False);
        }

        #[test]
        fn equal_provided_and_required_passes(r in 2u32..500, d in 1.0f64..10.0, q in 1.0f64..10.0) {
            prop_assert_eq!(check(Some(f64::from(r)), r, d, q), DosageCheck::True);
        }

        #[test]
        fn check_is_pure(p in 0.0f64..50.0, r in 0u32..50, d in 0.0f64..1000.0, q in 0.0f64..1000.0) {
            prop_assert_eq!(check(Some(p), r, d, q), check(Some(p), r, d, q));
        }
    }
}
