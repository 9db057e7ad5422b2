//! Pattern strategies for "units per container".
//!
//! Every strategy receives an already-normalised description and returns
//! `Quantity::Unidentified` when its pattern does not apply, so the next
//! strategy in the chain gets a turn.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Quantity;

/// Identifies the rule that produced a quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    Override,
    MeteredDoses,
    Actuations,
    Sprays,
    Inhalations,
    Doses,
    Caps,
    Disks,
    BtXNumberApplXNumber,
    DosesNumberMl,
    PlusNumberAppl,
    PlusNumberPrototype,
    BtXNumber,
    MlBtXNumberAmp,
    CapBtXNumber,
    DoseBtXNumber,
    VialBtXNumber,
    BtXNumberBlistXNumber,
    BtXNumberFlXNumber,
    BtXNumberXNumberVials,
    BtXNumberVialXNumber,
    BottleXNumber,
    BtXNumberFlXMl,
    FlXNumber,
    BtXNumberSachetXNumber,
    BtXNumberBottleXMl,
    BtXNumberVialXNumberMl,
    BtXNumberBottleXNumber,
    Excluded,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::MeteredDoses => "number_metered_doses",
            Self::Actuations => "number_actuations",
            Self::Sprays => "number_sprays",
            Self::Inhalations => "number_inhalations",
            Self::Doses => "number_doses",
            Self::Caps => "number_caps",
            Self::Disks => "number_disks",
            Self::BtXNumberApplXNumber => "bt_x_number_appl_x_number",
            Self::DosesNumberMl => "doses_number_ml",
            Self::PlusNumberAppl => "plus_number_appl",
            Self::PlusNumberPrototype => "plus_number_prototype",
            Self::BtXNumber => "bt_x_number",
            Self::MlBtXNumberAmp => "ml_bt_x_number_amp",
            Self::CapBtXNumber => "cap_bt_x_number",
            Self::DoseBtXNumber => "dose_bt_x_number",
            Self::VialBtXNumber => "vial_bt_x_number",
            Self::BtXNumberBlistXNumber => "bt_x_number_blist_x_number",
            Self::BtXNumberFlXNumber => "bt_x_number_fl_x_number",
            Self::BtXNumberXNumberVials => "bt_x_number_x_number_vials",
            Self::BtXNumberVialXNumber => "bt_x_number_vial_x_number",
            Self::BottleXNumber => "bottle_x_number",
            Self::BtXNumberFlXMl => "bt_x_number_fl_x_ml",
            Self::FlXNumber => "fl_x_number",
            Self::BtXNumberSachetXNumber => "bt_x_number_sachet_x_number",
            Self::BtXNumberBottleXMl => "bt_x_number_bottle_x_ml",
            Self::BtXNumberVialXNumberMl => "bt_x_number_vial_x_number_ml",
            Self::BtXNumberBottleXNumber => "bt_x_number_bottle_x_number",
            Self::Excluded => "dosage_excluded",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Patterns
// ═══════════════════════════════════════════

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static COMMA_OR_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,\s]+").unwrap());

static METERED_DOSES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)(?:METEREDDOSES)").unwrap());
static ACTUATIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)(?:ACTUATIONS)").unwrap());
static SPRAYS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+)(?:ΨEKAΣMOI)").unwrap());
static INHALATIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)(?:EIΣΠNOEΣ)").unwrap());
static DOSES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)(?:DOSES|ΔOΣEIΣ|ΔOΣH)").unwrap());
static CAPS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+)(?:CAPS)").unwrap());
static DISKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+)(?:ΔIΣKIΩN)").unwrap());

static BTX_INT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"BTX([0-9]+)").unwrap());
static APPLX_INT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"APPLX([0-9]+)").unwrap());
static ML_BTX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+)MLBTX").unwrap());
static PLUS_APPL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\+([0-9]+)APPL").unwrap());
static PLUS_PROTOTYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+([0-9]+)ΠPOTOTYΠO").unwrap());
static ML_BTX_AMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ML\s*BTX(\d+)AMP").unwrap());
static CAP_BTX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"CAP\s*BTX(\d+)").unwrap());
static DOSE_BTX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"DOSE\s*BTX(\d+)").unwrap());
static VIAL_BTX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"VIALBTX([0-9]+)").unwrap());
static BLISTX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"BLISTX([0-9]+)").unwrap());
static FLX_INT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"FLX([0-9]+)").unwrap());
static X_VIALS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"X([0-9]+)VIALS").unwrap());
static VIALX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:VIALX|VIALSX|ΦIAΛEΣ|ΦIAΛH)([0-9]+)").unwrap());
static BOTTLEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"BOTTLE(?:S)?X([0-9]+)").unwrap());

static BTX_DEC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)BTX(\d+(?:\.\d+)?)").unwrap());
static FLX_ML: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)FLX(\d+(?:\.\d+)?)ML").unwrap());
static FLX_DEC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)FLX(\d+(?:\.\d+)?)").unwrap());
static SACHET_X: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)SACHETS? X (\d+(?:\.\d+)?)").unwrap());
static BOTTLE_X_ML_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)BOTTLE(?:S)?X(\d+(?:\.\d+)?)ML$").unwrap());
static BT_SPACED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"BT\s*X\s*(\d+(?:\.\d+)?)").unwrap());
static VIAL_X_ML: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"VIALS?\s*X\s*(\d+(?:\.\d+)?)\s*ML").unwrap());
static BTX_SPACED_DEC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)BTX\s*([0-9]+(?:\.[0-9]+)?)").unwrap());
static BOTTLE_SPACED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)BOTTLE\s*X\s*([0-9]+(?:\.[0-9]+)?)").unwrap());

// ═══════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════

/// Run one pattern strategy. `Override` has no pattern and never matches here.
pub fn apply(rule: RuleId, description: &str) -> Quantity {
    match rule {
        RuleId::Override => Quantity::Unidentified,
        RuleId::MeteredDoses => number_before_word(&METERED_DOSES, description),
        RuleId::Actuations => number_before_word(&ACTUATIONS, description),
        RuleId::Sprays => number_before_word(&SPRAYS, description),
        RuleId::Inhalations => number_before_word(&INHALATIONS, description),
        RuleId::Doses => number_before_word(&DOSES, description),
        RuleId::Caps => number_before_word(&CAPS, description),
        RuleId::Disks => number_before_word(&DISKS, description),
        RuleId::BtXNumberApplXNumber => {
            let s = strip_commas_and_space(description);
            product(first(&BTX_INT, &s), first(&APPLX_INT, &s))
        }
        RuleId::DosesNumberMl => single(first(&ML_BTX, &strip_space(description))),
        RuleId::PlusNumberAppl => single(first(&PLUS_APPL, &strip_commas_and_space(description))),
        RuleId::PlusNumberPrototype => {
            single(first(&PLUS_PROTOTYPE, &strip_commas_and_space(description)))
        }
        RuleId::BtXNumber => single(first(&BTX_INT, &strip_commas_and_space(description))),
        RuleId::MlBtXNumberAmp => single(first(&ML_BTX_AMP, &strip_space(description))),
        RuleId::CapBtXNumber => single(first(&CAP_BTX, &strip_commas_and_space(description))),
        RuleId::DoseBtXNumber => single(first(&DOSE_BTX, &strip_space(description))),
        RuleId::VialBtXNumber => single(first(&VIAL_BTX, &strip_space(description))),
        RuleId::BtXNumberBlistXNumber => {
            let s = strip_commas_and_space(description);
            product(first(&BTX_INT, &s), first(&BLISTX, &s))
        }
        RuleId::BtXNumberFlXNumber => {
            let s = strip_space(description);
            product(first(&BTX_INT, &s), first(&FLX_INT, &s))
        }
        RuleId::BtXNumberXNumberVials => {
            let s = strip_commas_and_space(description).replace("SACHETS", "");
            product(first(&BTX_INT, &s), first(&X_VIALS, &s))
        }
        RuleId::BtXNumberVialXNumber => {
            let s = strip_commas_and_space(description);
            product(first(&BTX_INT, &s), first(&VIALX, &s))
        }
        RuleId::BottleXNumber => single(first(&BOTTLEX, &strip_commas_and_space(description))),
        RuleId::BtXNumberFlXMl => {
            let s = strip_space(description).replace(',', ".");
            product(first(&BTX_INT, &s), first(&FLX_ML, &s))
        }
        RuleId::FlXNumber => {
            let s = strip_space(&description.replace(',', "."));
            single(first(&FLX_DEC, &s))
        }
        RuleId::BtXNumberSachetXNumber => {
            let s = WHITESPACE.replace_all(&description.replace(',', "."), " ").into_owned();
            product(first(&BTX_DEC, &s), first(&SACHET_X, &s))
        }
        RuleId::BtXNumberBottleXMl => {
            let s = strip_space(description).replace(',', ".");
            product(first(&BTX_DEC, &s), first(&BOTTLE_X_ML_END, &s))
        }
        RuleId::BtXNumberVialXNumberMl => {
            let s = description.to_uppercase().replace(',', ".");
            product(first(&BT_SPACED, &s), first(&VIAL_X_ML, &s))
        }
        RuleId::BtXNumberBottleXNumber => {
            let d = description.replace(',', ".");
            let s = WHITESPACE.replace_all(&d, " ");
            let s = s.trim();
            product(first(&BTX_SPACED_DEC, s), first(&BOTTLE_SPACED, s))
        }
        RuleId::Excluded => Quantity::NotApplicable,
    }
}

// ═══════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════

fn strip_space(s: &str) -> String {
    WHITESPACE.replace_all(s, "").into_owned()
}

fn strip_commas_and_space(s: &str) -> String {
    COMMA_OR_WHITESPACE.replace_all(s, "").into_owned()
}

/// First capture group of the leftmost match, parsed as a number.
fn first(re: &Regex, s: &str) -> Option<f64> {
    re.captures(s)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn number_before_word(re: &Regex, description: &str) -> Quantity {
    single(first(re, &strip_space(description)))
}

/// A zero count is not a pack size; the next rule gets a turn.
fn single(n: Option<f64>) -> Quantity {
    match n {
        Some(n) if n != 0.0 => Quantity::Units(n),
        _ => Quantity::Unidentified,
    }
}

fn product(a: Option<f64>, b: Option<f64>) -> Quantity {
    match (a, b) {
        (Some(a), Some(b)) if a != 0.0 && b != 0.0 => Quantity::Units(a * b),
        _ => Quantity::Unidentified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::quantity::normalize::clean_description;

    fn run(rule: RuleId, raw: &str) -> Quantity {
        apply(rule, &clean_description(raw))
    }

    #[test]
    fn doses_variants() {
        assert_eq!(
            run(RuleId::Doses, "DEXARIS NASPR.SUS 0,2028+0,5MG/ML BT X 1VIAL X 300 DOSES ΓΕΝΌΣΗΜΟ"),
            Quantity::Units(300.0)
        );
        assert_eq!(
            run(RuleId::Doses, "FOSTER NEXTHALER PD.INH.MD 100+6MC/DOSE BTX1X120 ΔOΣEIΣ ΠΡΩΤΌΤΥΠΟ"),
            Quantity::Units(120.0)
        );
        assert_eq!(
            run(
                RuleId::Doses,
                "RELVAR ELLIPTA INH.PD.DOS 92+22MCG/DOSE BTX1 ΣΥΣΚΕΥΉ ΕΙΣΠΝΟΏΝ X30 ΔOΣEIΣ ΠΡΩΤΌΤΥΠΟ"
            ),
            Quantity::Units(30.0)
        );
    }

    #[test]
    fn bottle_x_number() {
        assert_eq!(
            run(RuleId::BottleXNumber, "CADELIUS OR.DISP.TA 1500MG+1000 IU/TAB BOTTLEX30 TABS ΓΕΝΌΣΗΜΟ"),
            Quantity::Units(30.0)
        );
    }

    #[test]
    fn disks() {
        assert_eq!(
            run(RuleId::Disks, "ENIT TAB 10+20MG/TAB ΣΥΣΚΕΥΑΣΙΑ30 ΔIΣKIΩN ΠΡΩΤΌΤΥΠΟ"),
            Quantity::Units(30.0)
        );
    }

    #[test]
    fn bt_x_number_vial_x_number() {
        assert_eq!(
            run(RuleId::BtXNumberVialXNumber, "ELCOZEK GR.CAP 40MG/CAP BTX1VIALX 30 CAPS ΓΕΝΌΣΗΜΟ"),
            Quantity::Units(30.0)
        );
    }

    #[test]
    fn bt_x_number_tolerates_spacing() {
        for (raw, expected) in [
            ("NEXIUM GR.TAB 40MG/TAB BT X 28 ΠΡΩΤΌΤΥΠΟ ΣΕ ΘΕΡΑΠΕΥΤΙΚΉ ΚΑΤΗΓΟΡΊΑ", 28.0),
            ("INEGY TAB 10+40MG/TAB BTX28 ΠΡΩΤΌΤΥΠΟ", 28.0),
            ("CRESTOR F.C.TAB 10MG/TAB BTX  14 ΠΡΩΤΌΤΥΠΟ", 14.0),
        ] {
            assert_eq!(run(RuleId::BtXNumber, raw), Quantity::Units(expected), "{raw}");
        }
    }

    #[test]
    fn fl_x_number_variants() {
        for (raw, expected) in [
            ("CLARIPEN GRA.OR.SUS 250MG/5ML FLX60 ML ΓΕΝΌΣΗΜΟ", 60.0),
            ("PROCEF PD.ORA.SUS 250MG/5ML FL X 100 ML ΠΡΩΤΌΤΥΠΟ", 100.0),
            ("CALCIORAL D3 CHW.TAB 1000MG+20ΜG 800 IU/TAB FLX30 HDPE ΓΕΝΌΣΗΜΟ", 30.0),
            ("SOMETHING FL X 2,5 ML", 2.5),
        ] {
            assert_eq!(run(RuleId::FlXNumber, raw), Quantity::Units(expected), "{raw}");
        }
    }

    #[test]
    fn fl_x_zero_is_unidentified() {
        assert_eq!(run(RuleId::FlXNumber, "DROPS FLX0 ML"), Quantity::Unidentified);
    }

    #[test]
    fn blister_product() {
        assert_eq!(
            run(RuleId::BtXNumberBlistXNumber, "SERTRAL CAPS 50 MG/CAP BTX2 BLIST X7 ΓΕΝΌΣΗΜΟ"),
            Quantity::Units(14.0)
        );
    }

    #[test]
    fn cap_bt_x_number() {
        assert_eq!(
            run(RuleId::CapBtXNumber, "EDUFIL INHPD.CAP 12 MCG/CAP BTX60"),
            Quantity::Units(60.0)
        );
    }

    #[test]
    fn sachet_product_with_decimal_comma() {
        assert_eq!(
            run(RuleId::BtXNumberSachetXNumber, "PATCH BTX2 SACHET X 1,5"),
            Quantity::Units(3.0)
        );
        assert_eq!(
            run(RuleId::BtXNumberSachetXNumber, "PATCH BTX0 SACHETS X 5"),
            Quantity::Unidentified
        );
    }

    #[test]
    fn bottle_ml_must_end_description() {
        assert_eq!(
            run(RuleId::BtXNumberBottleXMl, "SYRUP BT X 1 BOTTLE X 200 ML"),
            Quantity::Units(200.0)
        );
        assert_eq!(
            run(RuleId::BtXNumberBottleXMl, "SYRUP BT X 1 BOTTLE X 200 ML GENERIC"),
            Quantity::Unidentified
        );
    }

    #[test]
    fn vial_ml_product() {
        assert_eq!(
            run(RuleId::BtXNumberVialXNumberMl, "ORAL SOL BT X 2 VIALS X 7,5 ML"),
            Quantity::Units(15.0)
        );
    }

    #[test]
    fn fl_ml_product() {
        assert_eq!(
            run(RuleId::BtXNumberFlXMl, "EYE DROPS BTX 3 FL X 5 ML"),
            Quantity::Units(15.0)
        );
    }

    #[test]
    fn plus_rules() {
        assert_eq!(run(RuleId::PlusNumberAppl, "VAG CREAM 40G +7 APPL"), Quantity::Units(7.0));
        assert_eq!(run(RuleId::PlusNumberAppl, "VAG CREAM 40G"), Quantity::Unidentified);
    }

    #[test]
    fn appl_product() {
        assert_eq!(
            run(RuleId::BtXNumberApplXNumber, "GEL BTX 2, APPL X 10"),
            Quantity::Units(20.0)
        );
    }

    #[test]
    fn x_vials_ignores_sachets() {
        assert_eq!(
            run(RuleId::BtXNumberXNumberVials, "POWDER BTX2 X 10 SACHETS VIALS"),
            Quantity::Units(20.0)
        );
    }

    #[test]
    fn zero_counts_are_unidentified() {
        for (rule, raw) in [
            (RuleId::MeteredDoses, "INH 0 METERED DOSES"),
            (RuleId::Actuations, "SPRAY 0 ACTUATIONS"),
            (RuleId::Doses, "INH.PD 0 DOSES"),
            (RuleId::Caps, "INH.PD 0 CAPS"),
            (RuleId::BtXNumber, "TAB BTX0"),
            (RuleId::CapBtXNumber, "INHPD.CAP 12 MCG/CAP BTX0"),
            (RuleId::DoseBtXNumber, "INH 100MCG/DOSE BTX0"),
            (RuleId::VialBtXNumber, "INJ.SOL VIAL BTX0"),
            (RuleId::MlBtXNumberAmp, "INJ.SOL 2ML BTX0 AMP"),
            (RuleId::DosesNumberMl, "SOL 0ML BTX1"),
            (RuleId::PlusNumberAppl, "VAG CREAM 40G +0 APPL"),
            (RuleId::BtXNumberApplXNumber, "GEL BTX 0, APPL X 10"),
            (RuleId::BtXNumberBlistXNumber, "CAPS BTX0 BLIST X7"),
            (RuleId::BtXNumberBlistXNumber, "CAPS BTX2 BLIST X0"),
            (RuleId::BtXNumberFlXNumber, "DROPS BTX0 FLX 30"),
            (RuleId::BtXNumberXNumberVials, "POWDER BTX0 X 10 VIALS"),
            (RuleId::BtXNumberVialXNumber, "CAPS BTX1VIALX 0"),
            (RuleId::BottleXNumber, "TAB BOTTLEX0"),
            (RuleId::BtXNumberFlXMl, "EYE DROPS BTX 3 FL X 0 ML"),
            (RuleId::FlXNumber, "DROPS FLX0 ML"),
            (RuleId::BtXNumberBottleXMl, "SYRUP BT X 1 BOTTLE X 0 ML"),
            (RuleId::BtXNumberVialXNumberMl, "ORAL SOL BT X 0 VIALS X 7,5 ML"),
            (RuleId::BtXNumberBottleXNumber, "SYRUP BTX 0 BOTTLE X 3"),
        ] {
            assert_eq!(run(rule, raw), Quantity::Unidentified, "{rule:?}: {raw}");
        }
    }

    #[test]
    fn bottle_x_number_product_with_spacing() {
        assert_eq!(
            run(RuleId::BtXNumberBottleXNumber, "SYRUP BTX 2 BOTTLE X 3"),
            Quantity::Units(6.0)
        );
    }

    #[test]
    fn excluded_is_not_applicable() {
        assert_eq!(apply(RuleId::Excluded, "ANYTHING"), Quantity::NotApplicable);
    }

    #[test]
    fn rule_names_are_stable() {
        assert_eq!(RuleId::BtXNumber.to_string(), "bt_x_number");
        assert_eq!(RuleId::Override.as_str(), "override");
    }
}
