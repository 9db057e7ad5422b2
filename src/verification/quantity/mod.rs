//! Quantity extraction: "how many units does one pack hold?"
//!
//! Every dosage-form category maps to an ordered chain of rules. The first
//! rule that identifies a quantity wins, so chain order is the precedence
//! contract: multiplicative patterns ("BTX2 BLISTX7") sit before the
//! single-number fallbacks ("BTX28") that would otherwise shadow them.
//! Most chains start with the override table of known pack sizes.
//!
//! Results are a `Quantity`: a unit count, `NotApplicable` for forms where no
//! quantity check applies, or `Unidentified` when no rule matched.

pub mod normalize;
pub mod overrides;
pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use normalize::clean_description;
use overrides::OverrideTable;
pub use rules::RuleId;

/// Units per container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Units(f64),
    /// No quantity check applies to this form (creams, grams, ...).
    NotApplicable,
    /// No rule could read the pack size.
    Unidentified,
}

impl Quantity {
    pub fn is_identified(&self) -> bool {
        !matches!(self, Quantity::Unidentified)
    }
}

/// One step of a category chain.
pub trait QuantityRule: Send + Sync {
    fn id(&self) -> RuleId;

    /// `description` is already normalised.
    fn apply(&self, description: &str) -> Quantity;
}

/// A regex strategy from `rules`.
#[derive(Debug, Clone, Copy)]
pub struct PatternRule(pub RuleId);

impl QuantityRule for PatternRule {
    fn id(&self) -> RuleId {
        self.0
    }

    fn apply(&self, description: &str) -> Quantity {
        rules::apply(self.0, description)
    }
}

// ═══════════════════════════════════════════
// Category chains
// ═══════════════════════════════════════════

use RuleId::*;

const TABLETS: &[RuleId] = &[
    BtXNumberBlistXNumber,
    Disks,
    BtXNumberFlXNumber,
    BtXNumberBottleXNumber,
    FlXNumber,
    BtXNumber,
];
const TABLET: &[RuleId] = &[BtXNumberBlistXNumber, Disks, BtXNumberFlXNumber, FlXNumber, BtXNumber];
const INHALED: &[RuleId] = &[
    MeteredDoses,
    Actuations,
    Sprays,
    Inhalations,
    Caps,
    Doses,
    MlBtXNumberAmp,
    VialBtXNumber,
    BtXNumberApplXNumber,
    CapBtXNumber,
];
const EYE_DROPS: &[RuleId] = &[BtXNumberBottleXMl, BtXNumberVialXNumberMl, BtXNumberFlXMl, FlXNumber];
const ORAL_SOLUTION: &[RuleId] = &[
    BtXNumberVialXNumberMl,
    BtXNumberVialXNumber,
    BtXNumberBottleXMl,
    BtXNumberFlXMl,
    BottleXNumber,
    DosesNumberMl,
    FlXNumber,
    BtXNumber,
];
const BOX_COUNT: &[RuleId] = &[BtXNumber];
const EXCLUDED: &[RuleId] = &[Excluded];
const OVERRIDE_ONLY: &[RuleId] = &[];

/// `(category, starts with override table, pattern chain)`.
const CATEGORY_CHAINS: &[(&str, bool, &[RuleId])] = &[
    ("ΔΕΡΜ", true, EXCLUDED),
    ("ΟΦΘ.ΕΠΑΛΕΙΨΗ", true, EXCLUDED),
    ("ΕΠΑΛΕΙΨΗ", true, EXCLUDED),
    ("ΡΙΝΙΚΑ", true, EXCLUDED),
    ("ΔΙΑΔΕΡΜ", true, BOX_COUNT),
    ("ΔΙΣΚΙΑ", true, TABLETS),
    ("ΔΙΣΚΙΟ", true, TABLET),
    ("ΔΙΣΚΙΑ-ΔΙΑΣΠ", true, TABLET),
    // Both spellings occur: one with a Latin O.
    ("ΕΙΣΠΝOΕΣ", true, INHALED),
    ("ΕΙΣΠΝΟΕΣ", true, INHALED),
    ("ΕΚΧΥΣΗ", true, BOX_COUNT),
    ("ΕΝΕΣΗ", true, BOX_COUNT),
    ("ΕΝΕΣΙΜΗ", true, OVERRIDE_ONLY),
    ("ΕΝΕΣΙΜΟ", true, OVERRIDE_ONLY),
    ("ΚΑΨΑΚΙΟ", true, BOX_COUNT),
    ("ΚΑΨΑΚΙΟ,", true, BOX_COUNT),
    ("ΚΑΨΑΚΙΑ", true, BOX_COUNT),
    ("ΚΑΨΟΥΛΑ", true, &[BtXNumberBlistXNumber, BtXNumber]),
    ("ΚΑΨΟΥΛΕΣ", true, &[BtXNumberVialXNumber, FlXNumber, BtXNumber]),
    ("ΚΟΛΠΙΚΗ", true, &[PlusNumberPrototype, PlusNumberAppl]),
    ("ΚΟΛΠΙΚΟ", true, BOX_COUNT),
    ("ΚΟΝΙΣ", true, &[Doses, BtXNumber]),
    ("ΟΡΘΙΚΗ", true, OVERRIDE_ONLY),
    ("ΟΡΘΙΚΟΣ", true, OVERRIDE_ONLY),
    ("ΟΦΘ.ΣΤΑΓΟΝΕΣ", true, EYE_DROPS),
    ("ΟΦΘΑΛΜΙΚΕΣ", true, EYE_DROPS),
    ("ΠΟΣ", true, ORAL_SOLUTION),
    ("ΠΟΣ.ΔΙΑΛ", true, ORAL_SOLUTION),
    ("ΠΟΣ.ΔΙΑΛΥΜΑ", true, ORAL_SOLUTION),
    ("ΠΟΣ.ΣΚΟΝΗ", true, BOX_COUNT),
    ("ΠΟΣ.ΣΤΑΓΟΝΕΣ", true, &[BtXNumberBottleXMl, BtXNumberFlXMl, FlXNumber]),
    ("ΠΟΣΙΜΕΣ", true, EYE_DROPS),
    ("ΥΠΟΓΛΩΣΣΙΕΣ", true, &[BtXNumberVialXNumberMl, BtXNumberFlXMl]),
    ("ΕΝΑΙΩΡΗΜΑ", true, OVERRIDE_ONLY),
    ("ΡΙΝΙΚΟ", true, &[Sprays, Doses]),
    ("ΣΙΡΟΠΙ", true, &[BtXNumberBottleXMl, FlXNumber]),
    ("ΥΠΟΘΕΤΑ", true, BOX_COUNT),
    ("ΦΑΚΕΛΑΚΙ", true, BOX_COUNT),
    ("ΟΤΙΚΟ", true, OVERRIDE_ONLY),
    ("ΕΜΦΥΤΕΥΣΗ", true, BOX_COUNT),
    ("ΣΚΟΝΗ", true, BOX_COUNT),
    ("ΕΜΠΛΑΣΤΡΟ", true, &[BtXNumberSachetXNumber]),
    ("ΕΝΕΜΑ", true, &[BtXNumberFlXNumber]),
    ("ΔΟΣΕΙΣ", true, OVERRIDE_ONLY),
    ("g", false, EXCLUDED),
    ("γ", false, EXCLUDED),
    ("γρ", false, EXCLUDED),
    ("ΓΡ", false, EXCLUDED),
    ("GR", false, EXCLUDED),
    ("gr", false, EXCLUDED),
    ("G", false, EXCLUDED),
    ("ΓΡΑΜΜΑΡΙΑ", false, EXCLUDED),
    ("ΜG", true, EXCLUDED),
    ("mg", true, EXCLUDED),
    ("ml", true, EXCLUDED),
    ("ML", true, EXCLUDED),
    ("", false, EXCLUDED),
];

/// Form codes used by the registry API, mapped to the chain they share.
const CATEGORY_ALIASES: &[(&str, &str)] = &[
    ("ΕΙΣΠΝΟΕΣ_ΔΙΑΛ_ΔΟΣΕΙΣ", "ΕΙΣΠΝΟΕΣ"),
    ("ΕΙΣΠΝΟΕΣ_ΔΟΣΕΙΣ", "ΕΙΣΠΝΟΕΣ"),
    ("ΕΝΕΣΗ_ΣΚΟΝΗ_ΦΙΑΛΗ", "ΕΝΕΣΗ"),
    ("ΕΝΕΣΗ_ΔΙΑΛ_ΦΥΣΙΓΓΕΣ", "ΕΝΕΣΗ"),
    ("ΕΝΕΣΗ_ΔΙΑΛ_ΦΙΑΛΗ", "ΕΝΕΣΗ"),
    ("ΔΙΣΚΙΑ_ΜΑΣΩΜΕΝΑ", "ΔΙΣΚΙΑ"),
    ("ΔΙΣΚΙΑ_ΕΝΤΕΡΟΔΙΑΛΥΤΑ", "ΔΙΣΚΙΑ"),
    ("ΔΙΣΚΙΑ_", "ΔΙΣΚΙΑ"),
    ("ΔΙΣΚΙΑ_ΕΠΙΚΑΛ", "ΔΙΣΚΙΑ"),
    ("ΔΙΣΚΙΑ_ΕΠΙΚΑΛΥΜ", "ΔΙΣΚΙΑ"),
    ("ΔΙΣΚΙΑ_ΔΙΑΣΠ", "ΔΙΣΚΙΑ"),
    ("ΔΙΣΚΙΑ_ΒΡΑΔΕΙΑΣ_ΑΠΟΔΕΣ", "ΔΙΣΚΙΑ"),
    ("ΔΙΣΚΙΑ_ΑΝΑΒΡ", "ΔΙΣΚΙΑ"),
    ("ΔΙΣΚΙΑ_ΕΛΕΓΧ_ΑΠΟΔ", "ΔΙΣΚΙΑ"),
    ("ΕΚΧΥΣΗ_ΔΙΑΛ_ΦΥΣΙΓΓΕΣ", "ΕΚΧΥΣΗ"),
    ("ΠΟΣ_ΔΙΑΛΥΜΑ_1ML", "ΠΟΣ.ΔΙΑΛΥΜΑ"),
    ("ΠΟΣ.ΔΙΑΛ_ΔΟΣΕΙΣ_15ML", "ΠΟΣ.ΔΙΑΛΥΜΑ"),
    ("ΠΟΣ.ΔΙΑΛ_ΔΟΣΕΙΣ_5ML", "ΠΟΣ.ΔΙΑΛΥΜΑ"),
    ("ΠΟΣ_ΔΙΑΛΥΜΑ_ML", "ΠΟΣ.ΔΙΑΛΥΜΑ"),
    ("ΠΟΣ.ΔΙΑΛΥΜΑ_ML", "ΠΟΣ.ΔΙΑΛΥΜΑ"),
    ("ΠΟΣ.ΔΙΑΛ_ΔΟΣΕΙΣ", "ΠΟΣ.ΔΙΑΛΥΜΑ"),
    ("ΠΟΣ.ΣΚΟΝΗ_ΔΟΣ_ΔΙΑΛΥΜΑ", "ΠΟΣ.ΣΚΟΝΗ"),
    ("ΚΑΨΟΥΛΕΣ_ΕΝΤΕΡΟΔΙΑΛ", "ΚΑΨΟΥΛΕΣ"),
    ("ΚΑΨΟΥΛΑ_ΕΛΕΓΧΟΜ_ΑΠΟΔΕΣΜ", "ΚΑΨΟΥΛΕΣ"),
];

// ═══════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════

pub struct QuantityExtractionEngine {
    chains: HashMap<String, Vec<Arc<dyn QuantityRule>>>,
}

impl QuantityExtractionEngine {
    /// Engine with the bundled override table and the standard chains.
    pub fn new() -> Result<Self, ConfigError> {
        let table = OverrideTable::bundled()
            .map_err(|e| ConfigError::Invalid(format!("override table: {e}")))?;
        Ok(Self::with_overrides(table))
    }

    pub fn with_overrides(table: OverrideTable) -> Self {
        let table: Arc<dyn QuantityRule> = Arc::new(table);
        let mut chains: HashMap<String, Vec<Arc<dyn QuantityRule>>> = HashMap::new();

        for (category, with_override, patterns) in CATEGORY_CHAINS {
            let mut chain: Vec<Arc<dyn QuantityRule>> = Vec::with_capacity(patterns.len() + 1);
            if *with_override {
                chain.push(Arc::clone(&table));
            }
            chain.extend(
                patterns
                    .iter()
                    .map(|id| Arc::new(PatternRule(*id)) as Arc<dyn QuantityRule>),
            );
            chains.insert((*category).to_string(), chain);
        }

        for (alias, target) in CATEGORY_ALIASES {
            if let Some(chain) = chains.get(*target).cloned() {
                chains.insert((*alias).to_string(), chain);
            }
        }

        Self { chains }
    }

    /// Engine with exactly the given chains.
    pub fn from_chains(chains: HashMap<String, Vec<Arc<dyn QuantityRule>>>) -> Self {
        Self { chains }
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.chains.contains_key(category)
    }

    /// Units per container for `description` under `category`.
    ///
    /// Unknown categories and exhausted chains return `Unidentified` with no rule.
    pub fn extract(&self, category: &str, description: &str) -> (Quantity, Option<RuleId>) {
        let Some(chain) = self.chains.get(category) else {
            tracing::debug!(category, "Unknown dosage category");
            return (Quantity::Unidentified, None);
        };

        let normalized = clean_description(description);
        for rule in chain {
            let quantity = rule.apply(&normalized);
            if quantity.is_identified() {
                return (quantity, Some(rule.id()));
            }
        }
        (Quantity::Unidentified, None)
    }
}
