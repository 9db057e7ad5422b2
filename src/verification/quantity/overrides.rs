//! Known pack sizes that beat every pattern.
//!
//! Entries are kept in declaration order; the first key found as a whole
//! word in the description wins.

use regex::{escape, RegexSet, RegexSetBuilder};

use super::normalize::clean_description;
use super::rules::RuleId;
use super::{Quantity, QuantityRule};

const BUNDLED_OVERRIDES: &str = include_str!("overrides.json");

#[derive(Debug, Clone)]
pub struct OverrideTable {
    entries: Vec<(String, f64)>,
    patterns: RegexSet,
}

impl OverrideTable {
    /// Table shipped with the crate.
    pub fn bundled() -> Result<Self, String> {
        let entries: Vec<(String, f64)> =
            serde_json::from_str(BUNDLED_OVERRIDES).map_err(|e| e.to_string())?;
        Self::new(entries)
    }

    /// Build from `(description, quantity)` pairs. Keys are normalised the
    /// same way descriptions are.
    pub fn new(entries: Vec<(String, f64)>) -> Result<Self, String> {
        let entries: Vec<(String, f64)> = entries
            .into_iter()
            .map(|(key, qty)| (clean_description(&key), qty))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        let patterns = RegexSetBuilder::new(
            entries
                .iter()
                .map(|(key, _)| format!(r"\b{}\b", escape(key))),
        )
        .case_insensitive(true)
        .size_limit(64 * 1024 * 1024)
        .build()
        .map_err(|e| e.to_string())?;
        Ok(Self { entries, patterns })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Quantity of the first entry found in `description` (already normalised).
    pub fn lookup(&self, description: &str) -> Option<f64> {
        self.patterns
            .matches(description.trim())
            .iter()
            .next()
            .map(|idx| self.entries[idx].1)
    }
}

impl QuantityRule for OverrideTable {
    fn id(&self) -> RuleId {
        RuleId::Override
    }

    fn apply(&self, description: &str) -> Quantity {
        self.lookup(description)
            .map(Quantity::Units)
            .unwrap_or(Quantity::Unidentified)
    }
}
