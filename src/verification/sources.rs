//! Prescription metadata sources.
//!
//! The registry extraction step writes one JSON document per prescription;
//! `JsonDirSource` reads them back. `InMemorySource` serves callers that
//! already hold the records.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::VerificationError;
use super::traits::PrescriptionSource;
use super::types::{Prescription, PrescriptionId};

/// Reads `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &PrescriptionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn metadata_error(id: &PrescriptionId, reason: impl ToString) -> VerificationError {
    VerificationError::Metadata {
        prescription: id.to_string(),
        reason: reason.to_string(),
    }
}

impl PrescriptionSource for JsonDirSource {
    /// Missing, unreadable or malformed files all abort only this prescription.
    fn load(&self, id: &PrescriptionId) -> Result<Prescription, VerificationError> {
        let path = self.path_for(id);
        let raw = fs::read_to_string(&path)
            .map_err(|e| metadata_error(id, format!("{}: {e}", path.display())))?;
        let prescription: Prescription =
            serde_json::from_str(&raw).map_err(|e| metadata_error(id, e))?;
        if prescription.id != *id {
            return Err(metadata_error(
                id,
                format!("file holds prescription {}", prescription.id),
            ));
        }
        tracing::debug!(prescription = %id, executions = prescription.executions.len(), "Metadata loaded");
        Ok(prescription)
    }
}

/// Prescriptions held in memory, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    prescriptions: HashMap<PrescriptionId, Prescription>,
}

impl InMemorySource {
    pub fn new(prescriptions: impl IntoIterator<Item = Prescription>) -> Self {
        Self {
            prescriptions: prescriptions.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn insert(&mut self, prescription: Prescription) {
        self.prescriptions.insert(prescription.id.clone(), prescription);
    }

    pub fn ids(&self) -> impl Iterator<Item = &PrescriptionId> {
        self.prescriptions.keys()
    }
}

impl PrescriptionSource for InMemorySource {
    fn load(&self, id: &PrescriptionId) -> Result<Prescription, VerificationError> {
        self.prescriptions
            .get(id)
            .cloned()
            .ok_or_else(|| metadata_error(id, "no registry data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn prescription(id: &str) -> Prescription {
        Prescription {
            id: PrescriptionId::from(id),
            executions: BTreeMap::new(),
        }
    }

    #[test]
    fn json_dir_reads_prescription() {
        let dir = tempfile::tempdir().unwrap();
        let id = PrescriptionId::from("2301011234567890");
        fs::write(
            dir.path().join("2301011234567890.json"),
            r#"{"id": "2301011234567890", "executions": {"101": {"execution": "101", "pages": 2}}}"#,
        )
        .unwrap();

        let source = JsonDirSource::new(dir.path());
        let p = source.load(&id).unwrap();
        assert_eq!(p.executions.len(), 1);
        assert_eq!(p.executions.values().next().unwrap().pages, 2);
    }

    #[test]
    fn missing_file_is_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonDirSource::new(dir.path());
        let err = source.load(&PrescriptionId::from("2301011234567890")).unwrap_err();
        assert!(err.is_prescription_fatal());
    }

    #[test]
    fn malformed_json_is_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2301011234567890.json"), "{\"id\": ").unwrap();
        let source = JsonDirSource::new(dir.path());
        let err = source.load(&PrescriptionId::from("2301011234567890")).unwrap_err();
        assert!(err.is_prescription_fatal());
    }

    #[test]
    fn mismatched_id_is_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("2301011234567890.json"),
            r#"{"id": "9999999999999999", "executions": {}}"#,
        )
        .unwrap();
        let source = JsonDirSource::new(dir.path());
        assert!(source.load(&PrescriptionId::from("2301011234567890")).is_err());
    }

    #[test]
    fn in_memory_lookup() {
        let mut source = InMemorySource::new(vec![prescription("a")]);
        source.insert(prescription("b"));
        assert_eq!(source.ids().count(), 2);
        assert!(source.load(&PrescriptionId::from("a")).is_ok());
        assert!(source
            .load(&PrescriptionId::from("c"))
            .unwrap_err()
            .is_prescription_fatal());
    }
}
