//! Scanned page discovery and the `index.csv` written by the scan step.
//!
//! Scans are stored as `<date>_<barcode>_<seq>.<ext>`; the barcode segment
//! ends with the three execution digits.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{ScanIndexError, VerificationError};
use super::types::{ExecutionDigits, PrescriptionId, Role};

pub const INDEX_FILE_NAME: &str = "index.csv";

const PRESCRIPTION_ID_LEN: usize = 16;

const SCAN_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

const COLUMNS: [&str; 5] = [
    "id",
    "stack_number",
    "prescription_scanned_pages",
    "probable_barcodes",
    "old_filname",
];

// ═══════════════════════════════════════════
// Scanned pages
// ═══════════════════════════════════════════

/// One scanned image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    pub path: PathBuf,
    pub file_name: String,
    /// Execution digits read from the file name.
    pub scan_digits: ExecutionDigits,
}

impl ScanPage {
    /// Parse the execution digits out of the file name.
    pub fn from_path(path: &Path) -> Result<Self, VerificationError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VerificationError::InvalidExecutionDigits(path.display().to_string()))?
            .to_string();
        let scan_digits = digits_from_file_name(&file_name)?;
        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            scan_digits,
        })
    }

    pub fn role(&self) -> Role {
        self.scan_digits.role()
    }
}

/// Last three characters of the second-to-last `_` segment of the stem.
pub fn digits_from_file_name(file_name: &str) -> Result<ExecutionDigits, VerificationError> {
    let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
    let segments: Vec<&str> = stem.split('_').collect();
    let barcode = segments
        .len()
        .checked_sub(2)
        .and_then(|i| segments.get(i))
        .ok_or_else(|| VerificationError::InvalidExecutionDigits(file_name.to_string()))?;
    let start = barcode
        .char_indices()
        .rev()
        .nth(2)
        .map(|(i, _)| i)
        .ok_or_else(|| VerificationError::InvalidExecutionDigits(file_name.to_string()))?;
    ExecutionDigits::parse(&barcode[start..])
}

fn has_scan_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SCAN_EXTENSIONS.iter().any(|s| e.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

/// Image files in `dir` whose name contains `id`, sorted by file name.
///
/// A missing directory yields no files.
pub fn discover_scans(dir: &Path, id: &PrescriptionId) -> Result<Vec<PathBuf>, ScanIndexError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !has_scan_extension(&path) {
            continue;
        }
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(id.as_str()))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

// ═══════════════════════════════════════════
// index.csv
// ═══════════════════════════════════════════

/// One row of `index.csv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Barcode read from the page (unrecognised scans carry zeros).
    pub id: String,
    /// Position in the scanned stack, zero-based.
    pub stack_number: u32,
    /// File name the scan was stored under.
    pub file_name: String,
    /// OCR candidates when the barcode could not be decoded.
    pub probable_barcodes: Vec<String>,
    /// File name the scanner produced.
    pub original_file_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScanIndex {
    entries: Vec<IndexEntry>,
    by_file: HashMap<String, usize>,
}

impl ScanIndex {
    /// Read `<dir>/index.csv`.
    pub fn load(dir: &Path) -> Result<Self, ScanIndexError> {
        let text = fs::read_to_string(dir.join(INDEX_FILE_NAME))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ScanIndexError> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let Some((header_line, header)) = lines.next() else {
            return Err(ScanIndexError::MissingColumn(COLUMNS[0]));
        };
        let header = split_record(header).map_err(|reason| ScanIndexError::Malformed {
            line: header_line + 1,
            reason,
        })?;
        let mut positions = [0usize; 5];
        for (slot, column) in positions.iter_mut().zip(COLUMNS) {
            *slot = header
                .iter()
                .position(|h| h.trim() == column)
                .ok_or(ScanIndexError::MissingColumn(column))?;
        }
        let [id_at, stack_at, file_at, probable_at, original_at] = positions;

        let mut entries = Vec::new();
        for (n, line) in lines {
            let malformed = |reason: String| ScanIndexError::Malformed { line: n + 1, reason };
            let fields = split_record(line).map_err(malformed)?;
            let field = |i: usize| fields.get(i).map(|f| f.trim()).unwrap_or("");

            let stack_number = parse_stack_number(field(stack_at))
                .ok_or_else(|| malformed(format!("bad stack number {:?}", field(stack_at))))?;
            let probable = field(probable_at);
            let probable_barcodes = if probable.is_empty() || probable == "[]" {
                Vec::new()
            } else {
                probable.split('|').map(str::to_string).collect()
            };

            entries.push(IndexEntry {
                id: field(id_at).to_string(),
                stack_number,
                file_name: field(file_at).to_string(),
                probable_barcodes,
                original_file_name: field(original_at).to_string(),
            });
        }

        let by_file = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.file_name.clone(), i))
            .collect();
        Ok(Self { entries, by_file })
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Entries whose barcode matches `barcode`, in stack order.
    pub fn entries_for(&self, barcode: &str) -> Vec<&IndexEntry> {
        let mut found: Vec<&IndexEntry> =
            self.entries.iter().filter(|e| e.id == barcode).collect();
        found.sort_by_key(|e| e.stack_number);
        found
    }

    pub fn stack_number(&self, file_name: &str) -> Option<u32> {
        self.by_file.get(file_name).map(|&i| self.entries[i].stack_number)
    }

    /// Distinct recognised prescription ids, skipping unreadable barcodes.
    ///
    /// Page barcodes carry the execution digits after the 16-digit id.
    pub fn prescription_ids(&self) -> BTreeSet<PrescriptionId> {
        self.entries
            .iter()
            .map(|e| PrescriptionId::new(e.id.get(..PRESCRIPTION_ID_LEN).unwrap_or(&e.id)))
            .filter(|id| !id.as_str().is_empty() && !id.is_unrecognised())
            .collect()
    }
}

fn parse_stack_number(s: &str) -> Option<u32> {
    s.parse::<u32>().ok().or_else(|| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0 && v.fract() == 0.0)
            .map(|v| v as u32)
    })
}

/// Split one CSV record, honouring double-quoted fields.
fn split_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if current.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if quoted {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(current);
    Ok(fields)
}
