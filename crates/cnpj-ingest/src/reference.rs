//! Supplementary reference codes
//!
//! The official `Motivos` and `Paises` files do not always carry every code
//! the other tables point at. Once such a file has loaded, codes from a
//! [`ReferenceSupplement`] that the table still lacks are upserted after the
//! last official batch. Codes the release ships are never overwritten.

use crate::error::{PipelineError, Result};
use crate::processing::{FieldValue, RecordBatch};
use crate::schema::{FileKind, TableSchema};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Kinds whose tables accept supplementary codes
pub const SUPPLEMENTED_KINDS: [FileKind; 2] = [FileKind::Motivos, FileKind::Paises];

/// Source of `(codigo, descricao)` pairs for reference tables
pub trait ReferenceSupplement: Send + Sync {
    /// Candidate codes for `kind`; empty when nothing applies
    fn codes(&self, kind: FileKind) -> Vec<(String, String)>;
}

/// Fixed set of codes, built in code or read from a local file
#[derive(Debug, Clone, Default)]
pub struct StaticSupplement {
    codes: HashMap<FileKind, Vec<(String, String)>>,
}

impl StaticSupplement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codes<C, D>(mut self, kind: FileKind, codes: impl IntoIterator<Item = (C, D)>) -> Self
    where
        C: Into<String>,
        D: Into<String>,
    {
        self.codes
            .entry(kind)
            .or_default()
            .extend(codes.into_iter().map(|(c, d)| (c.into(), d.into())));
        self
    }

    /// Read `table;codigo;descricao` lines, `;`-separated and UTF-8.
    ///
    /// Only the `motivos` and `paises` tables are accepted.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let invalid = |reason: String| {
            PipelineError::Config(format!("reference supplement {}: {}", path.display(), reason))
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .from_path(path)
            .map_err(|e| invalid(e.to_string()))?;

        let mut supplement = Self::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| invalid(e.to_string()))?;
            let (Some(table), Some(code), Some(description), None) =
                (record.get(0), record.get(1), record.get(2), record.get(3))
            else {
                return Err(invalid(format!("line {} must have 3 fields", idx + 1)));
            };
            let kind = SUPPLEMENTED_KINDS
                .into_iter()
                .find(|k| k.schema().table == table.trim())
                .ok_or_else(|| invalid(format!("line {}: table '{}' takes no supplement", idx + 1, table)))?;
            supplement = supplement.with_codes(kind, [(code.trim(), description.trim())]);
        }
        Ok(supplement)
    }
}

impl ReferenceSupplement for StaticSupplement {
    fn codes(&self, kind: FileKind) -> Vec<(String, String)> {
        if !SUPPLEMENTED_KINDS.contains(&kind) {
            return Vec::new();
        }
        self.codes.get(&kind).cloned().unwrap_or_default()
    }
}

/// Batch holding the candidate codes absent from `existing`, if any.
///
/// Later duplicates of a code are ignored so the first description wins.
pub fn missing_batch(
    codes: Vec<(String, String)>,
    schema: &'static TableSchema,
    source: &str,
    sequence: u64,
    existing: &HashSet<String>,
) -> Option<RecordBatch> {
    let mut seen = HashSet::new();
    let rows: Vec<_> = codes
        .into_iter()
        .filter(|(code, _)| !existing.contains(code) && seen.insert(code.clone()))
        .map(|(code, description)| vec![FieldValue::Text(code), FieldValue::Text(description)])
        .collect();

    if rows.is_empty() {
        return None;
    }
    Some(RecordBatch {
        source: source.to_string(),
        schema,
        sequence,
        rows,
    })
}
