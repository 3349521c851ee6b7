//! Pipeline error taxonomy
//!
//! Errors are scoped: row-level problems are counted and skipped, file-level
//! problems fail only that file, and run-level problems abort before any work
//! is queued.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Remote listing unreachable after its retry budget. Fatal to the run.
    #[error("Source catalog unavailable after {attempts} attempts: {reason}")]
    CatalogUnavailable { attempts: u32, reason: String },

    /// One file could not be fetched after exhausting its attempts.
    #[error("Download of {file} failed after {attempts} attempts: {reason}")]
    DownloadFailed {
        file: String,
        attempts: u32,
        reason: String,
    },

    /// A single CSV row was rejected. Counted and skipped, never fatal alone.
    #[error("Row {row} of {file} rejected: {reason}")]
    ParseRow { file: String, row: u64, reason: String },

    /// The archive itself could not be read (bad zip, unknown layout).
    #[error("Failed to process {file}: {reason}")]
    Processing { file: String, reason: String },

    /// The store rejected a batch after the adapter's own retries.
    #[error("Load of {table} batch {batch} failed: {reason}")]
    Load {
        table: String,
        batch: u64,
        reason: String,
    },

    /// A ledger write could not be confirmed.
    #[error("Ledger write for {file}@{version} failed: {reason}")]
    LedgerWrite {
        file: String,
        version: String,
        reason: String,
    },

    #[error("Ledger read failed: {0}")]
    LedgerRead(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// True for errors that abort the whole run rather than one file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::CatalogUnavailable { .. }
                | PipelineError::LedgerRead(_)
                | PipelineError::Store(_)
                | PipelineError::Config(_)
        )
    }
}
