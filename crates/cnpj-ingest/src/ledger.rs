//! Processed-file ledger
//!
//! The ledger is the only record that survives between runs. An entry for
//! `(filename, version)` means every batch of that file version was accepted
//! by the store. Entries are only ever added by the pipeline; `reset` exists
//! for explicit operator use.

use crate::error::{PipelineError, Result};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub filename: String,
    pub version: String,
    pub loaded_at: DateTime<Utc>,
    pub row_count: u64,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn contains(&self, filename: &str, version: &str) -> Result<bool>;

    /// Durably record a fully loaded file. Recording an existing key is a no-op.
    async fn record(&self, filename: &str, version: &str, row_count: u64) -> Result<()>;

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>>;

    /// Remove every entry. Never called by the pipeline itself.
    async fn reset(&self) -> Result<u64>;
}

fn write_error(filename: &str, version: &str, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::LedgerWrite {
        file: filename.to_string(),
        version: version.to_string(),
        reason: reason.to_string(),
    }
}

type Key = (String, String);

struct FileLedgerInner {
    entries: BTreeMap<Key, LedgerEntry>,
    file: tokio::fs::File,
    /// A previous append failed and may have left a line without its newline
    torn_tail: bool,
}

/// JSON-lines ledger on local disk
///
/// One mutex covers both the append and the in-memory index, and the index is
/// only updated after the line is synced, so `contains` never observes an
/// entry that is not on disk.
pub struct FileLedger {
    path: PathBuf,
    inner: Mutex<FileLedgerInner>,
}

impl FileLedger {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(PipelineError::LedgerRead(format!("{}: {}", path.display(), e))),
        };

        let mut entries = BTreeMap::new();
        for (line_no, line) in content.split(|&b| b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<LedgerEntry>(line) {
                Ok(entry) => {
                    entries
                        .entry((entry.filename.clone(), entry.version.clone()))
                        .or_insert(entry);
                },
                Err(e) => warn!(
                    ledger = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Ignoring unreadable ledger line"
                ),
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        // Terminate a torn trailing line so the next append starts clean
        if content.last().is_some_and(|&b| b != b'\n') {
            file.write_all(b"\n").await?;
            file.flush().await?;
            file.sync_data().await?;
        }

        info!(ledger = %path.display(), entries = entries.len(), "File ledger opened");

        Ok(Self {
            path,
            inner: Mutex::new(FileLedgerInner {
                entries,
                file,
                torn_tail: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn contains(&self, filename: &str, version: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .contains_key(&(filename.to_string(), version.to_string())))
    }

    async fn record(&self, filename: &str, version: &str, row_count: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = (filename.to_string(), version.to_string());
        if inner.entries.contains_key(&key) {
            debug!(file = %filename, %version, "Ledger entry already present");
            return Ok(());
        }

        let entry = LedgerEntry {
            filename: filename.to_string(),
            version: version.to_string(),
            loaded_at: Utc::now(),
            row_count,
        };
        let mut line = Vec::new();
        if inner.torn_tail {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &entry).map_err(|e| write_error(filename, version, e))?;
        line.push(b'\n');

        // tokio buffers writes; the flush is what reports a failed write
        let written = async {
            inner.file.write_all(&line).await?;
            inner.file.flush().await?;
            inner.file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            inner.torn_tail = true;
            return Err(write_error(filename, version, e));
        }

        inner.torn_tail = false;
        inner.entries.insert(key, entry);
        Ok(())
    }

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.values().cloned().collect())
    }

    async fn reset(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let removed = inner.entries.len() as u64;
        inner.file.set_len(0).await?;
        inner.file.sync_all().await?;
        inner.entries.clear();
        inner.torn_tail = false;
        warn!(ledger = %self.path.display(), removed, "Ledger reset");
        Ok(removed)
    }
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS processed_files (
    filename TEXT NOT NULL,
    version TEXT NOT NULL,
    loaded_at TEXT NOT NULL,
    row_count BIGINT NOT NULL,
    PRIMARY KEY (filename, version)
)";

const PG_CONTAINS: &str =
    "SELECT COUNT(*) FROM processed_files WHERE filename = $1 AND version = $2";
const SQLITE_CONTAINS: &str =
    "SELECT COUNT(*) FROM processed_files WHERE filename = ?1 AND version = ?2";

const PG_RECORD: &str = "INSERT INTO processed_files (filename, version, loaded_at, row_count)
    VALUES ($1, $2, $3, $4) ON CONFLICT (filename, version) DO NOTHING";
const SQLITE_RECORD: &str = "INSERT INTO processed_files (filename, version, loaded_at, row_count)
    VALUES (?1, ?2, ?3, ?4) ON CONFLICT (filename, version) DO NOTHING";

const SELECT_ALL: &str =
    "SELECT filename, version, loaded_at, row_count FROM processed_files ORDER BY filename, version";

/// Ledger kept in the `processed_files` table of the target store
pub struct SqlLedger {
    store: Store,
}

impl SqlLedger {
    pub async fn open(store: Store) -> Result<Self> {
        store.execute(CREATE_TABLE).await?;
        Ok(Self { store })
    }
}

type EntryRow = (String, String, String, i64);

fn entry_from_row((filename, version, loaded_at, row_count): EntryRow) -> Result<LedgerEntry> {
    let loaded_at = DateTime::parse_from_rfc3339(&loaded_at)
        .map_err(|e| PipelineError::LedgerRead(format!("bad loaded_at for {}: {}", filename, e)))?
        .with_timezone(&Utc);
    Ok(LedgerEntry {
        filename,
        version,
        loaded_at,
        row_count: row_count.max(0) as u64,
    })
}

#[async_trait]
impl Ledger for SqlLedger {
    async fn contains(&self, filename: &str, version: &str) -> Result<bool> {
        let count: i64 = match &self.store {
            Store::Postgres(pool) => {
                sqlx::query_scalar(PG_CONTAINS)
                    .bind(filename)
                    .bind(version)
                    .fetch_one(pool)
                    .await
            },
            Store::Sqlite(pool) => {
                sqlx::query_scalar(SQLITE_CONTAINS)
                    .bind(filename)
                    .bind(version)
                    .fetch_one(pool)
                    .await
            },
        }
        .map_err(|e| PipelineError::LedgerRead(e.to_string()))?;
        Ok(count > 0)
    }

    async fn record(&self, filename: &str, version: &str, row_count: u64) -> Result<()> {
        let loaded_at = Utc::now().to_rfc3339();
        let rows = i64::try_from(row_count).unwrap_or(i64::MAX);
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(PG_RECORD)
                    .bind(filename)
                    .bind(version)
                    .bind(&loaded_at)
                    .bind(rows)
                    .execute(pool)
                    .await
                    .map(|_| ())
            },
            Store::Sqlite(pool) => {
                sqlx::query(SQLITE_RECORD)
                    .bind(filename)
                    .bind(version)
                    .bind(&loaded_at)
                    .bind(rows)
                    .execute(pool)
                    .await
                    .map(|_| ())
            },
        }
        .map_err(|e| write_error(filename, version, e))
    }

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> = match &self.store {
            Store::Postgres(pool) => sqlx::query_as(SELECT_ALL).fetch_all(pool).await,
            Store::Sqlite(pool) => sqlx::query_as(SELECT_ALL).fetch_all(pool).await,
        }
        .map_err(|e| PipelineError::LedgerRead(e.to_string()))?;
        rows.into_iter().map(entry_from_row).collect()
    }

    async fn reset(&self) -> Result<u64> {
        let removed = self.store.execute("DELETE FROM processed_files").await?;
        warn!(removed, "Ledger reset");
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_ledger_record_is_idempotent_and_durable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("ledger.jsonl");

        {
            let ledger = FileLedger::open(&path).await.unwrap();
            assert!(!ledger.contains("Empresas0.zip", "2024-05").await.unwrap());
            ledger.record("Empresas0.zip", "2024-05", 100).await.unwrap();
            ledger.record("Empresas0.zip", "2024-05", 100).await.unwrap();
            assert!(ledger.contains("Empresas0.zip", "2024-05").await.unwrap());
            assert!(!ledger.contains("Empresas0.zip", "2024-06").await.unwrap());
        }

        let reopened = FileLedger::open(&path).await.unwrap();
        let entries = reopened.all_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_count, 100);

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_append_after_failed_write_starts_on_new_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = FileLedger::open(&path).await.unwrap();
        ledger.record("Cnaes.zip", "2024-05", 3).await.unwrap();

        // Read-only handle: the next append fails
        ledger.inner.lock().await.file = tokio::fs::File::open(&path).await.unwrap();
        let err = ledger.record("Empresas0.zip", "2024-05", 10).await.unwrap_err();
        assert!(matches!(err, PipelineError::LedgerWrite { .. }));
        assert!(!ledger.contains("Empresas0.zip", "2024-05").await.unwrap());

        // What a write cut short would have left behind
        {
            use std::io::Write;
            let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(br#"{"filename":"Empresas0.zip","vers"#).unwrap();
        }
        ledger.inner.lock().await.file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        ledger.record("Empresas1.zip", "2024-05", 20).await.unwrap();
        drop(ledger);

        let reopened = FileLedger::open(&path).await.unwrap();
        assert!(reopened.contains("Cnaes.zip", "2024-05").await.unwrap());
        assert!(reopened.contains("Empresas1.zip", "2024-05").await.unwrap());
        assert!(!reopened.contains("Empresas0.zip", "2024-05").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_ledger_ignores_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(
            &path,
            "{\"filename\":\"Cnaes.zip\",\"version\":\"2024-05\",\"loaded_at\":\"2024-05-20T10:00:00Z\",\"row_count\":1359}\n{\"filename\":\"Soc",
        )
        .unwrap();

        let ledger = FileLedger::open(&path).await.unwrap();
        assert!(ledger.contains("Cnaes.zip", "2024-05").await.unwrap());
        ledger.record("Paises.zip", "2024-05", 255).await.unwrap();
        drop(ledger);

        let reopened = FileLedger::open(&path).await.unwrap();
        assert_eq!(reopened.all_entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_ledger_concurrent_records() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(FileLedger::open(dir.path().join("l.jsonl")).await.unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.record(&format!("f{}.zip", i % 4), "v1", i).await.unwrap();
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(ledger.all_entries().await.unwrap().len(), 4);
        assert_eq!(ledger.reset().await.unwrap(), 4);
        assert!(ledger.all_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sql_ledger_on_sqlite() {
        let dir = TempDir::new().unwrap();
        let store = Store::sqlite_file(&dir.path().join("ledger.db"), 2).await.unwrap();
        let ledger = SqlLedger::open(store.clone()).await.unwrap();

        ledger.record("Socios0.zip", "2024-05", 42).await.unwrap();
        ledger.record("Socios0.zip", "2024-05", 42).await.unwrap();
        assert!(ledger.contains("Socios0.zip", "2024-05").await.unwrap());
        assert!(!ledger.contains("Socios1.zip", "2024-05").await.unwrap());

        // Reopening must not drop existing entries
        let again = SqlLedger::open(store).await.unwrap();
        let entries = again.all_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_count, 42);
    }
}
