// Pipeline coordinator
//
// Sequences catalog -> ledger filter -> downloads -> processing -> load per
// file. A file's ledger entry is written only once every one of its batches
// has been accepted by the load adapter.

use crate::catalog::{HttpCatalog, SourceCatalog, SourceFile};
use crate::config::{DownloadMode, LedgerBackend, PipelineConfig};
use crate::download::{DownloadOrchestrator, DownloadStrategy, DownloadTask, HttpFetcher, TaskStatus};
use crate::error::{PipelineError, Result};
use crate::ledger::{FileLedger, Ledger, SqlLedger};
use crate::load::{LoadAdapter, SqlLoader};
use crate::processing::{self, ProcessOptions, ProcessingStats, RecordBatch};
use crate::progress::DownloadProgress;
use crate::reference::{self, ReferenceSupplement, StaticSupplement};
use crate::resources::{self, ResourceRequest, BATCH_CHANNEL_CAPACITY};
use crate::schema::TableSchema;
use crate::store::Store;
use anyhow::Context;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit code for errors that abort the run before files are attempted
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Discovered,
    QueuedForDownload,
    Downloading,
    Downloaded,
    Loading,
    Loaded,
    Failed,
    Skipped,
    Cancelled,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Discovered => "discovered",
            FileState::QueuedForDownload => "queued_for_download",
            FileState::Downloading => "downloading",
            FileState::Downloaded => "downloaded",
            FileState::Loading => "loading",
            FileState::Loaded => "loaded",
            FileState::Failed => "failed",
            FileState::Skipped => "skipped",
            FileState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Loaded | FileState::Failed | FileState::Skipped | FileState::Cancelled
        )
    }
}

fn transition(file: &str, state: FileState) {
    debug!(file = %file, state = state.as_str(), "File state");
}

/// Final outcome of one file
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub name: String,
    pub version: String,
    pub state: FileState,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
    pub error: Option<String>,
}

impl FileReport {
    fn new(file: &SourceFile, state: FileState) -> Self {
        transition(&file.name, state);
        Self {
            name: file.name.clone(),
            version: file.version(),
            state,
            rows_loaded: 0,
            rows_skipped: 0,
            error: None,
        }
    }

    fn failed(file: &SourceFile, error: impl ToString) -> Self {
        let mut report = Self::new(file, FileState::Failed);
        report.error = Some(error.to_string());
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::PartialFailure => 1,
            RunOutcome::Cancelled => 130,
        }
    }
}

/// Summary of one run; never persisted
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineRun {
    pub files_total: usize,
    pub files_skipped: usize,
    pub files_succeeded: usize,
    pub files_failed: usize,
    pub files_cancelled: usize,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
    pub duration_seconds: f64,
    pub files: Vec<FileReport>,
}

impl PipelineRun {
    fn from_reports(mut files: Vec<FileReport>, started: Instant) -> Self {
        files.sort_by(|a, b| a.name.cmp(&b.name));
        let count = |state: FileState| files.iter().filter(|f| f.state == state).count();
        Self {
            files_total: files.len(),
            files_skipped: count(FileState::Skipped),
            files_succeeded: count(FileState::Loaded),
            files_failed: count(FileState::Failed),
            files_cancelled: count(FileState::Cancelled),
            rows_loaded: files.iter().map(|f| f.rows_loaded).sum(),
            rows_skipped: files.iter().map(|f| f.rows_skipped).sum(),
            duration_seconds: started.elapsed().as_secs_f64(),
            files,
        }
    }

    /// Failures take precedence over cancellation
    pub fn outcome(&self) -> RunOutcome {
        if self.files_failed > 0 {
            RunOutcome::PartialFailure
        } else if self.files_cancelled > 0 {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Success
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome().exit_code()
    }

    pub fn file(&self, name: &str) -> Option<&FileReport> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// Execution knobs resolved once at startup
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub strategy: DownloadStrategy,
    pub process: ProcessOptions,
    pub load_workers: usize,
    pub keep_downloaded_files: bool,
}

/// Minimum pool size: one connection per worker of whichever pool is larger.
/// [`Store::connect`] adds one spare for the ledger.
pub(crate) fn pool_connections(load_workers: usize, download_workers: usize) -> u32 {
    load_workers.max(download_workers).max(1) as u32
}

pub struct Pipeline {
    catalog: Arc<dyn SourceCatalog>,
    ledger: Arc<dyn Ledger>,
    downloads: DownloadOrchestrator,
    loader: Arc<dyn LoadAdapter>,
    settings: PipelineSettings,
    cancel: CancellationToken,
    supplement: Option<Arc<dyn ReferenceSupplement>>,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<dyn SourceCatalog>,
        ledger: Arc<dyn Ledger>,
        downloads: DownloadOrchestrator,
        loader: Arc<dyn LoadAdapter>,
        settings: PipelineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            ledger,
            downloads,
            loader,
            settings,
            cancel,
            supplement: None,
        }
    }

    /// Add missing reference codes after `motivos`/`paises` files load
    pub fn with_supplement(mut self, supplement: Arc<dyn ReferenceSupplement>) -> Self {
        self.supplement = Some(supplement);
        self
    }

    /// Wire the production components from configuration.
    ///
    /// Returns the store as well so the caller can close the pool on exit.
    pub async fn from_config(
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<(Self, Store)> {
        let resolved = resources::profile(&ResourceRequest {
            batch_size: config.batch_size,
            memory_percent: Some(config.memory_percent),
            workers: config.download_workers,
            max_workers: config.max_workers,
            load_workers: config.load_workers,
            ..ResourceRequest::default()
        });

        let connections = pool_connections(config.load_workers, resolved.worker_count);
        let store = Store::connect(&config.database, connections)
            .await
            .context("Failed to connect to the target database")?;
        store.health_check().await.context("Database health check failed")?;

        let ledger: Arc<dyn Ledger> = match config.ledger_backend {
            LedgerBackend::Database => Arc::new(SqlLedger::open(store.clone()).await?),
            LedgerBackend::File => Arc::new(FileLedger::open(config.ledger_path()).await?),
        };

        let catalog = HttpCatalog::new(
            &config.base_url,
            config.release.clone(),
            config.catalog_retry(),
            config.http_timeout(),
        )?;
        let fetcher = HttpFetcher::new(config.http_timeout(), DownloadProgress::new(config.show_progress))?;
        let downloads = DownloadOrchestrator::new(
            Arc::new(fetcher),
            config.work_dir.clone(),
            config.download_retry(),
            cancel.clone(),
        );
        let loader = SqlLoader::new(store.clone(), config.load_retry());

        let strategy = match config.download_mode {
            DownloadMode::Sequential => DownloadStrategy::Sequential,
            DownloadMode::Parallel => DownloadStrategy::Parallel {
                workers: resolved.worker_count,
            },
        };
        let settings = PipelineSettings {
            strategy,
            process: ProcessOptions {
                batch_size: resolved.batch_size,
                encoding: config.encoding,
                max_skipped_row_ratio: config.max_skipped_row_ratio,
            },
            load_workers: config.load_workers,
            keep_downloaded_files: config.keep_downloaded_files,
        };

        let mut pipeline = Self::new(
            Arc::new(catalog),
            ledger,
            downloads,
            Arc::new(loader),
            settings,
            cancel,
        );
        if let Some(path) = &config.reference_supplement_file {
            let supplement = StaticSupplement::from_csv(path)?;
            pipeline = pipeline.with_supplement(Arc::new(supplement));
        }
        Ok((pipeline, store))
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Execute one run.
    ///
    /// Only run-level problems (catalog unavailable, ledger unreadable) are
    /// returned as errors; everything file-scoped ends up in the summary.
    pub async fn run(&self) -> Result<PipelineRun> {
        let started = Instant::now();
        info!(strategy = ?self.settings.strategy, batch_size = self.settings.process.batch_size, "Pipeline run starting");

        let files = self.catalog.list_available().await?;
        info!(files = files.len(), "Catalog listed");

        let mut reports = Vec::with_capacity(files.len());
        let mut queued = Vec::new();
        for file in files {
            transition(&file.name, FileState::Discovered);
            let version = file.version();
            if self.ledger.contains(&file.name, &version).await? {
                info!(file = %file.name, version = %version, "Already loaded, skipping");
                reports.push(FileReport::new(&file, FileState::Skipped));
            } else {
                transition(&file.name, FileState::QueuedForDownload);
                queued.push(DownloadTask::new(file));
            }
        }

        if self.cancel.is_cancelled() {
            warn!(files = queued.len(), "Run cancelled before downloads started");
            reports.extend(
                queued
                    .iter()
                    .map(|task| FileReport::new(&task.source, FileState::Cancelled)),
            );
            return Ok(self.finish(reports, started));
        }

        for task in &queued {
            transition(&task.source.name, FileState::Downloading);
        }
        let tasks = self.downloads.fetch_all(queued, self.settings.strategy).await;

        let mut downloaded = Vec::new();
        for task in tasks {
            match task.status {
                TaskStatus::Succeeded => {
                    transition(&task.source.name, FileState::Downloaded);
                    downloaded.push(task.source);
                },
                TaskStatus::Failed => {
                    let reason = task.last_error.unwrap_or_else(|| "download failed".to_string());
                    reports.push(FileReport::failed(&task.source, reason));
                },
                TaskStatus::Pending | TaskStatus::InProgress => {
                    reports.push(FileReport::new(&task.source, FileState::Cancelled));
                },
            }
        }

        let loaded: Vec<FileReport> = stream::iter(downloaded)
            .map(|file| self.load_file(file))
            .buffer_unordered(self.settings.load_workers.max(1))
            .collect()
            .await;
        reports.extend(loaded);

        Ok(self.finish(reports, started))
    }

    fn finish(&self, reports: Vec<FileReport>, started: Instant) -> PipelineRun {
        let run = PipelineRun::from_reports(reports, started);
        info!(
            total = run.files_total,
            skipped = run.files_skipped,
            succeeded = run.files_succeeded,
            failed = run.files_failed,
            cancelled = run.files_cancelled,
            rows_loaded = run.rows_loaded,
            rows_skipped = run.rows_skipped,
            "Pipeline run finished in {:.2}s",
            run.duration_seconds
        );
        run
    }

    /// Process and load one downloaded file, then record it in the ledger
    async fn load_file(&self, file: SourceFile) -> FileReport {
        if self.cancel.is_cancelled() {
            self.discard(&file).await;
            return FileReport::new(&file, FileState::Cancelled);
        }

        let Some(path) = file.local_path.clone() else {
            return FileReport::failed(&file, "downloaded file has no local path");
        };

        transition(&file.name, FileState::Loading);
        let (loaded, stats, result) = self.load_batches(&file, &path).await;

        let report = match result {
            Ok(()) => {
                let version = file.version();
                match self.ledger.record(&file.name, &version, loaded).await {
                    Ok(()) => {
                        info!(
                            file = %file.name,
                            rows = loaded,
                            skipped = stats.rows_skipped,
                            batches = stats.batches,
                            "File loaded"
                        );
                        let mut report = FileReport::new(&file, FileState::Loaded);
                        report.rows_loaded = loaded;
                        report.rows_skipped = stats.rows_skipped;
                        report
                    },
                    Err(e) => {
                        error!(file = %file.name, error = %e, "Ledger write failed, reporting file as failed");
                        let mut report = FileReport::failed(&file, e);
                        report.rows_loaded = loaded;
                        report.rows_skipped = stats.rows_skipped;
                        report
                    },
                }
            },
            Err(e) => {
                warn!(file = %file.name, error = %e, rows_loaded = loaded, "File failed");
                let mut report = FileReport::failed(&file, e);
                report.rows_loaded = loaded;
                report.rows_skipped = stats.rows_skipped;
                report
            },
        };

        self.discard(&file).await;
        report
    }

    /// Stream batches from a blocking parser thread into the loader, in order.
    ///
    /// Stops at the first failed batch; dropping the receiver makes the
    /// producer give up on its next send.
    async fn load_batches(&self, file: &SourceFile, path: &Path) -> (u64, ProcessingStats, Result<()>) {
        let (tx, mut rx) = mpsc::channel::<Result<RecordBatch>>(BATCH_CHANNEL_CAPACITY);
        let options = self.settings.process;
        let name = file.name.clone();
        let path = path.to_path_buf();

        let producer = tokio::task::spawn_blocking(move || {
            let mut batches = match processing::stream(&path, &name, &options) {
                Ok(batches) => batches,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return ProcessingStats::default();
                },
            };
            for item in batches.by_ref() {
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
            batches.stats()
        });

        let mut loaded = 0u64;
        let mut schema_ready = false;
        let mut tail: Option<(&'static TableSchema, u64)> = None;
        let mut result = Ok(());
        while let Some(item) = rx.recv().await {
            let batch = match item {
                Ok(batch) => batch,
                Err(e) => {
                    result = Err(e);
                    break;
                },
            };
            if !schema_ready {
                if let Err(e) = self.loader.ensure_schema(batch.schema).await {
                    result = Err(e);
                    break;
                }
                schema_ready = true;
            }
            match self.loader.bulk_upsert(&batch).await {
                Ok(rows) => {
                    loaded += rows;
                    tail = Some((batch.schema, batch.sequence + 1));
                    debug!(file = %file.name, batch = batch.sequence, rows, "Batch accepted");
                },
                Err(e) => {
                    result = Err(e);
                    break;
                },
            }
        }
        drop(rx);

        let stats = match producer.await {
            Ok(stats) => stats,
            Err(e) => {
                if result.is_ok() {
                    result = Err(PipelineError::Processing {
                        file: file.name.clone(),
                        reason: format!("parser task failed: {}", e),
                    });
                }
                ProcessingStats::default()
            },
        };

        if let (true, Some((schema, next_sequence)), Some(supplement)) =
            (result.is_ok(), tail, &self.supplement)
        {
            match self
                .supplement_codes(supplement.as_ref(), file, schema, next_sequence)
                .await
            {
                Ok(added) => loaded += added,
                Err(e) => result = Err(e),
            }
        }
        (loaded, stats, result)
    }

    /// Upsert supplement codes the table still lacks, after the official rows
    async fn supplement_codes(
        &self,
        supplement: &dyn ReferenceSupplement,
        file: &SourceFile,
        schema: &'static TableSchema,
        sequence: u64,
    ) -> Result<u64> {
        let codes = supplement.codes(schema.kind);
        if codes.is_empty() {
            return Ok(0);
        }

        let existing = self.loader.existing_keys(schema).await?;
        let Some(batch) = reference::missing_batch(codes, schema, &file.name, sequence, &existing) else {
            debug!(file = %file.name, table = schema.table, "No reference codes missing");
            return Ok(0);
        };
        let added = self.loader.bulk_upsert(&batch).await?;
        info!(
            file = %file.name,
            table = schema.table,
            official = existing.len(),
            added,
            "Reference codes supplemented"
        );
        Ok(added)
    }

    async fn discard(&self, file: &SourceFile) {
        if self.settings.keep_downloaded_files {
            return;
        }
        if let Some(path) = &file.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(file = %file.name, "Removed local archive"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(file = %file.name, error = %e, "Could not remove local archive"),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_covers_largest_worker_count() {
        assert_eq!(pool_connections(1, 8), 8);
        assert_eq!(pool_connections(4, 2), 4);
        assert_eq!(pool_connections(0, 0), 1);
    }

    fn report(name: &str, state: FileState, rows: u64) -> FileReport {
        FileReport {
            name: name.into(),
            version: "2024-05".into(),
            state,
            rows_loaded: rows,
            rows_skipped: 0,
            error: None,
        }
    }

    #[test]
    fn test_run_aggregates_reports() {
        let run = PipelineRun::from_reports(
            vec![
                report("b.zip", FileState::Loaded, 10),
                report("a.zip", FileState::Skipped, 0),
                report("c.zip", FileState::Loaded, 5),
            ],
            Instant::now(),
        );
        assert_eq!(run.files_total, 3);
        assert_eq!(run.files_skipped, 1);
        assert_eq!(run.files_succeeded, 2);
        assert_eq!(run.rows_loaded, 15);
        assert_eq!(run.files[0].name, "a.zip");
        assert_eq!(run.outcome(), RunOutcome::Success);
        assert_eq!(run.exit_code(), 0);
    }

    #[test]
    fn test_outcome_precedence() {
        let run = PipelineRun::from_reports(
            vec![
                report("a.zip", FileState::Failed, 0),
                report("b.zip", FileState::Cancelled, 0),
            ],
            Instant::now(),
        );
        assert_eq!(run.outcome(), RunOutcome::PartialFailure);
        assert_eq!(run.exit_code(), 1);

        let run = PipelineRun::from_reports(vec![report("b.zip", FileState::Cancelled, 0)], Instant::now());
        assert_eq!(run.exit_code(), 130);
    }

    #[test]
    fn test_terminal_states() {
        assert!(FileState::Skipped.is_terminal());
        assert!(FileState::Cancelled.is_terminal());
        assert!(!FileState::Downloaded.is_terminal());
        assert_eq!(FileState::QueuedForDownload.as_str(), "queued_for_download");
    }
}
