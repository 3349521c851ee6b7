//! Shared fixtures for the pipeline integration tests
//!
//! - archive builders (zip with a CNPJ-style inner CSV name)
//! - a fetcher serving in-memory archives and tracking concurrency
//! - a loader recording every batch, with optional failure injection

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use cnpj_ingest::catalog::{SourceFile, StaticCatalog};
use cnpj_ingest::download::{DownloadOrchestrator, DownloadStrategy, Fetcher};
use cnpj_ingest::ledger::{FileLedger, Ledger};
use cnpj_ingest::load::LoadAdapter;
use cnpj_ingest::processing::{ProcessOptions, RecordBatch};
use cnpj_ingest::retry::RetryPolicy;
use cnpj_ingest::schema::TableSchema;
use cnpj_ingest::{Pipeline, PipelineError, PipelineSettings};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;

pub const RELEASE: &str = "2024-05";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("cnpj_ingest=debug")
        .try_init();
}

/// One quoted `Empresas` line, the way the Receita Federal files look
pub fn empresa_line(i: usize) -> String {
    format!(
        "\"{:08}\";\"EMPRESA {} LTDA\";\"2062\";\"49\";\"{},50\";\"01\";\"\"\n",
        i, i, i * 1000
    )
}

pub fn empresas_csv(rows: usize) -> Vec<u8> {
    (0..rows).map(empresa_line).collect::<String>().into_bytes()
}

/// Deflated zip with a single entry
pub fn zip_bytes(entry: &str, content: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    writer.start_file(entry, options).unwrap();
    writer.write_all(content).unwrap();
    writer.finish().unwrap().into_inner()
}

pub fn empresas_zip(rows: usize) -> Vec<u8> {
    zip_bytes("K3241.K03200Y0.D40511.EMPRECSV", &empresas_csv(rows))
}

pub fn source(name: &str) -> SourceFile {
    SourceFile::new(name, format!("http://fixtures.invalid/{}/{}", RELEASE, name), RELEASE)
}

/// Serves archives from memory; unknown names fail every attempt
#[derive(Default)]
pub struct FixtureFetcher {
    archives: HashMap<String, Vec<u8>>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FixtureFetcher {
    pub fn new(archives: Vec<(&str, Vec<u8>)>) -> Self {
        Self {
            archives: archives
                .into_iter()
                .map(|(name, bytes)| (name.to_string(), bytes))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FixtureFetcher {
    async fn fetch(&self, file: &SourceFile, dest: &Path) -> anyhow::Result<u64> {
        self.calls.lock().unwrap().push(file.name.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = match self.archives.get(&file.name) {
            Some(bytes) => tokio::fs::write(dest, bytes)
                .await
                .map(|_| bytes.len() as u64)
                .map_err(anyhow::Error::from),
            None => Err(anyhow::anyhow!("404 for {}", file.name)),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Accepted batch as seen by the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenBatch {
    pub source: String,
    pub sequence: u64,
    pub rows: usize,
    /// First natural-key column of each row
    pub keys: Vec<String>,
}

/// Records batches; fails `(file, sequence)` when asked to
#[derive(Default)]
pub struct RecordingLoader {
    batches: Mutex<Vec<SeenBatch>>,
    tables: Mutex<Vec<&'static str>>,
    stored_keys: Mutex<HashMap<&'static str, HashSet<String>>>,
    fail_on: Option<(String, u64)>,
}

impl RecordingLoader {
    pub fn failing_on(file: &str, sequence: u64) -> Self {
        Self {
            fail_on: Some((file.to_string(), sequence)),
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<SeenBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batches_for(&self, file: &str) -> Vec<SeenBatch> {
        self.batches()
            .into_iter()
            .filter(|b| b.source == file)
            .collect()
    }

    pub fn tables(&self) -> Vec<&'static str> {
        self.tables.lock().unwrap().clone()
    }
}

#[async_trait]
impl LoadAdapter for RecordingLoader {
    async fn ensure_schema(&self, schema: &'static TableSchema) -> cnpj_ingest::Result<()> {
        self.tables.lock().unwrap().push(schema.table);
        Ok(())
    }

    async fn bulk_upsert(&self, batch: &RecordBatch) -> cnpj_ingest::Result<u64> {
        if let Some((file, sequence)) = &self.fail_on {
            if *file == batch.source && *sequence == batch.sequence {
                return Err(PipelineError::Load {
                    table: batch.schema.table.to_string(),
                    batch: batch.sequence,
                    reason: "injected failure".into(),
                });
            }
        }
        let key_idx = batch.schema.key_indices()[0];
        let keys: Vec<String> = batch
            .rows
            .iter()
            .map(|row| row[key_idx].as_text().unwrap_or_default().to_string())
            .collect();
        self.stored_keys
            .lock()
            .unwrap()
            .entry(batch.schema.table)
            .or_default()
            .extend(keys.iter().cloned());
        self.batches.lock().unwrap().push(SeenBatch {
            source: batch.source.clone(),
            sequence: batch.sequence,
            rows: batch.len(),
            keys,
        });
        Ok(batch.len() as u64)
    }

    async fn existing_keys(&self, schema: &'static TableSchema) -> cnpj_ingest::Result<HashSet<String>> {
        Ok(self
            .stored_keys
            .lock()
            .unwrap()
            .get(schema.table)
            .cloned()
            .unwrap_or_default())
    }
}

/// Temp work area plus the pieces a test wants to inspect afterwards
pub struct TestEnv {
    pub dir: TempDir,
    pub fetcher: Arc<FixtureFetcher>,
    pub loader: Arc<RecordingLoader>,
    pub cancel: CancellationToken,
    pub strategy: DownloadStrategy,
    pub batch_size: usize,
    pub keep_files: bool,
}

impl TestEnv {
    pub fn new(fetcher: FixtureFetcher, loader: RecordingLoader) -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().unwrap(),
            fetcher: Arc::new(fetcher),
            loader: Arc::new(loader),
            cancel: CancellationToken::new(),
            strategy: DownloadStrategy::Sequential,
            batch_size: 30,
            keep_files: false,
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.path().join("ledger.jsonl")
    }

    pub async fn open_ledger(&self) -> Arc<FileLedger> {
        Arc::new(FileLedger::open(self.ledger_path()).await.unwrap())
    }

    pub fn pipeline(&self, files: &[&str], ledger: Arc<dyn Ledger>) -> Pipeline {
        let catalog = StaticCatalog::new(files.iter().map(|name| source(name)).collect());
        let downloads = DownloadOrchestrator::new(
            self.fetcher.clone(),
            self.work_dir(),
            RetryPolicy::immediate(2),
            self.cancel.clone(),
        );
        let settings = PipelineSettings {
            strategy: self.strategy,
            process: ProcessOptions::new(self.batch_size),
            load_workers: 1,
            keep_downloaded_files: self.keep_files,
        };
        Pipeline::new(
            Arc::new(catalog),
            ledger,
            downloads,
            self.loader.clone(),
            settings,
            self.cancel.clone(),
        )
    }

    /// Archives left in the download directory
    pub fn leftover_archives(&self) -> Vec<String> {
        match std::fs::read_dir(self.work_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
