//! Download orchestration
//!
//! [`DownloadOrchestrator::fetch_all`] takes one [`DownloadTask`] per archive
//! and drives each to a terminal status with the configured
//! [`DownloadStrategy`]. Every task gets its own bounded retry budget and a
//! failed task never stops its siblings.

use crate::catalog::SourceFile;
use crate::error::PipelineError;
use crate::progress::DownloadProgress;
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use anyhow::{bail, Context};
use async_trait::async_trait;
use cnpj_common::units::format_bytes;
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub source: SourceFile,
    pub attempt_count: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    /// Bytes written by the successful attempt
    pub bytes: u64,
}

impl DownloadTask {
    pub fn new(source: SourceFile) -> Self {
        Self {
            source,
            attempt_count: 0,
            status: TaskStatus::Pending,
            last_error: None,
            bytes: 0,
        }
    }
}

/// How tasks are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// One at a time, in input order
    Sequential,
    /// At most `workers` tasks in flight
    Parallel { workers: usize },
}

impl DownloadStrategy {
    pub fn concurrency(&self) -> usize {
        match self {
            DownloadStrategy::Sequential => 1,
            DownloadStrategy::Parallel { workers } => (*workers).max(1),
        }
    }
}

/// One attempt at fetching one file into `dest`
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns bytes written. A short transfer must be an error.
    async fn fetch(&self, file: &SourceFile, dest: &Path) -> anyhow::Result<u64>;
}

/// Streams the response body to `<dest>.part`, then renames it into place
pub struct HttpFetcher {
    client: reqwest::Client,
    progress: DownloadProgress,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, progress: DownloadProgress) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cnpj-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, progress })
    }

    pub fn with_client(client: reqwest::Client, progress: DownloadProgress) -> Self {
        Self { client, progress }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, file: &SourceFile, dest: &Path) -> anyhow::Result<u64> {
        let response = self
            .client
            .get(&file.url)
            .send()
            .await
            .with_context(|| format!("Request for {} failed", file.url))?;

        if !response.status().is_success() {
            bail!("Failed to download {}: {}", file.url, response.status());
        }

        let expected = response.content_length();
        let pb = self.progress.file_bar(&file.name, expected.or(file.remote_size));
        let part = part_path(dest);

        let outcome: anyhow::Result<u64> = async {
            let written = write_body(response, &part, &pb).await?;
            if let Some(expected) = expected {
                if written != expected {
                    bail!(
                        "Short transfer for {}: received {} of {} bytes",
                        file.name,
                        written,
                        expected
                    );
                }
            }
            tokio::fs::rename(&part, dest)
                .await
                .with_context(|| format!("Failed to move {} into place", part.display()))?;
            Ok(written)
        }
        .await;

        match outcome {
            Ok(written) => {
                pb.finish_and_clear();
                Ok(written)
            },
            Err(e) => {
                pb.abandon();
                if let Err(rm) = tokio::fs::remove_file(&part).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(file = %part.display(), error = %rm, "Could not remove partial download");
                    }
                }
                Err(e)
            },
        }
    }
}

/// Stream the response body into `part` and return the bytes written
async fn write_body(response: reqwest::Response, part: &Path, pb: &ProgressBar) -> anyhow::Result<u64> {
    let mut out = tokio::fs::File::create(part)
        .await
        .with_context(|| format!("Failed to create {}", part.display()))?;

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Connection dropped mid-transfer")?;
        out.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", part.display()))?;
        written += chunk.len() as u64;
        pb.set_position(written);
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(written)
}

pub struct DownloadOrchestrator {
    fetcher: Arc<dyn Fetcher>,
    work_dir: PathBuf,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl DownloadOrchestrator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        work_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            work_dir: work_dir.into(),
            retry,
            cancel,
        }
    }

    /// Drive every task to a terminal status, returned in input order.
    ///
    /// Duplicate names are collapsed (first wins). Tasks not started before
    /// cancellation come back `Pending`.
    pub async fn fetch_all(
        &self,
        mut tasks: Vec<DownloadTask>,
        strategy: DownloadStrategy,
    ) -> Vec<DownloadTask> {
        let mut seen = HashSet::new();
        tasks.retain(|task| {
            let fresh = seen.insert(task.source.name.clone());
            if !fresh {
                warn!(file = %task.source.name, "Dropping duplicate download task");
            }
            fresh
        });

        if let Err(e) = tokio::fs::create_dir_all(&self.work_dir).await {
            warn!(dir = %self.work_dir.display(), error = %e, "Cannot create download directory");
            let reason = format!("download directory unavailable: {}", e);
            return tasks
                .into_iter()
                .map(|mut task| {
                    task.status = TaskStatus::Failed;
                    task.last_error = Some(reason.clone());
                    task
                })
                .collect();
        }

        let total = tasks.len();
        let concurrency = strategy.concurrency();
        info!(files = total, concurrency, ?strategy, "Starting downloads");

        let mut results: Vec<(usize, DownloadTask)> = match strategy {
            DownloadStrategy::Sequential => {
                let mut done = Vec::with_capacity(total);
                for (index, task) in tasks.into_iter().enumerate() {
                    done.push((index, self.run_task(task).await));
                }
                done
            },
            DownloadStrategy::Parallel { .. } => {
                stream::iter(tasks.into_iter().enumerate())
                    .map(|(index, task)| async move { (index, self.run_task(task).await) })
                    .buffer_unordered(concurrency)
                    .collect()
                    .await
            },
        };

        results.sort_by_key(|(index, _)| *index);
        let tasks: Vec<DownloadTask> = results.into_iter().map(|(_, task)| task).collect();

        let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
        let bytes: u64 = tasks.iter().map(|t| t.bytes).sum();
        info!(
            files = total,
            failed,
            downloaded = %format_bytes(bytes),
            "Downloads finished"
        );
        tasks
    }

    async fn run_task(&self, mut task: DownloadTask) -> DownloadTask {
        if self.cancel.is_cancelled() {
            debug!(file = %task.source.name, "Cancelled before start");
            return task;
        }

        task.status = TaskStatus::InProgress;
        let dest = self.work_dir.join(&task.source.name);
        let fetcher = self.fetcher.as_ref();
        let source = &task.source;
        let dest_ref = dest.as_path();

        let outcome = retry(&self.retry, &source.name, |attempt| async move {
            debug!(file = %source.name, attempt, "Downloading");
            fetcher.fetch(source, dest_ref).await
        })
        .await;

        task.attempt_count = outcome.attempts();
        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                task.bytes = value;
                task.status = TaskStatus::Succeeded;
                task.source.local_path = Some(dest);
                info!(
                    file = %task.source.name,
                    size = %format_bytes(value),
                    attempts,
                    "Downloaded"
                );
            },
            RetryOutcome::Exhausted { error, attempts } => {
                let err = PipelineError::DownloadFailed {
                    file: task.source.name.clone(),
                    attempts,
                    reason: format!("{:#}", error),
                };
                warn!(error = %err, "Download failed");
                task.status = TaskStatus::Failed;
                task.last_error = Some(err.to_string());
            },
        }
        task
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fails the first `failures` attempts per file, then writes `body`
    struct FlakyFetcher {
        failures: u32,
        calls: Mutex<Vec<(String, u32)>>,
        total: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for FlakyFetcher {
        async fn fetch(&self, file: &SourceFile, dest: &Path) -> anyhow::Result<u64> {
            self.total.fetch_add(1, Ordering::SeqCst);
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.iter().filter(|(name, _)| name == &file.name).count() as u32 + 1;
                calls.push((file.name.clone(), n));
                n
            };
            if file.name.starts_with("broken") || attempt <= self.failures {
                bail!("simulated failure {}", attempt);
            }
            tokio::fs::write(dest, b"payload").await?;
            Ok(7)
        }
    }

    fn tasks(names: &[&str]) -> Vec<DownloadTask> {
        names
            .iter()
            .map(|n| DownloadTask::new(SourceFile::new(*n, format!("http://x/{}", n), "2024-05")))
            .collect()
    }

    fn orchestrator(dir: &TempDir, fetcher: Arc<dyn Fetcher>, attempts: u32) -> DownloadOrchestrator {
        DownloadOrchestrator::new(
            fetcher,
            dir.path(),
            RetryPolicy::immediate(attempts),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_siblings() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 1,
            calls: Mutex::new(Vec::new()),
            total: AtomicU32::new(0),
        });
        let orch = orchestrator(&dir, fetcher.clone(), 3);

        let done = orch
            .fetch_all(tasks(&["a.zip", "broken.zip", "c.zip"]), DownloadStrategy::Sequential)
            .await;

        let names: Vec<_> = done.iter().map(|t| t.source.name.as_str()).collect();
        assert_eq!(names, vec!["a.zip", "broken.zip", "c.zip"]);
        assert_eq!(done[0].status, TaskStatus::Succeeded);
        assert_eq!(done[0].attempt_count, 2);
        assert_eq!(done[1].status, TaskStatus::Failed);
        assert_eq!(done[1].attempt_count, 3);
        assert!(done[1].last_error.as_deref().unwrap().contains("broken.zip"));
        assert_eq!(done[2].status, TaskStatus::Succeeded);
        assert!(done[2].source.local_path.as_ref().unwrap().exists());
        assert_eq!(fetcher.total.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_duplicates_fetched_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 0,
            calls: Mutex::new(Vec::new()),
            total: AtomicU32::new(0),
        });
        let orch = orchestrator(&dir, fetcher.clone(), 1);

        let done = orch
            .fetch_all(
                tasks(&["a.zip", "a.zip", "b.zip"]),
                DownloadStrategy::Parallel { workers: 4 },
            )
            .await;
        assert_eq!(done.len(), 2);
        assert_eq!(fetcher.total.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_tasks_stay_pending() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 0,
            calls: Mutex::new(Vec::new()),
            total: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orch = DownloadOrchestrator::new(fetcher.clone(), dir.path(), RetryPolicy::immediate(1), cancel);

        let done = orch.fetch_all(tasks(&["a.zip"]), DownloadStrategy::Sequential).await;
        assert_eq!(done[0].status, TaskStatus::Pending);
        assert_eq!(fetcher.total.load(Ordering::SeqCst), 0);
    }

    /// Serves every connection a `Content-Length: 1000` header and 400 bytes
    async fn truncating_server() -> (String, Arc<AtomicU32>) {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU32::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n")
                    .await;
                let _ = socket.write_all(&[b'x'; 400]).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}/2024-05/Empresas0.zip", addr), connections)
    }

    #[tokio::test]
    async fn test_truncated_body_fails_attempt_and_is_retried() {
        let (url, connections) = truncating_server().await;
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            HttpFetcher::new(Duration::from_secs(5), DownloadProgress::new(false)).unwrap(),
        );
        let file = SourceFile::new("Empresas0.zip", url, "2024-05");
        let dest = dir.path().join("Empresas0.zip");

        let err = fetcher.fetch(&file, &dest).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Connection dropped mid-transfer"), "{:#}", err);
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());

        let orch = orchestrator(&dir, fetcher, 2);
        let done = orch
            .fetch_all(vec![DownloadTask::new(file)], DownloadStrategy::Sequential)
            .await;
        assert_eq!(done[0].status, TaskStatus::Failed);
        assert_eq!(done[0].attempt_count, 2);
        assert_eq!(connections.load(Ordering::SeqCst), 3);
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_fetcher_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2024-05/Cnaes.zip"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2024-05/Cnaes.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            HttpFetcher::new(Duration::from_secs(5), DownloadProgress::new(false)).unwrap(),
        );
        let orch = orchestrator(&dir, fetcher, 3);
        let file = SourceFile::new(
            "Cnaes.zip",
            format!("{}/2024-05/Cnaes.zip", server.uri()),
            "2024-05",
        );

        let done = orch
            .fetch_all(vec![DownloadTask::new(file)], DownloadStrategy::Sequential)
            .await;
        assert_eq!(done[0].status, TaskStatus::Succeeded);
        assert_eq!(done[0].attempt_count, 3);
        assert_eq!(done[0].bytes, 4096);
        let on_disk = std::fs::metadata(dir.path().join("Cnaes.zip")).unwrap().len();
        assert_eq!(on_disk, 4096);
        assert!(!dir.path().join("Cnaes.zip.part").exists());
    }
}
