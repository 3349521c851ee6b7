//! Pipeline configuration
//!
//! Loaded from environment variables (a `.env` file is honoured by the
//! binary), then validated. CLI flags override individual fields afterwards.

use crate::processing::Encoding;
use crate::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str =
    "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj/";
pub const DEFAULT_MEMORY_PERCENT: u8 = 80;
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WORK_DIR: &str = "./temp";
pub const DEFAULT_SQLITE_FILE: &str = "cnpj.db";

/// Target relational store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Postgres,
    Sqlite,
}

impl DatabaseBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseBackend::Postgres => "postgresql",
            DatabaseBackend::Sqlite => "sqlite",
        }
    }
}

impl FromStr for DatabaseBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(DatabaseBackend::Postgres),
            "sqlite" | "sqlite3" => Ok(DatabaseBackend::Sqlite),
            _ => bail!("Unknown database backend '{}' (expected postgresql or sqlite)", s),
        }
    }
}

/// How archives are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Sequential,
    Parallel,
}

impl FromStr for DownloadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sequential" | "serial" => Ok(DownloadMode::Sequential),
            "parallel" | "concurrent" => Ok(DownloadMode::Parallel),
            _ => bail!("Unknown download strategy '{}' (expected sequential or parallel)", s),
        }
    }
}

/// Where the processed-file ledger lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// `processed_files` table in the target store
    Database,
    /// JSON-lines file on local disk
    File,
}

impl FromStr for LedgerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "database" | "db" | "table" => Ok(LedgerBackend::Database),
            "file" => Ok(LedgerBackend::File),
            _ => bail!("Unknown ledger backend '{}' (expected database or file)", s),
        }
    }
}

/// Connection settings for the target store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Explicit URL; takes precedence over the individual fields
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub sqlite_file: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Postgres,
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            name: "cnpj".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            sqlite_file: PathBuf::from(DEFAULT_SQLITE_FILE),
        }
    }
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match self.backend {
            DatabaseBackend::Postgres => {
                if self.password.is_empty() {
                    format!(
                        "postgres://{}@{}:{}/{}",
                        self.user, self.host, self.port, self.name
                    )
                } else {
                    format!(
                        "postgres://{}:{}@{}:{}/{}",
                        self.user, self.password, self.host, self.port, self.name
                    )
                }
            },
            DatabaseBackend::Sqlite => format!("sqlite://{}", self.sqlite_file.display()),
        }
    }

    /// URL safe to print; masks the password wherever it came from
    pub fn redacted_url(&self) -> String {
        let raw = self.connection_url();
        match reqwest::Url::parse(&raw) {
            Ok(mut url) if url.password().is_some() => match url.set_password(Some("****")) {
                Ok(()) => url.to_string(),
                Err(()) => mask_userinfo(&raw),
            },
            Ok(_) => raw,
            Err(_) => mask_userinfo(&raw),
        }
    }
}

/// Fallback for URLs the parser rejects: hide everything before the last `@`
fn mask_userinfo(raw: &str) -> String {
    raw.split_once("://")
        .and_then(|(scheme, rest)| {
            rest.rsplit_once('@')
                .map(|(_, host)| format!("{}://****@{}", scheme, host))
        })
        .unwrap_or_else(|| raw.to_string())
}

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the remote directory index
    pub base_url: String,
    /// Pin a release directory (`YYYY-MM`); newest when unset
    pub release: Option<String>,
    pub database: DatabaseConfig,

    /// Rows per batch; derived from host memory when unset
    pub batch_size: Option<usize>,
    /// Memory ceiling (percent of available) for batch auto-sizing
    pub memory_percent: u8,
    pub download_mode: DownloadMode,
    /// Download pool size; derived from CPU count when unset
    pub download_workers: Option<usize>,
    /// Cap applied to the derived worker count
    pub max_workers: usize,
    /// Files loaded concurrently (each file's batches stay in order)
    pub load_workers: usize,

    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub catalog_retry_attempts: u32,
    pub load_retry_attempts: u32,
    pub http_timeout_secs: u64,

    /// Download directory
    pub work_dir: PathBuf,
    pub keep_downloaded_files: bool,
    pub ledger_backend: LedgerBackend,
    /// Ledger path for the file backend; `{work_dir}/ledger.jsonl` when unset
    pub ledger_file: Option<PathBuf>,

    pub encoding: Encoding,
    /// Fail a file whose skipped/read row ratio exceeds this value
    pub max_skipped_row_ratio: Option<f64>,
    pub show_progress: bool,
    /// `table;codigo;descricao` lines added to `motivos`/`paises` when missing
    pub reference_supplement_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            release: None,
            database: DatabaseConfig::default(),
            batch_size: None,
            memory_percent: DEFAULT_MEMORY_PERCENT,
            download_mode: DownloadMode::Parallel,
            download_workers: None,
            max_workers: DEFAULT_MAX_WORKERS,
            load_workers: 1,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            catalog_retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            load_retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            keep_downloaded_files: false,
            ledger_backend: LedgerBackend::Database,
            ledger_file: None,
            encoding: Encoding::Latin1,
            max_skipped_row_ratio: None,
            show_progress: false,
            reference_supplement_file: None,
        }
    }
}

/// Read and parse an optional variable; malformed values are errors, not defaults.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}: invalid value '{}': {}", key, raw, e)),
        Err(_) => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => bail!("{}: invalid boolean '{}'", key, raw),
        },
        Err(_) => Ok(None),
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        let db = &mut config.database;

        if let Some(v) = env_parse::<DatabaseBackend>("DATABASE_BACKEND")? {
            db.backend = v;
        }
        db.url = env_parse::<String>("DATABASE_URL")?;
        if let Some(v) = env_parse("POSTGRES_HOST")? {
            db.host = v;
        }
        if let Some(v) = env_parse("POSTGRES_PORT")? {
            db.port = v;
        }
        if let Some(v) = env_parse("POSTGRES_NAME")? {
            db.name = v;
        }
        if let Some(v) = env_parse("POSTGRES_USER")? {
            db.user = v;
        }
        if let Ok(v) = std::env::var("POSTGRES_PASSWORD") {
            db.password = v;
        }
        if let Some(v) = env_parse("SQLITE_DB_FILE")? {
            db.sqlite_file = v;
        }

        if let Some(v) = env_parse("CNPJ_BASE_URL")? {
            config.base_url = v;
        }
        config.release = env_parse("CNPJ_RELEASE")?;
        config.batch_size = env_parse("BATCH_SIZE")?;
        if let Some(v) = env_parse("MAX_MEMORY_PERCENT")? {
            config.memory_percent = v;
        }
        if let Some(v) = env_parse("DOWNLOAD_STRATEGY")? {
            config.download_mode = v;
        }
        config.download_workers = env_parse("DOWNLOAD_WORKERS")?;
        if let Some(v) = env_parse("MAX_WORKERS")? {
            config.max_workers = v;
        }
        if let Some(v) = env_parse("LOAD_WORKERS")? {
            config.load_workers = v;
        }
        if let Some(v) = env_parse("RETRY_ATTEMPTS")? {
            config.retry_attempts = v;
        }
        if let Some(v) = env_parse("RETRY_DELAY_MS")? {
            config.retry_delay_ms = v;
        }
        if let Some(v) = env_parse("RETRY_MAX_DELAY_MS")? {
            config.retry_max_delay_ms = v;
        }
        if let Some(v) = env_parse("CATALOG_RETRY_ATTEMPTS")? {
            config.catalog_retry_attempts = v;
        }
        if let Some(v) = env_parse("LOAD_RETRY_ATTEMPTS")? {
            config.load_retry_attempts = v;
        }
        if let Some(v) = env_parse("HTTP_TIMEOUT_SECS")? {
            config.http_timeout_secs = v;
        }
        if let Some(v) = env_parse("TEMP_DIR")? {
            config.work_dir = v;
        }
        if let Some(v) = env_bool("KEEP_DOWNLOADED_FILES")? {
            config.keep_downloaded_files = v;
        }
        if let Some(v) = env_parse("LEDGER_BACKEND")? {
            config.ledger_backend = v;
        }
        config.ledger_file = env_parse("LEDGER_FILE")?;
        if let Some(v) = env_parse("FILE_ENCODING")? {
            config.encoding = v;
        }
        config.max_skipped_row_ratio = env_parse("MAX_SKIPPED_ROW_RATIO")?;
        if let Some(v) = env_bool("SHOW_PROGRESS")? {
            config.show_progress = v;
        }
        config.reference_supplement_file = env_parse("REFERENCE_SUPPLEMENT_FILE")?;

        config.validate().context("Invalid pipeline configuration")?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            bail!("CNPJ_BASE_URL must be an http(s) URL, got '{}'", self.base_url);
        }
        if !(1..=100).contains(&self.memory_percent) {
            bail!("MAX_MEMORY_PERCENT must be between 1 and 100");
        }
        if self.batch_size == Some(0) {
            bail!("BATCH_SIZE must be greater than 0");
        }
        if self.download_workers == Some(0) {
            bail!("DOWNLOAD_WORKERS must be greater than 0");
        }
        if self.max_workers == 0 {
            bail!("MAX_WORKERS must be greater than 0");
        }
        if self.load_workers == 0 {
            bail!("LOAD_WORKERS must be greater than 0");
        }
        if self.retry_attempts == 0 || self.catalog_retry_attempts == 0 || self.load_retry_attempts == 0
        {
            bail!("Retry attempt counts must be greater than 0");
        }
        if self.retry_max_delay_ms < self.retry_delay_ms {
            bail!("RETRY_MAX_DELAY_MS must not be below RETRY_DELAY_MS");
        }
        if let Some(ratio) = self.max_skipped_row_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                bail!("MAX_SKIPPED_ROW_RATIO must be between 0.0 and 1.0");
            }
        }
        if let Some(release) = &self.release {
            let valid = release.len() == 7
                && release.as_bytes()[4] == b'-'
                && release
                    .chars()
                    .enumerate()
                    .all(|(i, c)| i == 4 || c.is_ascii_digit());
            if !valid {
                bail!("CNPJ_RELEASE must look like YYYY-MM, got '{}'", release);
            }
        }
        Ok(())
    }

    fn policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Per-file download retry policy
    pub fn download_retry(&self) -> RetryPolicy {
        self.policy(self.retry_attempts)
    }

    pub fn catalog_retry(&self) -> RetryPolicy {
        self.policy(self.catalog_retry_attempts)
    }

    pub fn load_retry(&self) -> RetryPolicy {
        self.policy(self.load_retry_attempts)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("ledger.jsonl"))
    }
}
