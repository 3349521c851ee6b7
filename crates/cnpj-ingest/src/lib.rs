//! CNPJ Ingest Library
//!
//! Downloads the Receita Federal open CNPJ dataset, streams each archive
//! through a bounded batching parser and upserts the rows into PostgreSQL or
//! SQLite. A processed-file ledger makes reruns skip files already loaded.
//!
//! # Components
//!
//! - [`resources`]: batch size and worker count from host memory and CPUs
//! - [`catalog`]: remote file listing
//! - [`ledger`]: durable record of fully loaded files
//! - [`download`]: sequential or pooled downloads with retry
//! - [`processing`]: zip/gzip/CSV streaming into [`processing::RecordBatch`]es
//! - [`load`]: bulk upsert adapter
//! - [`coordinator`]: per-file state machine and run summary
//!
//! # Example
//!
//! ```no_run
//! use cnpj_ingest::{Pipeline, PipelineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let (pipeline, store) = Pipeline::from_config(&config, CancellationToken::new()).await?;
//!     let run = pipeline.run().await?;
//!     println!("{} rows loaded", run.rows_loaded);
//!     store.close().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod error;
pub mod ledger;
pub mod load;
pub mod processing;
pub mod progress;
pub mod reference;
pub mod resources;
pub mod retry;
pub mod schema;
pub mod store;

pub use config::PipelineConfig;
pub use coordinator::{FileReport, FileState, Pipeline, PipelineRun, PipelineSettings, RunOutcome};
pub use error::{PipelineError, Result};
