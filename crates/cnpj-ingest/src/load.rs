//! Bulk upsert into the target store
//!
//! Batches are written with multi-row `INSERT ... ON CONFLICT (key) DO UPDATE`
//! so replaying a file from its first batch is harmless. Each batch runs in
//! one transaction and is retried as a whole.

use crate::error::{PipelineError, Result};
use crate::processing::{FieldValue, RecordBatch, Row};
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::schema::TableSchema;
use crate::store::Store;
use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder, Sqlite};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Bind parameters per statement, kept under each backend's hard limit
const POSTGRES_MAX_PARAMS: usize = 65_000;
const SQLITE_MAX_PARAMS: usize = 32_000;

#[async_trait]
pub trait LoadAdapter: Send + Sync {
    /// Create the target table if missing. Called before a file's first batch.
    async fn ensure_schema(&self, schema: &'static TableSchema) -> Result<()>;

    /// Insert-or-update every row of `batch`; returns the batch row count.
    ///
    /// Must be safe to call again with the same batch.
    async fn bulk_upsert(&self, batch: &RecordBatch) -> Result<u64>;

    /// Stored values of a single-column natural key
    async fn existing_keys(&self, schema: &'static TableSchema) -> Result<HashSet<String>>;
}

pub struct SqlLoader {
    store: Store,
    retry: RetryPolicy,
    prepared: Mutex<HashSet<&'static str>>,
}

impl SqlLoader {
    pub fn new(store: Store, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            prepared: Mutex::new(HashSet::new()),
        }
    }

    async fn upsert_once(&self, schema: &TableSchema, rows: &[&Row]) -> sqlx::Result<()> {
        match &self.store {
            Store::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                for chunk in rows.chunks(rows_per_statement(schema, POSTGRES_MAX_PARAMS)) {
                    let mut builder = QueryBuilder::<Postgres>::new(insert_head(schema));
                    builder.push_values(chunk, |mut b, row| {
                        for (idx, value) in row.iter().enumerate() {
                            match value {
                                FieldValue::Text(s) => b.push_bind(s.clone()),
                                FieldValue::Float(f) => b.push_bind(*f),
                                FieldValue::Null if schema.is_numeric(idx) => b.push_bind(None::<f64>),
                                FieldValue::Null => b.push_bind(None::<String>),
                            };
                        }
                    });
                    builder.push(conflict_clause(schema));
                    builder.build().execute(&mut *tx).await?;
                }
                tx.commit().await
            },
            Store::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                for chunk in rows.chunks(rows_per_statement(schema, SQLITE_MAX_PARAMS)) {
                    let mut builder = QueryBuilder::<Sqlite>::new(insert_head(schema));
                    builder.push_values(chunk, |mut b, row| {
                        for (idx, value) in row.iter().enumerate() {
                            match value {
                                FieldValue::Text(s) => b.push_bind(s.clone()),
                                FieldValue::Float(f) => b.push_bind(*f),
                                FieldValue::Null if schema.is_numeric(idx) => b.push_bind(None::<f64>),
                                FieldValue::Null => b.push_bind(None::<String>),
                            };
                        }
                    });
                    builder.push(conflict_clause(schema));
                    builder.build().execute(&mut *tx).await?;
                }
                tx.commit().await
            },
        }
    }
}

fn rows_per_statement(schema: &TableSchema, max_params: usize) -> usize {
    (max_params / schema.width().max(1)).max(1)
}

/// `CREATE TABLE IF NOT EXISTS` for a schema; numeric columns are floating point
pub fn create_table_sql(schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| {
            let ty = if schema.numeric.contains(c) {
                "DOUBLE PRECISION"
            } else {
                "TEXT"
            };
            if schema.natural_key.contains(c) {
                format!("{} {} NOT NULL", c, ty)
            } else {
                format!("{} {}", c, ty)
            }
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
        schema.table,
        columns.join(", "),
        schema.natural_key.join(", ")
    )
}

fn insert_head(schema: &TableSchema) -> String {
    format!("INSERT INTO {} ({}) ", schema.table, schema.columns.join(", "))
}

fn conflict_clause(schema: &TableSchema) -> String {
    let updates: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| !schema.natural_key.contains(c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    if updates.is_empty() {
        format!(" ON CONFLICT ({}) DO NOTHING", schema.natural_key.join(", "))
    } else {
        format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            schema.natural_key.join(", "),
            updates.join(", ")
        )
    }
}

/// Rows with a unique natural key, keeping the last occurrence in input order.
///
/// A single `INSERT ... ON CONFLICT DO UPDATE` may not touch the same key
/// twice, so duplicates inside one batch are collapsed here.
fn dedupe_by_key<'a>(schema: &TableSchema, rows: &'a [Row]) -> Vec<&'a Row> {
    let keys = schema.key_indices();
    let mut latest: HashMap<Vec<&str>, usize> = HashMap::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let key = keys
            .iter()
            .map(|&k| row.get(k).and_then(FieldValue::as_text).unwrap_or(""))
            .collect();
        latest.insert(key, idx);
    }
    let mut keep: Vec<usize> = latest.into_values().collect();
    keep.sort_unstable();
    keep.into_iter().map(|idx| &rows[idx]).collect()
}

#[async_trait]
impl LoadAdapter for SqlLoader {
    async fn ensure_schema(&self, schema: &'static TableSchema) -> Result<()> {
        let mut prepared = self.prepared.lock().await;
        if prepared.contains(schema.table) {
            return Ok(());
        }
        self.store.execute(&create_table_sql(schema)).await?;
        prepared.insert(schema.table);
        info!(table = schema.table, "Target table ready");
        Ok(())
    }

    async fn bulk_upsert(&self, batch: &RecordBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let schema = batch.schema;
        let rows = dedupe_by_key(schema, &batch.rows);
        if rows.len() < batch.len() {
            debug!(
                file = %batch.source,
                batch = batch.sequence,
                duplicates = batch.len() - rows.len(),
                "Collapsed duplicate keys in batch"
            );
        }

        let label = format!("{}#{}", batch.source, batch.sequence);
        let rows = rows.as_slice();
        let outcome = retry(&self.retry, &label, |_| async move {
            self.upsert_once(schema, rows).await
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { .. } => {
                debug!(table = schema.table, batch = batch.sequence, rows = batch.len(), "Batch upserted");
                Ok(batch.len() as u64)
            },
            RetryOutcome::Exhausted { error, .. } => Err(PipelineError::Load {
                table: schema.table.to_string(),
                batch: batch.sequence,
                reason: error.to_string(),
            }),
        }
    }

    async fn existing_keys(&self, schema: &'static TableSchema) -> Result<HashSet<String>> {
        let load_error = |reason: String| PipelineError::Load {
            table: schema.table.to_string(),
            batch: 0,
            reason,
        };
        let [key] = schema.natural_key else {
            return Err(load_error("key lookup needs a single-column natural key".into()));
        };

        let sql = format!("SELECT {} FROM {}", key, schema.table);
        let keys: Vec<String> = match &self.store {
            Store::Postgres(pool) => sqlx::query_scalar::<_, String>(&sql).fetch_all(pool).await,
            Store::Sqlite(pool) => sqlx::query_scalar::<_, String>(&sql).fetch_all(pool).await,
        }
        .map_err(|e| load_error(e.to_string()))?;
        Ok(keys.into_iter().collect())
    }
}
