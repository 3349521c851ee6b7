//! Host resource profiling
//!
//! Host readings are taken once at startup into [`HostResources`]; everything
//! after that is a pure function of those readings and the configured
//! overrides, so tests can feed in any machine they like.

use serde::Serialize;
use sysinfo::System;
use tracing::info;

/// Estimated in-memory cost of one parsed row (widest table plus overhead)
pub const DEFAULT_ROW_BYTES: u64 = 2 * 1024;
pub const MIN_BATCH_SIZE: usize = 1_000;
pub const MAX_BATCH_SIZE: usize = 500_000;

/// Capacity of the channel between a file's parser and its loader
pub const BATCH_CHANNEL_CAPACITY: usize = 2;

/// Batches one loading file can hold at once: the channel, the one being
/// filled by the parser and the one being upserted
pub const BATCHES_IN_FLIGHT_PER_FILE: usize = BATCH_CHANNEL_CAPACITY + 2;

const GIB: u64 = 1024 * 1024 * 1024;

/// Snapshot of host memory and CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostResources {
    pub total_memory: u64,
    pub available_memory: u64,
    pub cpu_count: usize,
}

impl HostResources {
    /// Read memory via sysinfo and parallelism from the standard library
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let total_memory = sys.total_memory();
        // Some containers report 0 available; fall back to total.
        let available_memory = match sys.available_memory() {
            0 => total_memory,
            n => n,
        };

        Self {
            total_memory,
            available_memory,
            cpu_count,
        }
    }
}

/// Informational memory tier, logged alongside the resolved settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Constrained,
    Standard,
    High,
}

impl MemoryTier {
    pub fn for_total(total_memory: u64) -> Self {
        if total_memory < 8 * GIB {
            MemoryTier::Constrained
        } else if total_memory < 32 * GIB {
            MemoryTier::Standard
        } else {
            MemoryTier::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Constrained => "constrained",
            MemoryTier::Standard => "standard",
            MemoryTier::High => "high",
        }
    }
}

/// Overrides and bounds fed into [`resolve`]
#[derive(Debug, Clone, Copy)]
pub struct ResourceRequest {
    pub batch_size: Option<usize>,
    pub memory_percent: Option<u8>,
    pub workers: Option<usize>,
    pub max_workers: usize,
    /// Files loaded concurrently
    pub load_workers: usize,
    pub row_bytes: u64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            batch_size: None,
            memory_percent: None,
            workers: None,
            max_workers: crate::config::DEFAULT_MAX_WORKERS,
            load_workers: 1,
            row_bytes: DEFAULT_ROW_BYTES,
        }
    }
}

/// Execution settings derived from the host; neither field is ever zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedResources {
    pub batch_size: usize,
    pub worker_count: usize,
    pub memory_tier: MemoryTier,
}

/// Derive batch size and worker count from host readings plus overrides.
///
/// Explicit values win. Otherwise the worker count follows the CPU count
/// (capped at `max_workers`) and the batch size keeps every batch in flight
/// (`BATCHES_IN_FLIGHT_PER_FILE` per loading file) under `memory_percent` of
/// available memory.
pub fn resolve(host: &HostResources, request: &ResourceRequest) -> ResolvedResources {
    let worker_count = match request.workers {
        Some(n) => n.max(1),
        None => host.cpu_count.clamp(1, request.max_workers.max(1)),
    };

    let batch_size = match request.batch_size {
        Some(n) => n.max(1),
        None => {
            let percent = u64::from(
                request
                    .memory_percent
                    .unwrap_or(crate::config::DEFAULT_MEMORY_PERCENT)
                    .clamp(1, 100),
            );
            let budget = host.available_memory / 100 * percent;
            let in_flight = (request.load_workers.max(1) * BATCHES_IN_FLIGHT_PER_FILE) as u64;
            let per_batch = budget / in_flight;
            let rows = per_batch / request.row_bytes.max(1);
            (rows.min(MAX_BATCH_SIZE as u64) as usize).max(MIN_BATCH_SIZE)
        },
    };

    ResolvedResources {
        batch_size,
        worker_count,
        memory_tier: MemoryTier::for_total(host.total_memory),
    }
}

/// Detect the host and resolve, logging the result
pub fn profile(request: &ResourceRequest) -> ResolvedResources {
    let host = HostResources::detect();
    let resolved = resolve(&host, request);
    info!(
        total_memory = %cnpj_common::units::format_bytes(host.total_memory),
        available_memory = %cnpj_common::units::format_bytes(host.available_memory),
        cpus = host.cpu_count,
        tier = resolved.memory_tier.as_str(),
        batch_size = resolved.batch_size,
        workers = resolved.worker_count,
        "Resolved execution resources"
    );
    resolved
}
