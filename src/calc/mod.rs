// pgkeeper/src/calc/mod.rs
//
// Parallelism planning. Two deterministic strategies: a static split of the
// CPU budget across equally-weighted databases, and a size-weighted split for
// clusters where a few large databases dominate.

use std::collections::HashMap;

use crate::errors::{AppError, Result};

pub const PG_DUMP_JOBS_DEFAULT: u32 = 4;
pub const MAX_CONCURRENCY_DEFAULT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelSettings {
    /// Databases dumped at the same time.
    pub workers: usize,
    /// `--jobs` handed to each dump process.
    pub jobs: usize,
}

/// Static strategy: one CPU is left to the system, the rest is divided
/// between concurrent dumps, and whatever is left over per dump becomes its
/// `--jobs` value.
pub fn calculate_parallel_settings(
    num_databases: usize,
    total_cpus: usize,
) -> Result<ParallelSettings> {
    if num_databases == 0 {
        return Err(AppError::InvalidInput(
            "zero databases to plan for".into(),
        ));
    }

    if total_cpus < 2 {
        return Ok(ParallelSettings { workers: 1, jobs: 1 });
    }

    let usable = (total_cpus - 1).max(1);
    let workers = num_databases.min(usable);
    let jobs = (usable / workers).max(1);

    Ok(ParallelSettings { workers, jobs })
}

/// Size-weighted strategy: every database gets jobs proportional to its share
/// of the total size, with a floor of one. Callers pick the worker count
/// separately.
pub fn size_weighted_jobs(
    sizes: &[(String, u64)],
    total_cpus: usize,
) -> Result<HashMap<String, u32>> {
    if sizes.is_empty() {
        return Err(AppError::InvalidInput(
            "zero databases to plan for".into(),
        ));
    }

    let budget = total_cpus.saturating_sub(1).max(1) as f64;
    let total: u64 = sizes.iter().map(|(_, s)| s).sum();

    let mut out = HashMap::with_capacity(sizes.len());
    for (dbname, size) in sizes {
        let jobs = if total == 0 {
            1
        } else {
            ((*size as f64 / total as f64) * budget).round().max(1.0) as u32
        };
        out.insert(dbname.clone(), jobs);
    }
    Ok(out)
}

/// Per-target `--jobs` override. Values outside a sane range fall back to the
/// default rather than oversubscribing the server.
pub fn effective_jobs(configured: u32) -> u32 {
    if configured == 0 || configured >= 32 {
        PG_DUMP_JOBS_DEFAULT
    } else {
        configured
    }
}

/// Pool width for a phase, bounded by the machine.
pub fn effective_concurrency(configured: usize) -> usize {
    let cpus = num_cpus::get();
    if configured == 0 || configured > cpus {
        MAX_CONCURRENCY_DEFAULT
    } else {
        configured
    }
}
