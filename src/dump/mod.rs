// pgkeeper/src/dump/mod.rs
//
// `pgkeeper dump` — one-shot logical dump of a whole cluster into a single
// staged directory:
//
//   <output>/<ts>.dirty/<db>.dmp/data/…   while running
//   <output>/<ts>.dmp/<db>.dmp/data/…     after the final rename
//
// Unlike the config-driven orchestrator, the target list comes from the
// cluster itself and parallelism is planned from the machine.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use crate::calc;
use crate::chksum;
use crate::connstr;
use crate::dbinfo;
use crate::execs::{find_tool, ToolCommand};
use crate::naming;
use crate::pool;

#[derive(Debug, Clone)]
pub struct ClusterDumpArgs {
    pub conn_str: String,
    pub pg_bin_path: Option<PathBuf>,
    pub output: PathBuf,
    pub compress: u32,
    pub parallel_databases: Option<usize>,
}

pub async fn run(args: &ClusterDumpArgs) -> Result<()> {
    let params = connstr::parse_conn_str(&args.conn_str)?;
    connstr::export_pg_env(&params);

    dbinfo::wait_until_ready(&args.conn_str).await?;

    let databases = dbinfo::get_databases(&args.conn_str).await?;
    if databases.is_empty() {
        bail!("no databases to dump");
    }

    // Workers come from the static split; per-database `--jobs` follow the
    // size distribution, so one huge database does not dump with the same
    // budget as a tiny one.
    let mut settings = calc::calculate_parallel_settings(databases.len(), num_cpus::get())?;
    if let Some(parallel) = args.parallel_databases {
        settings.workers = parallel.clamp(1, databases.len());
    }
    let sizes: Vec<(String, u64)> = databases
        .iter()
        .map(|db| (db.datname.clone(), db.size_bytes.max(0) as u64))
        .collect();
    let job_weights = calc::size_weighted_jobs(&sizes, num_cpus::get())?;
    info!(
        db_workers = settings.workers,
        databases = databases.len(),
        "planned cluster dump"
    );

    let ts = naming::working_timestamp();
    let stage = args.output.join(format!("{ts}.dirty"));
    let final_dir = args.output.join(format!("{ts}.dmp"));
    std::fs::create_dir_all(&stage)
        .with_context(|| format!("cannot create staging dir {}", stage.display()))?;

    let outcome = dump_all_databases(args, &databases, &stage, settings, &job_weights).await;
    if let Err(e) = outcome {
        // Leave nothing half-baked behind: the cluster dump is all-or-nothing.
        let _ = std::fs::remove_dir_all(&stage);
        return Err(e);
    }

    write_globals_file(args, &stage).await?;

    let manifest_stage = stage.clone();
    tokio::task::spawn_blocking(move || chksum::write_checksums_file(&manifest_stage))
        .await
        .context("checksum task panicked")??;

    std::fs::rename(&stage, &final_dir).with_context(|| {
        format!(
            "cannot rename {} to {}",
            stage.display(),
            final_dir.display()
        )
    })?;

    info!(status = "ok", path = %final_dir.display(), "backup");
    Ok(())
}

async fn dump_all_databases(
    args: &ClusterDumpArgs,
    databases: &[dbinfo::DbInfo],
    stage: &Path,
    settings: calc::ParallelSettings,
    job_weights: &std::collections::HashMap<String, u32>,
) -> Result<()> {
    // (dbname, jobs) pairs; the static planner's value backs any database
    // missing from the weight map.
    let tasks: Vec<(String, u32)> = databases
        .iter()
        .map(|db| {
            let jobs = job_weights
                .get(&db.datname)
                .copied()
                .unwrap_or(settings.jobs as u32);
            (db.datname.clone(), jobs)
        })
        .collect();

    let pg_bin_path = args.pg_bin_path.clone();
    let stage = stage.to_path_buf();
    let compress = args.compress;

    let results = pool::run(settings.workers, tasks, move |(dbname, jobs): (String, u32)| {
        let pg_bin_path = pg_bin_path.clone();
        let stage = stage.clone();
        async move {
            let outcome =
                dump_one_database(pg_bin_path.as_deref(), &dbname, &stage, jobs, compress).await;
            if let Err(e) = &outcome {
                error!(dbname = %dbname, err = %e, "dump-error");
            }
            outcome
        }
    })
    .await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        bail!("{failed} of {} database dump(s) failed", results.len());
    }
    Ok(())
}

/// Dumps one database into `<stage>/<db>.dmp`, staged through
/// `<stage>/<db>.dirty` so a failed dump never looks finished.
async fn dump_one_database(
    pg_bin_path: Option<&Path>,
    dbname: &str,
    stage: &Path,
    jobs: u32,
    compress: u32,
) -> Result<()> {
    let pg_dump = find_tool(pg_bin_path, "pg_dump")?;

    let tmp_dest = stage.join(format!("{dbname}.dirty"));
    let ok_dest = stage.join(format!("{dbname}.dmp"));
    std::fs::create_dir_all(&tmp_dest)?;

    let output = ToolCommand::new(pg_dump)
        .arg(format!("--dbname={dbname}"))
        .arg(format!("--file={}/data", tmp_dest.display()))
        .arg("--format=directory")
        .arg(format!("--jobs={jobs}"))
        .arg(format!("--compress={compress}"))
        .arg("--no-password")
        .arg("--verbose")
        .arg("--verbose") // yes, twice
        .run()
        .await?;

    if let Err(e) = std::fs::write(tmp_dest.join("dump.log"), &output.stderr) {
        warn!(dbname = %dbname, err = %e, "cannot save dump.log");
    }

    std::fs::rename(&tmp_dest, &ok_dest)?;
    info!(status = "ok", dbname = %dbname, "backup");
    Ok(())
}

/// Cluster-wide globals for the whole bundle. A cluster dump without roles
/// is not restorable, so unlike the orchestrator this failure is fatal.
async fn write_globals_file(args: &ClusterDumpArgs, stage: &Path) -> Result<()> {
    let pg_dumpall = find_tool(args.pg_bin_path.as_deref(), "pg_dumpall")?;

    let output = ToolCommand::new(pg_dumpall)
        .arg(format!("--dbname={}", args.conn_str))
        .arg("--globals-only")
        .arg("--clean")
        .arg("--if-exists")
        .arg("--verbose")
        .arg("--verbose") // yes, twice
        .run()
        .await?;

    std::fs::write(stage.join("globals.sql"), output.stdout)
        .context("cannot save globals.sql")?;
    Ok(())
}
