// pgkeeper/src/restore/mod.rs
//
// `pgkeeper restore` — replays a cluster dump produced by `pgkeeper dump`
// into an empty cluster: manifest verification, globals first, then a
// bounded fan-out of directory-format restores.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use crate::calc;
use crate::chksum;
use crate::connstr;
use crate::dbinfo;
use crate::execs::{find_tool, ToolCommand};
use crate::pool;

#[derive(Debug, Clone)]
pub struct ClusterRestoreArgs {
    pub conn_str: String,
    pub pg_bin_path: Option<PathBuf>,
    pub input: PathBuf,
    pub exit_on_error: bool,
    pub log_dir: Option<PathBuf>,
    pub parallel_databases: Option<usize>,
}

pub async fn run(args: &ClusterRestoreArgs) -> Result<()> {
    let params = connstr::parse_conn_str(&args.conn_str)?;
    connstr::export_pg_env(&params);

    dbinfo::wait_until_ready(&args.conn_str).await?;

    let databases = dbinfo::get_databases(&args.conn_str).await?;
    if !databases.is_empty() {
        bail!("cannot restore on non-empty cluster");
    }

    let dump_dirs = list_dump_dirs(&args.input)?;
    if dump_dirs.is_empty() {
        bail!("no dumps were found in {}", args.input.display());
    }

    // The manifest covers the whole bundle; verify before touching anything.
    let input = args.input.clone();
    tokio::task::spawn_blocking(move || chksum::compare_checksums(&input))
        .await
        .context("checksum task panicked")??;
    info!(input = %args.input.display(), "checksums verified");

    restore_globals(args).await?;
    restore_databases(args, dump_dirs).await
}

async fn restore_globals(args: &ClusterRestoreArgs) -> Result<()> {
    let globals_script = args.input.join("globals.sql");
    if !globals_script.is_file() {
        warn!("no globals.sql in the bundle, skipping globals replay");
        return Ok(());
    }

    let psql = find_tool(args.pg_bin_path.as_deref(), "psql")?;

    // No ON_ERROR_STOP here: pre-existing roles are the norm, and globals
    // replay is allowed to skip them.
    ToolCommand::new(psql)
        .arg(format!("--dbname={}", args.conn_str))
        .arg(format!("--file={}", globals_script.display()))
        .run()
        .await?;

    info!(status = "ok", globals = %globals_script.display(), "restore");
    Ok(())
}

async fn restore_databases(args: &ClusterRestoreArgs, dump_dirs: Vec<PathBuf>) -> Result<()> {
    let mut settings = calc::calculate_parallel_settings(dump_dirs.len(), num_cpus::get())?;
    if let Some(parallel) = args.parallel_databases {
        settings.workers = parallel.clamp(1, dump_dirs.len());
    }
    info!(
        db_workers = settings.workers,
        pgrestore_jobs = settings.jobs,
        dumps = dump_dirs.len(),
        "planned cluster restore"
    );

    let log_dir = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            dir.clone()
        }
        None => PathBuf::from("."),
    };

    let conn_str = args.conn_str.clone();
    let pg_bin_path = args.pg_bin_path.clone();
    let exit_on_error = args.exit_on_error;
    let jobs = settings.jobs;

    let results = pool::run(settings.workers, dump_dirs, move |dump_dir: PathBuf| {
        let conn_str = conn_str.clone();
        let pg_bin_path = pg_bin_path.clone();
        let log_dir = log_dir.clone();
        async move {
            let outcome = restore_one_dump(
                pg_bin_path.as_deref(),
                &conn_str,
                &dump_dir,
                &log_dir,
                jobs,
                exit_on_error,
            )
            .await;
            if let Err(e) = &outcome {
                error!(dump = %dump_dir.display(), err = %e, "restore-error");
            }
            outcome
        }
    })
    .await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        bail!("{failed} of {} restore(s) failed", results.len());
    }
    Ok(())
}

async fn restore_one_dump(
    pg_bin_path: Option<&Path>,
    conn_str: &str,
    dump_dir: &Path,
    log_dir: &Path,
    jobs: usize,
    exit_on_error: bool,
) -> Result<()> {
    let pg_restore = find_tool(pg_bin_path, "pg_restore")?;

    let dump_name = dump_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dump".to_string());
    let log_path = log_dir.join(format!("restore-{dump_name}.log"));

    let mut cmd = ToolCommand::new(pg_restore)
        .arg(format!("--dbname={conn_str}"))
        .arg("--create");
    if exit_on_error {
        cmd = cmd.arg("--exit-on-error");
    }
    let cmd = cmd
        .arg("--format=directory")
        .arg(format!("--jobs={jobs}"))
        .arg("--no-password")
        .arg("--verbose")
        .arg(format!("{}/data", dump_dir.display()));

    // pg_restore chatter goes to the log file; stderr still comes back for
    // failure diagnostics.
    let stderr = cmd.run_stdout_to_file(&log_path).await?;
    if !stderr.is_empty() {
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        use std::io::Write;
        let _ = log.write_all(&stderr);
    }

    info!(status = "ok", dump = %dump_dir.display(), log = %log_path.display(), "restore");
    Ok(())
}

/// Top-level `<db>.dmp` directories inside the bundle.
fn list_dump_dirs(input: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(input)
        .with_context(|| format!("cannot read input dir {}", input.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.path().is_dir() && name.ends_with(".dmp") {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
