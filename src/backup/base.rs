// pgkeeper/src/backup/base.rs
//
// Physical cluster backups via pg_basebackup. Same staging envelope as the
// logical pipeline, one task per cluster, the `__pg_basebackup__` token in
// place of a database name.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::backup::dump::create_stage_dir;
use crate::backup::result::{BackupMode, TaskResult};
use crate::calc;
use crate::chksum;
use crate::config::{BaseBackupCluster, Config};
use crate::connstr::{create_conn_str, ConnParams};
use crate::errors::{AppError, Result};
use crate::execs::{find_tool, ToolCommand};
use crate::naming::{self, BASEBACKUP_TOKEN};
use crate::pool;

#[derive(Debug, Clone)]
struct BaseBackupTask {
    cluster: BaseBackupCluster,
    dest: PathBuf,
    ts: String,
    print_logs: bool,
}

pub async fn run_pg_basebackups(cfg: &Config, ts: &str) -> Vec<TaskResult> {
    if !cfg.base.enable || cfg.base.clusters.is_empty() {
        return Vec::new();
    }

    let worker_count = calc::effective_concurrency(cfg.base.max_concurrency);
    info!(
        workers = worker_count,
        clusters = cfg.base.clusters.len(),
        "starting base backups"
    );

    let tasks: Vec<BaseBackupTask> = cfg
        .base
        .clusters
        .iter()
        .map(|cluster| BaseBackupTask {
            cluster: cluster.clone(),
            dest: cfg.dest.clone(),
            ts: ts.to_string(),
            print_logs: cfg.print_dump_logs,
        })
        .collect();

    pool::run(worker_count, tasks, |task| async move {
        let mut result = TaskResult {
            host: task.cluster.host.clone(),
            port: task.cluster.port,
            dbname: None,
            mode: BackupMode::Physical,
            error: None,
        };
        if let Err(e) = dump_cluster(&task).await {
            error!(status = "error", server = %result.target(), err = %e, "backup");
            result.error = Some(e.to_string());
        }
        result
    })
    .await
}

async fn dump_cluster(task: &BaseBackupTask) -> Result<()> {
    let cluster = &task.cluster;

    let pg_basebackup = find_tool(cluster.pg_bin_path.as_deref(), "pg_basebackup")?;

    info!(
        status = "run",
        mode = "pg_basebackup",
        cluster = %format!("{}:{}", cluster.host, cluster.port),
        "backup"
    );

    // No dbname: the streaming protocol addresses the whole cluster.
    let conn_str = create_conn_str(&ConnParams {
        host: cluster.host.clone(),
        port: cluster.port,
        username: cluster.username.clone(),
        password: cluster.password.clone(),
        dbname: String::new(),
        opts: cluster.opts.clone(),
    })?;

    let stage = task.dest.join(naming::dirty_dir_name(
        &task.ts,
        &cluster.host,
        cluster.port,
        BASEBACKUP_TOKEN,
    ));
    let final_dir = task.dest.join(naming::dmp_dir_name(
        &task.ts,
        &cluster.host,
        cluster.port,
        BASEBACKUP_TOKEN,
    ));

    create_stage_dir(&stage)?;

    let output = ToolCommand::new(pg_basebackup)
        .args(build_pg_basebackup_args(&conn_str, &stage))
        .env("PGPASSWORD", &cluster.password)
        .mirror_output(task.print_logs)
        .run()
        .await?;

    if let Err(e) = std::fs::write(stage.join("dump.log"), &output.stderr) {
        warn!(err = %e, "cannot save dump.log");
    }

    let manifest_stage = stage.clone();
    tokio::task::spawn_blocking(move || chksum::write_checksums_file(&manifest_stage))
        .await
        .map_err(|e| AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

    std::fs::rename(&stage, &final_dir)?;

    info!(
        status = "ok",
        mode = "pg_basebackup",
        cluster = %format!("{}:{}", cluster.host, cluster.port),
        path = %final_dir.display(),
        "backup"
    );
    Ok(())
}

fn build_pg_basebackup_args(conn_str: &str, stage: &Path) -> Vec<String> {
    vec![
        format!("--dbname={conn_str}"),
        format!("--pgdata={}/data", stage.display()),
        "--checkpoint=fast".to_string(),
        "--progress".to_string(),
        "--no-password".to_string(),
        "--format=tar".to_string(),
        "--gzip".to_string(),
        "--verbose".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_streams_a_gzipped_tarball() {
        let args = build_pg_basebackup_args(
            "postgres://replicator:pw@db.example.com:5432",
            Path::new("/var/backups/20250101000000--db.example.com-5432--__pg_basebackup__.dirty"),
        );
        assert_eq!(
            args,
            vec![
                "--dbname=postgres://replicator:pw@db.example.com:5432",
                "--pgdata=/var/backups/20250101000000--db.example.com-5432--__pg_basebackup__.dirty/data",
                "--checkpoint=fast",
                "--progress",
                "--no-password",
                "--format=tar",
                "--gzip",
                "--verbose",
            ]
        );
    }
}
