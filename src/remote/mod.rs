// pgkeeper/src/remote/mod.rs
//
// Local ↔ remote reconciliation. The backup root on disk is the source of
// truth: files missing remotely are uploaded, top-level backup directories
// that exist only remotely are deleted. The asymmetry is deliberate — the
// mirror never restores anything locally.

pub mod uploader;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::errors::{AppError, Result};
use crate::local;
use crate::naming;
use crate::pool;
use uploader::{new_uploader, Uploader, UploaderKind};

/// Knobs the reconciliation engine needs, decoupled from the full config so
/// any `Uploader` implementation can be driven through it.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub max_concurrency: usize,
    pub check_total_cnt_and_size: bool,
}

/// Runs every enabled backend concurrently. Backend failures are logged and
/// reported per backend; they never fail the batch.
pub async fn sync_local_with_remote(cfg: &Config) {
    if !cfg.upload.enable {
        return;
    }

    let mut kinds = Vec::new();
    if cfg.upload.sftp.enable {
        kinds.push(UploaderKind::Sftp);
    }
    if cfg.upload.s3.enable {
        kinds.push(UploaderKind::S3);
    }

    let options = ReconcileOptions {
        max_concurrency: cfg.upload.max_concurrency,
        check_total_cnt_and_size: cfg.upload.check_total_cnt_and_size_after_upload,
    };

    let runs = kinds.into_iter().map(|kind| {
        let options = options.clone();
        async move {
            let outcome = match new_uploader(kind, &cfg.upload).await {
                Ok(uploader) => sync_backend(&cfg.dest, &options, uploader).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => info!(storage = %kind, "remote sync finished"),
                Err(e) => error!(storage = %kind, err = %e, "remote sync failed"),
            }
        }
    });
    futures::future::join_all(runs).await;
}

/// Reconciles one backend against the local backup root: upload what is
/// missing, then delete what no longer exists locally, then (optionally)
/// cross-check totals.
pub async fn sync_backend(
    dest: &Path,
    options: &ReconcileOptions,
    uploader: Arc<dyn Uploader>,
) -> Result<()> {
    let upload_outcome = upload_on_remote(dest, options, Arc::clone(&uploader)).await;
    delete_on_remote(dest, uploader.as_ref()).await?;
    upload_outcome?;

    if options.check_total_cnt_and_size {
        post_check(dest, uploader.as_ref()).await?;
    }

    uploader.close().await
}

/// Upload phase: everything local that is absent remotely, fanned out over a
/// bounded pool sharing one client.
async fn upload_on_remote(
    dest: &Path,
    options: &ReconcileOptions,
    uploader: Arc<dyn Uploader>,
) -> Result<()> {
    let local_map = local_relative_map(dest)?;
    let remote_map = remote_relative_map(uploader.as_ref()).await?;
    let missing = plan_uploads(&local_map, &remote_map);

    if missing.is_empty() {
        debug!(storage = %uploader.kind(), "nothing to upload");
        return Ok(());
    }
    info!(
        storage = %uploader.kind(),
        files = missing.len(),
        "uploading missing backup files"
    );

    let workers = crate::calc::effective_concurrency(options.max_concurrency);
    let dest = dest.to_path_buf();
    let results = pool::run(workers, missing, move |rel: String| {
        let uploader = Arc::clone(&uploader);
        let local_path = dest.join(&rel);
        async move {
            let outcome = uploader.upload(&local_path, &rel).await;
            match &outcome {
                Ok(()) => debug!(
                    storage = %uploader.kind(),
                    remote_path = %rel,
                    status = "ok",
                    "upload"
                ),
                Err(e) => error!(
                    storage = %uploader.kind(),
                    local_path = %local_path.display(),
                    remote_path = %rel,
                    err = %e,
                    "upload"
                ),
            }
            outcome
        }
    })
    .await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        return Err(AppError::Network(format!(
            "upload failed for {failed} file(s)"
        )));
    }
    Ok(())
}

/// Delete phase: top-level backup directories present remotely but no longer
/// present locally (retention already ran). Individual delete failures are
/// logged and retried implicitly on the next run.
async fn delete_on_remote(dest: &Path, uploader: &dyn Uploader) -> Result<()> {
    let remote_dirs = uploader
        .list_top_level_dirs(&naming::BACKUP_DMP_REGEX)
        .await?;
    let local_dirs = local::list_top_level_dirs(dest, &naming::BACKUP_DMP_REGEX)?;

    for dir_name in plan_deletions(remote_dirs.iter(), &local_dirs) {
        match uploader.delete_all(&dir_name).await {
            Ok(()) => debug!(
                storage = %uploader.kind(),
                remote_path = %dir_name,
                action = "rm -rf",
                status = "ok",
                "remote"
            ),
            Err(e) => error!(
                storage = %uploader.kind(),
                remote_path = %dir_name,
                action = "rm -rf",
                err = %e,
                "remote"
            ),
        }
    }
    Ok(())
}

/// Post-check: equal file count and equal total bytes on both sides.
async fn post_check(dest: &Path, uploader: &dyn Uploader) -> Result<()> {
    let local_map = local_relative_map(dest)?;
    let remote_map = remote_relative_map(uploader).await?;

    let local_count = local_map.len();
    let remote_count = remote_map.len();
    let local_bytes: u64 = local_map.values().sum();
    let remote_bytes: u64 = remote_map.values().sum();

    if local_count != remote_count || local_bytes != remote_bytes {
        return Err(AppError::Integrity(format!(
            "post-upload check failed: local {local_count} files / {local_bytes} bytes, \
             remote {remote_count} files / {remote_bytes} bytes"
        )));
    }
    info!(
        storage = %uploader.kind(),
        files = local_count,
        bytes = local_bytes,
        "post-upload check passed"
    );
    Ok(())
}

/// Relative path → size for every file inside finalized local backups.
fn local_relative_map(dest: &Path) -> Result<BTreeMap<String, u64>> {
    let mut map = BTreeMap::new();
    for object in local::list_backup_objects(dest)? {
        if let Some(rel) = relativize(dest, &object.path) {
            map.insert(rel, object.size);
        }
    }
    Ok(map)
}

async fn remote_relative_map(uploader: &dyn Uploader) -> Result<BTreeMap<String, u64>> {
    let mut map = BTreeMap::new();
    for object in uploader.list_objects().await? {
        map.insert(object.path.clone(), object.size);
    }
    Ok(map)
}

/// Slash-separated path of `path` relative to `base`, or `None` when `path`
/// lies outside `base`.
fn relativize(base: &Path, path: &Path) -> Option<String> {
    let rel = match path.strip_prefix(base) {
        Ok(rel) => rel.to_path_buf(),
        // Symlinked roots: retry with both sides canonicalized.
        Err(_) => {
            let base = base.canonicalize().ok()?;
            let path = path.canonicalize().ok()?;
            path.strip_prefix(&base).ok()?.to_path_buf()
        }
    };
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

/// Local-only relative paths, in stable order.
fn plan_uploads(
    local: &BTreeMap<String, u64>,
    remote: &BTreeMap<String, u64>,
) -> Vec<String> {
    local
        .keys()
        .filter(|rel| !remote.contains_key(*rel))
        .cloned()
        .collect()
}

/// Remote-only top-level directories, in stable order.
fn plan_deletions<'a>(
    remote_dirs: impl Iterator<Item = &'a String>,
    local_dirs: &std::collections::HashSet<String>,
) -> Vec<String> {
    let mut doomed: Vec<String> = remote_dirs
        .filter(|d| !local_dirs.contains(*d))
        .cloned()
        .collect();
    doomed.sort();
    doomed
}
