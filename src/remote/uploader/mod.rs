// pgkeeper/src/remote/uploader/mod.rs
//
// One capability set, two transports. The reconciliation engine consumes
// only this trait; every path it passes in is relative to the backend root
// (an SFTP directory, or an S3 bucket/prefix).

mod s3;
mod sftp;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::config::UploadConfig;
use crate::errors::{AppError, Result};

pub use s3::S3Storage;
pub use sftp::SftpStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderKind {
    S3,
    Sftp,
}

impl fmt::Display for UploaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploaderKind::S3 => write!(f, "s3"),
            UploaderKind::Sftp => write!(f, "sftp"),
        }
    }
}

/// One file on the remote side, addressed relative to the backend root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub path: String,
    pub size: u64,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    fn kind(&self) -> UploaderKind;

    /// Remote root this backend mirrors into; empty string means the bucket
    /// root.
    fn dest(&self) -> &str;

    /// Copies one local file to `remote_rel` under the backend root,
    /// creating intermediate directories where the transport has them.
    async fn upload(&self, local: &Path, remote_rel: &str) -> Result<()>;

    /// Recursive listing of files (never directories) under the root.
    async fn list_objects(&self) -> Result<Vec<RemoteObject>>;

    /// Names of top-level directories under the root matching `re`.
    async fn list_top_level_dirs(&self, re: &Regex) -> Result<HashSet<String>>;

    /// Recursively deletes a file or directory tree under the root.
    async fn delete_all(&self, remote_rel: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory: picks the backend implementation by tag.
pub async fn new_uploader(
    kind: UploaderKind,
    cfg: &UploadConfig,
) -> Result<Arc<dyn Uploader>> {
    match kind {
        UploaderKind::S3 => Ok(Arc::new(S3Storage::connect(&cfg.s3).await?)),
        UploaderKind::Sftp => Ok(Arc::new(SftpStorage::connect(&cfg.sftp).await?)),
    }
}

/// Joins a backend root with a relative path using forward slashes.
pub(crate) fn join_remote(root: &str, rel: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        rel.to_string()
    } else {
        format!("{root}/{rel}")
    }
}

pub(crate) fn ssh_err(e: ssh2::Error) -> AppError {
    AppError::Network(e.to_string())
}
