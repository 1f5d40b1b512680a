// pgkeeper/src/remote/uploader/sftp.rs
//
// SFTP backend over libssh2. The library is blocking, so a shared session
// lives behind a mutex and every operation runs on the blocking pool. Host
// keys are deliberately not verified: backup targets are provisioned hosts
// addressed by private config, and key pinning is left to the SSH layer of
// the deployment. Documented trade-off.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{ssh_err, RemoteObject, Uploader, UploaderKind};
use crate::config::UploadSftpConfig;
use crate::errors::{AppError, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SftpStorage {
    inner: Arc<Mutex<SftpSession>>,
    dest: String,
}

struct SftpSession {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
}

impl SftpStorage {
    pub async fn connect(cfg: &UploadSftpConfig) -> Result<Self> {
        let cfg = cfg.clone();
        let session = tokio::task::spawn_blocking(move || SftpSession::connect(&cfg))
            .await
            .map_err(|e| AppError::Network(e.to_string()))??;

        Ok(SftpStorage {
            dest: session.dest.clone(),
            inner: Arc::new(Mutex::new(session.inner)),
        })
    }

    /// Runs one blocking SFTP operation on the blocking pool.
    async fn with_session<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&SftpSession) -> Result<R> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let session = inner
                .lock()
                .map_err(|_| AppError::Network("sftp session poisoned".into()))?;
            op(&session)
        })
        .await
        .map_err(|e| AppError::Network(e.to_string()))?
    }
}

struct ConnectedSession {
    inner: SftpSession,
    dest: String,
}

impl SftpSession {
    fn connect(cfg: &UploadSftpConfig) -> Result<ConnectedSession> {
        let addr = (cfg.host.as_str(), cfg.port)
            .to_socket_addrs()
            .map_err(|e| AppError::Network(format!("cannot resolve {}: {e}", cfg.host)))?
            .next()
            .ok_or_else(|| {
                AppError::Network(format!("no address found for {}", cfg.host))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)
            .map_err(|e| AppError::Network(format!("cannot dial {addr}: {e}")))?;

        let mut session = ssh2::Session::new().map_err(ssh_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(ssh_err)?;

        let passphrase = if cfg.passphrase.is_empty() {
            None
        } else {
            Some(cfg.passphrase.as_str())
        };
        session
            .userauth_pubkey_file(&cfg.user, None, Path::new(&cfg.pkey_path), passphrase)
            .map_err(|e| AppError::Network(format!("ssh authentication failed: {e}")))?;
        if !session.authenticated() {
            return Err(AppError::Network("ssh authentication failed".into()));
        }

        let sftp = session.sftp().map_err(ssh_err)?;
        Ok(ConnectedSession {
            inner: SftpSession { session, sftp },
            dest: cfg.dest.trim_end_matches('/').to_string(),
        })
    }

    fn mkdir_all(&self, dir: &Path) -> Result<()> {
        let mut current = PathBuf::new();
        for component in dir.components() {
            current.push(component);
            if self.sftp.stat(&current).is_err() {
                // Racing against a sibling upload is fine; the final stat
                // decides.
                let _ = self.sftp.mkdir(&current, 0o755);
            }
        }
        match self.sftp.stat(dir) {
            Ok(stat) if stat.is_dir() => Ok(()),
            _ => Err(AppError::Network(format!(
                "cannot create remote directory {}",
                dir.display()
            ))),
        }
    }

    fn upload_file(&self, local: &Path, remote: &Path) -> Result<()> {
        if let Some(parent) = remote.parent() {
            self.mkdir_all(parent)?;
        }

        let mut local_file = std::fs::File::open(local)?;
        let mut remote_file = self.sftp.create(remote).map_err(ssh_err)?;

        let mut buf = [0u8; 128 * 1024];
        loop {
            let n = local_file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            remote_file
                .write_all(&buf[..n])
                .map_err(|e| AppError::Network(e.to_string()))?;
        }
        Ok(())
    }

    fn walk_files(&self, root: &Path) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();

        // A missing remote root is an empty mirror, not a failure.
        if self.sftp.stat(root).is_err() {
            return Ok(objects);
        }

        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for (path, stat) in self.sftp.readdir(&dir).map_err(ssh_err)? {
                if stat.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path
                        .strip_prefix(root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .into_owned();
                    objects.push(RemoteObject {
                        path: rel,
                        size: stat.size.unwrap_or(0),
                    });
                }
            }
        }
        Ok(objects)
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let stat = self.sftp.stat(path).map_err(ssh_err)?;
        if !stat.is_dir() {
            return self.sftp.unlink(path).map_err(ssh_err);
        }
        for (child, child_stat) in self.sftp.readdir(path).map_err(ssh_err)? {
            if child_stat.is_dir() {
                self.remove_all(&child)?;
            } else {
                self.sftp.unlink(&child).map_err(ssh_err)?;
            }
        }
        self.sftp.rmdir(path).map_err(ssh_err)
    }
}

#[async_trait]
impl Uploader for SftpStorage {
    fn kind(&self) -> UploaderKind {
        UploaderKind::Sftp
    }

    fn dest(&self) -> &str {
        &self.dest
    }

    async fn upload(&self, local: &Path, remote_rel: &str) -> Result<()> {
        let local = local.to_path_buf();
        let remote = Path::new(&self.dest).join(remote_rel);
        self.with_session(move |s| s.upload_file(&local, &remote)).await
    }

    async fn list_objects(&self) -> Result<Vec<RemoteObject>> {
        let root = PathBuf::from(&self.dest);
        self.with_session(move |s| s.walk_files(&root)).await
    }

    async fn list_top_level_dirs(&self, re: &Regex) -> Result<HashSet<String>> {
        let root = PathBuf::from(&self.dest);
        let re = re.clone();
        self.with_session(move |s| {
            let mut dirs = HashSet::new();
            if s.sftp.stat(&root).is_err() {
                return Ok(dirs);
            }
            for (path, stat) in s.sftp.readdir(&root).map_err(ssh_err)? {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if stat.is_dir() && re.is_match(name) {
                    dirs.insert(name.to_string());
                }
            }
            Ok(dirs)
        })
        .await
    }

    async fn delete_all(&self, remote_rel: &str) -> Result<()> {
        let target = Path::new(&self.dest).join(remote_rel);
        self.with_session(move |s| s.remove_all(&target)).await
    }

    async fn close(&self) -> Result<()> {
        self.with_session(|s| {
            let _ = s.session.disconnect(None, "done", None);
            Ok(())
        })
        .await
    }
}
