// pgkeeper/src/remote/uploader/s3.rs
use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use regex::Regex;
use s3::config::{Credentials, Region};
use s3::primitives::ByteStream;
use s3::types::{Delete, ObjectIdentifier};
use tracing::warn;

use super::{join_remote, RemoteObject, Uploader, UploaderKind};
use crate::config::UploadS3Config;
use crate::errors::{AppError, Result};

/// Object-store backend. The root is the bucket, optionally narrowed to a
/// key prefix.
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    pub async fn connect(cfg: &UploadS3Config) -> Result<Self> {
        let mut endpoint = cfg.endpoint_url.clone();
        if cfg.disable_ssl && endpoint.starts_with("https://") {
            // The bundled TLS stack has no verification-off switch, so the
            // bypass degrades to plain HTTP. Self-hosted stores accept both.
            warn!("upload.s3.disableSSL set, using plain http endpoint");
            endpoint = endpoint.replacen("https://", "http://", 1);
        }

        let region = if cfg.region.is_empty() {
            "us-east-1".to_string()
        } else {
            cfg.region.clone()
        };

        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&endpoint)
            .region(Region::new(region))
            .credentials_provider(Credentials::new(
                &cfg.access_key_id,
                &cfg.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(cfg.use_path_style)
            .build();

        Ok(S3Storage {
            client: s3::Client::from_conf(s3_config),
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.trim_matches('/').to_string(),
        })
    }

    fn key(&self, rel: &str) -> String {
        join_remote(&self.prefix, rel)
    }

    fn strip_root<'a>(&self, key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            Some(key)
        } else {
            key.strip_prefix(&self.prefix)
                .map(|rest| rest.trim_start_matches('/'))
        }
    }

    fn list_prefix(&self) -> Option<String> {
        if self.prefix.is_empty() {
            None
        } else {
            Some(format!("{}/", self.prefix))
        }
    }

    fn net_err(e: impl std::fmt::Display) -> AppError {
        AppError::Network(e.to_string())
    }
}

#[async_trait]
impl Uploader for S3Storage {
    fn kind(&self) -> UploaderKind {
        UploaderKind::S3
    }

    fn dest(&self) -> &str {
        &self.prefix
    }

    async fn upload(&self, local: &Path, remote_rel: &str) -> Result<()> {
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| AppError::Network(format!("cannot read {}: {e}", local.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(remote_rel))
            .body(body)
            .send()
            .await
            .map_err(Self::net_err)?;
        Ok(())
    }

    async fn list_objects(&self) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(prefix) = self.list_prefix() {
                request = request.prefix(prefix);
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(Self::net_err)?;
            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                let Some(rel) = self.strip_root(key) else { continue };
                objects.push(RemoteObject {
                    path: rel.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn list_top_level_dirs(&self, re: &Regex) -> Result<HashSet<String>> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .delimiter("/");
        if let Some(prefix) = self.list_prefix() {
            request = request.prefix(prefix);
        }

        let output = request.send().await.map_err(Self::net_err)?;

        let mut dirs = HashSet::new();
        for common_prefix in output.common_prefixes() {
            let Some(prefix) = common_prefix.prefix() else { continue };
            let Some(rel) = self.strip_root(prefix) else { continue };
            let name = rel.trim_end_matches('/');
            if re.is_match(name) {
                dirs.insert(name.to_string());
            }
        }
        Ok(dirs)
    }

    async fn delete_all(&self, remote_rel: &str) -> Result<()> {
        let prefix = self.key(remote_rel);
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request.send().await.map_err(Self::net_err)?;

            let object_ids: Vec<ObjectIdentifier> = output
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(Self::net_err)
                })
                .collect::<Result<_>>()?;

            if object_ids.is_empty() {
                break;
            }

            // One bulk call per listing page.
            let delete = Delete::builder()
                .set_objects(Some(object_ids))
                .quiet(true)
                .build()
                .map_err(Self::net_err)?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(Self::net_err)?;

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
