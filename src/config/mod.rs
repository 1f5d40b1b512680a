// pgkeeper/src/config/mod.rs
use std::collections::{BTreeMap, HashMap};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::errors::AppError;

/// Top-level configuration, loaded once in `main` and passed down by
/// reference. Workers never reach for global state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Backup root directory. Everything this tool owns lives under it.
    pub dest: PathBuf,

    /// Mirror tool output to our own stdout/stderr in addition to capturing.
    #[serde(default)]
    pub print_dump_logs: bool,

    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub dump: DumpConfig,

    #[serde(default)]
    pub base: BaseConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggerConfig {
    #[serde(default = "default_logger_format")]
    pub format: String,
    #[serde(default = "default_logger_level")]
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            format: default_logger_format(),
            level: default_logger_level(),
        }
    }
}

fn default_logger_format() -> String {
    "text".into()
}

fn default_logger_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DumpConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub max_concurrency: usize,
    /// Also capture cluster-wide globals (roles, tablespaces) next to each dump.
    #[serde(default)]
    pub dump_globals: bool,
    /// Emit a ready-to-edit restore.sh into each dump.
    #[serde(default)]
    pub create_restore_script: bool,
    #[serde(default)]
    pub databases: Vec<DumpDatabase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DumpDatabase {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub dbname: String,
    #[serde(default)]
    pub opts: BTreeMap<String, String>,

    // optional filters, passed through to the dump tool in order
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub exclude_schemas: Vec<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    #[serde(default)]
    pub jobs: u32,
    #[serde(default)]
    pub pg_bin_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BaseConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub clusters: Vec<BaseBackupCluster>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BaseBackupCluster {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub opts: BTreeMap<String, String>,
    #[serde(default)]
    pub pg_bin_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default)]
    pub enable: bool,
    /// Duration string, e.g. "168h" or "30d 12h".
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub keep_last: usize,
}

impl RetentionConfig {
    pub fn parsed_period(&self) -> Result<Duration, AppError> {
        humantime::parse_duration(&self.period)
            .map_err(|e| AppError::InvalidInput(format!("retention.period {:?}: {e}", self.period)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UploadConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub max_concurrency: usize,
    /// After the upload phase, assert that file count and total bytes match
    /// between local and remote.
    #[serde(default)]
    pub check_total_cnt_and_size_after_upload: bool,
    #[serde(default)]
    pub sftp: UploadSftpConfig,
    #[serde(default)]
    pub s3: UploadS3Config,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UploadSftpConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pkey_path: String,
    #[serde(default)]
    pub passphrase: String,
    /// Remote root directory for the mirror.
    #[serde(default)]
    pub dest: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UploadS3Config {
    #[serde(default)]
    pub enable: bool,
    #[serde(default, rename = "endpointURL")]
    pub endpoint_url: String,
    #[serde(default, rename = "accessKeyID")]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    /// Key prefix inside the bucket; empty means the bucket root.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub use_path_style: bool,
    #[serde(default, rename = "disableSSL")]
    pub disable_ssl: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NotifyConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub telegram: NotifyTelegramConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NotifyTelegramConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default, rename = "chatID")]
    pub chat_id: String,
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::load(&content)
            .with_context(|| format!("failed to load config file at {}", path.display()))
    }

    pub fn load(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let cfg: Config =
            serde_yaml::from_str(&expanded).context("failed to parse YAML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), AppError> {
        check_no_duplicate_dump_targets(&self.dump.databases)?;
        check_no_duplicate_clusters(&self.base.clusters)?;

        if self.upload.enable && self.upload.sftp.enable {
            let s = &self.upload.sftp;
            if s.dest.is_empty()
                || s.host.is_empty()
                || s.port == 0
                || s.user.is_empty()
                || s.pkey_path.is_empty()
            {
                return Err(AppError::Validation(
                    "upload.sftp requires dest, host, port, user and pkeyPath".into(),
                ));
            }
        }
        if self.upload.enable && self.upload.s3.enable {
            let s = &self.upload.s3;
            if s.endpoint_url.is_empty()
                || s.access_key_id.is_empty()
                || s.secret_access_key.is_empty()
                || s.bucket.is_empty()
            {
                return Err(AppError::Validation(
                    "upload.s3 requires endpointURL, accessKeyID, secretAccessKey and bucket"
                        .into(),
                ));
            }
        }
        Ok(())
    }
}

/// Two entries naming the same server through different hostnames are still
/// the same target, so duplicate detection runs on resolved IPv4 sets.
fn check_no_duplicate_dump_targets(databases: &[DumpDatabase]) -> Result<(), AppError> {
    let mut seen: HashMap<String, ()> = HashMap::new();
    for db in databases {
        let ips = lookup_ip4_addresses(&db.host, db.port)?;
        let key = format!("{};{};{}", ips.join(";"), db.port, db.dbname);
        if seen.insert(key, ()).is_some() {
            return Err(AppError::Validation(format!(
                "duplicate dump target: host={} port={} dbname={}",
                db.host, db.port, db.dbname
            )));
        }
    }
    Ok(())
}

fn check_no_duplicate_clusters(clusters: &[BaseBackupCluster]) -> Result<(), AppError> {
    let mut seen: HashMap<String, ()> = HashMap::new();
    for cluster in clusters {
        let ips = lookup_ip4_addresses(&cluster.host, cluster.port)?;
        let key = format!("{};{}", ips.join(";"), cluster.port);
        if seen.insert(key, ()).is_some() {
            return Err(AppError::Validation(format!(
                "duplicate base-backup cluster: host={} port={}",
                cluster.host, cluster.port
            )));
        }
    }
    Ok(())
}

fn lookup_ip4_addresses(host: &str, port: u16) -> Result<Vec<String>, AppError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| AppError::Validation(format!("cannot resolve host {host}: {e}")))?;

    let mut ips: Vec<String> = addrs
        .filter(|a| a.is_ipv4())
        .map(|a| a.ip().to_string())
        .collect();
    ips.sort();
    ips.dedup();
    Ok(ips)
}

static ENV_VAR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var regex"));

/// Expands `${NAME}` references against the process environment before the
/// YAML parser sees the content. Unset variables expand to the empty string.
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
dest: /var/backups/pg
dump:
  enable: true
  maxConcurrency: 2
  databases:
    - host: 127.0.0.1
      port: 5432
      username: backup
      password: secret
      dbname: app
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = Config::load(MINIMAL).unwrap();
        assert_eq!(cfg.dest, PathBuf::from("/var/backups/pg"));
        assert!(!cfg.print_dump_logs);
        assert_eq!(cfg.logger.format, "text");
        assert_eq!(cfg.logger.level, "info");
        assert!(cfg.dump.enable);
        assert_eq!(cfg.dump.databases.len(), 1);
        assert!(!cfg.retention.enable);
        assert!(!cfg.upload.enable);
    }

    #[test]
    fn env_vars_expand_before_parsing() {
        std::env::set_var("PGKEEPER_TEST_PASSWORD", "hunter2");
        let yaml = r#"
dest: /var/backups/pg
dump:
  enable: true
  databases:
    - host: 127.0.0.1
      port: 5432
      username: backup
      password: ${PGKEEPER_TEST_PASSWORD}
      dbname: app
"#;
        let cfg = Config::load(yaml).unwrap();
        assert_eq!(cfg.dump.databases[0].password, "hunter2");
    }

    #[test]
    fn duplicate_dump_targets_are_rejected() {
        let yaml = r#"
dest: /var/backups/pg
dump:
  enable: true
  databases:
    - host: 127.0.0.1
      port: 5432
      username: backup
      dbname: app
    - host: 127.0.0.1
      port: 5432
      username: other
      dbname: app
"#;
        let err = Config::load(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate dump target"), "{err}");
    }

    #[test]
    fn same_database_on_different_ports_is_fine() {
        let yaml = r#"
dest: /var/backups/pg
dump:
  enable: true
  databases:
    - host: 127.0.0.1
      port: 5432
      username: backup
      dbname: app
    - host: 127.0.0.1
      port: 5433
      username: backup
      dbname: app
"#;
        assert!(Config::load(yaml).is_ok());
    }

    #[test]
    fn duplicate_clusters_are_rejected() {
        let yaml = r#"
dest: /var/backups/pg
base:
  enable: true
  clusters:
    - host: 127.0.0.1
      port: 5432
      username: replicator
    - host: 127.0.0.1
      port: 5432
      username: replicator2
"#;
        let err = Config::load(yaml).unwrap_err();
        assert!(
            err.to_string().contains("duplicate base-backup cluster"),
            "{err}"
        );
    }

    #[test]
    fn enabled_sftp_requires_connection_fields() {
        let yaml = r#"
dest: /var/backups/pg
upload:
  enable: true
  sftp:
    enable: true
    host: backup.example.com
"#;
        let err = Config::load(yaml).unwrap_err();
        assert!(err.to_string().contains("upload.sftp requires"), "{err}");
    }

    #[test]
    fn enabled_s3_requires_credentials() {
        let yaml = r#"
dest: /var/backups/pg
upload:
  enable: true
  s3:
    enable: true
    endpointURL: https://s3.example.com
    bucket: backups
"#;
        let err = Config::load(yaml).unwrap_err();
        assert!(err.to_string().contains("upload.s3 requires"), "{err}");
    }

    #[test]
    fn retention_period_parses_durations() {
        let retention = RetentionConfig {
            enable: true,
            period: "168h".into(),
            keep_last: 3,
        };
        assert_eq!(
            retention.parsed_period().unwrap(),
            Duration::from_secs(168 * 3600)
        );

        let bad = RetentionConfig {
            enable: true,
            period: "fortnight".into(),
            keep_last: 3,
        };
        assert!(bad.parsed_period().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = r#"
dest: /var/backups/pg
shredder:
  enable: true
"#;
        assert!(Config::load(yaml).is_err());
    }
}
