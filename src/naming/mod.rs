// pgkeeper/src/naming/mod.rs
//
// Backup directory naming. Every artifact under the backup root encodes its
// identity in the directory name:
//
//   layout:  <timestamp>--<host>-<port>--<dbname>.<dmp|dirty>
//   example: 20250217134506--10.40.240.165-30201--vault.dmp
//
// Physical (pg_basebackup) entries carry the literal `__pg_basebackup__`
// token in place of a database name. Anything that does not match the
// grammar is invisible to the index, the retention engine and the mirror.

use chrono::{NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{AppError, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Database-name token used by physical cluster backups.
pub const BASEBACKUP_TOKEN: &str = "__pg_basebackup__";

/// Finalized backups. Immutable once renamed; only retention deletes them.
pub static BACKUP_DMP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{14})--([a-zA-Z0-9.-]+)-(\d{1,5})--([a-zA-Z_][a-zA-Z0-9_]{0,62}|__pg_basebackup__)\.dmp$")
        .expect("dmp regex")
});

/// Staging residue. Owned by the worker that created it; swept on the next run.
pub static BACKUP_DIRTY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{14})--([a-zA-Z0-9.-]+)-(\d{1,5})--([a-zA-Z_][a-zA-Z0-9_]{0,62}|__pg_basebackup__)\.dirty$")
        .expect("dirty regex")
});

pub static DATABASE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,62}$").expect("dbname regex"));

/// Captures the working timestamp for a batch: UTC, truncated to the second.
/// One value is captured at startup and threaded through every task, so all
/// artifacts of a single run share one sort key.
pub fn working_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(ts: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
        .map_err(|e| AppError::InvalidInput(format!("bad timestamp {ts}: {e}")))
}

/// Parsed identity of a finalized backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupName {
    pub timestamp: NaiveDateTime,
    pub host: String,
    pub port: u16,
    pub dbname: String,
}

impl BackupName {
    /// Parses a `.dmp` directory name. Non-conforming names are an error so
    /// callers can decide to skip or to fail loudly.
    pub fn parse(dir_name: &str) -> Result<Self> {
        let caps = BACKUP_DMP_REGEX
            .captures(dir_name)
            .ok_or_else(|| AppError::InvalidInput(format!("not a backup name: {dir_name}")))?;

        let timestamp = parse_timestamp(&caps[1])?;
        let port: u16 = caps[3]
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("port out of range in {dir_name}")))?;

        Ok(BackupName {
            timestamp,
            host: caps[2].to_string(),
            port,
            dbname: caps[4].to_string(),
        })
    }

    pub fn is_basebackup(&self) -> bool {
        self.dbname == BASEBACKUP_TOKEN
    }
}

/// Stem shared by the staging and finalized directory of one task.
pub fn backup_stem(ts: &str, host: &str, port: u16, dbname: &str) -> String {
    format!("{ts}--{host}-{port}--{dbname}")
}

pub fn dirty_dir_name(ts: &str, host: &str, port: u16, dbname: &str) -> String {
    format!("{}.dirty", backup_stem(ts, host, port, dbname))
}

pub fn dmp_dir_name(ts: &str, host: &str, port: u16, dbname: &str) -> String {
    format!("{}.dmp", backup_stem(ts, host, port, dbname))
}
