use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Logical,
    Physical,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Logical => write!(f, "pg_dump"),
            BackupMode::Physical => write!(f, "pg_basebackup"),
        }
    }
}

/// Outcome of one finished task, aggregated by the orchestrator and handed
/// to the notifier.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub host: String,
    pub port: u16,
    pub dbname: Option<String>,
    pub mode: BackupMode,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// `host:port/dbname` for logical targets, `host:port` for clusters.
    pub fn target(&self) -> String {
        match &self.dbname {
            Some(dbname) => format!("{}:{}/{}", self.host, self.port, dbname),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}
