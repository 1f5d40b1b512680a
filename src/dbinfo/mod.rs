// pgkeeper/src/dbinfo/mod.rs
//
// The only place that talks to PostgreSQL over the wire. Used to wait for a
// cluster to accept connections and to enumerate databases with their sizes;
// everything else goes through the vendor tools.

use std::time::{Duration, Instant};

use sqlx::{Connection, PgConnection, Row};
use tracing::info;

use crate::errors::{AppError, Result};

pub const CONN_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
pub const CONN_RETRY_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DbInfo {
    pub datname: String,
    pub size_bytes: i64,
}

/// Lists every dumpable database with its size. Templates and the `postgres`
/// maintenance database are excluded.
pub async fn get_databases(conn_str: &str) -> Result<Vec<DbInfo>> {
    let mut conn = PgConnection::connect(conn_str).await?;

    let rows = sqlx::query(
        r#"
        select d.datname                   as datname,
               pg_database_size(d.datname) as size_bytes
        from pg_database d
        where d.datistemplate = false
          and d.datallowconn
          and d.datname <> 'postgres'
        "#,
    )
    .fetch_all(&mut conn)
    .await?;

    let mut databases = Vec::with_capacity(rows.len());
    for row in rows {
        databases.push(DbInfo {
            datname: row.try_get("datname")?,
            size_bytes: row.try_get("size_bytes")?,
        });
    }
    conn.close().await?;
    Ok(databases)
}

/// Blocks until the cluster answers a ping, with a short per-attempt timeout
/// and an overall deadline. Mirrors `pg_isready`-style startup waiting.
pub async fn wait_until_ready(conn_str: &str) -> Result<()> {
    let deadline = Instant::now() + CONN_WAIT_TIMEOUT;

    loop {
        let attempt = tokio::time::timeout(
            CONN_ATTEMPT_TIMEOUT,
            PgConnection::connect(conn_str),
        )
        .await;

        match attempt {
            Ok(Ok(mut conn)) => {
                conn.ping().await?;
                conn.close().await?;
                info!(status = "ok", "pg_isready");
                return Ok(());
            }
            Ok(Err(e)) => {
                if Instant::now() >= deadline {
                    return Err(AppError::Timeout(format!(
                        "PostgreSQL not ready after {}s: {e}",
                        CONN_WAIT_TIMEOUT.as_secs()
                    )));
                }
            }
            Err(_elapsed) => {
                if Instant::now() >= deadline {
                    return Err(AppError::Timeout(format!(
                        "PostgreSQL not ready after {}s: connect attempt timed out",
                        CONN_WAIT_TIMEOUT.as_secs()
                    )));
                }
            }
        }

        info!(status = "waiting", "pg_isready");
        tokio::time::sleep(CONN_RETRY_SLEEP).await;
    }
}
