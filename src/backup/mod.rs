// pgkeeper/src/backup/mod.rs
//
// The batch orchestrator. Fixed phase order, filesystem as the only
// hand-off between phases:
//
//   retention → dirty sweep → logical dumps → base backups → mirror → notify
//
// Retention runs before any worker spawns, so nothing it deletes can be
// in-flight; the cleaner runs before dumps, so this run's staging dirs are
// the only `.dirty` entries alive afterwards.

pub mod base;
pub mod dump;
pub mod result;
pub mod script;

use tracing::{error, info};

use crate::config::Config;
use crate::local;
use crate::naming;
use crate::notifier::{self, AlertRequest, NotifyStatus};
use crate::remote;
use crate::retention;
use result::TaskResult;

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<TaskResult>,
}

impl BatchOutcome {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_ok()).count()
    }
}

pub async fn run_backup_flow(cfg: &Config) -> anyhow::Result<BatchOutcome> {
    // One timestamp for the whole batch; every task name and every retention
    // decision derives from it.
    let ts = naming::working_timestamp();
    info!(working_timestamp = %ts, dest = %cfg.dest.display(), "starting batch");

    run_retention(cfg, &ts);

    let removed = local::sweep_dirty(&cfg.dest);
    if removed > 0 {
        info!(removed, "cleaner removed dirty residue");
    }

    let mut outcome = BatchOutcome::default();
    outcome.results.extend(dump::run_pg_dumps(cfg, &ts).await);
    outcome
        .results
        .extend(base::run_pg_basebackups(cfg, &ts).await);

    remote::sync_local_with_remote(cfg).await;

    publish_results(cfg, &outcome).await;

    info!(
        tasks = outcome.results.len(),
        failed = outcome.failed_count(),
        "batch finished"
    );
    Ok(outcome)
}

/// Retention failures abort this phase only; a batch that cannot prune can
/// still back up.
fn run_retention(cfg: &Config, ts: &str) {
    if !cfg.retention.enable {
        return;
    }

    let period = match cfg.retention.parsed_period() {
        Ok(period) => period,
        Err(e) => {
            error!(err = %e, "retention skipped");
            return;
        }
    };
    let now = match naming::parse_timestamp(ts) {
        Ok(now) => now,
        Err(e) => {
            error!(err = %e, "retention skipped");
            return;
        }
    };

    let index = match local::find_all_backups(&cfg.dest) {
        Ok(index) => index,
        Err(e) => {
            error!(err = %e, "retention skipped: cannot index backups");
            return;
        }
    };

    match retention::purge_old_dirs(&index, period, cfg.retention.keep_last, now) {
        Ok(stats) => info!(
            examined = stats.examined,
            removed = stats.removed,
            "retention finished"
        ),
        Err(e) => error!(err = %e, "retention aborted"),
    }
}

async fn publish_results(cfg: &Config, outcome: &BatchOutcome) {
    let Some(notifier) = notifier::new_notifier(&cfg.notify) else {
        return;
    };

    for result in &outcome.results {
        let request = match &result.error {
            None => AlertRequest {
                status: NotifyStatus::Info,
                message: format!("backup ok: {} ({})", result.target(), result.mode),
            },
            Some(err) => AlertRequest {
                status: NotifyStatus::Error,
                message: format!(
                    "backup failed: {} ({}): {err}",
                    result.target(),
                    result.mode
                ),
            },
        };
        notifier.send_message(&request).await;
    }
}
