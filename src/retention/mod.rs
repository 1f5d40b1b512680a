// pgkeeper/src/retention/mod.rs
//
// Bounded history. For every logical target the newest `keep_last` backups
// survive unconditionally; older ones are deleted once their age exceeds the
// configured period. Age is measured against the timestamp embedded in the
// directory name — filesystem mtime is mutated by sweeps and remote sync and
// cannot be trusted.

use std::fs;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::info;

use crate::errors::Result;
use crate::local::{BackupEntry, BackupIndex};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub examined: usize,
    pub removed: usize,
}

/// Deletes expired backups. `now` is the batch working timestamp, so one run
/// makes one consistent retention decision. The first removal error aborts —
/// a half-applied policy should be visible, not papered over.
pub fn purge_old_dirs(
    index: &BackupIndex,
    period: Duration,
    keep_last: usize,
    now: NaiveDateTime,
) -> Result<PruneStats> {
    let mut stats = PruneStats::default();

    for (key, entries) in index {
        stats.examined += entries.len();
        for entry in select_expired(entries, period, keep_last, now) {
            info!(
                host = %key.host,
                port = key.port,
                dbname = %key.dbname,
                path = %entry.path.display(),
                "retention: removing expired backup"
            );
            fs::remove_dir_all(&entry.path)?;
            stats.removed += 1;
        }
    }
    Ok(stats)
}

/// Pure selection: entries must be sorted oldest-first (the index guarantees
/// it). Only the entries beyond the keep-last floor are candidates, and of
/// those only the ones older than `period` are returned.
fn select_expired<'a>(
    entries: &'a [BackupEntry],
    period: Duration,
    keep_last: usize,
    now: NaiveDateTime,
) -> Vec<&'a BackupEntry> {
    let excess = entries.len().saturating_sub(keep_last);
    if excess == 0 {
        return Vec::new();
    }

    let period = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::MAX);
    entries[..excess]
        .iter()
        .filter(|e| now - e.name.timestamp > period)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{find_all_backups, LogicalKey};
    use crate::naming::BackupName;
    use std::path::PathBuf;

    fn fixed_now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("20250301120000", "%Y%m%d%H%M%S").unwrap()
    }

    fn entry_aged(hours_ago: i64) -> BackupEntry {
        let ts = fixed_now() - chrono::Duration::hours(hours_ago);
        let stamp = ts.format("%Y%m%d%H%M%S").to_string();
        let dir_name = format!("{stamp}--localhost-5432--demo.dmp");
        BackupEntry {
            name: BackupName::parse(&dir_name).unwrap(),
            path: PathBuf::from(format!("/tmp/{dir_name}")),
            dir_name,
        }
    }

    fn ages(selected: &[&BackupEntry], now: NaiveDateTime) -> Vec<i64> {
        selected
            .iter()
            .map(|e| (now - e.name.timestamp).num_hours())
            .collect()
    }

    #[test]
    fn keeps_the_newest_beyond_the_floor() {
        // keepLast=2, period=24h, ages 48h/36h/12h/1h -> the two oldest go.
        let now = fixed_now();
        let entries = vec![entry_aged(48), entry_aged(36), entry_aged(12), entry_aged(1)];
        let selected = select_expired(&entries, Duration::from_secs(24 * 3600), 2, now);
        assert_eq!(ages(&selected, now), vec![48, 36]);
    }

    #[test]
    fn period_protects_young_entries_even_with_keep_last_zero() {
        let now = fixed_now();
        let entries = vec![entry_aged(48), entry_aged(1)];
        let selected = select_expired(&entries, Duration::from_secs(24 * 3600), 0, now);
        assert_eq!(ages(&selected, now), vec![48]);
    }

    #[test]
    fn floor_alone_retains_everything() {
        let now = fixed_now();
        let entries = vec![entry_aged(400), entry_aged(300)];
        let selected = select_expired(&entries, Duration::from_secs(3600), 2, now);
        assert!(selected.is_empty());
    }

    #[test]
    fn old_but_within_excess_only() {
        // Five entries, keepLast=3: only the two oldest are candidates, and
        // of those only the expired one goes.
        let now = fixed_now();
        let entries = vec![
            entry_aged(72),
            entry_aged(10),
            entry_aged(8),
            entry_aged(6),
            entry_aged(4),
        ];
        let selected = select_expired(&entries, Duration::from_secs(24 * 3600), 3, now);
        assert_eq!(ages(&selected, now), vec![72]);
    }

    #[test]
    fn purge_deletes_directories_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let mk = |stamp: &str, db: &str| {
            let path = dir
                .path()
                .join(format!("{stamp}--localhost-5432--{db}.dmp"));
            std::fs::create_dir_all(path.join("data")).unwrap();
            std::fs::write(path.join("data/f"), b"x").unwrap();
        };
        // demo: three entries over three days; other: one young entry.
        mk("20250226120000", "demo");
        mk("20250227120000", "demo");
        mk("20250228120000", "demo");
        mk("20250301110000", "other");

        let index = find_all_backups(dir.path()).unwrap();
        let stats =
            purge_old_dirs(&index, Duration::from_secs(3600), 1, fixed_now()).unwrap();

        assert_eq!(stats, PruneStats { examined: 4, removed: 2 });

        let remaining = find_all_backups(dir.path()).unwrap();
        let demo_key = LogicalKey {
            host: "localhost".into(),
            port: 5432,
            dbname: "demo".into(),
        };
        let other_key = LogicalKey {
            host: "localhost".into(),
            port: 5432,
            dbname: "other".into(),
        };
        assert_eq!(remaining[&demo_key].len(), 1);
        assert_eq!(
            remaining[&demo_key][0].dir_name,
            "20250228120000--localhost-5432--demo.dmp"
        );
        assert_eq!(remaining[&other_key].len(), 1);
    }
}
