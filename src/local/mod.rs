// pgkeeper/src/local/mod.rs
//
// The local side of the world: an index over finalized backups under the
// backup root, and the cleaner that sweeps crash residue. Both walk exactly
// one level deep — backup directories are opaque below their top level.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::errors::Result;
use crate::naming::{self, BackupName};

/// Groups all historical backups of one target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalKey {
    pub host: String,
    pub port: u16,
    pub dbname: String,
}

#[derive(Debug, Clone)]
pub struct BackupEntry {
    /// Parsed identity from the directory name.
    pub name: BackupName,
    /// Directory name as found on disk.
    pub dir_name: String,
    /// Absolute path of the backup directory.
    pub path: PathBuf,
}

/// `(host, port, dbname)` → backups, oldest first by embedded timestamp.
pub type BackupIndex = BTreeMap<LogicalKey, Vec<BackupEntry>>;

/// Walks the backup root and indexes every directory matching the finalized
/// grammar. Names that do not parse are ignored — the grammar is the contract.
pub fn find_all_backups(dest: &Path) -> Result<BackupIndex> {
    let mut index: BackupIndex = BTreeMap::new();

    for entry in read_root(dest)? {
        let Some(dir_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !entry.path().is_dir() || !naming::BACKUP_DMP_REGEX.is_match(&dir_name) {
            continue;
        }
        let Ok(name) = BackupName::parse(&dir_name) else {
            continue;
        };

        let key = LogicalKey {
            host: name.host.clone(),
            port: name.port,
            dbname: name.dbname.clone(),
        };
        index.entry(key).or_default().push(BackupEntry {
            name,
            dir_name,
            path: entry.path().canonicalize()?,
        });
    }

    for entries in index.values_mut() {
        entries.sort_by_key(|e| e.name.timestamp);
    }
    Ok(index)
}

/// Top-level directory names under `dest` matching `re`. One level only.
pub fn list_top_level_dirs(dest: &Path, re: &Regex) -> Result<HashSet<String>> {
    let mut dirs = HashSet::new();
    for entry in read_root(dest)? {
        if let Some(name) = entry.file_name().to_str() {
            if entry.path().is_dir() && re.is_match(name) {
                dirs.insert(name.to_string());
            }
        }
    }
    Ok(dirs)
}

#[derive(Debug, Clone)]
pub struct LocalObject {
    pub path: PathBuf,
    pub size: u64,
}

/// Every file inside finalized backups, for the mirror. Staging directories
/// are invisible here: half-written artifacts must never reach a remote.
pub fn list_backup_objects(dest: &Path) -> Result<Vec<LocalObject>> {
    let mut objects = Vec::new();

    for entry in read_root(dest)? {
        let file_name = entry.file_name();
        let Some(dir_name) = file_name.to_str() else {
            continue;
        };
        if !entry.path().is_dir() || !naming::BACKUP_DMP_REGEX.is_match(dir_name) {
            continue;
        }
        for file in WalkDir::new(entry.path()) {
            let file = file.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
            })?;
            if file.file_type().is_file() {
                objects.push(LocalObject {
                    size: file.metadata().map(|m| m.len()).unwrap_or(0),
                    path: file.into_path(),
                });
            }
        }
    }

    objects.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(objects)
}

/// Removes `.dirty` staging residue left by a crashed or failed run. A
/// removal failure is logged and skipped so one stubborn directory cannot
/// wedge the whole batch.
pub fn sweep_dirty(dest: &Path) -> usize {
    let entries = match read_root(dest) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(err = %e, dest = %dest.display(), "cleaner cannot read backup root");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !entry.path().is_dir() || !naming::BACKUP_DIRTY_REGEX.is_match(name) {
            continue;
        }
        info!(path = %entry.path().display(), "removing dirty backup residue");
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(err = %e, path = %entry.path().display(), "cannot remove dirty dir"),
        }
    }
    removed
}

/// A missing backup root means an empty backup set, not an error — the first
/// run of a fresh install starts from nothing.
fn read_root(dest: &Path) -> Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dest) {
        Ok(iter) => Ok(iter.collect::<std::io::Result<Vec<_>>>()?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::BACKUP_DMP_REGEX;

    fn mkdir(root: &Path, name: &str) {
        fs::create_dir_all(root.join(name)).unwrap();
    }

    #[test]
    fn index_groups_by_logical_key_and_sorts_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        // Deliberately created newest-first to prove ordering comes from the
        // name, not the filesystem.
        mkdir(dir.path(), "20250103000000--localhost-5432--demo.dmp");
        mkdir(dir.path(), "20250101000000--localhost-5432--demo.dmp");
        mkdir(dir.path(), "20250102000000--localhost-5432--demo.dmp");
        mkdir(dir.path(), "20250102000000--localhost-5432--other.dmp");
        mkdir(dir.path(), "20250102000000--localhost-5433--demo.dmp");
        // Noise the index must ignore.
        mkdir(dir.path(), "20250102000000--localhost-5432--demo.dirty");
        mkdir(dir.path(), "some-unrelated-dir");
        fs::write(
            dir.path().join("20250104000000--localhost-5432--demo.dmp"),
            b"a file, not a dir",
        )
        .unwrap();

        let index = find_all_backups(dir.path()).unwrap();
        assert_eq!(index.len(), 3);

        let key = LogicalKey {
            host: "localhost".into(),
            port: 5432,
            dbname: "demo".into(),
        };
        let entries = &index[&key];
        assert_eq!(entries.len(), 3);
        let stamps: Vec<String> = entries
            .iter()
            .map(|e| e.name.timestamp.format("%Y%m%d%H%M%S").to_string())
            .collect();
        assert_eq!(
            stamps,
            vec!["20250101000000", "20250102000000", "20250103000000"]
        );
    }

    #[test]
    fn index_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = find_all_backups(&dir.path().join("does-not-exist")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn top_level_listing_is_one_level_deep() {
        let dir = tempfile::tempdir().unwrap();
        mkdir(dir.path(), "20250101000000--localhost-5432--demo.dmp");
        mkdir(
            dir.path(),
            "20250101000000--localhost-5432--demo.dmp/data",
        );
        mkdir(dir.path(), "nested");
        mkdir(dir.path(), "nested/20250102000000--localhost-5432--x.dmp");

        let dirs = list_top_level_dirs(dir.path(), &BACKUP_DMP_REGEX).unwrap();
        assert_eq!(dirs.len(), 1);
        assert!(dirs.contains("20250101000000--localhost-5432--demo.dmp"));
    }

    #[test]
    fn backup_objects_exclude_dirty_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let dmp = dir.path().join("20250101000000--localhost-5432--demo.dmp");
        fs::create_dir_all(dmp.join("data")).unwrap();
        fs::write(dmp.join("data/0001.dat"), b"x").unwrap();
        fs::write(dmp.join("dump.log"), b"log").unwrap();

        let dirty = dir.path().join("20250101000000--localhost-5432--app.dirty");
        fs::create_dir_all(&dirty).unwrap();
        fs::write(dirty.join("partial"), b"half-written").unwrap();

        fs::write(dir.path().join("stray.txt"), b"stray").unwrap();

        let objects = list_backup_objects(dir.path()).unwrap();
        let names: Vec<String> = objects
            .iter()
            .map(|o| o.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["0001.dat", "dump.log"]);
        assert!(objects.iter().all(|o| o.size > 0));
    }

    #[test]
    fn cleaner_removes_only_dirty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let dirty = dir.path().join("20250101000000--localhost-5432--app.dirty");
        fs::create_dir_all(dirty.join("data")).unwrap();
        fs::write(dirty.join("data/partial"), b"junk").unwrap();
        mkdir(dir.path(), "20250101000000--localhost-5432--app.dmp");
        mkdir(dir.path(), "keep-me");

        let removed = sweep_dirty(dir.path());
        assert_eq!(removed, 1);
        assert!(!dirty.exists());
        assert!(dir
            .path()
            .join("20250101000000--localhost-5432--app.dmp")
            .exists());
        assert!(dir.path().join("keep-me").exists());
    }

    #[test]
    fn cleaner_tolerates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sweep_dirty(&dir.path().join("nope")), 0);
    }
}
