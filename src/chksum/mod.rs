// pgkeeper/src/chksum/mod.rs
//
// Per-directory checksum manifests. Each finalized backup carries a
// `checksums.txt` with one line per file:
//
//   <hex-sha256>  <slash-relative-path>
//
// The manifest is written while the directory is still in staging, so a
// finalized backup is always self-describing.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::errors::{AppError, Result};

pub const CHECKSUMS_FILE_NAME: &str = "checksums.txt";

/// Computes hashes for every file under `root` (except the manifest itself)
/// and writes the manifest into `root`.
pub fn write_checksums_file(root: &Path) -> Result<()> {
    let checksums = collect_checksums(root)?;

    let mut file = File::create(root.join(CHECKSUMS_FILE_NAME))?;
    for (rel_path, digest) in &checksums {
        writeln!(file, "{digest}  {rel_path}")?;
    }
    Ok(())
}

/// Re-walks `root` and compares against the stored manifest in both
/// directions: changed content, stray files and missing files all fail.
pub fn compare_checksums(root: &Path) -> Result<()> {
    let expected = read_checksums_file(&root.join(CHECKSUMS_FILE_NAME))?;
    let current = collect_checksums(root)?;

    if expected.len() != current.len() {
        return Err(AppError::Integrity(format!(
            "directory content mismatch under {}: manifest lists {} files, found {}",
            root.display(),
            expected.len(),
            current.len()
        )));
    }
    for (rel_path, digest) in &expected {
        match current.get(rel_path) {
            None => {
                return Err(AppError::Integrity(format!(
                    "missing file listed in manifest: {rel_path}"
                )))
            }
            Some(actual) if actual != digest => {
                return Err(AppError::Integrity(format!(
                    "checksum mismatch for file: {rel_path}"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn collect_checksums(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            AppError::Integrity(format!("cannot walk {}: {e}", root.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name() == std::ffi::OsStr::new(CHECKSUMS_FILE_NAME)
            && entry.path().parent() == Some(root)
        {
            continue;
        }

        let rel_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| AppError::Integrity(format!("bad path under manifest root: {e}")))?;
        let key = rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        checksums.insert(key, compute_checksum(entry.path())?);
    }
    Ok(checksums)
}

fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn read_checksums_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let file = File::open(path)?;
    let mut checksums = BTreeMap::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let (digest, rel_path) = line.split_once("  ").ok_or_else(|| {
            AppError::Integrity(format!("invalid manifest line: {line}"))
        })?;
        checksums.insert(rel_path.to_string(), digest.to_string());
    }
    Ok(checksums)
}
