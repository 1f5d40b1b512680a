//! End-to-end batch runs against stub PostgreSQL tools. The stubs honor the
//! same argument shapes as the real executables, so the whole staging →
//! rename → manifest lifecycle is exercised on a real filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use pgkeeper::backup::run_backup_flow;
use pgkeeper::chksum;
use pgkeeper::config::{Config, DumpConfig, DumpDatabase, RetentionConfig};
use pgkeeper::naming;

/// Installs stub pg_dump/pg_dumpall executables into `dir`.
fn install_fake_tools(dir: &Path, pg_dump_fails: bool) {
    fs::create_dir_all(dir).unwrap();

    let pg_dump = if pg_dump_fails {
        "#!/bin/sh\necho 'pg_dump: error: connection refused' >&2\nexit 1\n".to_string()
    } else {
        concat!(
            "#!/bin/sh\n",
            "out=''\n",
            "for arg in \"$@\"; do\n",
            "  case \"$arg\" in\n",
            "    --file=*) out=\"${arg#--file=}\" ;;\n",
            "  esac\n",
            "done\n",
            "mkdir -p \"$out\"\n",
            "printf 'directory-format-dump' > \"$out/0001.dat\"\n",
            "printf 'toc' > \"$out/toc.dat\"\n",
            "echo 'pg_dump: dumping contents' >&2\n",
            "exit 0\n",
        )
        .to_string()
    };
    write_executable(&dir.join("pg_dump"), &pg_dump);

    let pg_dumpall = concat!(
        "#!/bin/sh\n",
        "echo '-- roles'\n",
        "echo 'CREATE ROLE app;'\n",
        "echo 'pg_dumpall: dumping globals' >&2\n",
        "exit 0\n",
    );
    write_executable(&dir.join("pg_dumpall"), pg_dumpall);
}

fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn test_config(dest: &Path, tools: &Path) -> Config {
    Config {
        dest: dest.to_path_buf(),
        print_dump_logs: false,
        logger: Default::default(),
        dump: DumpConfig {
            enable: true,
            max_concurrency: 2,
            dump_globals: true,
            create_restore_script: true,
            databases: vec![DumpDatabase {
                host: "db.example.com".into(),
                port: 5432,
                username: "backup".into(),
                password: "secret".into(),
                dbname: "app".into(),
                opts: Default::default(),
                schemas: vec![],
                exclude_schemas: vec![],
                tables: vec![],
                exclude_tables: vec![],
                jobs: 2,
                pg_bin_path: Some(tools.to_path_buf()),
            }],
        },
        base: Default::default(),
        retention: Default::default(),
        upload: Default::default(),
        notify: Default::default(),
    }
}

fn list_entries(dest: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dest)
        .map(|iter| {
            iter.filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| n.ends_with(suffix))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn happy_logical_dump_produces_finalized_layout() {
    let root = tempfile::tempdir().unwrap();
    let dest = root.path().join("backups");
    let tools = root.path().join("bin");
    install_fake_tools(&tools, false);

    let cfg = test_config(&dest, &tools);
    let outcome = run_backup_flow(&cfg).await.unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.failed_count(), 0);

    // Exactly one finalized entry, no staging residue.
    let dmp = list_entries(&dest, ".dmp");
    assert_eq!(dmp.len(), 1, "expected one .dmp entry, got {dmp:?}");
    assert!(list_entries(&dest, ".dirty").is_empty());

    let name = naming::BackupName::parse(&dmp[0]).unwrap();
    assert_eq!(name.host, "db.example.com");
    assert_eq!(name.port, 5432);
    assert_eq!(name.dbname, "app");

    let backup_dir = dest.join(&dmp[0]);
    assert!(backup_dir.join("data/0001.dat").is_file());
    assert!(backup_dir.join("dump.log").is_file());
    assert!(backup_dir.join("globals.sql").is_file());
    assert!(backup_dir.join("restore.sh").is_file());
    assert!(backup_dir.join("checksums.txt").is_file());

    // The manifest covers everything in the directory, including the extras.
    chksum::compare_checksums(&backup_dir).unwrap();

    let globals = fs::read_to_string(backup_dir.join("globals.sql")).unwrap();
    assert!(globals.contains("CREATE ROLE app;"));

    let script = fs::read_to_string(backup_dir.join("restore.sh")).unwrap();
    assert!(script.contains("app_restore_"));

    let log = fs::read_to_string(backup_dir.join("dump.log")).unwrap();
    assert!(log.contains("pg_dump: dumping contents"));
    assert!(log.contains("pg_dumpall: dumping globals"));
}

#[tokio::test]
async fn failed_dump_leaves_residue_and_the_next_run_cleans_it() {
    let root = tempfile::tempdir().unwrap();
    let dest = root.path().join("backups");
    let tools = root.path().join("bin");

    // First run: the tool fails, the staging dir stays behind.
    install_fake_tools(&tools, true);
    let cfg = test_config(&dest, &tools);
    let outcome = run_backup_flow(&cfg).await.unwrap();
    assert_eq!(outcome.failed_count(), 1);
    let err = outcome.results[0].error.as_deref().unwrap();
    assert!(err.contains("connection refused"), "unexpected error: {err}");

    assert_eq!(list_entries(&dest, ".dirty").len(), 1);
    assert!(list_entries(&dest, ".dmp").is_empty());

    // Second run: the tool works again; the cleaner removes the residue and
    // a finalized entry appears.
    install_fake_tools(&tools, false);
    let outcome = run_backup_flow(&cfg).await.unwrap();
    assert_eq!(outcome.failed_count(), 0);

    assert!(list_entries(&dest, ".dirty").is_empty());
    assert_eq!(list_entries(&dest, ".dmp").len(), 1);
}

#[tokio::test]
async fn retention_keeps_one_entry_per_key() {
    let root = tempfile::tempdir().unwrap();
    let dest = root.path().join("backups");
    fs::create_dir_all(&dest).unwrap();

    // Three historical runs for one target, one for another.
    for stamp in ["20240101000000", "20240102000000", "20240103000000"] {
        let dir = dest.join(format!("{stamp}--db.example.com-5432--app.dmp"));
        fs::create_dir_all(dir.join("data")).unwrap();
        fs::write(dir.join("data/f"), b"x").unwrap();
    }
    let other = dest.join("20240102000000--db.example.com-5432--billing.dmp");
    fs::create_dir_all(&other).unwrap();

    let mut cfg = test_config(&dest, &PathBuf::from("/nonexistent"));
    cfg.dump.enable = false;
    cfg.retention = RetentionConfig {
        enable: true,
        period: "1h".into(),
        keep_last: 1,
    };

    let outcome = run_backup_flow(&cfg).await.unwrap();
    assert_eq!(outcome.results.len(), 0);

    let remaining = list_entries(&dest, ".dmp");
    assert_eq!(
        remaining,
        vec![
            "20240102000000--db.example.com-5432--billing.dmp".to_string(),
            "20240103000000--db.example.com-5432--app.dmp".to_string(),
        ]
    );
}

#[tokio::test]
async fn disabled_phases_do_nothing() {
    let root = tempfile::tempdir().unwrap();
    let dest = root.path().join("backups");

    let mut cfg = test_config(&dest, &PathBuf::from("/nonexistent"));
    cfg.dump.enable = false;

    let outcome = run_backup_flow(&cfg).await.unwrap();
    assert!(outcome.results.is_empty());
    // Nothing was created either.
    assert!(!dest.exists() || list_entries(&dest, ".dmp").is_empty());
}
