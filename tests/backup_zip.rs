mod test_support;

use std::fs::File;
use std::io::{Read, Write};

use gradeimportd::backup;
use gradeimportd::db::DB_FILE;
use gradeimportd::storage::REMOTE_DB_FILE;
use test_support::temp_dir;

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("gradeimport-backup-src");
    let workspace2 = temp_dir("gradeimport-backup-dst");
    let out_dir = temp_dir("gradeimport-backup-out");

    std::fs::write(workspace.join(DB_FILE), b"workspace-db-payload").expect("write db");
    std::fs::write(workspace.join(REMOTE_DB_FILE), b"remote-db-payload").expect("write remote");

    let bundle_path = out_dir.join("workspace.gradeimport.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], backup::BUNDLE_FORMAT_V1);
    assert_eq!(manifest["entries"].as_array().map(|a| a.len()), Some(2));

    // A stale remote DB in the target must not survive the restore.
    std::fs::write(workspace2.join(REMOTE_DB_FILE), b"stale").expect("write stale");
    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    assert_eq!(import.files_restored.len(), 2);

    assert_eq!(
        std::fs::read(workspace2.join(DB_FILE)).expect("restored db"),
        b"workspace-db-payload"
    );
    assert_eq!(
        std::fs::read(workspace2.join(REMOTE_DB_FILE)).expect("restored remote"),
        b"remote-db-payload"
    );

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn bundle_without_remote_db_removes_the_old_one() {
    let workspace = temp_dir("gradeimport-backup-local-only");
    let target = temp_dir("gradeimport-backup-local-only-dst");
    std::fs::write(workspace.join(DB_FILE), b"only-local").expect("write db");
    std::fs::write(target.join(REMOTE_DB_FILE), b"stale").expect("write stale");

    let bundle = workspace.join("bundle.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle).expect("export");
    assert_eq!(export.entry_count, 2);
    backup::import_workspace_bundle(&bundle, &target).expect("import");

    assert!(!target.join(REMOTE_DB_FILE).exists());
    assert_eq!(std::fs::read(target.join(DB_FILE)).expect("db"), b"only-local");

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(target);
}

#[test]
fn tampered_entry_is_rejected_and_live_files_are_kept() {
    let out_dir = temp_dir("gradeimport-backup-tampered");
    let workspace = temp_dir("gradeimport-backup-tampered-dst");
    std::fs::write(workspace.join(DB_FILE), b"live").expect("write live db");

    let bundle = out_dir.join("tampered.zip");
    {
        let mut zip = zip::ZipWriter::new(File::create(&bundle).expect("create bundle"));
        let opts = zip::write::FileOptions::default();
        let manifest = serde_json::json!({
            "format": backup::BUNDLE_FORMAT_V1,
            "version": 1,
            "appVersion": "0.0.0",
            "exportedAt": "2025-01-01T00:00:00Z",
            "sourceWorkspace": "/elsewhere",
            "entries": [{
                "path": format!("db/{}", DB_FILE),
                "file": DB_FILE,
                "bytes": 8,
                "sha256": "0000000000000000000000000000000000000000000000000000000000000000"
            }]
        });
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(manifest.to_string().as_bytes()).expect("write manifest");
        zip.start_file(format!("db/{}", DB_FILE), opts).expect("db entry");
        zip.write_all(b"tampered").expect("write db");
        zip.finish().expect("finish");
    }

    let err = backup::import_workspace_bundle(&bundle, &workspace).expect_err("checksum mismatch");
    assert!(err.to_string().contains("checksum mismatch"));
    assert_eq!(std::fs::read(workspace.join(DB_FILE)).expect("live db"), b"live");

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bare_sqlite_file_restores_the_workspace_db() {
    let out_dir = temp_dir("gradeimport-backup-bare");
    let workspace = temp_dir("gradeimport-backup-bare-dst");

    let bare = out_dir.join("copy.sqlite3");
    std::fs::write(&bare, b"bare-sqlite-copy").expect("write bare file");

    let import = backup::import_workspace_bundle(&bare, &workspace).expect("import bare sqlite");
    assert_eq!(import.bundle_format_detected, "sqlite3");
    assert_eq!(
        std::fs::read(workspace.join(DB_FILE)).expect("restored"),
        b"bare-sqlite-copy"
    );

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
