mod test_support;

use std::collections::HashSet;

use gradeimportd::config::IngestConfig;
use gradeimportd::decode::SourceEncoding;
use gradeimportd::error::{IngestError, RowErrorKind, WarningKind};
use gradeimportd::record::ActivityType;
use gradeimportd::report::ProgressSnapshot;
use gradeimportd::storage::{
    MemoryRemote, MemoryStore, StorageManager, StorageMode, StorageOptions,
    DEFAULT_LOCAL_BUDGET_BYTES,
};
use gradeimportd::Pipeline;
use test_support::{directory, fixture_bytes, santiago, HEADER};

fn quiet_config() -> IngestConfig {
    IngestConfig {
        pause_ms: 0,
        retry_delay_ms: 0,
        ..IngestConfig::default()
    }
}

fn manager() -> StorageManager {
    StorageManager::open(
        Box::new(MemoryStore::with_budget(DEFAULT_LOCAL_BUDGET_BYTES)),
        Some(Box::new(MemoryRemote::new())),
        StorageOptions::default(),
    )
    .expect("open storage")
}

fn no_progress(_: &ProgressSnapshot) {}

#[test]
fn three_row_file_stores_one_and_explains_two() {
    let dir = directory();
    let pipeline = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());
    let mut storage = manager();

    let report = pipeline
        .run("job-1", &fixture_bytes("grades_three_rows.csv"), &mut storage, &no_progress)
        .expect("run");

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.rows_read, 3);
    assert_eq!(
        report
            .errors
            .iter()
            .map(|e| (e.row, e.kind))
            .collect::<Vec<_>>(),
        vec![
            (2, RowErrorKind::IdentityUnresolved),
            (3, RowErrorKind::FieldInvalid)
        ]
    );
    assert_eq!(report.final_storage_mode, StorageMode::Normal);
    assert!(!report.detail_lost);
    assert_eq!(report.encoding, Some(SourceEncoding::Utf8));

    let stored = storage.read_all().expect("read back").full;
    assert_eq!(stored.len(), 1);
    let r = &stored[0];
    assert_eq!(r.student_id, "student-ana");
    assert_eq!(r.teacher_id, "teacher-rosa");
    assert_eq!(r.course_id, "course-4b");
    assert_eq!(r.section_id, "section-4b-a");
    assert_eq!(r.subject_code, "MAT");
    assert_eq!(r.date, "2025-03-05");
    assert_eq!(r.semester, 1);
    assert_eq!(r.year, 2025);
    assert_eq!(r.grade, 6.5);
    assert_eq!(r.activity_type, ActivityType::Evaluation);
    assert_eq!(r.source_row, 1);
}

#[test]
fn reingesting_the_same_file_adds_nothing() {
    let dir = directory();
    let pipeline = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());
    let mut storage = manager();
    let bytes = fixture_bytes("grades_three_rows.csv");

    let first = pipeline.run("job-1", &bytes, &mut storage, &no_progress).expect("first run");
    let ids_after_first = storage.ids().ids;
    let second = pipeline.run("job-2", &bytes, &mut storage, &no_progress).expect("second run");

    assert_eq!(first.succeeded, 1);
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.duplicates_skipped, 1);
    assert_eq!(second.failed, 2);
    assert_eq!(storage.ids().ids, ids_after_first);
    assert_eq!(storage.read_all().expect("read back").len(), 1);
}

#[test]
fn preview_reports_tiers_and_every_rejection() {
    let dir = directory();
    let pipeline = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());

    let preview = pipeline
        .preview(&fixture_bytes("grades_tiers.csv"), &HashSet::new())
        .expect("preview");

    assert_eq!(preview.rows_read, 8);
    assert_eq!(preview.rows_ok, 4);
    assert_eq!(preview.tiers.exact, 3);
    assert_eq!(preview.tiers.course_only, 0);
    assert_eq!(preview.tiers.subject_only, 1);
    assert_eq!(
        preview
            .errors
            .iter()
            .map(|e| (e.row, e.kind))
            .collect::<Vec<_>>(),
        vec![
            (5, RowErrorKind::IdentityUnresolved),
            (6, RowErrorKind::FieldInvalid),
            (7, RowErrorKind::RowParseError),
            (8, RowErrorKind::RowParseError),
        ]
    );
    let history = preview.rows.iter().find(|r| r.row == 3).expect("row 3");
    assert_eq!(history.teacher_id.as_deref(), Some("teacher-marta"));
}

#[test]
fn mixed_spellings_resolve_to_the_same_catalogue_ids() {
    let dir = directory();
    let pipeline = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());
    let mut storage = manager();

    let report = pipeline
        .run("job-tiers", &fixture_bytes("grades_tiers.csv"), &mut storage, &no_progress)
        .expect("run");
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 4);

    let stored = storage.read_all().expect("read back").full;
    let by_row = |row: usize| {
        stored
            .iter()
            .find(|r| r.source_row == row)
            .unwrap_or_else(|| panic!("row {} stored", row))
    };

    let homework = by_row(1);
    assert_eq!(homework.activity_type, ActivityType::Assignment);
    assert_eq!(homework.semester, 2);

    let comma_grade = by_row(2);
    assert_eq!(comma_grade.teacher_id, "teacher-jorge");
    assert_eq!(comma_grade.section_id, "section-4b-b");
    assert_eq!(comma_grade.grade, 88.5);
    assert_eq!(comma_grade.date, "2025-08-12");

    let timestamped = by_row(3);
    assert_eq!(timestamped.date, "2025-04-02");
    assert_eq!(timestamped.semester, 1);
    assert_eq!(timestamped.subject_code, "HIS");

    let language = by_row(4);
    assert_eq!(language.subject_code, "LEN");
    assert_eq!(language.course_id, "course-1m");
    assert_eq!(language.section_id, "section-1m-a");
}

#[test]
fn windows_1252_export_is_read_without_mojibake() {
    let dir = directory();
    let pipeline = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());
    let mut storage = manager();

    let report = pipeline
        .run("job-cp1252", &fixture_bytes("grades_windows1252.csv"), &mut storage, &no_progress)
        .expect("run");

    assert_eq!(report.encoding, Some(SourceEncoding::Windows1252));
    assert_eq!(report.succeeded, 2);
    assert!(report
        .warnings
        .iter()
        .all(|w| w.kind != WarningKind::DecodingAmbiguous));
    let names = storage
        .read_all()
        .expect("read back")
        .full
        .into_iter()
        .map(|r| r.student_name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Ana Pérez", "Benjamín Soto"]);
}

#[test]
fn header_without_required_columns_stops_the_run() {
    let dir = directory();
    let pipeline = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());
    let mut storage = manager();

    let err = pipeline
        .run("job-bad", &fixture_bytes("grades_bad_header.csv"), &mut storage, &no_progress)
        .expect_err("bad header");
    match err {
        IngestError::HeaderInvalid { missing } => assert_eq!(missing, vec!["rut", "fecha"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(storage.read_all().expect("read back").is_empty());
}

#[test]
fn file_with_no_usable_rows_is_a_hard_failure() {
    let dir = directory();
    let pipeline = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());
    let mut storage = manager();
    let csv = format!(
        "{HEADER}\nNadie,1-9,4° Básico,A,Matemáticas,evaluacion,05-03-2025,6,x\n"
    );

    let err = pipeline
        .run("job-empty", csv.as_bytes(), &mut storage, &no_progress)
        .expect_err("nothing to store");
    assert!(matches!(
        err,
        IngestError::NoRecordsProduced {
            rows_read: 1,
            rejected: 1
        }
    ));
    assert_eq!(err.code(), "no_records");
}

#[test]
fn unparseable_date_is_kept_with_a_warning_unless_rejection_is_configured() {
    let dir = directory();
    let csv = format!(
        "{HEADER}\nAna Pérez,12.345.678-5,4° Básico,A,Matemáticas,evaluacion,algún día,6,x\n"
    );

    let lenient = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());
    let report = lenient
        .run("job-lenient", csv.as_bytes(), &mut manager(), &no_progress)
        .expect("run");
    assert_eq!(report.succeeded, 1);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::DateAmbiguous && w.row == Some(1)));

    let strict_config = IngestConfig {
        date_fallback: gradeimportd::dates::DateFallback::Reject,
        ..quiet_config()
    };
    let strict = Pipeline::new(&dir, strict_config).with_date_context(santiago());
    let err = strict
        .run("job-strict", csv.as_bytes(), &mut manager(), &no_progress)
        .expect_err("row rejected");
    assert_eq!(err.code(), "no_records");
}

#[test]
fn preview_flags_rows_a_run_would_skip() {
    let dir = directory();
    let pipeline = Pipeline::new(&dir, quiet_config()).with_date_context(santiago());
    let mut storage = manager();
    let bytes = fixture_bytes("grades_three_rows.csv");
    pipeline.run("job-1", &bytes, &mut storage, &no_progress).expect("run");

    let preview = pipeline
        .preview(&bytes, &storage.ids().ids)
        .expect("preview");
    assert_eq!(preview.duplicates, 1);
    assert!(preview.rows.iter().any(|r| r.row == 1 && r.duplicate));
}
