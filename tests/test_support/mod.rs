#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{FixedOffset, TimeZone};
use gradeimportd::dates::DateContext;
use gradeimportd::directory::DirectorySnapshot;

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name)
}

pub fn fixture_bytes(name: &str) -> Vec<u8> {
    std::fs::read(fixture_path(name)).expect("read fixture")
}

pub fn directory() -> DirectorySnapshot {
    DirectorySnapshot::load(&fixture_path("directory.json")).expect("load directory fixture")
}

/// Santiago summer time, pinned so calendar days do not depend on the host.
pub fn santiago() -> DateContext {
    let offset = FixedOffset::west_opt(3 * 3600).expect("offset");
    let now = offset
        .with_ymd_and_hms(2025, 10, 1, 12, 0, 0)
        .single()
        .expect("now");
    DateContext::new(offset, now)
}

pub const HEADER: &str = "nombre,rut,curso,seccion,asignatura,tipo,fecha,nota,tema";

/// `n` valid rows for Ana, one per day starting 2025-03-01, with a padded topic.
pub fn ana_rows(n: usize, topic_len: usize) -> String {
    let topic = "x".repeat(topic_len);
    let mut out = String::from(HEADER);
    out.push('\n');
    for i in 0..n {
        let day = chrono::NaiveDate::from_ymd_opt(2025, 3, 1).expect("date")
            + chrono::Duration::days(i as i64);
        out.push_str(&format!(
            "Ana Pérez,12.345.678-5,4° Básico,A,Matemáticas,evaluacion,{},{},{}\n",
            day.format("%d-%m-%Y"),
            50 + (i % 50),
            topic
        ));
    }
    out
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradeimportd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradeimportd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_default()
}

pub fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}
