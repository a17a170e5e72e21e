use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

pub const DB_FILE: &str = "gradeimport.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Local key/value area the storage ladder writes into.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_store(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_jobs(
            id TEXT PRIMARY KEY,
            source_name TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            report_json TEXT
        )",
        [],
    )?;
    ensure_import_jobs_source_sha256(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_jobs_started ON import_jobs(started_at)",
        [],
    )?;

    Ok(conn)
}

// Jobs recorded before content hashing have no source_sha256.
fn ensure_import_jobs_source_sha256(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "import_jobs", "source_sha256")? {
        conn.execute("ALTER TABLE import_jobs ADD COLUMN source_sha256 TEXT", [])?;
    }
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub source_name: String,
    pub source_sha256: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub report: Option<Value>,
}

pub fn job_start(
    conn: &Connection,
    id: &str,
    source_name: &str,
    source_sha256: &str,
    started_at: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO import_jobs(id, source_name, source_sha256, started_at, status)
         VALUES(?, ?, ?, ?, 'running')",
        params![id, source_name, source_sha256, started_at],
    )?;
    Ok(())
}

pub fn job_finish(
    conn: &Connection,
    id: &str,
    status: &str,
    finished_at: &str,
    report: &Value,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET status = ?, finished_at = ?, report_json = ? WHERE id = ?",
        params![status, finished_at, serde_json::to_string(report)?, id],
    )?;
    Ok(())
}

fn job_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(JobRow, Option<String>)> {
    Ok((
        JobRow {
            id: r.get(0)?,
            source_name: r.get(1)?,
            source_sha256: r.get(2)?,
            started_at: r.get(3)?,
            finished_at: r.get(4)?,
            status: r.get(5)?,
            report: None,
        },
        r.get(6)?,
    ))
}

pub fn job_get(conn: &Connection, id: &str) -> anyhow::Result<Option<JobRow>> {
    let found = conn
        .query_row(
            "SELECT id, source_name, source_sha256, started_at, finished_at, status, report_json
             FROM import_jobs WHERE id = ?",
            [id],
            job_from_row,
        )
        .optional()?;
    let Some((mut job, report_json)) = found else {
        return Ok(None);
    };
    if let Some(s) = report_json {
        job.report = Some(serde_json::from_str(&s)?);
    }
    Ok(Some(job))
}

/// Most recent first, without report bodies.
pub fn job_list(conn: &Connection, limit: usize) -> anyhow::Result<Vec<JobRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, source_name, source_sha256, started_at, finished_at, status, NULL
         FROM import_jobs ORDER BY started_at DESC, id LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit as i64], job_from_row)?
        .map(|r| r.map(|(job, _)| job))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
