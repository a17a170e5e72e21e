use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::record::CanonicalRecord;

use super::{entry_cost, LocalStore, RemoteStore};

pub const REMOTE_DB_FILE: &str = "remote.sqlite3";

/// [`LocalStore`] over the workspace `kv_store` table.
pub struct SqliteStore {
    conn: Connection,
    budget: usize,
}

impl SqliteStore {
    pub fn open(db_path: &Path, budget: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store(
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT
            )",
            [],
        )?;
        Ok(Self { conn, budget })
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM kv_store WHERE key = ?", [key], |r| {
                r.get::<_, String>(0)
            })
            .optional()?)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let current = self.get(key)?.map(|v| entry_cost(key, &v)).unwrap_or(0);
        let used = self.used_bytes()?.saturating_sub(current);
        let needed = entry_cost(key, value);
        if used + needed > self.budget {
            return Err(StoreError::CapacityExceeded {
                needed,
                available: self.budget.saturating_sub(used),
            });
        }
        self.conn.execute(
            "INSERT INTO kv_store(key, value, updated_at) VALUES(?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv_store WHERE key = ?", [key])?;
        Ok(())
    }

    fn used_bytes(&self) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM kv_store",
            [],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    fn budget_bytes(&self) -> usize {
        self.budget
    }
}

/// [`RemoteStore`] in its own database file; one transaction per batch.
pub struct SqliteRemote {
    conn: Connection,
}

impl SqliteRemote {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::RemoteUnavailable(e.to_string()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS remote_records(
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                migrated_at TEXT NOT NULL,
                PRIMARY KEY(collection, id)
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    pub fn open_in_workspace(workspace: &Path) -> Result<Self, StoreError> {
        Self::open(&workspace.join(REMOTE_DB_FILE))
    }
}

impl RemoteStore for SqliteRemote {
    fn migrate_batch(&mut self, collection: &str, records: &[CanonicalRecord]) -> Result<(), StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO remote_records(collection, id, body, migrated_at) VALUES(?, ?, ?, ?)
                 ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body, migrated_at = excluded.migrated_at",
            )?;
            for r in records {
                let body = serde_json::to_string(r).map_err(|e| StoreError::Backend(e.to_string()))?;
                stmt.execute(params![collection, r.id, body, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read_all(&self, collection: &str) -> Result<Vec<CanonicalRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM remote_records WHERE collection = ? ORDER BY id")?;
        let rows = stmt
            .query_map([collection], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, body)| {
                serde_json::from_str(&body).map_err(|e| StoreError::Corrupt {
                    key: format!("{}/{}", collection, id),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    fn ids(&self, collection: &str) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM remote_records WHERE collection = ?")?;
        let ids = stmt
            .query_map([collection], |r| r.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM remote_records WHERE collection = ?",
            [collection],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn kv_budget_counts_bytes() {
        let dir = temp_dir("gradeimportd-kv");
        let mut s = SqliteStore::open(&dir.join("kv.sqlite3"), 16).expect("open");
        s.set("k", "ñ").expect("fits");
        assert_eq!(s.used_bytes().expect("used"), 3);
        assert!(matches!(
            s.set("other", "0123456789abcdef"),
            Err(StoreError::CapacityExceeded { .. })
        ));
        s.remove("k").expect("remove");
        assert_eq!(s.get("k").expect("get"), None);
    }

    #[test]
    fn remote_upserts_by_id() {
        let dir = temp_dir("gradeimportd-remote");
        let mut r = SqliteRemote::open_in_workspace(&dir).expect("open");
        let mut rec = CanonicalRecord {
            id: "grade-1".into(),
            grade: 50.0,
            ..CanonicalRecord::default()
        };
        r.migrate_batch("c", std::slice::from_ref(&rec)).expect("first");
        rec.grade = 70.0;
        r.migrate_batch("c", std::slice::from_ref(&rec)).expect("second");
        let all = r.read_all("c").expect("read");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].grade, 70.0);
        assert_eq!(r.count("c").expect("count"), 1);
        assert_eq!(r.ids("c").expect("ids"), HashSet::from(["grade-1".to_string()]));
        assert_eq!(r.count("other").expect("count"), 0);
    }
}
