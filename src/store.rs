//! SQLite-backed key-value store for orchestrator metadata
//!
//! Keyspace:
//! - `vm/<id>` -> pool record (uuid, reserved port, config digest)
//! - `vm/<id>/snap/<name>` -> snapshot metadata
//! - `vm/<id>/decision/<ts>` -> scaling decisions, capped by history bound

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Persisted pool record for one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolRecord {
    pub uuid: String,
    pub reserved_port: u16,
    pub config_digest: String,
}

/// Key-value store over a single SQLite table.
pub struct MetaStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetaStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    /// All `(key, value)` pairs under a prefix, key-ordered.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
        // '\u{10FFFF}' sorts after every key that shares the prefix
        let upper = format!("{}\u{10FFFF}", prefix);
        let rows = stmt
            .query_map(params![prefix, upper], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete oldest keys under `prefix` until at most `cap` remain.
    pub fn truncate_prefix(&self, prefix: &str, cap: usize) -> Result<usize> {
        let entries = self.scan_prefix(prefix)?;
        let mut removed = 0;
        if entries.len() > cap {
            for (key, _) in &entries[..entries.len() - cap] {
                if self.delete(key)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    // ===== Typed helpers =====

    pub fn put_pool_record(&self, id: u32, record: &PoolRecord) -> Result<()> {
        self.put(&format!("vm/{id}"), &serde_json::to_string(record)?)
    }

    pub fn get_pool_record(&self, id: u32) -> Result<Option<PoolRecord>> {
        match self.get(&format!("vm/{id}"))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn delete_pool_record(&self, id: u32) -> Result<bool> {
        self.delete(&format!("vm/{id}"))
    }

    /// All persisted pool records as `(id, record)`.
    pub fn all_pool_records(&self) -> Result<Vec<(u32, PoolRecord)>> {
        let mut records = Vec::new();
        for (key, value) in self.scan_prefix("vm/")? {
            // skip nested keys like vm/1/snap/...
            let rest = &key["vm/".len()..];
            if let Ok(id) = rest.parse::<u32>() {
                if let Ok(record) = serde_json::from_str(&value) {
                    records.push((id, record));
                }
            }
        }
        Ok(records)
    }

    pub fn close(self) {
        // Connection closes on drop; kept for interface symmetry.
    }
}

impl Clone for MetaStore {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MetaStore::in_memory().unwrap();
        assert_eq!(store.get("vm/1").unwrap(), None);
        store.put("vm/1", "a").unwrap();
        assert_eq!(store.get("vm/1").unwrap(), Some("a".to_string()));
        store.put("vm/1", "b").unwrap();
        assert_eq!(store.get("vm/1").unwrap(), Some("b".to_string()));
        assert!(store.delete("vm/1").unwrap());
        assert!(!store.delete("vm/1").unwrap());
    }

    #[test]
    fn test_scan_prefix_ordered() {
        let store = MetaStore::in_memory().unwrap();
        store.put("vm/1/decision/002", "b").unwrap();
        store.put("vm/1/decision/001", "a").unwrap();
        store.put("vm/2/decision/001", "x").unwrap();
        let entries = store.scan_prefix("vm/1/decision/").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, "a");
        assert_eq!(entries[1].1, "b");
    }

    #[test]
    fn test_truncate_prefix() {
        let store = MetaStore::in_memory().unwrap();
        for i in 0..10 {
            store.put(&format!("vm/1/decision/{i:03}"), "d").unwrap();
        }
        let removed = store.truncate_prefix("vm/1/decision/", 4).unwrap();
        assert_eq!(removed, 6);
        let remaining = store.scan_prefix("vm/1/decision/").unwrap();
        assert_eq!(remaining.len(), 4);
        assert_eq!(remaining[0].0, "vm/1/decision/006");
    }

    #[test]
    fn test_pool_record_round_trip() {
        let store = MetaStore::in_memory().unwrap();
        let record = PoolRecord {
            uuid: "abc".to_string(),
            reserved_port: 5901,
            config_digest: "deadbeef".to_string(),
        };
        store.put_pool_record(7, &record).unwrap();
        assert_eq!(store.get_pool_record(7).unwrap(), Some(record.clone()));

        // nested keys must not confuse record enumeration
        store.put("vm/7/snap/s1", "{}").unwrap();
        let all = store.all_pool_records().unwrap();
        assert_eq!(all, vec![(7, record)]);

        assert!(store.delete_pool_record(7).unwrap());
        assert_eq!(store.get_pool_record(7).unwrap(), None);
    }
}
