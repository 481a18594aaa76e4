//! Per-key state tables.
//!
//! The table is the stage-local materialization of a compacted changelog
//! topic; the stage replays the changelog into it before declaring ready.
//! Entries are created on the first event for a key and never deleted by
//! the engine.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use alembic_core::ProcessorConfig;

use crate::error::Result;

/// Key-value store for per-key projection state.
pub trait StateTable: Send {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()>;
}

/// Ephemeral table, selected by the `:in-memory:` storage sentinel.
#[derive(Default)]
pub struct MemoryTable {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateTable for MemoryTable {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Disk-backed table, one database file per consumer group.
pub struct SqliteTable {
    conn: Connection,
}

impl SqliteTable {
    pub fn open(dir: &Path, group: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(format!("{group}.db")))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }
}

impl StateTable for SqliteTable {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row("SELECT value FROM state WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Open the table selected by the configuration for a consumer group.
pub fn open_table(cfg: &ProcessorConfig, group: &str) -> Result<Box<dyn StateTable>> {
    if cfg.in_memory() {
        Ok(Box::new(MemoryTable::new()))
    } else {
        Ok(Box::new(SqliteTable::open(
            Path::new(&cfg.storage_path),
            group,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_table_get_put_overwrite() {
        let mut table = MemoryTable::new();
        assert!(table.get("k").unwrap().is_none());

        table.put("k", b"1").unwrap();
        assert_eq!(table.get("k").unwrap().unwrap(), b"1");

        table.put("k", b"2").unwrap();
        assert_eq!(table.get("k").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_sqlite_table_persists_across_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let mut table = SqliteTable::open(dir.path(), "p-group").unwrap();
            table.put("user-1", br#"{"count":3}"#).unwrap();
            table.put("user-1", br#"{"count":4}"#).unwrap();
        }

        let table = SqliteTable::open(dir.path(), "p-group").unwrap();
        assert_eq!(table.get("user-1").unwrap().unwrap(), br#"{"count":4}"#);
        assert!(table.get("user-2").unwrap().is_none());
    }

    #[test]
    fn test_groups_get_separate_files() {
        let dir = TempDir::new().unwrap();
        let mut a = SqliteTable::open(dir.path(), "a-group").unwrap();
        a.put("k", b"a").unwrap();

        let b = SqliteTable::open(dir.path(), "b-group").unwrap();
        assert!(b.get("k").unwrap().is_none());
    }

    #[test]
    fn test_in_memory_sentinel_leaves_no_artifacts() {
        let cfg = ProcessorConfig::new(vec!["b:9092".into()]);
        assert!(cfg.in_memory());

        let mut table = open_table(&cfg, "p-group").unwrap();
        table.put("k", b"v").unwrap();
        assert_eq!(table.get("k").unwrap().unwrap(), b"v");

        // No path is created for the sentinel.
        assert!(!Path::new(alembic_core::IN_MEMORY_STORAGE).exists());
    }

    #[test]
    fn test_open_table_selects_disk_backend() {
        let dir = TempDir::new().unwrap();
        let cfg = ProcessorConfig::new(vec!["b:9092".into()])
            .with_storage_path(dir.path().to_string_lossy());

        let mut table = open_table(&cfg, "p-group").unwrap();
        table.put("k", b"v").unwrap();
        drop(table);

        assert!(dir.path().join("p-group.db").exists());
    }
}
