//! SQLite persistent tier for raw tag dumps

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::dump::RawTagDump;

const SCHEMA_VERSION: i32 = 1;

/// A dump row from the persistent tier
pub struct StoredDump {
    pub dump: RawTagDump,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

/// Persistent dump store
///
/// The connection sits behind a mutex so the tier can be shared; the cache
/// facade already serializes writes, the mutex only satisfies `Sync`.
pub struct PersistentTier {
    db: Mutex<Connection>,
    capacity_entries: usize,
}

impl PersistentTier {
    /// Open or create the store under `dir`
    pub fn open(dir: &Path, capacity_entries: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        let db_path = dir.join("tag_cache.db");

        // A corrupt file can fail at open or at schema init; either way it
        // is backed up and recreated rather than failing the caller
        let mut db = match Self::open_db(&db_path) {
            Ok(db) => db,
            Err(e) => {
                eprintln!(
                    "Warning: Failed to open tag cache: {}. Attempting recovery...",
                    e
                );
                Self::recover(&db_path)?
            }
        };

        if let Err(e) = Self::init_schema(&mut db) {
            eprintln!(
                "Warning: Failed to initialize tag cache schema: {}. Attempting recovery...",
                e
            );
            db = Self::recover(&db_path)?;
            Self::init_schema(&mut db)
                .with_context(|| "Failed to initialize schema after recovery")?;
        }

        Ok(Self {
            db: Mutex::new(db),
            capacity_entries,
        })
    }

    fn open_db(db_path: &PathBuf) -> Result<Connection> {
        let db = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        // WAL allows concurrent readers while one writer is active
        db.pragma_update(None, "journal_mode", "WAL")
            .with_context(|| "Failed to enable WAL mode")?;
        db.busy_timeout(std::time::Duration::from_secs(30))
            .with_context(|| "Failed to set busy timeout")?;
        Ok(db)
    }

    /// Back up the corrupt file and open a fresh database in its place
    fn recover(db_path: &PathBuf) -> Result<Connection> {
        let backup_path = db_path.with_extension("db.backup");
        let _ = std::fs::copy(db_path, &backup_path);
        let _ = std::fs::remove_file(db_path);
        Self::open_db(db_path)
    }

    fn init_schema(db: &mut Connection) -> Result<()> {
        let version: i32 = db
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .or_else(|_| {
                db.execute(
                    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
                    [],
                )?;
                db.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
                Ok::<i32, rusqlite::Error>(0)
            })?;

        if version < SCHEMA_VERSION {
            Self::migrate_schema(db, version)?;
        }

        Ok(())
    }

    fn migrate_schema(db: &mut Connection, from_version: i32) -> Result<()> {
        let tx = db
            .transaction()
            .with_context(|| "Failed to start migration transaction")?;

        if from_version == 0 {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS tag_dumps (
                    uid_hex TEXT PRIMARY KEY,
                    bytes BLOB NOT NULL,
                    authenticated_sectors TEXT,
                    created_at INTEGER NOT NULL,
                    last_accessed_at INTEGER NOT NULL
                )",
                [],
            )
            .with_context(|| "Failed to create tag_dumps table")?;

            tx.execute(
                "CREATE INDEX IF NOT EXISTS idx_last_accessed ON tag_dumps(last_accessed_at)",
                [],
            )
            .with_context(|| "Failed to create last_accessed index")?;

            tx.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION])
                .with_context(|| "Failed to update schema version")?;
        }

        tx.commit()
            .with_context(|| "Failed to commit migration transaction")?;
        Ok(())
    }

    /// Insert or refresh a dump, then enforce the entry capacity by
    /// dropping oldest-by-last-access rows
    pub fn put(&self, dump: &RawTagDump, authenticated_sectors: Option<&[usize]>) -> Result<()> {
        let now = Utc::now().timestamp();
        let sectors_json = match authenticated_sectors {
            Some(sectors) => Some(serde_json::to_string(sectors)?),
            None => None,
        };
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "INSERT INTO tag_dumps (uid_hex, bytes, authenticated_sectors, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(uid_hex) DO UPDATE SET
                 bytes = excluded.bytes,
                 authenticated_sectors = excluded.authenticated_sectors,
                 last_accessed_at = excluded.last_accessed_at",
            params![dump.uid_hex(), dump.bytes(), sectors_json, now],
        )
        .with_context(|| format!("Failed to store dump for {}", dump.uid_hex()))?;

        Self::enforce_capacity(&db, self.capacity_entries)?;
        Ok(())
    }

    /// Fetch a dump and bump its last access time.
    ///
    /// A row that fails to deserialize is corrupt: it is deleted and
    /// reported as a miss, never as an error.
    pub fn get(&self, uid_hex: &str) -> Result<Option<StoredDump>> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let lookup = db
            .query_row(
                "SELECT bytes, created_at, last_accessed_at FROM tag_dumps WHERE uid_hex = ?1",
                [uid_hex],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional();

        let row = match lookup {
            Ok(row) => row,
            Err(_) => {
                // Undeserializable row: clear it and treat as empty cache
                let _ = db.execute("DELETE FROM tag_dumps WHERE uid_hex = ?1", [uid_hex]);
                None
            }
        };

        let Some((bytes, created_at, last_accessed_at)) = row else {
            return Ok(None);
        };

        let now = Utc::now().timestamp();
        db.execute(
            "UPDATE tag_dumps SET last_accessed_at = ?1 WHERE uid_hex = ?2",
            params![now, uid_hex],
        )
        .with_context(|| format!("Failed to touch dump for {}", uid_hex))?;

        Ok(Some(StoredDump {
            dump: RawTagDump::new(uid_hex, bytes),
            created_at,
            last_accessed_at,
        }))
    }

    /// JSON-decoded authenticated sector list stored alongside a dump
    pub fn authenticated_sectors(&self, uid_hex: &str) -> Result<Option<Vec<usize>>> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let json: Option<Option<String>> = db
            .query_row(
                "SELECT authenticated_sectors FROM tag_dumps WHERE uid_hex = ?1",
                [uid_hex],
                |row| row.get(0),
            )
            .optional()?;
        match json.flatten() {
            Some(json) => match serde_json::from_str(&json) {
                Ok(sectors) => Ok(Some(sectors)),
                // Corrupt column: clear it and report absent
                Err(_) => {
                    let _ = db.execute(
                        "UPDATE tag_dumps SET authenticated_sectors = NULL WHERE uid_hex = ?1",
                        [uid_hex],
                    );
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn remove(&self, uid_hex: &str) -> Result<bool> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let removed = db.execute("DELETE FROM tag_dumps WHERE uid_hex = ?1", [uid_hex])?;
        Ok(removed > 0)
    }

    pub fn clear(&self) -> Result<usize> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.execute("DELETE FROM tag_dumps", [])?)
    }

    pub fn len(&self) -> Result<usize> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = db.query_row("SELECT COUNT(*) FROM tag_dumps", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove rows whose last access is older than `ttl_seconds`
    pub fn sweep_expired(&self, ttl_seconds: i64) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - ttl_seconds;
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let removed = db.execute(
            "DELETE FROM tag_dumps WHERE last_accessed_at < ?1",
            [cutoff],
        )?;
        Ok(removed)
    }

    fn enforce_capacity(db: &Connection, capacity_entries: usize) -> Result<()> {
        let count: i64 = db.query_row("SELECT COUNT(*) FROM tag_dumps", [], |row| row.get(0))?;
        if count as usize <= capacity_entries {
            return Ok(());
        }
        let excess = count - capacity_entries as i64;
        db.execute(
            "DELETE FROM tag_dumps WHERE uid_hex IN (
                 SELECT uid_hex FROM tag_dumps ORDER BY last_accessed_at ASC LIMIT ?1
             )",
            [excess],
        )
        .with_context(|| "Failed to enforce persistent tier capacity")?;
        Ok(())
    }
}
