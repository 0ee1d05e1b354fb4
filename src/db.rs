//! Link Database
//!
//! SQLite store mapping `(url, algo)` → digest at `{cache_root}/links.db`.
//! Rows are learned by proxy rules (primarily the npm learner) and never
//! evicted. WAL mode keeps concurrent readers off the writer's back; batch
//! inserts run in a transaction so a metadata batch lands whole or not at
//! all.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::Result;

/// Embedded schema migrations, applied in order and tracked through
/// SQLite's `user_version` pragma.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE urls (
        url TEXT NOT NULL,
        algo TEXT NOT NULL,
        hash TEXT NOT NULL,
        PRIMARY KEY (url, algo)
    )",
];

/// A learned URL → digest link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub url: String,
    pub algo: String,
    pub hash: String,
}

/// Handle to the link database.
pub struct LinkDb {
    conn: Mutex<Connection>,
}

impl LinkDb {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database, for tests and ephemeral proxies.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let applied = (version.max(0) as usize).min(MIGRATIONS.len());
        let pending = &MIGRATIONS[applied..];
        if pending.is_empty() {
            return Ok(());
        }

        for (offset, migration) in pending.iter().enumerate() {
            conn.execute_batch(migration)?;
            conn.pragma_update(None, "user_version", (applied + offset + 1) as i64)?;
        }
        info!(
            from = applied,
            to = MIGRATIONS.len(),
            "link database migrations applied"
        );
        Ok(())
    }

    /// Upsert a single link. `(url, algo)` is the effective key.
    pub fn insert(&self, url: &str, algo: &str, hash: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO urls (url, algo, hash) VALUES (?1, ?2, ?3)",
            params![url, algo, hash],
        )?;
        Ok(())
    }

    /// Upsert a batch of links for one algorithm inside a transaction.
    pub fn insert_many(&self, algo: &str, entries: &[(String, String)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO urls (url, algo, hash) VALUES (?1, ?2, ?3)")?;
            for (url, hash) in entries {
                stmt.execute(params![url, algo, hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Look up the digest for `(url, algo)`.
    pub fn get(&self, url: &str, algo: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let hash = conn
            .query_row(
                "SELECT hash FROM urls WHERE url = ?1 AND algo = ?2",
                params![url, algo],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// All digests known for `url`, ordered by algorithm preference
    /// (sha256, sha512, sha1, anything else).
    pub fn get_all(&self, url: &str) -> Result<Vec<LinkRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT url, algo, hash FROM urls WHERE url = ?1
             ORDER BY CASE algo
                 WHEN 'sha256' THEN 0
                 WHEN 'sha512' THEN 1
                 WHEN 'sha1' THEN 2
                 ELSE 3
             END, algo",
        )?;
        let records = stmt
            .query_map(params![url], |row| {
                Ok(LinkRecord {
                    url: row.get(0)?,
                    algo: row.get(1)?,
                    hash: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Number of stored links.
    pub fn len(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM urls", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// =============================================================================
// Tests
// =============================================================================
