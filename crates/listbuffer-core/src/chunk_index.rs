//! Durable ledger of on-disk chunks.
//!
//! One SQLite table, one row per live chunk. Row ids come from
//! `AUTOINCREMENT`, so they grow monotonically and are never handed out
//! twice, even after the newest row is deleted. Ascending id order is the
//! FIFO order of the buffer. Every call autocommits; nothing is batched.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS chunks(
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    size INTEGER NOT NULL
);
";

/// One chunk as recorded in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: i64,
    /// Items persisted in the chunk file at the last size update.
    pub size: u64,
}

/// Aggregate view of the index, used by `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub chunks: u64,
    pub items: u64,
    pub oldest_id: Option<i64>,
    pub newest_id: Option<i64>,
}

/// SQLite-backed chunk ledger.
#[derive(Debug)]
pub struct ChunkIndex {
    conn: Connection,
}

impl ChunkIndex {
    /// Open (creating if absent) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let conn = Connection::open(path).map_err(|source| IndexError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;",
        )
        .map_err(|source| IndexError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::with_connection(conn)
    }

    /// Open an existing index without writing to it: no pragmas, no schema
    /// creation. Fails if the file is absent.
    pub fn open_read_only(path: &Path) -> Result<Self, IndexError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| IndexError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { conn })
    }

    /// Private in-memory index, for tests.
    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Append an empty record and return its id.
    pub fn create_chunk(&self) -> Result<i64, IndexError> {
        self.conn.execute("INSERT INTO chunks (size) VALUES (0)", [])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Remove the record for `id`. Returns whether a row existed; deleting
    /// twice is not an error.
    pub fn delete_chunk(&self, id: i64) -> Result<bool, IndexError> {
        let removed = self
            .conn
            .execute("DELETE FROM chunks WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Overwrite the size of an existing record.
    pub fn set_size(&self, id: i64, size: u64) -> Result<(), IndexError> {
        let updated = self.conn.execute(
            "UPDATE chunks SET size = ?1 WHERE id = ?2",
            params![size as i64, id],
        )?;
        if updated == 0 {
            return Err(IndexError::ChunkNotFound(id));
        }
        Ok(())
    }

    /// Record with the smallest id (the read head).
    pub fn oldest(&self) -> Result<Option<ChunkRecord>, IndexError> {
        self.single_row("SELECT id, size FROM chunks ORDER BY id ASC LIMIT 1")
    }

    /// Record with the largest id (the write tail).
    pub fn newest(&self) -> Result<Option<ChunkRecord>, IndexError> {
        self.single_row("SELECT id, size FROM chunks ORDER BY id DESC LIMIT 1")
    }

    pub fn get(&self, id: i64) -> Result<Option<ChunkRecord>, IndexError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, size FROM chunks WHERE id = ?1",
                params![id],
                record_from_row,
            )
            .optional()?)
    }

    /// All records in FIFO order.
    pub fn records(&self) -> Result<Vec<ChunkRecord>, IndexError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, size FROM chunks ORDER BY id ASC")?;
        let rows = stmt.query_map([], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn summary(&self) -> Result<IndexSummary, IndexError> {
        let (chunks, items, oldest_id, newest_id) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), MIN(id), MAX(id) FROM chunks",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )?;
        Ok(IndexSummary {
            chunks: chunks.max(0) as u64,
            items: items.max(0) as u64,
            oldest_id,
            newest_id,
        })
    }

    fn single_row(&self, sql: &str) -> Result<Option<ChunkRecord>, IndexError> {
        Ok(self.conn.query_row(sql, [], record_from_row).optional()?)
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let id: i64 = row.get(0)?;
    let size: i64 = row.get(1)?;
    Ok(ChunkRecord {
        id,
        size: size.max(0) as u64,
    })
}
