// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use rusqlite::{params, Connection};

use crate::errors::StoreResult;

/// Record a run id. Idempotent; runs are never mutated or deleted.
pub fn ensure(conn: &Connection, run_id: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO runs (id, created_at) VALUES (?1, ?2)",
        params![run_id, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// True if the run exists.
pub fn exists(conn: &Connection, run_id: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM runs WHERE id = ?1",
        params![run_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
