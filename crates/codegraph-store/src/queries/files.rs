// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use rusqlite::{params, Connection, OptionalExtension};

use codegraph::models::{FileStatus, SourceFile};

use crate::errors::{StoreError, StoreResult};

/// Insert a discovered file if absent; returns its row id either way.
pub fn upsert_discovered(conn: &Connection, file: &SourceFile) -> StoreResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO files (file_path, hash, status, run_id) VALUES (?1, ?2, ?3, ?4)",
        params![
            file.file_path,
            file.hash,
            FileStatus::Discovered.as_str(),
            file.run_id
        ],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM files WHERE run_id = ?1 AND file_path = ?2",
        params![file.run_id, file.file_path],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Move a file toward a terminal status. Illegal transitions are rejected
/// in SQL so the status stays monotonic even under concurrent writers.
pub fn set_status(
    conn: &Connection,
    run_id: &str,
    file_path: &str,
    status: FileStatus,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE files SET status = ?1
         WHERE run_id = ?2 AND file_path = ?3 AND status = 'discovered'",
        params![status.as_str(), run_id, file_path],
    )?;
    if updated == 0 {
        let current = get(conn, run_id, file_path)?;
        match current {
            Some(f) if f.status == status => Ok(()), // already there; idempotent
            Some(f) => Err(StoreError::Constraint(format!(
                "illegal file status transition {} -> {} for {file_path}",
                f.status.as_str(),
                status.as_str()
            ))),
            None => Err(StoreError::NotFound(format!(
                "file {file_path} in run {run_id}"
            ))),
        }
    } else {
        Ok(())
    }
}

/// Fetch one file row.
pub fn get(conn: &Connection, run_id: &str, file_path: &str) -> StoreResult<Option<SourceFile>> {
    let row = conn
        .query_row(
            "SELECT id, file_path, hash, status, run_id FROM files
             WHERE run_id = ?1 AND file_path = ?2",
            params![run_id, file_path],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(id, file_path, hash, status, run_id)| SourceFile {
        id: Some(id),
        file_path,
        hash,
        status: FileStatus::parse(&status).unwrap_or(FileStatus::Failed),
        run_id,
    }))
}

/// Count files by status for a run.
pub fn count_by_status(conn: &Connection, run_id: &str, status: FileStatus) -> StoreResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files WHERE run_id = ?1 AND status = ?2",
        params![run_id, status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::runs;
    use crate::schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::apply(&conn).unwrap();
        runs::ensure(&conn, "run-1").unwrap();
        conn
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let conn = setup();
        let file = SourceFile::discovered("a.js", "h1", "run-1");
        let id1 = upsert_discovered(&conn, &file).unwrap();
        let id2 = upsert_discovered(&conn, &file).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_status_is_monotonic() {
        let conn = setup();
        let file = SourceFile::discovered("a.js", "h1", "run-1");
        upsert_discovered(&conn, &file).unwrap();

        set_status(&conn, "run-1", "a.js", FileStatus::Processed).unwrap();
        // Repeating the same terminal state is fine.
        set_status(&conn, "run-1", "a.js", FileStatus::Processed).unwrap();
        // Moving to a different state from terminal is rejected.
        let err = set_status(&conn, "run-1", "a.js", FileStatus::Failed).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let conn = setup();
        let err = set_status(&conn, "run-1", "nope.js", FileStatus::Processed).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_count_by_status() {
        let conn = setup();
        upsert_discovered(&conn, &SourceFile::discovered("a.js", "h1", "run-1")).unwrap();
        upsert_discovered(&conn, &SourceFile::discovered("b.js", "h2", "run-1")).unwrap();
        set_status(&conn, "run-1", "a.js", FileStatus::Processed).unwrap();

        assert_eq!(count_by_status(&conn, "run-1", FileStatus::Processed).unwrap(), 1);
        assert_eq!(count_by_status(&conn, "run-1", FileStatus::Discovered).unwrap(), 1);
    }
}
