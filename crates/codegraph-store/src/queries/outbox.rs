// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use codegraph::models::{EventPayload, NewOutboxEvent, OutboxEvent, OutboxStatus};

use crate::errors::{StoreError, StoreResult};

/// Append one event in PENDING state. Returns the new row id.
pub fn insert(conn: &Connection, event: &NewOutboxEvent) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO outbox (run_id, event_type, payload, status, created_at)
         VALUES (?1, ?2, ?3, 'PENDING', ?4)",
        params![
            event.run_id,
            event.payload.event_type(),
            serde_json::to_string(&event.payload)?,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Append many events in order.
pub fn insert_batch(conn: &Connection, events: &[NewOutboxEvent]) -> StoreResult<Vec<i64>> {
    let mut ids = Vec::with_capacity(events.len());
    for event in events {
        ids.push(insert(conn, event)?);
    }
    Ok(ids)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, u32, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn assemble(raw: (i64, String, String, String, String, u32, String)) -> StoreResult<OutboxEvent> {
    let (id, run_id, event_type, payload_raw, status_raw, resolution_attempts, created_at) = raw;
    let payload: EventPayload = serde_json::from_str(&payload_raw)?;
    let status = OutboxStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown outbox status {status_raw}")))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Serialization(format!("bad outbox timestamp: {e}")))?
        .with_timezone(&Utc);
    Ok(OutboxEvent {
        id,
        run_id,
        event_type,
        payload,
        status,
        resolution_attempts,
        created_at,
    })
}

/// Up to `limit` PENDING events in ascending id order (FIFO per run).
/// Held events stay invisible until their `next_resolution_at` passes.
pub fn pending(conn: &Connection, limit: usize, now_ms: i64) -> StoreResult<Vec<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, run_id, event_type, payload, status, resolution_attempts, created_at
         FROM outbox
         WHERE status = 'PENDING'
           AND (next_resolution_at IS NULL OR next_resolution_at <= ?2)
         ORDER BY id LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64, now_ms], row_to_event)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(assemble).collect()
}

/// Transition events to PUBLISHED. PUBLISHED is terminal: rows already
/// published or failed are untouched.
pub fn mark_published(conn: &Connection, ids: &[i64]) -> StoreResult<u64> {
    let mut stmt = conn.prepare_cached(
        "UPDATE outbox SET status = 'PUBLISHED' WHERE id = ?1 AND status = 'PENDING'",
    )?;
    let mut updated = 0u64;
    for id in ids {
        updated += stmt.execute(params![id])? as u64;
    }
    Ok(updated)
}

/// Count one more failed resolution attempt against each event and
/// schedule its next eligibility.
pub fn bump_resolution_attempts(
    conn: &Connection,
    holds: &[(i64, i64)], // (event id, next attempt epoch millis)
) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE outbox
         SET resolution_attempts = resolution_attempts + 1, next_resolution_at = ?2
         WHERE id = ?1 AND status = 'PENDING'",
    )?;
    for (id, next_at) in holds {
        stmt.execute(params![id, next_at])?;
    }
    Ok(())
}

/// Terminally fail an event with a diagnostic reason.
pub fn mark_failed(conn: &Connection, id: i64, reason: &str) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE outbox SET status = 'FAILED', failure_reason = ?1
         WHERE id = ?2 AND status = 'PENDING'",
        params![reason, id],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!("pending outbox event {id}")));
    }
    Ok(())
}

/// Event counts by status for one run.
pub fn counts_by_status(conn: &Connection, run_id: &str) -> StoreResult<(u64, u64, u64)> {
    let mut pending = 0u64;
    let mut published = 0u64;
    let mut failed = 0u64;
    let mut stmt = conn.prepare_cached(
        "SELECT status, COUNT(*) FROM outbox WHERE run_id = ?1 GROUP BY status",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        match status.as_str() {
            "PENDING" => pending = count as u64,
            "PUBLISHED" => published = count as u64,
            "FAILED" => failed = count as u64,
            _ => {}
        }
    }
    Ok((pending, published, failed))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use codegraph::models::{Poi, PoiType};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::apply(&conn).unwrap();
        conn
    }

    fn finding(run_id: &str, file: &str) -> NewOutboxEvent {
        NewOutboxEvent::new(EventPayload::FileAnalysisFinding {
            run_id: run_id.to_string(),
            file_path: file.to_string(),
            pois: vec![Poi::from_classifier(
                file,
                "fn1",
                PoiType::FunctionDefinition,
                1,
                2,
                false,
                run_id,
            )],
            relationships: Vec::new(),
        })
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn test_pending_preserves_fifo_order() {
        let conn = setup();
        let a = insert(&conn, &finding("run-1", "a.js")).unwrap();
        let b = insert(&conn, &finding("run-1", "b.js")).unwrap();
        let c = insert(&conn, &finding("run-1", "c.js")).unwrap();
        assert!(a < b && b < c);

        let events = pending(&conn, 10, now_ms()).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn test_published_is_terminal() {
        let conn = setup();
        let id = insert(&conn, &finding("run-1", "a.js")).unwrap();
        assert_eq!(mark_published(&conn, &[id]).unwrap(), 1);
        // A second publish touches nothing, and the row no longer shows
        // up as pending.
        assert_eq!(mark_published(&conn, &[id]).unwrap(), 0);
        assert!(pending(&conn, 10, now_ms()).unwrap().is_empty());
        // A published row cannot be failed.
        assert!(mark_failed(&conn, id, "nope").is_err());
    }

    #[test]
    fn test_resolution_attempts_accumulate_with_hold() {
        let conn = setup();
        let id = insert(&conn, &finding("run-1", "a.js")).unwrap();
        let future = now_ms() + 60_000;
        bump_resolution_attempts(&conn, &[(id, future)]).unwrap();

        // Held: invisible until its next attempt time passes.
        assert!(pending(&conn, 10, now_ms()).unwrap().is_empty());
        let events = pending(&conn, 10, future + 1).unwrap();
        assert_eq!(events[0].resolution_attempts, 1);

        bump_resolution_attempts(&conn, &[(id, now_ms() - 1)]).unwrap();
        let events = pending(&conn, 10, now_ms()).unwrap();
        assert_eq!(events[0].resolution_attempts, 2);
    }

    #[test]
    fn test_mark_failed_records_reason() {
        let conn = setup();
        let id = insert(&conn, &finding("run-1", "a.js")).unwrap();
        mark_failed(&conn, id, "unresolved endpoint: createUser").unwrap();
        let (pending_count, published, failed) = counts_by_status(&conn, "run-1").unwrap();
        assert_eq!((pending_count, published, failed), (0, 0, 1));

        let reason: String = conn
            .query_row(
                "SELECT failure_reason FROM outbox WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(reason.contains("createUser"));
    }

    #[test]
    fn test_payload_round_trip() {
        let conn = setup();
        insert(&conn, &finding("run-1", "a.js")).unwrap();
        let events = pending(&conn, 10, now_ms()).unwrap();
        match &events[0].payload {
            EventPayload::FileAnalysisFinding { pois, .. } => assert_eq!(pois.len(), 1),
            EventPayload::RelationshipCreation { .. } => panic!("wrong variant"),
        }
    }
}
