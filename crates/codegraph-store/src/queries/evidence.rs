// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use rusqlite::{params, Connection, OptionalExtension};

use codegraph::models::{EvidenceStatus, RelationshipEvidence};

use crate::errors::{StoreError, StoreResult};

/// Create the tracking row if absent.
pub fn ensure(
    conn: &Connection,
    run_id: &str,
    relationship_hash: &str,
    expected_count: u32,
) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO relationship_evidence_tracking
         (run_id, relationship_hash, expected_count) VALUES (?1, ?2, ?3)",
        params![run_id, relationship_hash, expected_count.max(1)],
    )?;
    Ok(())
}

/// Fetch the tracking row.
pub fn get(
    conn: &Connection,
    run_id: &str,
    relationship_hash: &str,
) -> StoreResult<Option<RelationshipEvidence>> {
    let row = conn
        .query_row(
            "SELECT evidence_count, expected_count, total_confidence, avg_confidence, status
             FROM relationship_evidence_tracking
             WHERE run_id = ?1 AND relationship_hash = ?2",
            params![run_id, relationship_hash],
            |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(
        |(evidence_count, expected_count, total_confidence, avg_confidence, status)| {
            RelationshipEvidence {
                run_id: run_id.to_string(),
                relationship_hash: relationship_hash.to_string(),
                evidence_count,
                expected_count,
                total_confidence,
                avg_confidence,
                status: EvidenceStatus::parse(&status).unwrap_or(EvidenceStatus::Pending),
            }
        },
    ))
}

/// Fold in one evidence item from `source`.
///
/// Each distinct source counts once; a repeat delivery of the same source
/// (at-least-once queues redeliver) is a no-op. Returns the updated row and
/// whether this call completed the tracking.
pub fn add(
    conn: &Connection,
    run_id: &str,
    relationship_hash: &str,
    source: &str,
    confidence: f64,
) -> StoreResult<(RelationshipEvidence, bool)> {
    let row = conn
        .query_row(
            "SELECT evidence_count, expected_count, total_confidence, status, seen_sources
             FROM relationship_evidence_tracking
             WHERE run_id = ?1 AND relationship_hash = ?2",
            params![run_id, relationship_hash],
            |r| {
                Ok((
                    r.get::<_, u32>(0)?,
                    r.get::<_, u32>(1)?,
                    r.get::<_, f64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| {
            StoreError::NotFound(format!(
                "evidence tracking for {relationship_hash} in {run_id}"
            ))
        })?;

    let (mut evidence_count, expected_count, mut total_confidence, status, seen_raw) = row;
    let mut seen: Vec<String> = serde_json::from_str(&seen_raw).unwrap_or_default();

    let already_complete = status == "COMPLETED";
    let duplicate = seen.iter().any(|s| s == source);
    let mut completed_now = false;

    if !already_complete && !duplicate {
        seen.push(source.to_string());
        evidence_count += 1;
        total_confidence += confidence.clamp(0.0, 1.0);
        let avg = total_confidence / f64::from(evidence_count);
        let new_status = if evidence_count >= expected_count {
            completed_now = true;
            "COMPLETED"
        } else {
            "PENDING"
        };
        conn.execute(
            "UPDATE relationship_evidence_tracking
             SET evidence_count = ?1, total_confidence = ?2, avg_confidence = ?3,
                 status = ?4, seen_sources = ?5
             WHERE run_id = ?6 AND relationship_hash = ?7",
            params![
                evidence_count,
                total_confidence,
                avg,
                new_status,
                serde_json::to_string(&seen)?,
                run_id,
                relationship_hash,
            ],
        )?;
    }

    let updated = get(conn, run_id, relationship_hash)?.ok_or_else(|| {
        StoreError::NotFound(format!(
            "evidence tracking for {relationship_hash} in {run_id}"
        ))
    })?;
    Ok((updated, completed_now))
}
