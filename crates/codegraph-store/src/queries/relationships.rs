// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use rusqlite::{params, Connection, OptionalExtension};

use codegraph::models::{Relationship, RelationshipStatus, ResolvedRelationship};

use crate::errors::{StoreError, StoreResult};

const REL_COLUMNS: &str =
    "id, source_poi_id, target_poi_id, type, file_path, status, confidence, reason, run_id, evidence";

fn row_to_relationship(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relationship> {
    let evidence_raw: String = row.get(9)?;
    Ok(Relationship {
        id: Some(row.get(0)?),
        source_poi_id: row.get(1)?,
        target_poi_id: row.get(2)?,
        rel_type: row.get(3)?,
        file_path: row.get(4)?,
        status: RelationshipStatus::parse(&row.get::<_, String>(5)?)
            .unwrap_or(RelationshipStatus::Pending),
        confidence: row.get(6)?,
        reason: row.get(7)?,
        run_id: row.get(8)?,
        evidence: serde_json::from_str(&evidence_raw).unwrap_or_default(),
    })
}

/// Insert a resolved relationship in PENDING state, idempotently by
/// `(run_id, source, target, type)`. Returns the row id either way.
pub fn insert_pending(conn: &Connection, resolved: &ResolvedRelationship) -> StoreResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO relationships
         (source_poi_id, target_poi_id, type, file_path, status, confidence, reason, run_id)
         VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6, ?7)",
        params![
            resolved.source_poi_id,
            resolved.target_poi_id,
            resolved.rel_type,
            resolved.file_path,
            resolved.confidence.clamp(0.0, 1.0),
            resolved.reason,
            resolved.run_id,
        ],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM relationships
         WHERE run_id = ?1 AND source_poi_id = ?2 AND target_poi_id = ?3 AND type = ?4",
        params![
            resolved.run_id,
            resolved.source_poi_id,
            resolved.target_poi_id,
            resolved.rel_type
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Fetch one relationship.
pub fn get(conn: &Connection, id: i64) -> StoreResult<Option<Relationship>> {
    let rel = conn
        .query_row(
            &format!("SELECT {REL_COLUMNS} FROM relationships WHERE id = ?1"),
            params![id],
            row_to_relationship,
        )
        .optional()?;
    Ok(rel)
}

/// Append an evidence payload to the relationship's evidence array.
pub fn append_evidence(conn: &Connection, id: i64, item: &serde_json::Value) -> StoreResult<()> {
    let rel = get(conn, id)?
        .ok_or_else(|| StoreError::NotFound(format!("relationship {id}")))?;
    let mut evidence = rel.evidence;
    evidence.push(item.clone());
    conn.execute(
        "UPDATE relationships SET evidence = ?1 WHERE id = ?2",
        params![serde_json::to_string(&evidence)?, id],
    )?;
    Ok(())
}

/// Raise a relationship's confidence after an accepted triangulation pass.
/// Confidence is monotonic after ACCEPT: the stored value never decreases.
pub fn accept_with_confidence(conn: &Connection, id: i64, confidence: f64) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE relationships
         SET confidence = MAX(confidence, ?1)
         WHERE id = ?2 AND status IN ('PENDING', 'VALIDATED')",
        params![confidence.clamp(0.0, 1.0), id],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!(
            "relationship {id} not updatable"
        )));
    }
    Ok(())
}

/// Transition status, enforcing monotonicity in SQL.
pub fn set_status(conn: &Connection, id: i64, status: RelationshipStatus) -> StoreResult<()> {
    let allowed_from = match status {
        RelationshipStatus::Pending => "('PENDING')",
        RelationshipStatus::Validated => "('PENDING')",
        RelationshipStatus::Reconciled => "('PENDING', 'VALIDATED')",
        RelationshipStatus::Rejected => "('PENDING', 'VALIDATED')",
    };
    let updated = conn.execute(
        &format!(
            "UPDATE relationships SET status = ?1 WHERE id = ?2 AND status IN {allowed_from}"
        ),
        params![status.as_str(), id],
    )?;
    if updated == 0 {
        let current = get(conn, id)?;
        match current {
            Some(rel) if rel.status == status => Ok(()), // idempotent repeat
            Some(rel) => Err(StoreError::Constraint(format!(
                "illegal relationship status transition {} -> {} for id {id}",
                rel.status.as_str(),
                status.as_str()
            ))),
            None => Err(StoreError::NotFound(format!("relationship {id}"))),
        }
    } else {
        Ok(())
    }
}

/// Relationships in a run with the given status, ordered by id.
pub fn by_run_and_status(
    conn: &Connection,
    run_id: &str,
    status: RelationshipStatus,
) -> StoreResult<Vec<Relationship>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REL_COLUMNS} FROM relationships WHERE run_id = ?1 AND status = ?2 ORDER BY id"
    ))?;
    let rels = stmt
        .query_map(params![run_id, status.as_str()], row_to_relationship)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rels)
}

/// All rows sharing a `(source, target, type)` triple within a run,
/// ordered by confidence descending (used by reconciliation dedup).
pub fn duplicates_of(conn: &Connection, rel: &Relationship) -> StoreResult<Vec<Relationship>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REL_COLUMNS} FROM relationships
         WHERE run_id = ?1 AND source_poi_id = ?2 AND target_poi_id = ?3 AND type = ?4
         ORDER BY confidence DESC, id"
    ))?;
    let rels = stmt
        .query_map(
            params![rel.run_id, rel.source_poi_id, rel.target_poi_id, rel.rel_type],
            row_to_relationship,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rels)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{pois, runs};
    use crate::schema;
    use codegraph::models::{Poi, PoiType};

    fn setup() -> (Connection, i64, i64) {
        let conn = Connection::open_in_memory().unwrap();
        schema::apply(&conn).unwrap();
        runs::ensure(&conn, "run-1").unwrap();
        pois::insert_batch(
            &conn,
            &[
                Poi::from_classifier("a.js", "createUser", PoiType::FunctionDefinition, 1, 5, true, "run-1"),
                Poi::from_classifier("b.js", "validateUser", PoiType::FunctionDefinition, 1, 5, true, "run-1"),
            ],
        )
        .unwrap();
        let source = pois::resolve_id(&conn, "run-1", "validateUser").unwrap().unwrap();
        let target = pois::resolve_id(&conn, "run-1", "createUser").unwrap().unwrap();
        (conn, source, target)
    }

    fn resolved(source: i64, target: i64, confidence: f64) -> ResolvedRelationship {
        ResolvedRelationship {
            source_poi_id: source,
            target_poi_id: target,
            rel_type: "CALLS".to_string(),
            file_path: "b.js".to_string(),
            confidence,
            reason: "call expression".to_string(),
            run_id: "run-1".to_string(),
        }
    }

    #[test]
    fn test_insert_pending_is_idempotent() {
        let (conn, s, t) = setup();
        let id1 = insert_pending(&conn, &resolved(s, t, 0.8)).unwrap();
        let id2 = insert_pending(&conn, &resolved(s, t, 0.9)).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_accept_never_decreases_confidence() {
        let (conn, s, t) = setup();
        let id = insert_pending(&conn, &resolved(s, t, 0.5)).unwrap();
        accept_with_confidence(&conn, id, 0.8).unwrap();
        accept_with_confidence(&conn, id, 0.6).unwrap();
        let rel = get(&conn, id).unwrap().unwrap();
        assert!((rel.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let (conn, s, t) = setup();
        let id = insert_pending(&conn, &resolved(s, t, 0.7)).unwrap();

        set_status(&conn, id, RelationshipStatus::Validated).unwrap();
        set_status(&conn, id, RelationshipStatus::Reconciled).unwrap();
        // Terminal: repeating is idempotent, regressing is an error.
        set_status(&conn, id, RelationshipStatus::Reconciled).unwrap();
        let err = set_status(&conn, id, RelationshipStatus::Pending).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn test_append_evidence() {
        let (conn, s, t) = setup();
        let id = insert_pending(&conn, &resolved(s, t, 0.7)).unwrap();
        append_evidence(&conn, id, &serde_json::json!({"source": "initial_analysis"})).unwrap();
        append_evidence(&conn, id, &serde_json::json!({"source": "cross_file"})).unwrap();
        let rel = get(&conn, id).unwrap().unwrap();
        assert_eq!(rel.evidence.len(), 2);
    }

    #[test]
    fn test_by_run_and_status() {
        let (conn, s, t) = setup();
        let id = insert_pending(&conn, &resolved(s, t, 0.7)).unwrap();
        assert_eq!(
            by_run_and_status(&conn, "run-1", RelationshipStatus::Pending).unwrap().len(),
            1
        );
        set_status(&conn, id, RelationshipStatus::Rejected).unwrap();
        assert!(by_run_and_status(&conn, "run-1", RelationshipStatus::Pending).unwrap().is_empty());
    }
}
