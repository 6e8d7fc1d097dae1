// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use rusqlite::{params, Connection, OptionalExtension};

use codegraph::models::{Poi, PoiType};

use crate::errors::StoreResult;

/// Insert POIs idempotently (dedup key: `(run_id, hash)`). Returns the
/// number of rows actually inserted.
pub fn insert_batch(conn: &Connection, pois: &[Poi]) -> StoreResult<u64> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO pois
         (file_id, file_path, name, type, start_line, end_line, is_exported, semantic_id, hash, run_id, llm_output)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    let mut inserted = 0u64;
    for poi in pois {
        let llm_output = poi
            .llm_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        inserted += stmt.execute(params![
            poi.file_id,
            poi.file_path,
            poi.name,
            poi.poi_type.as_str(),
            poi.start_line,
            poi.end_line,
            poi.is_exported,
            poi.semantic_id,
            poi.hash,
            poi.run_id,
            llm_output,
        ])? as u64;
    }
    Ok(inserted)
}

/// Resolve a POI reference (name or semantic id) to its row id, scoped to a
/// run. Semantic ids are preferred; name matches fall back to the earliest
/// row so resolution stays deterministic when a name is ambiguous.
pub fn resolve_id(conn: &Connection, run_id: &str, reference: &str) -> StoreResult<Option<i64>> {
    let by_semantic: Option<i64> = conn
        .query_row(
            "SELECT id FROM pois WHERE run_id = ?1 AND semantic_id = ?2 ORDER BY id LIMIT 1",
            params![run_id, reference],
            |row| row.get(0),
        )
        .optional()?;
    if by_semantic.is_some() {
        return Ok(by_semantic);
    }
    let by_name: Option<i64> = conn
        .query_row(
            "SELECT id FROM pois WHERE run_id = ?1 AND name = ?2 ORDER BY id LIMIT 1",
            params![run_id, reference],
            |row| row.get(0),
        )
        .optional()?;
    Ok(by_name)
}

fn row_to_poi(row: &rusqlite::Row<'_>) -> rusqlite::Result<Poi> {
    let llm_output: Option<String> = row.get(11)?;
    Ok(Poi {
        id: Some(row.get(0)?),
        file_id: row.get(1)?,
        file_path: row.get(2)?,
        name: row.get(3)?,
        poi_type: PoiType::parse(&row.get::<_, String>(4)?),
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        is_exported: row.get(7)?,
        semantic_id: row.get(8)?,
        hash: row.get(9)?,
        run_id: row.get(10)?,
        llm_output: llm_output.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

const POI_COLUMNS: &str = "id, file_id, file_path, name, type, start_line, end_line, is_exported, semantic_id, hash, run_id, llm_output";

/// Fetch one POI by row id.
pub fn get(conn: &Connection, id: i64) -> StoreResult<Option<Poi>> {
    let poi = conn
        .query_row(
            &format!("SELECT {POI_COLUMNS} FROM pois WHERE id = ?1"),
            params![id],
            row_to_poi,
        )
        .optional()?;
    Ok(poi)
}

/// Every POI in a run, ordered by id.
pub fn by_run(conn: &Connection, run_id: &str) -> StoreResult<Vec<Poi>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {POI_COLUMNS} FROM pois WHERE run_id = ?1 ORDER BY id"
    ))?;
    let pois = stmt
        .query_map(params![run_id], row_to_poi)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pois)
}

/// POI count for a run.
pub fn count_by_run(conn: &Connection, run_id: &str) -> StoreResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pois WHERE run_id = ?1",
        params![run_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
