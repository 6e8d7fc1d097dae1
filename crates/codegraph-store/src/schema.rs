// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Embedded schema. Applied idempotently at open; there is no external
//! migration runner.

use rusqlite::Connection;

use crate::errors::StoreResult;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'discovered',
    run_id TEXT NOT NULL REFERENCES runs(id),
    UNIQUE(run_id, file_path)
);
CREATE INDEX IF NOT EXISTS idx_files_run ON files(run_id);
CREATE INDEX IF NOT EXISTS idx_files_run_status ON files(run_id, status);

CREATE TABLE IF NOT EXISTS pois (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER REFERENCES files(id),
    file_path TEXT NOT NULL,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    is_exported INTEGER NOT NULL DEFAULT 0,
    semantic_id TEXT NOT NULL,
    hash TEXT NOT NULL,
    run_id TEXT NOT NULL REFERENCES runs(id),
    llm_output TEXT,
    UNIQUE(run_id, hash),
    UNIQUE(run_id, file_id, semantic_id)
);
CREATE INDEX IF NOT EXISTS idx_pois_run ON pois(run_id);
CREATE INDEX IF NOT EXISTS idx_pois_hash ON pois(hash);
CREATE INDEX IF NOT EXISTS idx_pois_semantic ON pois(semantic_id);
CREATE INDEX IF NOT EXISTS idx_pois_run_name ON pois(run_id, name);

CREATE TABLE IF NOT EXISTS relationships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_poi_id INTEGER NOT NULL REFERENCES pois(id),
    target_poi_id INTEGER NOT NULL REFERENCES pois(id),
    type TEXT NOT NULL,
    file_path TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'PENDING',
    confidence REAL NOT NULL DEFAULT 0,
    reason TEXT NOT NULL DEFAULT '',
    run_id TEXT NOT NULL REFERENCES runs(id),
    evidence TEXT NOT NULL DEFAULT '[]',
    UNIQUE(run_id, source_poi_id, target_poi_id, type)
);
CREATE INDEX IF NOT EXISTS idx_relationships_run ON relationships(run_id);
CREATE INDEX IF NOT EXISTS idx_relationships_run_status ON relationships(run_id, status);
CREATE INDEX IF NOT EXISTS idx_relationships_endpoints ON relationships(source_poi_id, target_poi_id);

CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    resolution_attempts INTEGER NOT NULL DEFAULT 0,
    next_resolution_at INTEGER,
    failure_reason TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, id);
CREATE INDEX IF NOT EXISTS idx_outbox_run_status ON outbox(run_id, status);

CREATE TABLE IF NOT EXISTS relationship_evidence_tracking (
    run_id TEXT NOT NULL,
    relationship_hash TEXT NOT NULL,
    evidence_count INTEGER NOT NULL DEFAULT 0,
    expected_count INTEGER NOT NULL,
    total_confidence REAL NOT NULL DEFAULT 0,
    avg_confidence REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'PENDING',
    seen_sources TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (run_id, relationship_hash)
);

CREATE TABLE IF NOT EXISTS triangulated_analysis_sessions (
    session_id TEXT PRIMARY KEY,
    relationship_id INTEGER NOT NULL REFERENCES relationships(id),
    run_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    initial_confidence REAL NOT NULL,
    final_confidence REAL,
    consensus_score REAL,
    escalated_to_human INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sessions_run ON triangulated_analysis_sessions(run_id);
CREATE INDEX IF NOT EXISTS idx_sessions_relationship ON triangulated_analysis_sessions(relationship_id);

CREATE TABLE IF NOT EXISTS agent_analyses (
    session_id TEXT NOT NULL REFERENCES triangulated_analysis_sessions(session_id),
    agent_type TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    evidence_strength REAL NOT NULL,
    reasoning TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (session_id, agent_type)
);

CREATE TABLE IF NOT EXISTS consensus_decisions (
    session_id TEXT PRIMARY KEY REFERENCES triangulated_analysis_sessions(session_id),
    weighted_consensus REAL NOT NULL,
    agreement_level REAL NOT NULL,
    final_decision TEXT NOT NULL,
    requires_human_review INTEGER NOT NULL DEFAULT 0
);
"#;

/// Create all tables and indexes if absent.
pub fn apply(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_applies_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for expected in [
            "agent_analyses",
            "consensus_decisions",
            "files",
            "outbox",
            "pois",
            "relationship_evidence_tracking",
            "relationships",
            "runs",
            "triangulated_analysis_sessions",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[test]
    fn test_poi_hash_unique_per_run() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        conn.execute(
            "INSERT INTO runs (id, created_at) VALUES ('run-1', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO pois (file_path, name, type, start_line, end_line, semantic_id, hash, run_id)
                      VALUES ('a.js', 'f', 'FunctionDefinition', 1, 2, 'a.js::f', 'h1', 'run-1')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
