// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Content hashing for deduplication and idempotency.
//!
//! Hashes are hex-encoded SHA-256. The exact input layouts matter: they are
//! the dedup keys for POIs, relationship evidence, and downstream job
//! idempotency, and must stay stable across releases.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of arbitrary bytes.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stable POI dedup hash: `sha256(name:type:file_path:start_line)`.
#[must_use]
pub fn poi_hash(name: &str, poi_type: &str, file_path: &str, start_line: u32) -> String {
    sha256_hex(format!("{name}:{poi_type}:{file_path}:{start_line}").as_bytes())
}

/// Stable relationship hash for evidence tracking:
/// `sha256(source:target:type)` using resolved POI identifiers.
#[must_use]
pub fn relationship_hash(source_poi_id: i64, target_poi_id: i64, rel_type: &str) -> String {
    sha256_hex(format!("{source_poi_id}:{target_poi_id}:{rel_type}").as_bytes())
}

/// Idempotency key for a downstream job derived from outbox events:
/// `sha256(run_id:event_id[,event_id...])`.
#[must_use]
pub fn idempotency_key(run_id: &str, event_ids: &[i64]) -> String {
    let ids = event_ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    sha256_hex(format!("{run_id}:{ids}").as_bytes())
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poi_hash_is_stable() {
        let a = poi_hash("createUser", "FunctionDefinition", "src/a.js", 10);
        let b = poi_hash("createUser", "FunctionDefinition", "src/a.js", 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_poi_hash_varies_by_field() {
        let base = poi_hash("createUser", "FunctionDefinition", "src/a.js", 10);
        assert_ne!(base, poi_hash("validateUser", "FunctionDefinition", "src/a.js", 10));
        assert_ne!(base, poi_hash("createUser", "ClassDefinition", "src/a.js", 10));
        assert_ne!(base, poi_hash("createUser", "FunctionDefinition", "src/b.js", 10));
        assert_ne!(base, poi_hash("createUser", "FunctionDefinition", "src/a.js", 11));
    }

    #[test]
    fn test_idempotency_key_depends_on_event_set() {
        let a = idempotency_key("run-1", &[1, 2, 3]);
        let b = idempotency_key("run-1", &[1, 2, 3]);
        let c = idempotency_key("run-1", &[1, 2, 4]);
        let d = idempotency_key("run-2", &[1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_relationship_hash_distinguishes_direction() {
        assert_ne!(
            relationship_hash(1, 2, "CALLS"),
            relationship_hash(2, 1, "CALLS")
        );
    }
}
