// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Dead-letter records for terminally failed jobs.
//!
//! A record carries the original payload and full error context for forensic
//! analysis and potential replay. The original queue name is preserved so a
//! record can be replayed to its source.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::Engine;
use serde::{Deserialize, Serialize};

use crate::job::Job;

/// One terminally failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The failed job's id.
    pub job_id: String,
    /// Queue the job originally ran on.
    pub source_queue: String,
    /// Base64-encoded original payload.
    pub payload_base64: String,
    /// Error message from the final attempt.
    pub error: String,
    /// Error classification (e.g. `permanent`, `attempts_exhausted`,
    /// `stale_timeout`).
    pub error_type: String,
    /// Delivery attempts made before dead-lettering.
    pub attempts_made: u32,
    /// ISO 8601 timestamp when the job was dead-lettered.
    pub timestamp: String,
    /// Unique trace id for correlating logs.
    pub trace_id: String,
}

impl DeadLetterRecord {
    /// Build a record from a failed job.
    #[must_use]
    pub fn from_job(job: &Job, error: impl Into<String>, error_type: impl Into<String>) -> Self {
        let payload = serde_json::to_vec(&job.payload).unwrap_or_default();
        Self {
            job_id: job.id.clone(),
            source_queue: job.queue.clone(),
            payload_base64: BASE64.encode(payload),
            error: error.into(),
            error_type: error_type.into(),
            attempts_made: job.attempts_made,
            timestamp: chrono::Utc::now().to_rfc3339(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Decode the original payload.
    pub fn payload(&self) -> Result<serde_json::Value, crate::BrokerError> {
        let bytes = BASE64
            .decode(&self.payload_base64)
            .map_err(|e| crate::BrokerError::Serialization(format!("invalid base64 payload: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| crate::BrokerError::Serialization(format!("invalid payload JSON: {e}")))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;

    #[test]
    fn test_record_preserves_source_queue_and_payload() {
        let mut job = Job::new(
            "file-analysis",
            serde_json::json!({"file_path": "a.js", "run_id": "run-1"}),
            JobOptions::default(),
        );
        job.attempts_made = 3;

        let record = DeadLetterRecord::from_job(&job, "classifier 500", "attempts_exhausted");
        assert_eq!(record.source_queue, "file-analysis");
        assert_eq!(record.attempts_made, 3);
        assert_eq!(record.error_type, "attempts_exhausted");

        let payload = record.payload().unwrap();
        assert_eq!(payload["file_path"], "a.js");
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let job = Job::new("q", serde_json::json!({}), JobOptions::default());
        let record = DeadLetterRecord::from_job(&job, "err", "permanent");
        assert!(chrono::DateTime::parse_from_rfc3339(&record.timestamp).is_ok());
    }

    #[test]
    fn test_trace_id_is_uuid() {
        let job = Job::new("q", serde_json::json!({}), JobOptions::default());
        let record = DeadLetterRecord::from_job(&job, "err", "permanent");
        assert!(uuid::Uuid::parse_str(&record.trace_id).is_ok());
    }
}
