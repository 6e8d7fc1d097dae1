// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CodeGraph Classifier Client
//!
//! The external classifier is a request/response text-generation service
//! (an OpenAI-compatible chat endpoint). This crate owns the prompt
//! formats, the response schemas, retry/backoff/rate-limit behavior, and
//! input truncation. Everything upstream talks to the [`Classifier`] trait;
//! [`MockClassifier`] scripts responses for tests and offline runs.

mod client;
mod mock;
pub mod prompts;
pub mod response;
pub mod truncate;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{HttpClassifier, HttpClassifierConfig};
pub use mock::MockClassifier;
pub use response::{
    BatchFileResult, BatchResponse, PoiSpec, RelationshipSpec, RoleAssessment, SingleFileResponse,
};

use codegraph::models::AgentRole;

/// Error types for classifier operations
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum ClassifierError {
    /// Request exceeded its deadline (retriable)
    #[error("Classifier timeout")]
    Timeout,

    /// 429 from the service (retriable)
    #[error("Classifier rate limited")]
    RateLimited,

    /// Non-retriable HTTP failure (4xx other than 429)
    #[error("Classifier HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network-level failure (retriable)
    #[error("Classifier transport error: {0}")]
    Transport(String),

    /// Response failed schema validation (logical, not retriable here;
    /// batch callers fall back to per-file processing)
    #[error("Malformed classifier response: {0}")]
    MalformedResponse(String),

    /// Anything else terminal (bad configuration, exhausted mock script)
    #[error("Classifier error: {0}")]
    Terminal(String),
}

impl ClassifierError {
    /// True if the same request may succeed on retry.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited | Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::MalformedResponse(_) | Self::Terminal(_) => false,
        }
    }
}

/// One file in a batch request.
#[derive(Debug, Clone)]
pub struct BatchFile {
    pub file_path: String,
    pub content: String,
}

/// A triangulation role request about one relationship.
#[derive(Debug, Clone)]
pub struct RoleRequest {
    pub role: AgentRole,
    pub source_name: String,
    pub target_name: String,
    pub rel_type: String,
    pub file_path: String,
    /// Source snippet or surrounding context, when available.
    pub context: Option<String>,
    /// The previous role's assessment (sequential coordination mode).
    pub prior: Option<RoleAssessment>,
}

/// The external classifier interface.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Analyze one file; returns its POIs and relationship candidates.
    async fn analyze_file(
        &self,
        file_path: &str,
        content: &str,
    ) -> Result<SingleFileResponse, ClassifierError>;

    /// Analyze several small files in one call.
    async fn analyze_batch(&self, files: &[BatchFile]) -> Result<BatchResponse, ClassifierError>;

    /// Re-assess one relationship from a role-specific viewpoint.
    async fn assess_role(&self, request: &RoleRequest) -> Result<RoleAssessment, ClassifierError>;
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriability_classification() {
        assert!(ClassifierError::Timeout.is_retriable());
        assert!(ClassifierError::RateLimited.is_retriable());
        assert!(ClassifierError::Transport("reset".to_string()).is_retriable());
        assert!(ClassifierError::Http {
            status: 503,
            body: String::new()
        }
        .is_retriable());
        assert!(!ClassifierError::Http {
            status: 400,
            body: String::new()
        }
        .is_retriable());
        assert!(!ClassifierError::MalformedResponse("bad json".to_string()).is_retriable());
    }
}
