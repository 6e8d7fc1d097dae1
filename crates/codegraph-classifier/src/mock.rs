// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Scripted classifier for tests and offline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::response::{BatchResponse, RoleAssessment, SingleFileResponse};
use crate::{BatchFile, Classifier, ClassifierError, RoleRequest};

type SingleResult = Result<SingleFileResponse, ClassifierError>;
type BatchResult = Result<BatchResponse, ClassifierError>;
type RoleResult = Result<RoleAssessment, ClassifierError>;

/// Scripted [`Classifier`]. Single-file responses are keyed by path; batch
/// and role responses are FIFO queues. Unscripted calls fail loudly so a
/// test never silently passes on a default.
#[derive(Default)]
pub struct MockClassifier {
    singles: Mutex<HashMap<String, VecDeque<SingleResult>>>,
    batches: Mutex<VecDeque<BatchResult>>,
    roles: Mutex<VecDeque<RoleResult>>,
    single_calls: AtomicU64,
    batch_calls: AtomicU64,
    role_calls: AtomicU64,
}

impl MockClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next response for `file_path`.
    pub fn script_single(&self, file_path: &str, result: SingleResult) {
        self.singles
            .lock()
            .entry(file_path.to_string())
            .or_default()
            .push_back(result);
    }

    /// Script the next batch response.
    pub fn script_batch(&self, result: BatchResult) {
        self.batches.lock().push_back(result);
    }

    /// Script the next role assessment.
    pub fn script_role(&self, result: RoleResult) {
        self.roles.lock().push_back(result);
    }

    #[must_use]
    pub fn single_calls(&self) -> u64 {
        self.single_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn role_calls(&self) -> u64 {
        self.role_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn analyze_file(
        &self,
        file_path: &str,
        _content: &str,
    ) -> Result<SingleFileResponse, ClassifierError> {
        self.single_calls.fetch_add(1, Ordering::Relaxed);
        self.singles
            .lock()
            .get_mut(file_path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(ClassifierError::Terminal(format!(
                    "mock: no scripted single-file response for {file_path}"
                )))
            })
    }

    async fn analyze_batch(&self, files: &[BatchFile]) -> Result<BatchResponse, ClassifierError> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        self.batches.lock().pop_front().unwrap_or_else(|| {
            Err(ClassifierError::Terminal(format!(
                "mock: no scripted batch response ({} files requested)",
                files.len()
            )))
        })
    }

    async fn assess_role(&self, request: &RoleRequest) -> Result<RoleAssessment, ClassifierError> {
        self.role_calls.fetch_add(1, Ordering::Relaxed);
        self.roles.lock().pop_front().unwrap_or_else(|| {
            Err(ClassifierError::Terminal(format!(
                "mock: no scripted role response for {:?}",
                request.role
            )))
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::PoiSpec;

    #[tokio::test]
    async fn test_scripted_single_by_path() {
        let mock = MockClassifier::new();
        mock.script_single(
            "a.js",
            Ok(SingleFileResponse {
                pois: vec![PoiSpec {
                    name: "createUser".to_string(),
                    poi_type: "FunctionDefinition".to_string(),
                    start_line: 1,
                    end_line: 5,
                    is_exported: true,
                }],
                relationships: vec![],
            }),
        );

        let result = mock.analyze_file("a.js", "...").await.unwrap();
        assert_eq!(result.pois[0].name, "createUser");
        assert_eq!(mock.single_calls(), 1);

        // Second call for the same path is unscripted and fails loudly.
        assert!(mock.analyze_file("a.js", "...").await.is_err());
    }

    #[tokio::test]
    async fn test_unscripted_batch_errors() {
        let mock = MockClassifier::new();
        let err = mock.analyze_batch(&[]).await.unwrap_err();
        assert!(matches!(err, ClassifierError::Terminal(_)));
        assert_eq!(mock.batch_calls(), 1);
    }
}
