// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use serde::{Deserialize, Serialize};

/// Lifecycle of a discovered file. Status only moves forward:
/// `Discovered` -> `Processed` | `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Discovered,
    Processed,
    Failed,
}

impl FileStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True if `next` is a legal transition from `self`.
    /// Terminal states never change.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Discovered => matches!(next, Self::Processed | Self::Failed),
            Self::Processed | Self::Failed => false,
        }
    }
}

/// One row per path per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    /// Database identifier (`None` until persisted).
    pub id: Option<i64>,
    pub file_path: String,
    /// Content hash of the file at discovery time.
    pub hash: String,
    pub status: FileStatus,
    pub run_id: String,
}

impl SourceFile {
    /// A newly discovered file, not yet persisted.
    #[must_use]
    pub fn discovered(file_path: impl Into<String>, hash: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            id: None,
            file_path: file_path.into(),
            hash: hash.into(),
            status: FileStatus::Discovered,
            run_id: run_id.into(),
        }
    }
}
