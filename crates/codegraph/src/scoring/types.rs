// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use serde::{Deserialize, Serialize};

/// Confidence band for a scored relationship.
///
/// Thresholds:
/// - High: >= 0.85
/// - Medium: >= 0.65
/// - Low: >= 0.45
/// - VeryLow: < 0.45
/// - Error: the scorer itself failed; always escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
    Error,
}

/// Multiplicative penalties applied after the weighted factor sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Penalty {
    /// Target reached through a dynamic import.
    DynamicImport,
    /// Reference goes through at least one indirection.
    IndirectRef,
    /// Endpoint name matches more than one candidate.
    Ambiguous,
    /// Evidence items explicitly contradict each other. Always escalates.
    Conflict,
}

impl Penalty {
    /// Multiplicative factor in `(0, 1]`.
    #[must_use]
    pub fn factor(self) -> f64 {
        match self {
            Self::DynamicImport => 0.8,
            Self::IndirectRef => 0.85,
            Self::Ambiguous => 0.7,
            Self::Conflict => 0.5,
        }
    }
}

/// One piece of factor evidence supporting (or undercutting) a relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Direct syntactic support (call expression, import statement) in `[0,1]`.
    pub syntax_score: f64,
    /// Semantic plausibility (naming, signatures) in `[0,1]`.
    pub semantic_score: f64,
    /// Surrounding-context support in `[0,1]`.
    pub context_score: f64,
    /// Cross-file corroboration in `[0,1]`.
    pub cross_ref_score: f64,
    /// Penalties this evidence item triggers.
    #[serde(default)]
    pub penalties: Vec<Penalty>,
}

impl EvidenceItem {
    /// Evidence with uniform factor scores and no penalties.
    #[must_use]
    pub fn uniform(score: f64) -> Self {
        Self {
            syntax_score: score,
            semantic_score: score,
            context_score: score,
            cross_ref_score: score,
            penalties: Vec::new(),
        }
    }
}

/// Per-factor view of how the final confidence came together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub syntax: f64,
    pub semantic: f64,
    pub context: f64,
    pub cross_ref: f64,
    /// Weighted sum before penalties and uncertainty adjustment.
    pub raw_score: f64,
    /// Product of all applied penalty factors.
    pub penalty_factor: f64,
    /// Uncertainty down-scale applied for thin evidence.
    pub uncertainty_factor: f64,
    /// Penalties that fired, deduplicated.
    pub applied_penalties: Vec<Penalty>,
}

/// The scorer's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub final_confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub escalation_needed: bool,
    pub breakdown: ConfidenceBreakdown,
}
