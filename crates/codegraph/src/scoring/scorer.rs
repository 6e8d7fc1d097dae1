// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use super::types::{
    ConfidenceBreakdown, ConfidenceLevel, ConfidenceScore, EvidenceItem, Penalty,
};

/// Down-scale applied when fewer than two evidence items back a relationship.
const THIN_EVIDENCE_FACTOR: f64 = 0.85;

/// Scorer configuration. Weights are normalized at construction so callers
/// may pass any positive values.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub syntax_weight: f64,
    pub semantic_weight: f64,
    pub context_weight: f64,
    pub cross_ref_weight: f64,
    /// Final confidence at or below this escalates (default 0.45).
    pub escalation_threshold: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            syntax_weight: 0.35,
            semantic_weight: 0.30,
            context_weight: 0.20,
            cross_ref_weight: 0.15,
            escalation_threshold: 0.45,
        }
    }
}

/// Weighted multi-factor confidence scorer.
///
/// Deterministic and side-effect-free: identical evidence always produces an
/// identical score, and nothing here touches storage.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    weights: [f64; 4],
    escalation_threshold: f64,
}

impl ConfidenceScorer {
    #[must_use]
    pub fn new(config: ScorerConfig) -> Self {
        let raw = [
            config.syntax_weight,
            config.semantic_weight,
            config.context_weight,
            config.cross_ref_weight,
        ];
        let valid = raw.iter().all(|w| w.is_finite() && *w >= 0.0);
        let sum: f64 = raw.iter().sum();
        let weights = if valid && sum > 0.0 {
            [raw[0] / sum, raw[1] / sum, raw[2] / sum, raw[3] / sum]
        } else {
            // Unusable weights fall back to the default split.
            [0.35, 0.30, 0.20, 0.15]
        };
        Self {
            weights,
            escalation_threshold: config.escalation_threshold.clamp(0.0, 1.0),
        }
    }

    /// Score one relationship from its evidence items.
    ///
    /// Empty evidence is not an error: it produces a zero-confidence,
    /// escalated result. Non-finite factor scores mark the result as
    /// [`ConfidenceLevel::Error`], which also escalates.
    #[must_use]
    pub fn score(&self, evidence: &[EvidenceItem]) -> ConfidenceScore {
        if evidence.is_empty() {
            return ConfidenceScore {
                final_confidence: 0.0,
                confidence_level: ConfidenceLevel::VeryLow,
                escalation_needed: true,
                breakdown: ConfidenceBreakdown {
                    syntax: 0.0,
                    semantic: 0.0,
                    context: 0.0,
                    cross_ref: 0.0,
                    raw_score: 0.0,
                    penalty_factor: 1.0,
                    uncertainty_factor: THIN_EVIDENCE_FACTOR,
                    applied_penalties: Vec::new(),
                },
            };
        }

        let finite = evidence.iter().all(|e| {
            e.syntax_score.is_finite()
                && e.semantic_score.is_finite()
                && e.context_score.is_finite()
                && e.cross_ref_score.is_finite()
        });
        if !finite {
            return self.error_score();
        }

        let n = evidence.len() as f64;
        let avg = |f: fn(&EvidenceItem) -> f64| -> f64 {
            evidence.iter().map(|e| f(e).clamp(0.0, 1.0)).sum::<f64>() / n
        };
        let syntax = avg(|e| e.syntax_score);
        let semantic = avg(|e| e.semantic_score);
        let context = avg(|e| e.context_score);
        let cross_ref = avg(|e| e.cross_ref_score);

        let raw_score = self.weights[0] * syntax
            + self.weights[1] * semantic
            + self.weights[2] * context
            + self.weights[3] * cross_ref;

        let mut applied: Vec<Penalty> = Vec::new();
        for item in evidence {
            for penalty in &item.penalties {
                if !applied.contains(penalty) {
                    applied.push(*penalty);
                }
            }
        }
        let penalty_factor: f64 = applied.iter().map(|p| p.factor()).product();

        let uncertainty_factor = if evidence.len() < 2 {
            THIN_EVIDENCE_FACTOR
        } else {
            1.0
        };

        let final_confidence = (raw_score * penalty_factor * uncertainty_factor).clamp(0.0, 1.0);
        let confidence_level = level_for(final_confidence);
        let has_conflict = applied.contains(&Penalty::Conflict);
        let escalation_needed = final_confidence <= self.escalation_threshold || has_conflict;

        ConfidenceScore {
            final_confidence,
            confidence_level,
            escalation_needed,
            breakdown: ConfidenceBreakdown {
                syntax,
                semantic,
                context,
                cross_ref,
                raw_score,
                penalty_factor,
                uncertainty_factor,
                applied_penalties: applied,
            },
        }
    }

    fn error_score(&self) -> ConfidenceScore {
        ConfidenceScore {
            final_confidence: 0.0,
            confidence_level: ConfidenceLevel::Error,
            escalation_needed: true,
            breakdown: ConfidenceBreakdown {
                syntax: 0.0,
                semantic: 0.0,
                context: 0.0,
                cross_ref: 0.0,
                raw_score: 0.0,
                penalty_factor: 1.0,
                uncertainty_factor: 1.0,
                applied_penalties: Vec::new(),
            },
        }
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new(ScorerConfig::default())
    }
}

fn level_for(confidence: f64) -> ConfidenceLevel {
    if confidence >= 0.85 {
        ConfidenceLevel::High
    } else if confidence >= 0.65 {
        ConfidenceLevel::Medium
    } else if confidence >= 0.45 {
        ConfidenceLevel::Low
    } else {
        ConfidenceLevel::VeryLow
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item(syntax: f64, semantic: f64, context: f64, cross_ref: f64) -> EvidenceItem {
        EvidenceItem {
            syntax_score: syntax,
            semantic_score: semantic,
            context_score: context,
            cross_ref_score: cross_ref,
            penalties: Vec::new(),
        }
    }

    #[test]
    fn test_uniform_strong_evidence_is_high() {
        let scorer = ConfidenceScorer::default();
        let score = scorer.score(&[EvidenceItem::uniform(0.95), EvidenceItem::uniform(0.9)]);
        assert_eq!(score.confidence_level, ConfidenceLevel::High);
        assert!(!score.escalation_needed);
    }

    #[test]
    fn test_thin_evidence_is_down_scaled() {
        let scorer = ConfidenceScorer::default();
        let single = scorer.score(&[EvidenceItem::uniform(0.8)]);
        let double = scorer.score(&[EvidenceItem::uniform(0.8), EvidenceItem::uniform(0.8)]);
        assert!(single.final_confidence < double.final_confidence);
        assert!((single.breakdown.uncertainty_factor - THIN_EVIDENCE_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn test_conflict_always_escalates() {
        let scorer = ConfidenceScorer::default();
        let mut evidence = vec![EvidenceItem::uniform(0.95), EvidenceItem::uniform(0.95)];
        evidence[0].penalties.push(Penalty::Conflict);
        let score = scorer.score(&evidence);
        assert!(score.escalation_needed);
        assert!(score.breakdown.applied_penalties.contains(&Penalty::Conflict));
    }

    #[test]
    fn test_penalties_are_multiplicative_and_deduplicated() {
        let scorer = ConfidenceScorer::default();
        let mut evidence = vec![EvidenceItem::uniform(1.0), EvidenceItem::uniform(1.0)];
        evidence[0].penalties.push(Penalty::DynamicImport);
        evidence[1].penalties.push(Penalty::DynamicImport);
        evidence[1].penalties.push(Penalty::Ambiguous);
        let score = scorer.score(&evidence);
        let expected = Penalty::DynamicImport.factor() * Penalty::Ambiguous.factor();
        assert!((score.breakdown.penalty_factor - expected).abs() < 1e-9);
        assert_eq!(score.breakdown.applied_penalties.len(), 2);
    }

    #[test]
    fn test_empty_evidence_escalates() {
        let scorer = ConfidenceScorer::default();
        let score = scorer.score(&[]);
        assert!(score.escalation_needed);
        assert!((score.final_confidence - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_non_finite_input_is_error_level() {
        let scorer = ConfidenceScorer::default();
        let score = scorer.score(&[item(f64::NAN, 0.5, 0.5, 0.5)]);
        assert_eq!(score.confidence_level, ConfidenceLevel::Error);
        assert!(score.escalation_needed);
    }

    #[test]
    fn test_low_confidence_escalates_at_threshold() {
        let scorer = ConfidenceScorer::default();
        // All factors at 0.45 with two items: raw = 0.45, at the threshold.
        let score = scorer.score(&[EvidenceItem::uniform(0.45), EvidenceItem::uniform(0.45)]);
        assert!(score.escalation_needed);
    }

    #[test]
    fn test_level_boundaries() {
        assert_eq!(level_for(0.85), ConfidenceLevel::High);
        assert_eq!(level_for(0.8499), ConfidenceLevel::Medium);
        assert_eq!(level_for(0.65), ConfidenceLevel::Medium);
        assert_eq!(level_for(0.6499), ConfidenceLevel::Low);
        assert_eq!(level_for(0.45), ConfidenceLevel::Low);
        assert_eq!(level_for(0.4499), ConfidenceLevel::VeryLow);
    }

    #[test]
    fn test_weights_normalize() {
        let scorer = ConfidenceScorer::new(ScorerConfig {
            syntax_weight: 35.0,
            semantic_weight: 30.0,
            context_weight: 20.0,
            cross_ref_weight: 15.0,
            escalation_threshold: 0.45,
        });
        let a = scorer.score(&[EvidenceItem::uniform(0.7), EvidenceItem::uniform(0.7)]);
        let b = ConfidenceScorer::default()
            .score(&[EvidenceItem::uniform(0.7), EvidenceItem::uniform(0.7)]);
        assert!((a.final_confidence - b.final_confidence).abs() < 1e-9);
    }

    #[test]
    fn test_determinism() {
        let scorer = ConfidenceScorer::default();
        let evidence = vec![item(0.9, 0.4, 0.6, 0.2), item(0.1, 0.8, 0.3, 0.7)];
        let a = scorer.score(&evidence);
        let b = scorer.score(&evidence);
        assert!((a.final_confidence - b.final_confidence).abs() < f64::EPSILON);
        assert_eq!(a.confidence_level, b.confidence_level);
    }

    proptest! {
        #[test]
        fn prop_confidence_is_bounded(
            scores in proptest::collection::vec(
                (0.0f64..=1.0, 0.0f64..=1.0, 0.0f64..=1.0, 0.0f64..=1.0),
                0..8,
            )
        ) {
            let evidence: Vec<EvidenceItem> = scores
                .into_iter()
                .map(|(a, b, c, d)| item(a, b, c, d))
                .collect();
            let score = ConfidenceScorer::default().score(&evidence);
            prop_assert!(score.final_confidence >= 0.0);
            prop_assert!(score.final_confidence <= 1.0);
        }

        #[test]
        fn prop_raw_score_bounded_before_penalties(
            a in 0.0f64..=1.0,
            b in 0.0f64..=1.0,
            c in 0.0f64..=1.0,
            d in 0.0f64..=1.0,
        ) {
            let score = ConfidenceScorer::default().score(&[item(a, b, c, d), item(a, b, c, d)]);
            prop_assert!(score.breakdown.raw_score >= -1e-9);
            prop_assert!(score.breakdown.raw_score <= 1.0 + 1e-9);
        }
    }
}
