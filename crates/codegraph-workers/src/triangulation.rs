// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Triangulated re-analysis of low-confidence relationships.
//!
//! Each job runs one session: three agent roles (syntactic 0.35,
//! semantic 0.40, contextual 0.25) re-query the classifier about the same
//! relationship, in parallel (bounded, per-agent timeout) or sequentially
//! (each role sees the previous verdict). The weighted consensus and
//! agreement level decide ACCEPT / REJECT / ESCALATE.
//!
//! Session state machine: PENDING -> IN_PROGRESS -> {COMPLETED, FAILED};
//! terminal. A FAILED session (timeout, unrecoverable agent failure) leaves
//! the relationship exactly as it was.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use prometheus::{CounterVec, Opts};
use tracing::{info, warn};

use codegraph::config::TriangulationMode;
use codegraph::metrics_constants::METRIC_TRIANGULATION_DECISIONS_TOTAL;
use codegraph::models::{
    AgentAnalysis, AgentRole, ConsensusDecision, EvidenceSource, FinalDecision, SessionStatus,
    TriangulationJob, TriangulationSession, ValidationJob,
};
use codegraph::{hashing, queues, JobError};
use codegraph_broker::{Job, JobOptions, QueueBroker};
use codegraph_classifier::{Classifier, RoleAssessment, RoleRequest};
use codegraph_store::{queries, StagingStore};

use crate::runtime::{HandlerOutcome, JobHandler};

static DECISIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(
            METRIC_TRIANGULATION_DECISIONS_TOTAL,
            "Total triangulation decisions",
        ),
        &["decision"],
    )
});

/// Triangulation tuning, usually sourced from [`codegraph::PipelineConfig`].
#[derive(Debug, Clone)]
pub struct TriangulationConfig {
    pub mode: TriangulationMode,
    pub max_parallel_agents: usize,
    pub agent_timeout: Duration,
    pub session_timeout: Duration,
    /// Consensus at or above this (with agreement) accepts.
    pub accept_threshold: f64,
    /// Consensus at or below this (with agreement) rejects.
    pub reject_threshold: f64,
    /// Minimum agreement for a non-escalated decision.
    pub agreement_min: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            mode: TriangulationMode::Parallel,
            max_parallel_agents: 3,
            agent_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(120),
            accept_threshold: 0.65,
            reject_threshold: 0.35,
            agreement_min: 0.67,
        }
    }
}

/// Consensus across agent verdicts.
///
/// `consensus = sum(w * strength * conf) / sum(w * strength)` - evidence
/// strength modulates each role's weight rather than attenuating the
/// score itself. `agreement = 1 - stddev(conf) / 0.5` (0.5 is the largest
/// possible deviation on the unit interval), clamped to `[0, 1]`.
#[must_use]
pub fn weighted_consensus(analyses: &[AgentAnalysis]) -> (f64, f64) {
    if analyses.is_empty() {
        return (0.0, 0.0);
    }
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for analysis in analyses {
        let weight = analysis.agent_type.weight() * analysis.evidence_strength.clamp(0.0, 1.0);
        weighted_sum += weight * analysis.confidence_score.clamp(0.0, 1.0);
        weight_total += weight;
    }
    let consensus = if weight_total > 0.0 {
        (weighted_sum / weight_total).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let n = analyses.len() as f64;
    let mean = analyses
        .iter()
        .map(|a| a.confidence_score.clamp(0.0, 1.0))
        .sum::<f64>()
        / n;
    let variance = analyses
        .iter()
        .map(|a| {
            let d = a.confidence_score.clamp(0.0, 1.0) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let agreement = (1.0 - variance.sqrt() / 0.5).clamp(0.0, 1.0);
    (consensus, agreement)
}

/// Apply the decision rule.
#[must_use]
pub fn decide(config: &TriangulationConfig, consensus: f64, agreement: f64) -> FinalDecision {
    if agreement >= config.agreement_min {
        if consensus >= config.accept_threshold {
            return FinalDecision::Accept;
        }
        if consensus <= config.reject_threshold {
            return FinalDecision::Reject;
        }
    }
    FinalDecision::Escalate
}

/// The `triangulated-analysis` consumer.
pub struct TriangulationWorker {
    classifier: Arc<dyn Classifier>,
    store: StagingStore,
    broker: Arc<dyn QueueBroker>,
    config: TriangulationConfig,
}

impl TriangulationWorker {
    #[must_use]
    pub fn new(
        classifier: Arc<dyn Classifier>,
        store: StagingStore,
        broker: Arc<dyn QueueBroker>,
        config: TriangulationConfig,
    ) -> Self {
        Self {
            classifier,
            store,
            broker,
            config,
        }
    }

    async fn load_request_parts(
        &self,
        relationship_id: i64,
    ) -> Result<(String, String, String, String), JobError> {
        self.store
            .with_conn(move |conn| {
                let rel = queries::relationships::get(conn, relationship_id)?.ok_or_else(|| {
                    codegraph_store::StoreError::NotFound(format!(
                        "relationship {relationship_id}"
                    ))
                })?;
                let source = queries::pois::get(conn, rel.source_poi_id)?
                    .map(|p| p.name)
                    .unwrap_or_else(|| format!("poi:{}", rel.source_poi_id));
                let target = queries::pois::get(conn, rel.target_poi_id)?
                    .map(|p| p.name)
                    .unwrap_or_else(|| format!("poi:{}", rel.target_poi_id));
                Ok((source, target, rel.rel_type, rel.file_path))
            })
            .await
            .map_err(|e| match e {
                codegraph_store::StoreError::NotFound(what) => {
                    JobError::permanent(format!("missing {what}"))
                }
                other => JobError::retriable(other.to_string()),
            })
    }

    async fn assess_one(
        &self,
        role: AgentRole,
        base: &RoleRequest,
        prior: Option<RoleAssessment>,
    ) -> Result<AgentAnalysis, String> {
        let request = RoleRequest {
            role,
            prior,
            ..base.clone()
        };
        let assessment = tokio::time::timeout(
            self.config.agent_timeout,
            self.classifier.assess_role(&request),
        )
        .await
        .map_err(|_| format!("{} agent timed out", role.as_str()))?
        .map_err(|e| format!("{} agent failed: {e}", role.as_str()))?;
        Ok(AgentAnalysis {
            session_id: String::new(), // filled by the caller
            agent_type: role,
            confidence_score: assessment.confidence,
            evidence_strength: assessment.evidence_strength,
            reasoning: assessment.reasoning,
        })
    }

    /// Run all roles under the session timeout.
    async fn run_roles(&self, base: &RoleRequest) -> Result<Vec<AgentAnalysis>, String> {
        match self.config.mode {
            TriangulationMode::Parallel => {
                let mut futures = FuturesUnordered::new();
                let mut queued: Vec<AgentRole> = AgentRole::ALL.to_vec();
                let mut results = Vec::with_capacity(AgentRole::ALL.len());
                let parallel = self.config.max_parallel_agents.max(1);
                for _ in 0..parallel.min(queued.len()) {
                    let role = queued.remove(0);
                    futures.push(self.assess_one(role, base, None));
                }
                while let Some(result) = futures.next().await {
                    results.push(result?);
                    if let Some(role) = queued.first().copied() {
                        queued.remove(0);
                        futures.push(self.assess_one(role, base, None));
                    }
                }
                Ok(results)
            }
            TriangulationMode::Sequential => {
                let mut results: Vec<AgentAnalysis> = Vec::with_capacity(AgentRole::ALL.len());
                let mut prior: Option<RoleAssessment> = None;
                for role in AgentRole::ALL {
                    let analysis = self.assess_one(role, base, prior.clone()).await?;
                    prior = Some(RoleAssessment {
                        confidence: analysis.confidence_score,
                        evidence_strength: analysis.evidence_strength,
                        reasoning: analysis.reasoning.clone(),
                        details: serde_json::Value::Null,
                    });
                    results.push(analysis);
                }
                Ok(results)
            }
        }
    }

    /// Persist a FAILED session; the relationship keeps its prior state.
    async fn fail_session(&self, session_id: String, reason: &str) -> Result<(), JobError> {
        warn!(session_id = %session_id, reason, "Triangulation session failed");
        self.store
            .transaction(move |tx| {
                queries::triangulation::transition_session(tx, &session_id, SessionStatus::Failed)
            })
            .await
            .map_err(|e| JobError::retriable(format!("session fail transition: {e}")))
    }
}

#[async_trait]
impl JobHandler for TriangulationWorker {
    fn worker_type(&self) -> &'static str {
        queues::TRIANGULATED_ANALYSIS
    }

    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let request: TriangulationJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid triangulation payload: {e}")))?;

        let (source_name, target_name, rel_type, file_path) =
            self.load_request_parts(request.relationship_id).await?;

        // Create the session and take the IN_PROGRESS row lock.
        let session = TriangulationSession::pending(
            request.relationship_id,
            request.run_id.clone(),
            request.initial_confidence,
        );
        let session_id = session.session_id.clone();
        let session_for_txn = session.clone();
        self.store
            .transaction(move |tx| {
                queries::triangulation::create_session(tx, &session_for_txn)?;
                queries::triangulation::transition_session(
                    tx,
                    &session_for_txn.session_id,
                    SessionStatus::InProgress,
                )
            })
            .await
            .map_err(|e| JobError::retriable(format!("session create: {e}")))?;

        let base = RoleRequest {
            role: AgentRole::Syntactic,
            source_name,
            target_name,
            rel_type,
            file_path,
            context: None,
            prior: None,
        };

        let roles_result =
            tokio::time::timeout(self.config.session_timeout, self.run_roles(&base)).await;
        let mut analyses = match roles_result {
            Ok(Ok(analyses)) => analyses,
            Ok(Err(reason)) => {
                self.fail_session(session_id, &reason).await?;
                return Ok(HandlerOutcome::Done);
            }
            Err(_) => {
                self.fail_session(session_id, "session timed out").await?;
                return Ok(HandlerOutcome::Done);
            }
        };
        for analysis in &mut analyses {
            analysis.session_id = session_id.clone();
        }

        // The consensus step observes every agent result.
        let (consensus, agreement) = weighted_consensus(&analyses);
        let decision = decide(&self.config, consensus, agreement);
        DECISIONS.with_label_values(&[decision.as_str()]).inc();
        info!(
            session_id = %session_id,
            relationship_id = request.relationship_id,
            consensus,
            agreement,
            decision = decision.as_str(),
            "Triangulation decision"
        );

        let consensus_row = ConsensusDecision {
            session_id: session_id.clone(),
            weighted_consensus: consensus,
            agreement_level: agreement,
            final_decision: decision,
            requires_human_review: decision == FinalDecision::Escalate,
        };

        // Persist verdicts, consensus, outcome, and the relationship effect
        // in one transaction.
        let analyses_for_txn = analyses.clone();
        let session_for_txn = session_id.clone();
        let relationship_id = request.relationship_id;
        self.store
            .transaction(move |tx| {
                for analysis in &analyses_for_txn {
                    queries::triangulation::upsert_agent_analysis(tx, analysis)?;
                }
                queries::triangulation::insert_consensus(tx, &consensus_row)?;
                queries::triangulation::set_outcome(
                    tx,
                    &session_for_txn,
                    Some(consensus),
                    Some(consensus),
                    consensus_row.final_decision == FinalDecision::Escalate,
                )?;
                match consensus_row.final_decision {
                    FinalDecision::Accept => {
                        queries::relationships::accept_with_confidence(tx, relationship_id, consensus)?;
                    }
                    FinalDecision::Reject => {
                        queries::relationships::set_status(
                            tx,
                            relationship_id,
                            codegraph::models::RelationshipStatus::Rejected,
                        )?;
                    }
                    // Escalated relationships stay PENDING for human review.
                    FinalDecision::Escalate => {}
                }
                queries::triangulation::transition_session(
                    tx,
                    &session_for_txn,
                    SessionStatus::Completed,
                )
            })
            .await
            .map_err(|e| JobError::retriable(format!("session outcome persist: {e}")))?;

        // ACCEPT feeds each role's verdict into evidence validation.
        if decision == FinalDecision::Accept {
            let relationship_hash = self
                .store
                .with_conn(move |conn| {
                    let rel = queries::relationships::get(conn, relationship_id)?.ok_or_else(|| {
                        codegraph_store::StoreError::NotFound(format!(
                            "relationship {relationship_id}"
                        ))
                    })?;
                    Ok(hashing::relationship_hash(
                        rel.source_poi_id,
                        rel.target_poi_id,
                        &rel.rel_type,
                    ))
                })
                .await
                .map_err(|e| JobError::retriable(e.to_string()))?;

            for analysis in &analyses {
                let source = match analysis.agent_type {
                    AgentRole::Syntactic => EvidenceSource::SyntacticAgent,
                    AgentRole::Semantic => EvidenceSource::SemanticAgent,
                    AgentRole::Contextual => EvidenceSource::ContextualAgent,
                };
                let validation = ValidationJob {
                    run_id: request.run_id.clone(),
                    relationship_id,
                    relationship_hash: relationship_hash.clone(),
                    source: source.as_str().to_string(),
                    confidence: analysis.confidence_score,
                    expected_count: 4,
                };
                let key = hashing::sha256_hex(
                    format!(
                        "val:{}:{relationship_hash}:{}",
                        request.run_id,
                        source.as_str()
                    )
                    .as_bytes(),
                );
                self.broker
                    .enqueue(
                        queues::VALIDATION,
                        serde_json::to_value(&validation)
                            .map_err(|e| JobError::permanent(e.to_string()))?,
                        JobOptions::with_idempotency_key(key),
                    )
                    .await
                    .map_err(|e| JobError::retriable(format!("validation enqueue: {e}")))?;
            }
        }

        Ok(HandlerOutcome::Done)
    }
}
