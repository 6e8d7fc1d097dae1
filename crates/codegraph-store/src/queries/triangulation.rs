// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use rusqlite::{params, Connection, OptionalExtension};

use codegraph::models::{
    AgentAnalysis, AgentRole, ConsensusDecision, FinalDecision, SessionStatus, TriangulationSession,
};

use crate::errors::{StoreError, StoreResult};

/// Persist a fresh session (PENDING).
pub fn create_session(conn: &Connection, session: &TriangulationSession) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO triangulated_analysis_sessions
         (session_id, relationship_id, run_id, status, initial_confidence, escalated_to_human)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            session.session_id,
            session.relationship_id,
            session.run_id,
            session.status.as_str(),
            session.initial_confidence,
        ],
    )?;
    Ok(())
}

/// Transition a session's status under the session state machine. The row
/// guard doubles as the row lock: the UPDATE only succeeds from the legal
/// predecessor states.
pub fn transition_session(
    conn: &Connection,
    session_id: &str,
    to: SessionStatus,
) -> StoreResult<()> {
    let allowed_from = match to {
        SessionStatus::Pending => "('PENDING')",
        SessionStatus::InProgress => "('PENDING')",
        SessionStatus::Completed => "('IN_PROGRESS')",
        SessionStatus::Failed => "('PENDING', 'IN_PROGRESS')",
    };
    let updated = conn.execute(
        &format!(
            "UPDATE triangulated_analysis_sessions SET status = ?1
             WHERE session_id = ?2 AND status IN {allowed_from}"
        ),
        params![to.as_str(), session_id],
    )?;
    if updated == 0 {
        let current = get_session(conn, session_id)?;
        match current {
            Some(s) if s.status == to => Ok(()),
            Some(s) => Err(StoreError::Constraint(format!(
                "illegal session transition {} -> {} for {session_id}",
                s.status.as_str(),
                to.as_str()
            ))),
            None => Err(StoreError::NotFound(format!("session {session_id}"))),
        }
    } else {
        Ok(())
    }
}

/// Record the session outcome fields.
pub fn set_outcome(
    conn: &Connection,
    session_id: &str,
    final_confidence: Option<f64>,
    consensus_score: Option<f64>,
    escalated_to_human: bool,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE triangulated_analysis_sessions
         SET final_confidence = ?1, consensus_score = ?2, escalated_to_human = ?3
         WHERE session_id = ?4",
        params![final_confidence, consensus_score, escalated_to_human, session_id],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!("session {session_id}")));
    }
    Ok(())
}

/// Fetch a session.
pub fn get_session(conn: &Connection, session_id: &str) -> StoreResult<Option<TriangulationSession>> {
    let row = conn
        .query_row(
            "SELECT session_id, relationship_id, run_id, status, initial_confidence,
                    final_confidence, consensus_score, escalated_to_human
             FROM triangulated_analysis_sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(TriangulationSession {
                    session_id: row.get(0)?,
                    relationship_id: row.get(1)?,
                    run_id: row.get(2)?,
                    status: SessionStatus::parse(&row.get::<_, String>(3)?)
                        .unwrap_or(SessionStatus::Failed),
                    initial_confidence: row.get(4)?,
                    final_confidence: row.get(5)?,
                    consensus_score: row.get(6)?,
                    escalated_to_human: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Record one agent's verdict. Exactly one row per `(session, agent_type)`;
/// a redelivered verdict replaces the previous one.
pub fn upsert_agent_analysis(conn: &Connection, analysis: &AgentAnalysis) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO agent_analyses
         (session_id, agent_type, confidence_score, evidence_strength, reasoning)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            analysis.session_id,
            analysis.agent_type.as_str(),
            analysis.confidence_score,
            analysis.evidence_strength,
            analysis.reasoning,
        ],
    )?;
    Ok(())
}

/// All agent verdicts for a session.
pub fn agent_analyses(conn: &Connection, session_id: &str) -> StoreResult<Vec<AgentAnalysis>> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id, agent_type, confidence_score, evidence_strength, reasoning
         FROM agent_analyses WHERE session_id = ?1 ORDER BY agent_type",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(session_id, agent_type, confidence_score, evidence_strength, reasoning)| {
            let agent_type = AgentRole::parse(&agent_type).ok_or_else(|| {
                StoreError::Serialization(format!("unknown agent type {agent_type}"))
            })?;
            Ok(AgentAnalysis {
                session_id,
                agent_type,
                confidence_score,
                evidence_strength,
                reasoning,
            })
        })
        .collect()
}

/// Record the consensus decision for a session.
pub fn insert_consensus(conn: &Connection, decision: &ConsensusDecision) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO consensus_decisions
         (session_id, weighted_consensus, agreement_level, final_decision, requires_human_review)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            decision.session_id,
            decision.weighted_consensus,
            decision.agreement_level,
            decision.final_decision.as_str(),
            decision.requires_human_review,
        ],
    )?;
    Ok(())
}

/// Fetch the consensus decision for a session.
pub fn get_consensus(conn: &Connection, session_id: &str) -> StoreResult<Option<ConsensusDecision>> {
    let row = conn
        .query_row(
            "SELECT session_id, weighted_consensus, agreement_level, final_decision, requires_human_review
             FROM consensus_decisions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()?;
    row.map(
        |(session_id, weighted_consensus, agreement_level, decision_raw, requires_human_review)| {
            let final_decision = match decision_raw.as_str() {
                "ACCEPT" => FinalDecision::Accept,
                "REJECT" => FinalDecision::Reject,
                "ESCALATE" => FinalDecision::Escalate,
                other => {
                    return Err(StoreError::Serialization(format!(
                        "unknown final decision {other}"
                    )))
                }
            };
            Ok(ConsensusDecision {
                session_id,
                weighted_consensus,
                agreement_level,
                final_decision,
                requires_human_review,
            })
        },
    )
    .transpose()
}
