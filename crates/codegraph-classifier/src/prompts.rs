// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Prompt builders.
//!
//! Three request shapes: single file, batch (`FILE 1: ...`, `FILE 2: ...`), and
//! the triangulation roles. Prompts pin the exact JSON shape the response
//! parser validates; keep the two in sync.

use codegraph::models::AgentRole;

use crate::{BatchFile, RoleRequest};

const SINGLE_FILE_INSTRUCTIONS: &str = r#"Analyze the source file below and extract every code entity (Point of Interest).

Respond with ONLY a JSON object of this exact shape:
{
  "pois": [
    {"name": "...", "type": "FunctionDefinition|ClassDefinition|MethodDefinition|VariableDeclaration|ImportStatement|ExportStatement", "start_line": 1, "end_line": 1, "is_exported": false}
  ],
  "relationships": [
    {"source": "<poi name>", "target": "<poi name, possibly defined in another file>", "type": "CALLS|IMPORTS|EXTENDS|USES", "confidence": 0.0, "reason": "..."}
  ]
}

Rules:
- Report line numbers from the file as given (1-based).
- Include relationships whose target is defined elsewhere; reference it by name.
- confidence is your certainty in [0,1] that the relationship is real."#;

/// Prompt for one file.
#[must_use]
pub fn single_file(file_path: &str, content: &str) -> String {
    format!("{SINGLE_FILE_INSTRUCTIONS}\n\nFILE: {file_path}\n```\n{content}\n```")
}

/// Prompt for a batch of small files.
#[must_use]
pub fn batch(files: &[BatchFile]) -> String {
    let mut prompt = String::from(
        r#"Analyze each source file below and extract every code entity (Point of Interest).

Respond with ONLY a JSON object of this exact shape:
{
  "files": [
    {"filePath": "<path exactly as given>", "pois": [...], "relationships": [...]}
  ]
}

Each "pois" entry: {"name", "type", "start_line", "end_line", "is_exported"}.
Each "relationships" entry: {"source", "target", "type", "confidence", "reason"}.
Every file listed below MUST appear exactly once in "files".
"#,
    );
    for (index, file) in files.iter().enumerate() {
        prompt.push_str(&format!(
            "\nFILE {}: {}\n```\n{}\n```\n",
            index + 1,
            file.file_path,
            file.content
        ));
    }
    prompt
}

fn role_viewpoint(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Syntactic => {
            "You are a syntactic analyst. Judge ONLY the syntactic evidence: \
             is there a literal call/import/extends expression connecting the two entities? \
             Ignore naming plausibility and architectural context."
        }
        AgentRole::Semantic => {
            "You are a semantic analyst. Judge ONLY semantic plausibility: \
             do the names, signatures, and apparent intent of the two entities make \
             this relationship likely? Ignore whether you can see the literal expression."
        }
        AgentRole::Contextual => {
            "You are a contextual analyst. Judge ONLY the surrounding context: \
             does the module structure, file layout, and nearby code support this \
             relationship existing?"
        }
    }
}

/// Prompt for one triangulation role.
#[must_use]
pub fn role(request: &RoleRequest) -> String {
    let mut prompt = format!(
        r#"{viewpoint}

Relationship under review: {source} -[{rel_type}]-> {target} (reported in {file_path}).

Respond with ONLY a JSON object:
{{"confidence": <0..1>, "evidence_strength": <0..1>, "reasoning": "...", "details": {{}}}}
"#,
        viewpoint = role_viewpoint(request.role),
        source = request.source_name,
        target = request.target_name,
        rel_type = request.rel_type,
        file_path = request.file_path,
    );
    if let Some(context) = &request.context {
        prompt.push_str(&format!("\nContext:\n```\n{context}\n```\n"));
    }
    if let Some(prior) = &request.prior {
        prompt.push_str(&format!(
            "\nA previous analyst assessed confidence {:.2} (evidence strength {:.2}): {}\n\
             Form your own judgment; do not simply repeat theirs.\n",
            prior.confidence, prior.evidence_strength, prior.reasoning
        ));
    }
    prompt
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::RoleAssessment;

    #[test]
    fn test_single_file_prompt_embeds_content() {
        let prompt = single_file("src/a.js", "function f() {}");
        assert!(prompt.contains("FILE: src/a.js"));
        assert!(prompt.contains("function f() {}"));
        assert!(prompt.contains("\"pois\""));
    }

    #[test]
    fn test_batch_prompt_numbers_files() {
        let files = vec![
            BatchFile {
                file_path: "a.js".to_string(),
                content: "aaa".to_string(),
            },
            BatchFile {
                file_path: "b.js".to_string(),
                content: "bbb".to_string(),
            },
        ];
        let prompt = batch(&files);
        assert!(prompt.contains("FILE 1: a.js"));
        assert!(prompt.contains("FILE 2: b.js"));
        assert!(prompt.contains("\"files\""));
    }

    #[test]
    fn test_role_prompts_differ_by_role() {
        let mut request = RoleRequest {
            role: AgentRole::Syntactic,
            source_name: "validateUser".to_string(),
            target_name: "createUser".to_string(),
            rel_type: "CALLS".to_string(),
            file_path: "b.js".to_string(),
            context: None,
            prior: None,
        };
        let syntactic = role(&request);
        request.role = AgentRole::Semantic;
        let semantic = role(&request);
        assert_ne!(syntactic, semantic);
        assert!(syntactic.contains("syntactic"));
        assert!(semantic.contains("semantic"));
    }

    #[test]
    fn test_sequential_prior_is_included() {
        let request = RoleRequest {
            role: AgentRole::Contextual,
            source_name: "a".to_string(),
            target_name: "b".to_string(),
            rel_type: "CALLS".to_string(),
            file_path: "x.js".to_string(),
            context: None,
            prior: Some(RoleAssessment {
                confidence: 0.72,
                evidence_strength: 0.8,
                reasoning: "saw the call".to_string(),
                details: serde_json::Value::Null,
            }),
        };
        let prompt = role(&request);
        assert!(prompt.contains("0.72"));
        assert!(prompt.contains("saw the call"));
    }
}
