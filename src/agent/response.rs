//! Parsing of agent output into typed responses.
//!
//! Agents answer with one JSON object, possibly wrapped in prose or a code
//! fence. Anything that does not fit the expected shape is a
//! `AgentError::Malformed`; there is no partial interpretation.

use foundry_common::{AgentRole, Specification, Verdict};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{CodeArtifact, PlanDraft, PlannedFile};
use crate::errors::AgentError;
use crate::util::extract_json_object;

fn parse_object<T: DeserializeOwned>(role: AgentRole, text: &str) -> Result<T, AgentError> {
    let json = extract_json_object(text)
        .ok_or_else(|| AgentError::malformed(role, "no JSON object in response"))?;
    serde_json::from_str(json).map_err(|e| AgentError::malformed(role, e.to_string()))
}

#[derive(Deserialize)]
struct SpecificationWire {
    summary: String,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    stack: Option<String>,
}

pub fn parse_specification(text: &str) -> Result<Specification, AgentError> {
    let wire: SpecificationWire = parse_object(AgentRole::Specifier, text)?;
    if wire.summary.trim().is_empty() {
        return Err(AgentError::malformed(AgentRole::Specifier, "empty summary"));
    }
    Ok(Specification {
        summary: wire.summary.trim().to_string(),
        features: wire
            .features
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect(),
        stack: wire.stack.unwrap_or_default().trim().to_string(),
    })
}

#[derive(Deserialize)]
struct PlanWire {
    #[serde(alias = "tasks")]
    files: Vec<PlannedFile>,
}

/// Shape only. Graph rules (cycles, duplicates, unknown dependencies) are
/// checked by `plan::validate`.
pub fn parse_plan(text: &str) -> Result<PlanDraft, AgentError> {
    let wire: PlanWire = parse_object(AgentRole::Architect, text)?;
    if let Some(file) = wire.files.iter().find(|f| f.path.trim().is_empty()) {
        return Err(AgentError::malformed(
            AgentRole::Architect,
            format!("file entry with empty path (description: {:?})", file.description),
        ));
    }
    Ok(PlanDraft { files: wire.files })
}

#[derive(Deserialize)]
struct CodeWire {
    content: String,
}

pub fn parse_code(text: &str) -> Result<CodeArtifact, AgentError> {
    let wire: CodeWire = parse_object(AgentRole::Coder, text)?;
    Ok(CodeArtifact {
        content: wire.content,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum VerdictKind {
    Approved,
    Rejected,
}

#[derive(Deserialize)]
struct VerdictWire {
    verdict: VerdictKind,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// A rejection must carry a reason; the Coder needs it on the next attempt.
pub fn parse_verdict(text: &str) -> Result<Verdict, AgentError> {
    let wire: VerdictWire = parse_object(AgentRole::Reviewer, text)?;
    match wire.verdict {
        VerdictKind::Approved => Ok(Verdict::Approved {
            comment: wire.comment.or(wire.reason).filter(|c| !c.trim().is_empty()),
        }),
        VerdictKind::Rejected => {
            let reason = wire
                .reason
                .or(wire.comment)
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| AgentError::malformed(AgentRole::Reviewer, "rejection without reason"))?;
            Ok(Verdict::Rejected { reason })
        }
    }
}
