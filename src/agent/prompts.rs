//! Prompt wording for the command-backed agents.

use foundry_common::{AgentRole, Specification};

use super::{ArchitectRequest, CodeRequest, DependencyFile, ReviewRequest, SpecifyRequest};

const SPECIFIER_PROMPT: &str = r#"You are a product engineer. Turn the user's request into a concise software specification.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "summary": "One paragraph describing what will be built",
  "features": ["Each user-visible feature, one short sentence each"],
  "stack": "Language, framework and storage choices"
}
"#;

const ARCHITECT_PROMPT: &str = r#"You are a software architect. Break the specification into the source files that implement it.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "files": [
    {
      "path": "relative/path/to/file.ext",
      "description": "What this file contains and exposes",
      "depends_on": ["relative/path/of/files/this/one/imports"]
    }
  ]
}

Rules:
- Paths are relative and must not contain "..".
- depends_on only names paths that appear in "files".
- Dependencies must not form a cycle.
- Prefer a handful of cohesive files over many tiny ones.
"#;

const CODER_PROMPT: &str = r#"You are a senior software engineer. Write the complete content of exactly one file.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "content": "The full file content"
}

Rules:
- Only write the requested file. Do not describe other files.
- Use the dependency files exactly as they are; do not redefine what they export.
- If reviewer feedback is present, address every point of it.
"#;

const REVIEWER_PROMPT: &str = r#"You are a strict code reviewer. Judge whether one file correctly fulfils its description within the specification.

You MUST respond with valid JSON only (no markdown, no explanation) matching one of:
{"verdict": "approved", "comment": "optional note"}
{"verdict": "rejected", "reason": "What must change, specific enough to act on"}
"#;

pub fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Specifier => SPECIFIER_PROMPT,
        AgentRole::Architect => ARCHITECT_PROMPT,
        AgentRole::Coder => CODER_PROMPT,
        AgentRole::Reviewer => REVIEWER_PROMPT,
    }
}

fn render_specification(spec: &Specification) -> String {
    let mut out = format!("## Specification\n\n{}\n", spec.summary);
    if !spec.features.is_empty() {
        out.push_str("\n### Features\n");
        for feature in &spec.features {
            out.push_str(&format!("- {}\n", feature));
        }
    }
    if !spec.stack.is_empty() {
        out.push_str(&format!("\n### Stack\n{}\n", spec.stack));
    }
    out
}

fn render_dependencies(deps: &[DependencyFile]) -> String {
    if deps.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Dependency files\n");
    for dep in deps {
        out.push_str(&format!("\n### {}\n```\n{}\n```\n", dep.path, dep.content));
    }
    out
}

pub fn specify(request: &SpecifyRequest) -> String {
    format!("{}\n## Request\n\n{}\n", SPECIFIER_PROMPT, request.request)
}

pub fn architect(request: &ArchitectRequest) -> String {
    format!(
        "{}\n## Request\n\n{}\n\n{}",
        ARCHITECT_PROMPT,
        request.request,
        render_specification(&request.specification)
    )
}

pub fn code(request: &CodeRequest) -> String {
    let mut out = format!(
        "{}\n{}\n## File to write\n\nPath: {}\nDescription: {}\nAttempt: {}\n",
        CODER_PROMPT,
        render_specification(&request.specification),
        request.task.path,
        request.task.description,
        request.task.attempt,
    );
    out.push_str(&render_dependencies(&request.dependencies));
    if !request.feedback.is_empty() {
        out.push_str("\n## Reviewer feedback from earlier attempts\n");
        for (i, reason) in request.feedback.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, reason));
        }
    }
    out
}

pub fn review(request: &ReviewRequest) -> String {
    let mut out = format!(
        "{}\n{}\n## File under review\n\nPath: {}\nDescription: {}\n\n```\n{}\n```\n",
        REVIEWER_PROMPT,
        render_specification(&request.specification),
        request.task.path,
        request.task.description,
        request.content,
    );
    out.push_str(&render_dependencies(&request.dependencies));
    out
}
