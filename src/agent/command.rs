//! Agent capabilities backed by an external command.
//!
//! The prompt goes to the child's stdin and one JSON object is expected on
//! stdout. The default command is `claude --print`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use foundry_common::{AgentRole, Specification, Verdict};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    AgentTeam, Architect, ArchitectRequest, CodeArtifact, CodeRequest, Coder, PlanDraft,
    ReviewRequest, Reviewer, Specifier, SpecifyRequest, prompts, response,
};
use crate::config::FoundryConfig;
use crate::errors::AgentError;

const STDERR_TAIL: usize = 2_000;

#[derive(Debug, Clone)]
pub struct CommandAgent {
    role: AgentRole,
    command: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn new(role: AgentRole, command: &str) -> Self {
        Self {
            role,
            command: command.to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(600),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Build the agent for `role`, applying `[agents.roles.<role>]` overrides.
    pub fn from_config(role: AgentRole, config: &FoundryConfig) -> Self {
        let agents = &config.toml.agents;
        let role_override = agents.roles.get(role.as_str());

        let command = role_override
            .and_then(|o| o.command.clone())
            .unwrap_or_else(|| config.agent_command());
        let args = role_override
            .and_then(|o| o.args.clone())
            .unwrap_or_else(|| agents.args.clone());
        let timeout_secs = role_override
            .and_then(|o| o.timeout_secs)
            .unwrap_or(agents.timeout_secs);

        Self::new(role, &command)
            .with_args(args)
            .with_timeout(Duration::from_secs(timeout_secs))
            .with_working_dir(config.project_dir.clone())
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// Run the command once with `prompt` on stdin and return its stdout.
    pub async fn run(&self, prompt: &str) -> Result<String, AgentError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let prompt = prompt.to_string();
        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(prompt.as_bytes()).await {
                    // The child may exit without reading its input.
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                        return Err(AgentError::Transport(format!("writing prompt: {}", e)));
                    }
                    _ => {}
                }
                drop(stdin);
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| AgentError::Transport(format!("waiting for agent: {}", e)))
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| AgentError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(STDERR_TAIL)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Err(AgentError::NonZeroExit {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: tail.trim().to_string(),
            });
        }

        tracing::debug!(
            role = %self.role,
            bytes = output.stdout.len(),
            "agent command finished"
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Specifier for CommandAgent {
    async fn specify(&self, request: &SpecifyRequest) -> Result<Specification, AgentError> {
        let out = self.run(&prompts::specify(request)).await?;
        response::parse_specification(&out)
    }
}

#[async_trait]
impl Architect for CommandAgent {
    async fn architect(&self, request: &ArchitectRequest) -> Result<PlanDraft, AgentError> {
        let out = self.run(&prompts::architect(request)).await?;
        response::parse_plan(&out)
    }
}

#[async_trait]
impl Coder for CommandAgent {
    async fn code(&self, request: &CodeRequest) -> Result<CodeArtifact, AgentError> {
        let out = self.run(&prompts::code(request)).await?;
        response::parse_code(&out)
    }
}

#[async_trait]
impl Reviewer for CommandAgent {
    async fn review(&self, request: &ReviewRequest) -> Result<Verdict, AgentError> {
        let out = self.run(&prompts::review(request)).await?;
        response::parse_verdict(&out)
    }
}

/// The default team: one command-backed agent per role.
pub fn team_from_config(config: &FoundryConfig) -> AgentTeam {
    AgentTeam::new(
        Arc::new(CommandAgent::from_config(AgentRole::Specifier, config)),
        Arc::new(CommandAgent::from_config(AgentRole::Architect, config)),
        Arc::new(CommandAgent::from_config(AgentRole::Coder, config)),
        Arc::new(CommandAgent::from_config(AgentRole::Reviewer, config)),
    )
}
