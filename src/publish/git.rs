//! Publishes approved files as a commit on a per-build branch.
//!
//! The commit is assembled with git2 directly from the object database, so
//! the user's checkout is never touched. The branch starts at the existing
//! branch tip (re-publication) or at the base branch. Pushing goes through
//! the `git` CLI so the user's credential helpers apply, and is never
//! retried. Pull request calls are retried on transient API errors.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use foundry_common::{BuildId, PublicationResult};
use git2::{ObjectType, Oid, Repository, Signature, Tree};

use super::github::{GitHubClient, PullRequest, parse_owner_repo_from_url};
use super::{PublishRequest, Publisher};
use crate::config::FoundryConfig;
use crate::errors::PublishError;
use crate::plan::normalize_path;
use crate::retry::{RetryPolicy, with_backoff};
use crate::util::{slugify, truncate};

const BRANCH_PREFIX: &str = "foundry/build";
const FILE_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;

/// `foundry/build-<first 8 of id>-<slug of title>`.
pub fn branch_name(build_id: BuildId, title: &str) -> String {
    let slug = slugify(title, 40);
    if slug.is_empty() {
        format!("{}-{}", BRANCH_PREFIX, build_id.short())
    } else {
        format!("{}-{}-{}", BRANCH_PREFIX, build_id.short(), slug)
    }
}

pub fn pull_request_title(title: &str) -> String {
    format!("foundry: {}", truncate(title.lines().next().unwrap_or_default().trim(), 72))
}

pub fn pull_request_body(request: &PublishRequest) -> String {
    let mut body = format!(
        "## Summary\n\nAutomated build `{}` for:\n\n> {}\n\n## Files\n\n",
        request.build_id,
        request.title.trim()
    );
    for file in &request.files {
        body.push_str(&format!("- `{}` ({})\n", file.path, &file.digest()[..12]));
    }
    body.push_str("\n---\n*Created by Foundry*");
    body
}

/// Outcome of writing the commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub commit: String,
    /// False when the branch already held identical content.
    pub created: bool,
}

pub struct GitPublisher {
    repo_path: PathBuf,
    remote: String,
    base_branch: String,
    open_pull_request: bool,
    github: Option<GitHubClient>,
    api_policy: RetryPolicy,
}

impl GitPublisher {
    pub fn new(repo_path: PathBuf, base_branch: &str) -> Self {
        Self {
            repo_path,
            remote: String::new(),
            base_branch: base_branch.to_string(),
            open_pull_request: false,
            github: None,
            api_policy: RetryPolicy::default(),
        }
    }

    /// An empty remote keeps the branch local.
    pub fn with_remote(mut self, remote: &str) -> Self {
        self.remote = remote.trim().to_string();
        self
    }

    pub fn with_pull_requests(mut self, client: GitHubClient, policy: RetryPolicy) -> Self {
        self.open_pull_request = true;
        self.github = Some(client);
        self.api_policy = policy;
        self
    }

    pub fn from_config(config: &FoundryConfig) -> Self {
        let section = &config.toml.publish;
        let mut publisher =
            Self::new(config.repo_path(), &section.base_branch).with_remote(&section.remote);
        if section.open_pull_request {
            publisher.open_pull_request = true;
            publisher.github = config.github_token().map(|t| GitHubClient::new(&t));
            publisher.api_policy = config
                .retry_policy()
                .with_max_attempts(section.api_attempts.max(1));
        }
        publisher
    }

    async fn push(&self, branch: &str) -> Result<(), PublishError> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        let output = tokio::process::Command::new("git")
            .args(["push", &self.remote, &refspec])
            .current_dir(&self.repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PublishError::Git(format!("failed to run git push: {}", e)))?;

        if !output.status.success() {
            return Err(PublishError::Push {
                branch: branch.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_pull_request(
        &self,
        request: &PublishRequest,
        branch: &str,
    ) -> Result<PullRequest, PublishError> {
        let client = self.github.as_ref().ok_or_else(|| {
            PublishError::Auth("no GitHub token configured (publish.github_token or GITHUB_TOKEN)".into())
        })?;
        let url = remote_url(&self.repo_path, &self.remote)?;
        let owner_repo =
            parse_owner_repo_from_url(&url).ok_or_else(|| PublishError::InvalidRemote(url.clone()))?;

        let existing = with_backoff(&self.api_policy, PublishError::is_retryable, |_| {
            client.find_open_pull_request(&owner_repo, branch)
        })
        .await?;
        if let Some(pr) = existing {
            tracing::info!(branch, number = pr.number, "pull request already open");
            return Ok(pr);
        }

        let title = pull_request_title(&request.title);
        let body = pull_request_body(request);
        let pr = with_backoff(&self.api_policy, PublishError::is_retryable, |_| {
            client.create_pull_request(&owner_repo, branch, &self.base_branch, &title, &body)
        })
        .await?;
        tracing::info!(branch, number = pr.number, url = %pr.html_url, "opened pull request");
        Ok(pr)
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublicationResult, PublishError> {
        for file in &request.files {
            normalize_path(&file.path).map_err(|_| PublishError::UnsafePath(file.path.clone()))?;
        }

        let branch = branch_name(request.build_id, &request.title);
        let repo_path = self.repo_path.clone();
        let base = self.base_branch.clone();
        let remote = self.remote.clone();
        let files: Vec<(String, String)> = request
            .files
            .iter()
            .map(|f| (f.path.clone(), f.content.clone()))
            .collect();
        let message = format!("foundry: {}\n\nBuild {}", truncate(&request.title, 72), request.build_id);
        let branch_for_commit = branch.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            commit_files(&repo_path, &branch_for_commit, &base, &remote, &files, &message)
        })
        .await
        .map_err(|e| PublishError::Git(format!("commit task panicked: {}", e)))??;

        tracing::info!(
            build_id = %request.build_id,
            branch = %branch,
            commit = %outcome.commit,
            created = outcome.created,
            "committed approved files"
        );

        let mut url = None;
        if !self.remote.is_empty() {
            self.push(&branch).await?;
            if self.open_pull_request {
                url = Some(self.ensure_pull_request(request, &branch).await?.html_url);
            }
        }

        Ok(PublicationResult {
            reference: url.clone().unwrap_or_else(|| branch.clone()),
            branch: Some(branch),
            commit: Some(outcome.commit),
            url,
            files: request.published_files(),
            published_at: Utc::now(),
        })
    }
}

fn remote_url(repo_path: &Path, remote: &str) -> Result<String, PublishError> {
    let repo = Repository::open(repo_path)?;
    let remote = repo.find_remote(remote)?;
    remote
        .url()
        .map(str::to_string)
        .ok_or_else(|| PublishError::InvalidRemote(remote.name().unwrap_or_default().to_string()))
}

/// Commit `files` onto `branch`, creating it from the base when missing.
///
/// The parent is the branch tip if the branch exists, otherwise the local
/// base branch, then `<remote>/<base>`, then HEAD. An unborn repository
/// gets a root commit. When the resulting tree equals the parent's tree no
/// commit is made.
pub fn commit_files(
    repo_path: &Path,
    branch: &str,
    base_branch: &str,
    remote: &str,
    files: &[(String, String)],
    message: &str,
) -> Result<CommitOutcome, PublishError> {
    let repo = Repository::open(repo_path)?;
    let branch_ref = format!("refs/heads/{}", branch);

    let mut candidates = vec![branch_ref.clone(), format!("refs/heads/{}", base_branch)];
    if !remote.is_empty() {
        candidates.push(format!("refs/remotes/{}/{}", remote, base_branch));
    }
    candidates.push("HEAD".to_string());
    let parent = candidates
        .iter()
        .find_map(|name| repo.revparse_single(name).ok()?.peel_to_commit().ok());

    let mut tree_oid = match &parent {
        Some(commit) => commit.tree_id(),
        None => repo.treebuilder(None)?.write()?,
    };
    for (path, content) in files {
        let blob = repo.blob(content.as_bytes())?;
        let components: Vec<&str> = path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();
        let base_tree = repo.find_tree(tree_oid)?;
        tree_oid = insert_blob(&repo, Some(&base_tree), &components, blob)?;
    }

    if let Some(commit) = &parent
        && commit.tree_id() == tree_oid
        && repo.find_reference(&branch_ref).is_ok()
    {
        return Ok(CommitOutcome {
            commit: commit.id().to_string(),
            created: false,
        });
    }

    let tree = repo.find_tree(tree_oid)?;
    let signature = repo
        .signature()
        .or_else(|_| Signature::now("Foundry", "foundry@localhost"))?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(
        Some(&branch_ref),
        &signature,
        &signature,
        message,
        &tree,
        &parents,
    )?;
    Ok(CommitOutcome {
        commit: oid.to_string(),
        created: true,
    })
}

fn insert_blob(
    repo: &Repository,
    tree: Option<&Tree<'_>>,
    components: &[&str],
    blob: Oid,
) -> Result<Oid, PublishError> {
    let Some((name, rest)) = components.split_first() else {
        return Err(PublishError::UnsafePath(String::new()));
    };
    let mut builder = repo.treebuilder(tree)?;
    if rest.is_empty() {
        builder.insert(name, blob, FILE_MODE)?;
    } else {
        let subtree = match tree.and_then(|t| t.get_name(name)) {
            Some(entry) if entry.kind() == Some(ObjectType::Tree) => Some(repo.find_tree(entry.id())?),
            _ => None,
        };
        let sub_oid = insert_blob(repo, subtree.as_ref(), rest, blob)?;
        builder.insert(name, sub_oid, TREE_MODE)?;
    }
    Ok(builder.write()?)
}
