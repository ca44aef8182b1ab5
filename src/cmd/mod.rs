//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                 |
//! |-----------|----------------------------------|
//! | `build`   | `Run`, `Submit`, `Resume`        |
//! | `query`   | `Status`, `List`                 |
//! | `manage`  | `Cancel`, `Delete`, `Cleanup`    |
//! | `project` | `Init`                           |
//! | `config`  | `Config`                         |

pub mod build;
pub mod config;
pub mod manage;
pub mod project;
pub mod query;

use anyhow::{Result, bail};
use foundry::BuildService;
use foundry_common::{BuildFilter, BuildId};

pub use build::{cmd_resume, cmd_run, cmd_submit};
pub use config::cmd_config;
pub use manage::{cmd_cancel, cmd_cleanup, cmd_delete};
pub use project::cmd_init;
pub use query::{cmd_list, cmd_status};

/// Accept a full build id or a unique prefix of one.
pub async fn resolve_build_id(service: &BuildService, text: &str) -> Result<BuildId> {
    if let Ok(id) = text.parse::<BuildId>() {
        return Ok(id);
    }
    let prefix = text.trim().to_lowercase();
    if prefix.is_empty() {
        bail!("Build id must not be empty");
    }
    let matches: Vec<BuildId> = service
        .list(&BuildFilter::default())
        .await?
        .into_iter()
        .map(|summary| summary.id)
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No build matches '{}'", text),
        _ => bail!(
            "Build id prefix '{}' is ambiguous ({} matches)",
            text,
            matches.len()
        ),
    }
}
