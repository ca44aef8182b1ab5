//! Read-only build queries: `status`, `list`.

use anyhow::Result;
use foundry::BuildService;
use foundry::config::FoundryConfig;
use foundry::ui::report;
use foundry_common::{BuildFilter, BuildStatus};

use super::resolve_build_id;

pub async fn cmd_status(config: &FoundryConfig, id: &str, json: bool) -> Result<()> {
    let service = BuildService::from_config(config)?;
    let id = resolve_build_id(&service, id).await?;
    let status = service.get_status(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        report::print_status(&status);
    }
    Ok(())
}

pub async fn cmd_list(
    config: &FoundryConfig,
    status: Option<BuildStatus>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let service = BuildService::from_config(config)?;
    let mut filter = BuildFilter::default();
    if let Some(status) = status {
        filter = filter.with_status(status);
    }
    if let Some(limit) = limit {
        filter = filter.with_limit(limit);
    }
    let builds = service.list(&filter).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&builds)?);
    } else {
        report::print_list(&builds);
    }
    Ok(())
}
