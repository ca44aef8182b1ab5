//! Build management commands: `cancel`, `delete`, `cleanup`.

use anyhow::Result;
use chrono::Utc;
use foundry::BuildService;
use foundry::config::FoundryConfig;
use foundry_common::BuildFilter;

use super::resolve_build_id;

pub async fn cmd_cancel(config: &FoundryConfig, id: &str) -> Result<()> {
    let service = BuildService::from_config(config)?;
    let id = resolve_build_id(&service, id).await?;
    if !service.cancel(id).await? {
        let status = service.get_status(id).await?.status;
        println!("Build {} already finished ({})", id, status);
        return Ok(());
    }
    let report = service.get_status(id).await?;
    if report.status.is_terminal() {
        println!("Build {} cancelled", id);
    } else {
        println!("Cancellation requested for build {}", id);
        println!("The driving process stops it at the next stage or task boundary.");
    }
    Ok(())
}

pub async fn cmd_delete(config: &FoundryConfig, id: &str, yes: bool) -> Result<()> {
    use dialoguer::Confirm;

    let service = BuildService::from_config(config)?;
    let id = resolve_build_id(&service, id).await?;
    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!("Delete build {}?", id))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Delete cancelled");
            return Ok(());
        }
    }
    service.delete(id).await?;
    println!("Deleted build {}", id);
    Ok(())
}

pub async fn cmd_cleanup(
    config: &FoundryConfig,
    older_than_days: Option<u32>,
    yes: bool,
) -> Result<()> {
    use dialoguer::Confirm;

    let days = older_than_days.unwrap_or(config.toml.retention.max_age_days);
    let older_than = chrono::Duration::days(i64::from(days));
    let cutoff = Utc::now() - older_than;

    let service = BuildService::from_config(config)?;
    let candidates = service
        .list(&BuildFilter::default())
        .await?
        .into_iter()
        .filter(|b| b.status.is_terminal() && b.finished_at.is_some_and(|at| at < cutoff))
        .count();

    if candidates == 0 {
        println!("No finished builds older than {} day(s).", days);
        return Ok(());
    }

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Delete {} finished build(s) older than {} day(s)?",
                candidates, days
            ))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Cleanup cancelled");
            return Ok(());
        }
    }

    let removed = service.cleanup(older_than).await?;
    println!("Removed {} build(s)", removed.len());
    Ok(())
}
