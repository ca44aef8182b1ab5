//! Foreground build commands: `run`, `submit`, `resume`.

use anyhow::{Context, Result};
use foundry::config::FoundryConfig;
use foundry::events::BuildEvent;
use foundry::ui::{BuildProgress, report};
use foundry::{BuildService, BuildStatusReport};
use foundry_common::{BuildId, BuildStatus};
use tokio::sync::broadcast;

use super::resolve_build_id;

pub async fn cmd_run(
    config: &FoundryConfig,
    request: &str,
    json: bool,
    verbose: bool,
) -> Result<BuildStatus> {
    let service = BuildService::from_config(config)?;
    // Subscribe before submitting so no early event is missed.
    let events = service.subscribe();
    let id = service.submit(request).await.context("Failed to submit build")?;
    if !json {
        println!("Build {} submitted", id);
    }
    follow(&service, id, events, json, verbose).await
}

pub async fn cmd_submit(config: &FoundryConfig, request: &str, json: bool) -> Result<()> {
    let service = BuildService::from_config(config)?;
    let id = service.create(request).await.context("Failed to submit build")?;
    if json {
        println!("{}", serde_json::json!({ "id": id, "status": BuildStatus::Pending }));
    } else {
        println!("Build {} is pending", id);
        println!("Start it with 'foundry resume {}'", id);
    }
    Ok(())
}

pub async fn cmd_resume(
    config: &FoundryConfig,
    id: &str,
    republish: bool,
    json: bool,
    verbose: bool,
) -> Result<BuildStatus> {
    let service = BuildService::from_config(config)?;
    let id = resolve_build_id(&service, id).await?;
    let events = service.subscribe();
    service
        .resume(id, republish)
        .await
        .with_context(|| format!("Failed to resume build {}", id))?;
    if !json {
        println!("Resuming build {}", id);
    }
    follow(&service, id, events, json, verbose).await
}

/// Render progress until the driver stops. Ctrl-C requests cancellation and
/// keeps waiting for the build to reach a boundary.
async fn follow(
    service: &BuildService,
    id: BuildId,
    events: broadcast::Receiver<BuildEvent>,
    json: bool,
    verbose: bool,
) -> Result<BuildStatus> {
    let progress = (!json).then(|| {
        let view = BuildProgress::new(id, verbose);
        tokio::spawn(view.follow(id, events))
    });

    let wait = service.wait(id);
    tokio::pin!(wait);
    let build = tokio::select! {
        build = &mut wait => build?,
        Ok(()) = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling build {}...", id.short());
            service.cancel(id).await?;
            wait.await?
        }
    };

    if let Some(handle) = progress {
        if build.is_terminal() {
            let _ = handle.await;
        } else {
            handle.abort();
        }
    }

    let status_report = BuildStatusReport::from_build(&build, false);
    if json {
        println!("{}", serde_json::to_string_pretty(&status_report)?);
    } else {
        report::print_outcome(&status_report);
    }
    Ok(build.status)
}
