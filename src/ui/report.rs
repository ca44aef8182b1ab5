//! Plain-text rendering of build records for `status`, `list` and the end
//! of `run`.

use chrono::{DateTime, Utc};
use console::style;
use foundry_common::{BuildStatus, BuildSummary, FileStatus};

use crate::orchestrator::BuildStatusReport;
use crate::ui::icons::{CHECK, CROSS, PENDING, REVIEW, RUNNING, STOP};
use crate::util::truncate;

// Padded before styling; ANSI codes would break column widths.
fn status_label(status: BuildStatus, width: usize) -> String {
    let text = format!("{:<width$}", status.as_str());
    match status {
        BuildStatus::Completed => style(text).green().to_string(),
        BuildStatus::Failed => style(text).red().to_string(),
        BuildStatus::Cancelled => style(text).yellow().to_string(),
        _ => style(text).cyan().to_string(),
    }
}

fn file_icon(status: FileStatus) -> console::Emoji<'static, 'static> {
    match status {
        FileStatus::Approved => CHECK,
        FileStatus::Failed => CROSS,
        FileStatus::InReview => REVIEW,
        FileStatus::InDevelopment => RUNNING,
        FileStatus::Pending => PENDING,
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn print_status(report: &BuildStatusReport) {
    println!();
    println!("Build {}", style(report.id).bold());
    println!("  Request: {}", truncate(&report.request, 100));
    println!(
        "  Status:  {} ({} stage){}",
        status_label(report.status, 0),
        report.stage,
        if report.running {
            style(" running here").dim().to_string()
        } else {
            String::new()
        }
    );
    println!("  Created: {}", timestamp(report.created_at));
    if let Some(finished) = report.finished_at {
        println!("  Finished: {}", timestamp(finished));
    }

    if !report.stage_times.is_empty() {
        println!();
        println!("Stages:");
        for timing in &report.stage_times {
            let elapsed = timing
                .exited_at
                .map(|end| format!("{}s", (end - timing.entered_at).num_seconds()))
                .unwrap_or_else(|| "in progress".to_string());
            println!("  {:<14} {}", timing.stage.as_str(), elapsed);
        }
    }

    if let Some(spec) = &report.specification {
        println!();
        println!("Specification: {}", spec.summary);
        for feature in &spec.features {
            println!("  - {}", feature);
        }
    }

    if !report.files.is_empty() {
        println!();
        println!(
            "{:<4} {:<40} {:<15} {:<5} {:<7} Depends on",
            "", "File", "Status", "Wave", "Retries"
        );
        for file in &report.files {
            println!(
                "{:<4} {:<40} {:<15} {:<5} {:<7} {}",
                file_icon(file.status),
                truncate(&file.path, 40),
                file.status.as_str(),
                file.wave.map(|w| w.to_string()).unwrap_or_else(|| "-".into()),
                file.retries,
                file.depends_on.join(", ")
            );
            if let Some(reason) = &file.last_rejection
                && file.status != FileStatus::Approved
            {
                println!("       {}", style(format!("last rejection: {}", truncate(reason, 90))).dim());
            }
        }
    }

    if let Some(error) = &report.error {
        println!();
        println!(
            "{} {} during {}: {}",
            style("Error:").red().bold(),
            error.kind,
            error.stage,
            error.message
        );
        for file in &error.files {
            println!("  {} {}", style(&file.path).red(), file.reason);
        }
    }

    if let Some(publication) = &report.publication {
        println!();
        println!("Published: {}", style(&publication.reference).green());
        if let Some(commit) = &publication.commit {
            println!("  Commit: {}", commit);
        }
    }

    println!();
    println!(
        "Agent invocations: {} ({} failed)",
        report.invocations, report.failed_invocations
    );
    println!();
}

pub fn print_list(builds: &[BuildSummary]) {
    if builds.is_empty() {
        println!();
        println!("No builds found. Run 'foundry run \"<request>\"' to start one.");
        println!();
        return;
    }

    println!();
    println!(
        "{:<10} {:<12} {:<7} {:<19} Request",
        "Build", "Status", "Files", "Updated"
    );
    println!(
        "{:<10} {:<12} {:<7} {:<19} -------",
        "----------", "------------", "-------", "-------------------"
    );
    for build in builds {
        println!(
            "{:<10} {} {:<7} {:<19} {}",
            build.id.short(),
            status_label(build.status, 12),
            format!("{}/{}", build.approved_files, build.total_files),
            timestamp(build.updated_at),
            truncate(&build.request, 60)
        );
    }
    println!();
}

/// One-line outcome printed after a foreground run.
pub fn print_outcome(report: &BuildStatusReport) {
    match report.status {
        BuildStatus::Completed => {
            let reference = report
                .publication
                .as_ref()
                .map(|p| p.reference.as_str())
                .unwrap_or("-");
            println!("{}Build {} completed: {}", CHECK, report.id.short(), reference);
        }
        BuildStatus::Cancelled => {
            println!("{}Build {} cancelled", STOP, report.id.short());
        }
        BuildStatus::Failed => {
            let reason = report
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.kind, e.message))
                .unwrap_or_default();
            println!("{}Build {} failed. {}", CROSS, report.id.short(), reason);
            if report.error.as_ref().is_some_and(|e| e.stage == foundry_common::Stage::Publish) {
                println!(
                    "  Retry publishing with 'foundry resume {} --republish'",
                    report.id
                );
            }
        }
        status => {
            println!(
                "Build {} stopped at {}. Continue with 'foundry resume {}'",
                report.id.short(),
                status,
                report.id
            );
        }
    }
}
