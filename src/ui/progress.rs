use std::time::Duration;

use console::style;
use foundry_common::BuildId;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast;

use crate::events::BuildEvent;
use crate::ui::icons::{CHECK, CROSS, FILE_NEW, REVIEW, RETRY, RUNNING, SPARKLE, STOP};

/// Live view of one build, driven by its events.
///
/// Two stacked bars:
/// - Status spinner with the current build status
/// - File bar counting approved file tasks against the plan size
pub struct BuildProgress {
    multi: MultiProgress,
    status_bar: ProgressBar,
    file_bar: ProgressBar,
    verbose: bool,
}

impl BuildProgress {
    pub fn new(build_id: BuildId, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let status_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let status_bar = multi.add(ProgressBar::new_spinner());
        status_bar.set_style(status_style);
        status_bar.set_prefix(format!("Build {}", build_id.short()));
        status_bar.set_message("pending");
        status_bar.enable_steady_tick(Duration::from_millis(120));

        let file_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░");
        let file_bar = multi.add(ProgressBar::new(0));
        file_bar.set_style(file_style);
        file_bar.set_prefix("  Files");

        Self {
            multi,
            status_bar,
            file_bar,
            verbose,
        }
    }

    // Falls back to stderr when the terminal is gone.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle(&self, event: &BuildEvent) {
        match event {
            BuildEvent::Submitted { .. } => {}
            BuildEvent::StatusChanged { to, .. } => {
                self.status_bar.set_message(style(to.as_str()).yellow().to_string());
            }
            BuildEvent::PlanAccepted { files, .. } => {
                self.file_bar.set_length(files.len() as u64);
                self.print_line(format!("{}File plan: {} file(s)", SPARKLE, files.len()));
                if self.verbose {
                    for file in files {
                        self.print_line(format!("    {}{}", FILE_NEW, style(file).dim()));
                    }
                }
            }
            BuildEvent::TaskStarted { path, attempt, .. } => {
                self.file_bar.set_message(path.clone());
                if self.verbose {
                    self.print_line(format!(
                        "  {}{} {}",
                        RUNNING,
                        path,
                        style(format!("(attempt {})", attempt)).dim()
                    ));
                }
            }
            BuildEvent::TaskCandidate {
                path,
                attempt,
                bytes,
                ..
            } => {
                if self.verbose {
                    self.print_line(format!(
                        "  {}{} {}",
                        REVIEW,
                        path,
                        style(format!("(attempt {}, {} bytes)", attempt, bytes)).dim()
                    ));
                }
            }
            BuildEvent::TaskRejected {
                path,
                attempt,
                reason,
                ..
            } => {
                self.print_line(format!(
                    "  {}{} rejected on attempt {}: {}",
                    RETRY,
                    style(path).yellow(),
                    attempt,
                    style(reason).dim()
                ));
            }
            BuildEvent::TaskApproved { path, attempt, .. } => {
                self.file_bar.inc(1);
                self.print_line(format!(
                    "  {}{} {}",
                    CHECK,
                    path,
                    style(format!("(attempt {})", attempt)).dim()
                ));
            }
            BuildEvent::TaskFailed { path, reason, .. } => {
                self.print_line(format!("  {}{}: {}", CROSS, style(path).red(), reason));
            }
            BuildEvent::AgentRetry {
                role,
                attempt,
                error,
                ..
            } => {
                if self.verbose {
                    self.print_line(format!(
                        "  {} {} attempt {} failed: {}",
                        style("!").yellow(),
                        role,
                        attempt,
                        style(error).dim()
                    ));
                }
            }
            BuildEvent::Published { reference, .. } => {
                self.print_line(format!("{}Published: {}", SPARKLE, style(reference).green()));
            }
            BuildEvent::Finished { status, .. } => {
                let icon = match status {
                    foundry_common::BuildStatus::Completed => CHECK,
                    foundry_common::BuildStatus::Cancelled => STOP,
                    _ => CROSS,
                };
                self.status_bar
                    .finish_with_message(format!("{}{}", icon, status));
                self.file_bar.finish();
            }
        }
    }

    /// Render events for `build_id` until it finishes or the bus closes.
    pub async fn follow(self, build_id: BuildId, mut rx: broadcast::Receiver<BuildEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) if event.build_id() == build_id => {
                    self.handle(&event);
                    if matches!(event, BuildEvent::Finished { .. }) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress view lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        self.status_bar.finish_and_clear();
        self.file_bar.finish_and_clear();
    }
}
