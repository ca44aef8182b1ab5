//! End-to-end pipeline behaviour through the public `BuildService` API,
//! with scripted agents and a recording publisher.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Gate, RecordingPublisher, ScriptedAgents, file, todo_plan};
use foundry::errors::PipelineError;
use foundry::events::BuildEvent;
use foundry_common::{
    AgentRole, Build, BuildFilter, BuildStatus, ErrorKind, FileStatus, Stage,
};
use tokio::sync::broadcast;

const TODO_REQUEST: &str = "Build a todo API with persistence";

async fn run_to_end(service: &foundry::BuildService, request: &str) -> Build {
    let id = service.submit(request).await.unwrap();
    service.wait(id).await.unwrap()
}

fn drain(rx: &mut broadcast::Receiver<BuildEvent>) -> Vec<BuildEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn stage_of(status: BuildStatus) -> Option<Stage> {
    status.stage()
}

fn approved_contents(build: &Build) -> HashMap<String, String> {
    build
        .plan
        .tasks
        .iter()
        .filter(|t| t.status == FileStatus::Approved)
        .map(|t| (t.path.clone(), t.content.clone().unwrap_or_default()))
        .collect()
}

mod happy_path {
    use super::*;

    #[tokio::test]
    async fn test_todo_api_completes_and_publishes_once() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;

        assert_eq!(build.status, BuildStatus::Completed);
        assert!(build.error.is_none());
        assert!(build.plan.all_approved());
        assert_eq!(build.plan.len(), 4);
        assert_eq!(publisher.calls(), 1);

        let request = &publisher.requests()[0];
        assert_eq!(request.build_id, build.id);
        let paths: Vec<&str> = request.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["src/models.rs", "src/store.rs", "src/routes.rs", "README.md"]
        );

        let publication = build.publication.as_ref().unwrap();
        assert_eq!(publication.files.len(), 4);
        assert!(publication.reference.starts_with("recorded/"));
        assert!(build.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_dependents_receive_approved_dependency_content() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;
        let approved = approved_contents(&build);

        let routes = agents.code_requests_for("src/routes.rs");
        assert_eq!(routes.len(), 1);
        let deps: HashMap<&str, &str> = routes[0]
            .dependencies
            .iter()
            .map(|d| (d.path.as_str(), d.content.as_str()))
            .collect();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps["src/models.rs"], approved["src/models.rs"]);
        assert_eq!(deps["src/store.rs"], approved["src/store.rs"]);

        // Independent files see no dependency context.
        assert!(agents.code_requests_for("README.md")[0].dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_dependency_approved_before_dependent_starts() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);

        run_to_end(&service, TODO_REQUEST).await;

        let calls = agents.calls();
        let position = |role: AgentRole, path: &str| {
            calls
                .iter()
                .position(|(r, p)| *r == role && p.as_deref() == Some(path))
                .unwrap()
        };
        assert!(
            position(AgentRole::Reviewer, "src/models.rs")
                < position(AgentRole::Coder, "src/store.rs")
        );
        assert!(
            position(AgentRole::Reviewer, "src/store.rs")
                < position(AgentRole::Coder, "src/routes.rs")
        );
    }

    #[tokio::test]
    async fn test_status_report_shows_waves_and_digests() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;
        let report = service.get_status(build.id).await.unwrap();

        assert_eq!(report.status, BuildStatus::Completed);
        assert!(!report.running);
        let waves: HashMap<&str, Option<usize>> = report
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.wave))
            .collect();
        assert_eq!(waves["src/models.rs"], Some(0));
        assert_eq!(waves["README.md"], Some(0));
        assert_eq!(waves["src/store.rs"], Some(1));
        assert_eq!(waves["src/routes.rs"], Some(2));
        assert!(report.files.iter().all(|f| f.digest.is_some()));
        // Specifier, Architect, then Coder + Reviewer per file.
        assert_eq!(report.invocations, 2 + 4 * 2);
        assert_eq!(report.failed_invocations, 0);
    }
}

mod ordering {
    use super::*;

    #[tokio::test]
    async fn test_status_changes_never_move_stage_backwards() {
        let agents = ScriptedAgents::new(todo_plan()).rejecting("src/store.rs", 1);
        let (service, _publisher) = common::service(&agents);
        let mut rx = service.subscribe();

        let build = run_to_end(&service, TODO_REQUEST).await;
        assert_eq!(build.status, BuildStatus::Completed);

        let transitions: Vec<(BuildStatus, BuildStatus)> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::StatusChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(transitions.first(), Some(&(BuildStatus::Pending, BuildStatus::Specifying)));
        assert_eq!(
            transitions.last(),
            Some(&(BuildStatus::Publishing, BuildStatus::Completed))
        );

        for (from, to) in &transitions {
            let (Some(a), Some(b)) = (stage_of(*from), stage_of(*to)) else {
                continue;
            };
            let review_to_development = a == Stage::Review && b == Stage::Development;
            assert!(
                a <= b || review_to_development,
                "stage moved backwards: {} -> {}",
                from,
                to
            );
        }
    }

    #[tokio::test]
    async fn test_finished_event_emitted_once() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);
        let mut rx = service.subscribe();

        let build = run_to_end(&service, TODO_REQUEST).await;

        let finished: Vec<BuildEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, BuildEvent::Finished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(
            finished[0],
            BuildEvent::Finished {
                build_id: build.id,
                status: BuildStatus::Completed,
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn test_stage_times_cover_every_stage_in_order() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;

        let stages: Vec<Stage> = build.stage_times.iter().map(|t| t.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Specification,
                Stage::Architecture,
                Stage::Development,
                Stage::Review,
                Stage::Publish,
            ]
        );
        assert!(build.stage_times.iter().all(|t| t.exited_at.is_some()));
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_specifier_failure_fails_build_without_publishing() {
        let agents = ScriptedAgents::new(todo_plan()).failing(AgentRole::Specifier);
        let (service, publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;

        assert_eq!(build.status, BuildStatus::Failed);
        let error = build.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::AgentInvocation);
        assert_eq!(error.stage, Stage::Specification);
        // Two attempts under the test retry policy, both recorded.
        assert_eq!(agents.calls_for(AgentRole::Specifier), 2);
        assert_eq!(build.invocations.len(), 2);
        assert!(build.invocations.iter().all(|r| !r.succeeded()));
        assert_eq!(agents.calls_for(AgentRole::Architect), 0);
        assert_eq!(publisher.calls(), 0);
    }

    #[tokio::test]
    async fn test_cyclic_plan_fails_at_architecting() {
        let plan = vec![
            file("src/a.rs", &["src/b.rs"]),
            file("src/b.rs", &["src/a.rs"]),
        ];
        let agents = ScriptedAgents::new(plan);
        let (service, publisher) = common::service(&agents);

        let build = run_to_end(&service, "two files that need each other").await;

        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.stage, Stage::Architecture);
        let error = build.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::PlanValidation);
        assert!(error.message.to_lowercase().contains("cycle"));
        assert_eq!(agents.calls_for(AgentRole::Coder), 0);
        assert_eq!(publisher.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_dependency_fails_plan_validation() {
        let plan = vec![file("src/main.rs", &["src/missing.rs"])];
        let agents = ScriptedAgents::new(plan);
        let (service, _publisher) = common::service(&agents);

        let build = run_to_end(&service, "a binary").await;

        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.error.unwrap().kind, ErrorKind::PlanValidation);
        assert!(build.plan.is_empty());
    }

    #[tokio::test]
    async fn test_always_rejected_file_exhausts_retries() {
        let agents = ScriptedAgents::new(todo_plan()).always_rejecting("src/store.rs");
        let (service, publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;

        assert_eq!(build.status, BuildStatus::Failed);
        let error = build.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::RetryExhausted);
        assert_eq!(error.files.len(), 1);
        assert_eq!(error.files[0].path, "src/store.rs");

        let store = build.plan.task("src/store.rs").unwrap();
        assert_eq!(store.status, FileStatus::Failed);
        assert_eq!(store.retries, 3);
        assert_eq!(store.reviews.len(), 3);
        assert_eq!(agents.code_requests_for("src/store.rs").len(), 3);

        // routes.rs depends on the failed file and never starts.
        assert!(agents.code_requests_for("src/routes.rs").is_empty());
        assert_eq!(publisher.calls(), 0);
        assert!(build.publication.is_none());
    }

    #[tokio::test]
    async fn test_rejection_feedback_reaches_next_attempt() {
        let agents = ScriptedAgents::new(todo_plan()).rejecting("src/models.rs", 2);
        let (service, _publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;
        assert_eq!(build.status, BuildStatus::Completed);

        let requests = agents.code_requests_for("src/models.rs");
        assert_eq!(requests.len(), 3);
        assert!(requests[0].feedback.is_empty());
        assert_eq!(requests[1].feedback.len(), 1);
        assert_eq!(requests[2].feedback.len(), 2);
        assert!(requests[2].feedback[0].contains("attempt 1"));
        assert!(requests[2].feedback[1].contains("attempt 2"));
        assert_eq!(requests[2].task.attempt, 3);

        let models = build.plan.task("src/models.rs").unwrap();
        assert_eq!(models.retries, 2);
        assert_eq!(models.status, FileStatus::Approved);
    }

    #[tokio::test]
    async fn test_coder_failure_stops_new_rounds() {
        let agents = ScriptedAgents::new(todo_plan()).failing(AgentRole::Coder);
        let (service, publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;

        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.error.as_ref().unwrap().kind, ErrorKind::AgentInvocation);
        assert_eq!(agents.calls_for(AgentRole::Reviewer), 0);
        // Dependents of the first wave never start.
        assert!(agents.code_requests_for("src/routes.rs").is_empty());
        assert_eq!(publisher.calls(), 0);
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn test_parallel_and_sequential_runs_produce_same_files() {
        let sequential_agents =
            ScriptedAgents::new(todo_plan()).with_coder_delay(Duration::from_millis(10));
        let publisher = RecordingPublisher::default();
        let sequential = common::service_with(&sequential_agents, &publisher, common::settings(1));
        let one = run_to_end(&sequential, TODO_REQUEST).await;

        let parallel_agents =
            ScriptedAgents::new(todo_plan()).with_coder_delay(Duration::from_millis(10));
        let publisher = RecordingPublisher::default();
        let parallel = common::service_with(&parallel_agents, &publisher, common::settings(4));
        let many = run_to_end(&parallel, TODO_REQUEST).await;

        assert_eq!(one.status, BuildStatus::Completed);
        assert_eq!(many.status, BuildStatus::Completed);
        assert_eq!(approved_contents(&one), approved_contents(&many));
        assert_eq!(sequential_agents.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let plan = (0..8)
            .map(|i| file(&format!("src/m{}.rs", i), &[]))
            .collect();
        let agents = ScriptedAgents::new(plan).with_coder_delay(Duration::from_millis(20));
        let publisher = RecordingPublisher::default();
        let service = common::service_with(&agents, &publisher, common::settings(3));

        let build = run_to_end(&service, "eight independent modules").await;

        assert_eq!(build.status, BuildStatus::Completed);
        assert!(agents.peak_concurrency() <= 3);
        assert!(agents.peak_concurrency() >= 2);
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_cancel_before_start_makes_no_agent_calls() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, publisher) = common::service(&agents);

        let id = service.create(TODO_REQUEST).await.unwrap();
        assert!(service.cancel(id).await.unwrap());

        let report = service.get_status(id).await.unwrap();
        assert_eq!(report.status, BuildStatus::Cancelled);
        assert_eq!(report.stage, Stage::Specification);
        let err = service.resume(id, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotResumable { .. }));
        assert!(agents.calls().is_empty());
        assert_eq!(publisher.calls(), 0);
    }

    #[tokio::test]
    async fn test_persisted_cancel_request_stops_resumed_build() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, publisher) = common::service(&agents);

        // As left by `foundry cancel` in another process.
        let id = service.create(TODO_REQUEST).await.unwrap();
        service.pipeline().store.request_cancel(id).await.unwrap();
        service.resume(id, false).await.unwrap();
        let build = service.wait(id).await.unwrap();

        assert_eq!(build.status, BuildStatus::Cancelled);
        assert!(agents.calls().is_empty());
        assert_eq!(publisher.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_development_discards_in_flight_result() {
        let gate = Arc::new(Gate::default());
        let plan = vec![file("src/models.rs", &[]), file("src/routes.rs", &["src/models.rs"])];
        let agents = ScriptedAgents::new(plan).gated("src/models.rs", gate.clone());
        let (service, publisher) = common::service(&agents);

        let id = service.submit(TODO_REQUEST).await.unwrap();
        gate.entered.notified().await;
        assert!(service.cancel(id).await.unwrap());
        gate.release.notify_one();
        let build = service.wait(id).await.unwrap();

        assert_eq!(build.status, BuildStatus::Cancelled);
        assert_eq!(build.stage, Stage::Development);
        let models = build.plan.task("src/models.rs").unwrap();
        assert_ne!(models.status, FileStatus::Approved);
        assert_eq!(agents.calls_for(AgentRole::Reviewer), 0);
        assert!(agents.code_requests_for("src/routes.rs").is_empty());
        assert_eq!(publisher.calls(), 0);
        assert!(!service.is_running(id));
    }

    #[tokio::test]
    async fn test_cancel_of_finished_build_is_refused() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;

        assert!(!service.cancel(build.id).await.unwrap());
        let after = service.get_status(build.id).await.unwrap();
        assert_eq!(after.status, BuildStatus::Completed);
    }
}

mod resume {
    use super::*;

    #[tokio::test]
    async fn test_republish_after_publish_failure_reuses_approved_files() {
        let agents = ScriptedAgents::new(todo_plan());
        let publisher = RecordingPublisher::failing_times(1);
        let service = common::service_with(&agents, &publisher, common::settings(4));

        let failed = run_to_end(&service, TODO_REQUEST).await;
        assert_eq!(failed.status, BuildStatus::Failed);
        let error = failed.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Vcs);
        assert_eq!(error.stage, Stage::Publish);
        assert!(failed.plan.all_approved());
        let coder_calls = agents.calls_for(AgentRole::Coder);

        service.resume(failed.id, true).await.unwrap();
        let build = service.wait(failed.id).await.unwrap();

        assert_eq!(build.status, BuildStatus::Completed);
        assert!(build.error.is_none());
        assert!(build.publication.is_some());
        assert_eq!(publisher.calls(), 2);
        assert_eq!(agents.calls_for(AgentRole::Coder), coder_calls);
        assert_eq!(publisher.requests()[0].files, publisher.requests()[1].files);
    }

    #[tokio::test]
    async fn test_finished_build_is_not_resumable() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);

        let build = run_to_end(&service, TODO_REQUEST).await;

        let err = service.resume(build.id, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotResumable { .. }));
        let err = service.resume(build.id, true).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotResumable { .. }));
        assert!(!service.is_running(build.id));
    }

    #[tokio::test]
    async fn test_submitted_build_runs_on_resume() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, publisher) = common::service(&agents);

        let id = service.create(TODO_REQUEST).await.unwrap();
        let pending = service.get_status(id).await.unwrap();
        assert_eq!(pending.status, BuildStatus::Pending);
        assert!(agents.calls().is_empty());

        service.resume(id, false).await.unwrap();
        let build = service.wait(id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Completed);
        assert_eq!(publisher.calls(), 1);
    }
}

mod listing {
    use super::*;

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);

        let done = run_to_end(&service, TODO_REQUEST).await;
        let pending = service.create("another request").await.unwrap();

        let all = service.list(&BuildFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let completed = service
            .list(&BuildFilter::default().with_status(BuildStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);
        assert_eq!(completed[0].approved_files, 4);

        let waiting = service
            .list(&BuildFilter::default().with_status(BuildStatus::Pending))
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, pending);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_builds() {
        let agents = ScriptedAgents::new(todo_plan());
        let (service, _publisher) = common::service(&agents);

        let done = run_to_end(&service, TODO_REQUEST).await;

        let removed = service.cleanup(chrono::Duration::days(30)).await.unwrap();
        assert!(removed.is_empty());

        let removed = service.cleanup(chrono::Duration::zero()).await.unwrap();
        assert_eq!(removed, vec![done.id]);
    }
}
