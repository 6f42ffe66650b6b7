//! End-to-end convergence sessions against in-memory collaborators.
//!
//! Time is paused so poll cadences and guardrail durations run instantly.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use socialsync_common::{
    CoverageMode, EngineConfig, ExternalItem, Platform, Provenance, RunState, SyncError, Window, WindowKind,
};
use socialsync_engine::testing::{
    completed_with_failures, discovery, status, MemoryProgressSink, MockBackend, ScriptedCoverage,
};
use socialsync_engine::{
    ConvergeRequest, ConvergenceEngine, EngineDeps, GuardrailReason, PollPolicy, Progress,
    ProgressSink, SessionOutcome,
};

fn window() -> Window {
    Window {
        key: "episode-4".into(),
        label: "Episode 4".into(),
        start: None,
        end: None,
        kind: WindowKind::Episode,
        provenance: Provenance::FallbackDerived,
        episode_number: Some(4),
    }
}

fn platforms() -> BTreeSet<Platform> {
    BTreeSet::from([Platform::Reddit, Platform::Tiktok, Platform::Instagram])
}

fn request() -> ConvergeRequest {
    ConvergeRequest::new("rhoslc", window(), platforms())
}

struct Harness {
    backend: Arc<MockBackend>,
    coverage: Arc<ScriptedCoverage>,
    sink: Arc<MemoryProgressSink>,
    engine: ConvergenceEngine<MockBackend, ScriptedCoverage>,
}

fn harness(backend: MockBackend, coverage: ScriptedCoverage, config: EngineConfig) -> Harness {
    harness_with_policy(backend, coverage, config, None)
}

fn harness_with_policy(
    backend: MockBackend,
    coverage: ScriptedCoverage,
    config: EngineConfig,
    policy: Option<PollPolicy>,
) -> Harness {
    let backend = Arc::new(backend);
    let coverage = Arc::new(coverage);
    let sink = Arc::new(MemoryProgressSink::new());
    let engine = ConvergenceEngine::new(
        EngineDeps::builder()
            .backend(Arc::clone(&backend))
            .coverage(Arc::clone(&coverage))
            .sink(Arc::clone(&sink) as Arc<dyn ProgressSink>)
            .config(config)
            .policy(policy)
            .build(),
    );
    Harness {
        backend,
        coverage,
        sink,
        engine,
    }
}

fn full_coverage() -> ScriptedCoverage {
    ScriptedCoverage::new().pass([
        (Platform::Reddit, 40, Some(40)),
        (Platform::Tiktok, 12, Some(12)),
        (Platform::Instagram, 9, None),
    ])
}

#[tokio::test(start_paused = true)]
async fn guardrail_stops_after_exactly_max_passes() {
    let config = EngineConfig {
        max_passes: 2,
        ..EngineConfig::default()
    };
    let h = harness(
        MockBackend::new(),
        ScriptedCoverage::new()
            .pass([(Platform::Tiktok, 10, Some(100))])
            .pass([(Platform::Tiktok, 20, Some(100))]),
        config,
    );

    let outcome = h.engine.converge(&request()).await.unwrap();

    match outcome {
        SessionOutcome::Incomplete {
            passes,
            reason,
            coverage,
            ..
        } => {
            assert_eq!(passes, 2);
            assert_eq!(reason, GuardrailReason::MaxPasses);
            assert_eq!(coverage.unwrap().by_platform[&Platform::Tiktok].saved, 20);
        }
        other => panic!("expected Incomplete, got {other:?}"),
    }
    assert_eq!(h.backend.created_runs().len(), 2);
    assert_eq!(h.coverage.calls(), 2);
    assert!(matches!(h.sink.last(), Some(Progress::Incomplete { .. })));
}

#[tokio::test(start_paused = true)]
async fn full_sync_waits_for_media_mirroring() {
    let h = harness(
        MockBackend::new(),
        full_coverage()
            .mirror_pass([(Platform::Reddit, 0, 5), (Platform::Tiktok, 3, 8)])
            .mirror_pass([(Platform::Reddit, 0, 5), (Platform::Tiktok, 0, 8)]),
        EngineConfig::default(),
    );
    let mut full_sync = request();
    full_sync.coverage_mode = CoverageMode::FullSync;

    let outcome = h.engine.converge(&full_sync).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Succeeded { passes: 2, .. }));

    let runs = h.backend.created_runs();
    assert_eq!(runs[1].platforms, BTreeSet::from([Platform::Tiktok]));
    assert_eq!(h.coverage.mirror_calls(), 2);
    assert_eq!(h.coverage.requeued(), vec![BTreeSet::from([Platform::Tiktok])]);
    assert!(h.sink.reports().iter().any(|p| matches!(
        p,
        Progress::MirrorRequeued { queued_jobs: 1, platforms, .. }
            if *platforms == BTreeSet::from([Platform::Tiktok])
    )));
}

#[tokio::test(start_paused = true)]
async fn failed_mirror_requeue_does_not_end_the_session() {
    let h = harness(
        MockBackend::new(),
        full_coverage()
            .mirror_pass([(Platform::Instagram, 2, 4)])
            .mirror_pass([(Platform::Instagram, 0, 4)])
            .fail_requeue(SyncError::Timeout("mirror requeue".into())),
        EngineConfig::default(),
    );
    let mut full_sync = request();
    full_sync.coverage_mode = CoverageMode::FullSync;

    let outcome = h.engine.converge(&full_sync).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Succeeded { passes: 2, .. }));
    assert_eq!(h.coverage.requeued().len(), 1);
    assert!(!h
        .sink
        .reports()
        .iter()
        .any(|p| matches!(p, Progress::MirrorRequeued { .. })));
}

#[tokio::test(start_paused = true)]
async fn metrics_sessions_ignore_mirroring() {
    let h = harness(
        MockBackend::new(),
        full_coverage().mirror_pass([(Platform::Tiktok, 3, 8)]),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Succeeded { passes: 1, .. }));
    assert_eq!(h.coverage.mirror_calls(), 0);
    assert!(h.coverage.requeued().is_empty());
}

#[tokio::test(start_paused = true)]
async fn converges_after_narrowing_to_stale_platforms() {
    let h = harness(
        MockBackend::new(),
        ScriptedCoverage::new()
            .pass([
                (Platform::Reddit, 40, Some(40)),
                (Platform::Tiktok, 5, Some(12)),
                (Platform::Instagram, 9, None),
            ])
            .pass([
                (Platform::Reddit, 40, Some(40)),
                (Platform::Tiktok, 12, Some(12)),
                (Platform::Instagram, 9, None),
            ]),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Succeeded { passes: 2, .. }));

    let runs = h.backend.created_runs();
    assert_eq!(runs[0].platforms, platforms());
    assert_eq!(runs[1].platforms, BTreeSet::from([Platform::Tiktok]));
    assert_eq!(runs[1].pass, 2);

    let reports = h.sink.reports();
    assert!(matches!(
        &reports[0],
        Progress::Queued {
            pass: 1,
            worker_health: Some(_),
            ..
        }
    ));
    assert!(reports
        .iter()
        .any(|p| matches!(p, Progress::Continuing { next_pass: 2, .. })));
    assert!(matches!(h.sink.last(), Some(Progress::Succeeded { passes: 2, .. })));
}

#[tokio::test(start_paused = true)]
async fn job_failure_blocks_success_even_at_full_coverage() {
    let h = harness(
        MockBackend::new()
            .on_status("run-1", vec![Ok(completed_with_failures("run-1", &[Platform::Instagram]))]),
        full_coverage(),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Succeeded { passes: 2, .. }));
    assert_eq!(
        h.backend.created_runs()[1].platforms,
        BTreeSet::from([Platform::Instagram])
    );
}

#[tokio::test(start_paused = true)]
async fn saved_coverage_never_decreases_across_passes() {
    let h = harness(
        MockBackend::new(),
        ScriptedCoverage::new()
            .pass([(Platform::Tiktok, 60, Some(100))])
            .pass([(Platform::Tiktok, 40, Some(100))])
            .pass([(Platform::Tiktok, 100, Some(100))]),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Succeeded { passes: 3, .. }));

    let saved: Vec<u64> = h
        .sink
        .reports()
        .iter()
        .filter_map(|p| match p {
            Progress::PassFinished { coverage, .. } => {
                Some(coverage.by_platform[&Platform::Tiktok].saved)
            }
            _ => None,
        })
        .collect();
    assert_eq!(saved, vec![60, 60, 100]);
}

#[tokio::test(start_paused = true)]
async fn time_guardrail_stops_a_slow_session() {
    let config = EngineConfig {
        max_duration: Duration::from_secs(5),
        ..EngineConfig::default()
    };
    let h = harness(
        MockBackend::new().with_default_statuses(vec![
            Ok(status("", RunState::Running)),
            Ok(status("", RunState::Running)),
            Ok(status("", RunState::Completed)),
        ]),
        ScriptedCoverage::new().pass([(Platform::Tiktok, 1, Some(10))]),
        config,
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(
        outcome,
        SessionOutcome::Incomplete {
            passes: 1,
            reason: GuardrailReason::MaxDuration,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn status_timeouts_fall_back_to_cached_discovery() {
    let timeout = || Err(SyncError::Timeout("status check exceeded 15s".into()));
    let h = harness(
        MockBackend::new()
            .on_status("run-1", (0..6).map(|_| timeout()).collect())
            .on_cache("rhoslc:episode-4", discovery(vec![ExternalItem::new("p1")])),
        full_coverage(),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    match outcome {
        SessionOutcome::Failed {
            error: SyncError::Timeout(_),
            fallback: Some(cached),
        } => assert_eq!(cached.items.len(), 1),
        other => panic!("expected Failed with cached fallback, got {other:?}"),
    }
    assert_eq!(h.backend.lookup_calls(), 1);
    assert_eq!(h.coverage.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn tracked_flair_totals_count_only_requested_flairs() {
    let h = harness(
        MockBackend::new().on_cache(
            "rhoslc:episode-4",
            discovery(vec![
                ExternalItem::new("p1").flair("Live Thread"),
                ExternalItem::new("p2").flair("Discussion"),
                ExternalItem::new("p3"),
            ]),
        ),
        full_coverage(),
        EngineConfig::default(),
    );
    let mut live = request();
    live.flairs = BTreeSet::from([":fire: Live Thread".to_string()]);

    match h.engine.converge(&live).await.unwrap() {
        SessionOutcome::Succeeded {
            discovery: Some(found),
            ..
        } => {
            assert_eq!(found.items.len(), 3);
            assert_eq!(found.totals.tracked_flair, 1);
        }
        other => panic!("expected Succeeded with discovery, got {other:?}"),
    }

    match h.engine.converge(&request()).await.unwrap() {
        SessionOutcome::Succeeded {
            discovery: Some(found),
            ..
        } => assert_eq!(found.totals.tracked_flair, 3),
        other => panic!("expected Succeeded with discovery, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn run_failure_ends_the_session_without_fallback() {
    let mut failed = status("run-1", RunState::Failed);
    failed.error_message = Some("apify actor crashed".into());
    let h = harness(
        MockBackend::new().on_status("run-1", vec![Ok(failed)]),
        full_coverage(),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    match outcome {
        SessionOutcome::Failed {
            error: SyncError::RunFailed { message, .. },
            fallback: None,
        } => assert_eq!(message, "apify actor crashed"),
        other => panic!("expected RunFailed, got {other:?}"),
    }
    assert_eq!(h.backend.created_runs().len(), 1);
    assert_eq!(h.backend.lookup_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_run_request_fails_immediately() {
    let h = harness(
        MockBackend::new().fail_create(SyncError::rejected(409, "window locked")),
        full_coverage(),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(
        outcome,
        SessionOutcome::Failed {
            error: SyncError::BackendRejected {
                status: Some(409),
                ..
            },
            ..
        }
    ));
    assert!(matches!(h.sink.last(), Some(Progress::Failed { .. })));
}

#[tokio::test(start_paused = true)]
async fn coverage_read_failure_fails_the_session() {
    let h = harness(
        MockBackend::new(),
        ScriptedCoverage::new().fail_with(SyncError::rejected(500, "coverage query failed")),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(
        outcome,
        SessionOutcome::Failed {
            error: SyncError::BackendRejected {
                status: Some(500),
                ..
            },
            fallback: None,
        }
    ));
    assert_eq!(h.coverage.calls(), 1);
    assert_eq!(h.backend.created_runs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn poll_budget_exhaustion_reports_still_running() {
    let policy = PollPolicy {
        max_attempts: 3,
        ..PollPolicy::default()
    };
    let h = harness_with_policy(
        MockBackend::new().with_default_statuses(vec![Ok(status("", RunState::Running))]),
        full_coverage(),
        EngineConfig::default(),
        Some(policy),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(
        outcome,
        SessionOutcome::StillRunning { ref run_id, passes: 1 } if run_id == "run-1"
    ));
    assert!(matches!(
        h.sink.last(),
        Some(Progress::StillRunning { attempts: 3, pass: 1, .. })
    ));
    assert!(!h
        .sink
        .reports()
        .iter()
        .any(|p| matches!(p, Progress::Failed { .. })));
}

#[tokio::test(start_paused = true)]
async fn worker_health_failure_is_ignored() {
    let h = harness(
        MockBackend::new().with_worker_health(Err(SyncError::rejected(503, "unavailable"))),
        full_coverage(),
        EngineConfig::default(),
    );

    let outcome = h.engine.converge(&request()).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Succeeded { passes: 1, .. }));
    assert!(matches!(
        &h.sink.reports()[0],
        Progress::Queued {
            worker_health: None,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn new_session_supersedes_the_running_one() {
    let h = harness(
        MockBackend::new().on_status("run-1", vec![Ok(status("run-1", RunState::Running))]),
        full_coverage(),
        EngineConfig::default(),
    );
    let engine = &h.engine;

    let first_request = request();
    let second_request = request();
    let (first, second) = tokio::join!(engine.converge(&first_request), async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        engine.converge(&second_request).await
    });

    assert!(matches!(first, Err(SyncError::Superseded)));
    assert!(matches!(second, Ok(SessionOutcome::Succeeded { .. })));
    assert_eq!(h.backend.created_runs().len(), 2);
    assert!(!h
        .sink
        .reports()
        .iter()
        .any(|p| matches!(p, Progress::Failed { .. })));
}
