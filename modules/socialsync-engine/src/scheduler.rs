//! Pass scheduling as a pure state machine.
//!
//! `reduce(session, event) -> (session, effects)` holds every decision the
//! convergence loop makes. Effects are the only side-effecting actions (start
//! a run, poll it, evaluate coverage, requeue mirror jobs, read the cache);
//! the engine performs them and feeds the results back in as events.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use socialsync_common::{
    CoverageMode, CoverageSnapshot, DiscoveryResult, EngineConfig, Platform, RunState, RunStatus,
    SyncError, Timestamp, Window, WorkerHealth,
};

use crate::coordinator::{RunHandle, RunRequest};
use crate::progress::{GuardrailReason, Progress};

/// Where the session is between effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Polling,
    Evaluating,
    ReadingFallback,
    Done,
}

#[derive(Debug, Clone)]
pub struct PassSession {
    pub window_key: String,
    pub window_start: Option<Timestamp>,
    pub window_end: Option<Timestamp>,
    pub requested: BTreeSet<Platform>,
    pub flairs: BTreeSet<String>,
    pub coverage_mode: CoverageMode,
    /// Platforms the current pass runs.
    pub shards: BTreeSet<Platform>,
    pub pass: u32,
    pub max_passes: u32,
    pub max_duration: Duration,
    pub phase: Phase,
    pub run_id: Option<String>,
    pub last_status: Option<RunStatus>,
    pub last_coverage: Option<CoverageSnapshot>,
    pub discovery: Option<Arc<DiscoveryResult>>,
    pub worker_health: Option<WorkerHealth>,
    pub fallback_attempted: bool,
    pending_error: Option<SyncError>,
}

impl PassSession {
    pub fn new(window: &Window, platforms: BTreeSet<Platform>) -> Self {
        let defaults = EngineConfig::default();
        Self {
            window_key: window.key.clone(),
            window_start: window.start,
            window_end: window.end,
            shards: platforms.clone(),
            requested: platforms,
            flairs: BTreeSet::new(),
            coverage_mode: CoverageMode::default(),
            pass: 1,
            max_passes: defaults.max_passes,
            max_duration: defaults.max_duration,
            phase: Phase::Idle,
            run_id: None,
            last_status: None,
            last_coverage: None,
            discovery: None,
            worker_health: None,
            fallback_attempted: false,
            pending_error: None,
        }
    }

    pub fn with_limits(mut self, max_passes: u32, max_duration: Duration) -> Self {
        self.max_passes = max_passes;
        self.max_duration = max_duration;
        self
    }

    pub fn with_flairs(mut self, flairs: BTreeSet<String>) -> Self {
        self.flairs = flairs;
        self
    }

    pub fn with_coverage_mode(mut self, mode: CoverageMode) -> Self {
        self.coverage_mode = mode;
        self
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// The run the current pass should start.
    pub fn run_request(&self) -> RunRequest {
        RunRequest {
            window_key: self.window_key.clone(),
            start: self.window_start,
            end: self.window_end,
            platforms: self.shards.clone(),
            flairs: self.flairs.clone(),
            coverage_mode: self.coverage_mode,
            pass: self.pass,
        }
    }

    /// Progress line for one status read while the current run is polled.
    pub fn polling(&self, status: &RunStatus, attempt: u32) -> Progress {
        Progress::Polling {
            window_key: self.window_key.clone(),
            pass: self.pass,
            run_id: status.run_id.clone(),
            attempt,
            state: status.state,
            totals: status.totals.clone(),
        }
    }

    /// Platforms the next pass should run: stale ones (comments or mirrored
    /// media) plus any whose jobs failed, limited to what was requested. Keeps
    /// the current shards when that leaves nothing.
    pub fn next_shards(&self, coverage: &CoverageSnapshot, status: Option<&RunStatus>) -> BTreeSet<Platform> {
        let mut next = coverage.platforms_to_rerun();
        if let Some(status) = status {
            next.extend(status.totals.failed_platforms.iter().copied());
        }
        next.retain(|p| self.requested.contains(p));
        if next.is_empty() {
            self.shards.clone()
        } else {
            next
        }
    }

    /// Requested platforms with media left to mirror. Empty outside full sync.
    fn mirror_requeue(&self, coverage: &CoverageSnapshot) -> BTreeSet<Platform> {
        match (&coverage.mirror, self.coverage_mode) {
            (Some(mirror), CoverageMode::FullSync) => mirror
                .stale_platforms()
                .into_iter()
                .filter(|p| self.requested.contains(p))
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    fn guardrail(&self, elapsed: Duration) -> Option<GuardrailReason> {
        if self.pass + 1 > self.max_passes {
            Some(GuardrailReason::MaxPasses)
        } else if elapsed >= self.max_duration {
            Some(GuardrailReason::MaxDuration)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum PassEvent {
    Started {
        worker_health: Option<WorkerHealth>,
    },
    RunQueued {
        handle: RunHandle,
    },
    RunFinished {
        status: RunStatus,
        discovery: Option<Arc<DiscoveryResult>>,
    },
    CoverageEvaluated {
        snapshot: CoverageSnapshot,
        elapsed: Duration,
    },
    PassFailed {
        error: SyncError,
    },
    CacheFallbackRead {
        result: Option<Arc<DiscoveryResult>>,
    },
}

#[derive(Debug, Clone)]
pub enum Effect {
    StartRun(RunRequest),
    PollRun { run_id: String },
    EvaluateCoverage,
    /// Best effort. The engine reports the outcome and moves on.
    RequeueMirror { platforms: BTreeSet<Platform> },
    ReadCacheFallback,
    Report(Progress),
    Finish(SessionOutcome),
}

#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Succeeded {
        passes: u32,
        coverage: CoverageSnapshot,
        discovery: Option<Arc<DiscoveryResult>>,
    },
    /// A guardrail stopped the loop. Not an error.
    Incomplete {
        passes: u32,
        reason: GuardrailReason,
        coverage: Option<CoverageSnapshot>,
        discovery: Option<Arc<DiscoveryResult>>,
    },
    Failed {
        error: SyncError,
        fallback: Option<Arc<DiscoveryResult>>,
    },
    /// The poll budget ran out while the run was still going. Check back later.
    StillRunning { run_id: String, passes: u32 },
}

impl SessionOutcome {
    pub fn passes(&self) -> Option<u32> {
        match self {
            SessionOutcome::Succeeded { passes, .. }
            | SessionOutcome::Incomplete { passes, .. }
            | SessionOutcome::StillRunning { passes, .. } => Some(*passes),
            SessionOutcome::Failed { .. } => None,
        }
    }

    pub fn coverage(&self) -> Option<&CoverageSnapshot> {
        match self {
            SessionOutcome::Succeeded { coverage, .. } => Some(coverage),
            SessionOutcome::Incomplete { coverage, .. } => coverage.as_ref(),
            _ => None,
        }
    }
}

pub fn reduce(mut session: PassSession, event: PassEvent) -> (PassSession, Vec<Effect>) {
    if session.is_done() {
        return (session, Vec::new());
    }

    let mut effects = Vec::new();
    match event {
        PassEvent::Started { worker_health } => {
            session.worker_health = worker_health;
            session.phase = Phase::Starting;
            effects.push(Effect::StartRun(session.run_request()));
        }

        PassEvent::RunQueued { handle } => {
            effects.push(Effect::Report(Progress::Queued {
                window_key: session.window_key.clone(),
                pass: session.pass,
                max_passes: session.max_passes,
                run_id: handle.run_id.clone(),
                jobs: handle.jobs,
                shards: session.shards.clone(),
                worker_health: if session.pass == 1 {
                    session.worker_health.clone()
                } else {
                    None
                },
            }));
            session.run_id = Some(handle.run_id.clone());
            session.phase = Phase::Polling;
            effects.push(Effect::PollRun {
                run_id: handle.run_id,
            });
        }

        PassEvent::RunFinished { status, discovery } => {
            session.last_status = Some(status);
            if discovery.is_some() {
                session.discovery = discovery;
            }
            session.phase = Phase::Evaluating;
            effects.push(Effect::EvaluateCoverage);
        }

        PassEvent::CoverageEvaluated { snapshot, elapsed } => {
            let status = session.last_status.clone();
            effects.push(Effect::Report(Progress::PassFinished {
                window_key: session.window_key.clone(),
                pass: session.pass,
                max_passes: session.max_passes,
                state: status.as_ref().map_or(RunState::Completed, |s| s.state),
                totals: status.as_ref().map(|s| s.totals.clone()).unwrap_or_default(),
                coverage: snapshot.clone(),
            }));

            let strict_success = status
                .as_ref()
                .is_some_and(|s| s.state == RunState::Completed && s.totals.failed_jobs == 0);

            if snapshot.converged() && strict_success {
                effects.push(Effect::Report(Progress::Succeeded {
                    window_key: session.window_key.clone(),
                    passes: session.pass,
                    coverage: snapshot.clone(),
                }));
                effects.push(Effect::Finish(SessionOutcome::Succeeded {
                    passes: session.pass,
                    coverage: snapshot.clone(),
                    discovery: session.discovery.clone(),
                }));
                session.last_coverage = Some(snapshot);
                session.phase = Phase::Done;
                return (session, effects);
            }

            let next = session.next_shards(&snapshot, status.as_ref());
            let requeue = session.mirror_requeue(&snapshot);
            session.last_coverage = Some(snapshot);

            if let Some(reason) = session.guardrail(elapsed) {
                effects.push(Effect::Report(Progress::Incomplete {
                    window_key: session.window_key.clone(),
                    passes: session.pass,
                    max_passes: session.max_passes,
                    reason,
                    coverage: session.last_coverage.clone(),
                }));
                effects.push(Effect::Finish(SessionOutcome::Incomplete {
                    passes: session.pass,
                    reason,
                    coverage: session.last_coverage.clone(),
                    discovery: session.discovery.clone(),
                }));
                session.phase = Phase::Done;
                return (session, effects);
            }

            session.pass += 1;
            session.shards = next;
            session.run_id = None;
            session.phase = Phase::Starting;
            effects.push(Effect::Report(Progress::Continuing {
                window_key: session.window_key.clone(),
                next_pass: session.pass,
                max_passes: session.max_passes,
                shards: session.shards.clone(),
            }));
            if !requeue.is_empty() {
                effects.push(Effect::RequeueMirror { platforms: requeue });
            }
            effects.push(Effect::StartRun(session.run_request()));
        }

        PassEvent::PassFailed { error } => match error {
            SyncError::Superseded => {
                session.phase = Phase::Done;
            }
            SyncError::StillRunning { run_id, attempts } => {
                session.phase = Phase::Done;
                effects.push(Effect::Report(Progress::StillRunning {
                    window_key: session.window_key.clone(),
                    pass: session.pass,
                    run_id: run_id.clone(),
                    attempts,
                }));
                effects.push(Effect::Finish(SessionOutcome::StillRunning {
                    run_id,
                    passes: session.pass,
                }));
            }
            SyncError::Timeout(_) if !session.fallback_attempted => {
                session.fallback_attempted = true;
                session.pending_error = Some(error);
                session.phase = Phase::ReadingFallback;
                effects.push(Effect::ReadCacheFallback);
            }
            error => {
                effects.extend(fail(&mut session, error, None));
            }
        },

        PassEvent::CacheFallbackRead { result } => {
            let error = session
                .pending_error
                .take()
                .unwrap_or_else(|| SyncError::Timeout("request timed out".to_string()));
            let fallback = result.or_else(|| session.discovery.clone());
            effects.extend(fail(&mut session, error, fallback));
        }
    }

    (session, effects)
}

fn fail(
    session: &mut PassSession,
    error: SyncError,
    fallback: Option<Arc<DiscoveryResult>>,
) -> Vec<Effect> {
    session.phase = Phase::Done;
    vec![
        Effect::Report(Progress::Failed {
            window_key: session.window_key.clone(),
            pass: session.pass,
            message: error.to_string(),
        }),
        Effect::Finish(SessionOutcome::Failed { error, fallback }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use socialsync_common::{MirrorSnapshot, PlatformCoverage, PlatformMirror, Provenance, WindowKind};

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

    fn all_platforms() -> BTreeSet<Platform> {
        BTreeSet::from([Platform::Reddit, Platform::Tiktok, Platform::Instagram])
    }

    fn session() -> PassSession {
        PassSession::new(&window(), all_platforms())
    }

    fn handle(run_id: &str) -> RunHandle {
        RunHandle {
            run_id: run_id.into(),
            window_key: "episode-4".into(),
            initial: RunState::Queued,
            jobs: Some(3),
            config_hash: String::new(),
        }
    }

    fn completed(failed: &[Platform]) -> RunStatus {
        let mut status = RunStatus::new("run-1", RunState::Completed);
        status.totals.total_jobs = 3;
        status.totals.failed_jobs = failed.len() as u64;
        status.totals.completed_jobs = 3 - failed.len() as u64;
        status.totals.failed_platforms = failed.iter().copied().collect();
        status
    }

    fn snapshot(entries: &[(Platform, u64, Option<u64>)]) -> CoverageSnapshot {
        let mut s = CoverageSnapshot::default();
        for (p, saved, reported) in entries {
            s.by_platform.insert(*p, PlatformCoverage::new(*saved, *reported));
        }
        s
    }

    fn with_mirror(mut coverage: CoverageSnapshot, stale: &[Platform]) -> CoverageSnapshot {
        let mut mirror = MirrorSnapshot::default();
        mirror.overall.up_to_date = stale.is_empty();
        for p in stale {
            mirror.by_platform.insert(
                *p,
                PlatformMirror {
                    needs_mirror: 2,
                    scanned: 5,
                    ..PlatformMirror::default()
                },
            );
        }
        coverage.mirror = Some(mirror);
        coverage
    }

    fn finish(effects: &[Effect]) -> Option<&SessionOutcome> {
        effects.iter().find_map(|e| match e {
            Effect::Finish(outcome) => Some(outcome),
            _ => None,
        })
    }

    fn start_run(effects: &[Effect]) -> Option<&RunRequest> {
        effects.iter().find_map(|e| match e {
            Effect::StartRun(request) => Some(request),
            _ => None,
        })
    }

    /// Drive one pass from Started/Continuing through coverage evaluation.
    fn through_pass(
        session: PassSession,
        status: RunStatus,
        coverage: CoverageSnapshot,
        elapsed: Duration,
    ) -> (PassSession, Vec<Effect>) {
        let (session, _) = reduce(session, PassEvent::RunQueued { handle: handle("run-1") });
        let (session, effects) = reduce(
            session,
            PassEvent::RunFinished {
                status,
                discovery: None,
            },
        );
        assert!(matches!(effects[..], [Effect::EvaluateCoverage]));
        reduce(
            session,
            PassEvent::CoverageEvaluated {
                snapshot: coverage,
                elapsed,
            },
        )
    }

    #[test]
    fn first_pass_runs_every_requested_platform() {
        let (session, effects) = reduce(session(), PassEvent::Started { worker_health: None });
        let request = start_run(&effects).unwrap();
        assert_eq!(request.platforms, all_platforms());
        assert_eq!(request.pass, 1);
        assert_eq!(session.phase, Phase::Starting);
    }

    #[test]
    fn queued_run_is_reported_then_polled() {
        let (session, _) = reduce(session(), PassEvent::Started { worker_health: None });
        let (session, effects) = reduce(session, PassEvent::RunQueued { handle: handle("run-1") });
        assert!(matches!(&effects[0], Effect::Report(Progress::Queued { jobs: Some(3), .. })));
        assert!(matches!(&effects[1], Effect::PollRun { run_id } if run_id == "run-1"));
        assert_eq!(session.run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn full_coverage_and_clean_run_succeeds() {
        let coverage = snapshot(&[
            (Platform::Reddit, 10, Some(10)),
            (Platform::Tiktok, 5, Some(5)),
            (Platform::Instagram, 3, None),
        ]);
        let (session, effects) =
            through_pass(session(), completed(&[]), coverage, Duration::from_secs(60));

        assert!(matches!(finish(&effects), Some(SessionOutcome::Succeeded { passes: 1, .. })));
        assert!(session.is_done());
    }

    #[test]
    fn failed_job_blocks_success_and_reruns_its_platform() {
        let coverage = snapshot(&[
            (Platform::Reddit, 10, Some(10)),
            (Platform::Tiktok, 5, Some(5)),
            (Platform::Instagram, 3, Some(3)),
        ]);
        let (session, effects) = through_pass(
            session(),
            completed(&[Platform::Tiktok]),
            coverage,
            Duration::from_secs(60),
        );

        assert!(finish(&effects).is_none());
        let next = start_run(&effects).unwrap();
        assert_eq!(next.pass, 2);
        assert_eq!(next.platforms, BTreeSet::from([Platform::Tiktok]));
        assert_eq!(session.pass, 2);
    }

    #[test]
    fn partial_run_is_not_strict_success() {
        let coverage = snapshot(&[(Platform::Reddit, 10, Some(10))]);
        let mut status = completed(&[]);
        status.state = RunState::Partial;
        let (_, effects) = through_pass(session(), status, coverage, Duration::ZERO);
        assert!(finish(&effects).is_none());
        assert_eq!(start_run(&effects).unwrap().platforms, all_platforms());
    }

    #[test]
    fn next_pass_narrows_to_stale_platforms() {
        let coverage = snapshot(&[
            (Platform::Reddit, 10, Some(10)),
            (Platform::Tiktok, 2, Some(5)),
            (Platform::Instagram, 3, Some(3)),
        ]);
        let (_, effects) = through_pass(session(), completed(&[]), coverage, Duration::ZERO);

        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Report(Progress::Continuing { next_pass: 2, .. }))));
        assert_eq!(
            start_run(&effects).unwrap().platforms,
            BTreeSet::from([Platform::Tiktok])
        );
    }

    #[test]
    fn failed_platforms_outside_the_request_are_ignored() {
        let s = PassSession::new(&window(), BTreeSet::from([Platform::Reddit]));
        let coverage = snapshot(&[(Platform::Reddit, 10, Some(10))]);
        let next = s.next_shards(&coverage, Some(&completed(&[Platform::Youtube])));
        assert_eq!(next, BTreeSet::from([Platform::Reddit]));
    }

    #[test]
    fn full_sync_waits_for_mirroring_and_requeues_stale_platforms() {
        let coverage = with_mirror(
            snapshot(&[
                (Platform::Reddit, 10, Some(10)),
                (Platform::Tiktok, 5, Some(5)),
                (Platform::Instagram, 3, Some(3)),
            ]),
            &[Platform::Instagram],
        );
        let s = session().with_coverage_mode(CoverageMode::FullSync);
        let (_, effects) = through_pass(s, completed(&[]), coverage, Duration::ZERO);

        assert!(finish(&effects).is_none());
        let requeue = effects.iter().position(|e| {
            matches!(e, Effect::RequeueMirror { platforms } if *platforms == BTreeSet::from([Platform::Instagram]))
        });
        let start = effects.iter().position(|e| matches!(e, Effect::StartRun(_)));
        assert!(requeue.is_some() && requeue < start);
        assert_eq!(
            start_run(&effects).unwrap().platforms,
            BTreeSet::from([Platform::Instagram])
        );
    }

    #[test]
    fn ready_mirror_lets_full_sync_succeed() {
        let coverage = with_mirror(snapshot(&[(Platform::Reddit, 10, Some(10))]), &[]);
        let s = session().with_coverage_mode(CoverageMode::FullSync);
        let (_, effects) = through_pass(s, completed(&[]), coverage, Duration::ZERO);
        assert!(matches!(finish(&effects), Some(SessionOutcome::Succeeded { passes: 1, .. })));
        assert!(!effects.iter().any(|e| matches!(e, Effect::RequeueMirror { .. })));
    }

    #[test]
    fn pass_limit_stops_with_incomplete() {
        let coverage = snapshot(&[(Platform::Tiktok, 1, Some(5))]);
        let s = session().with_limits(1, Duration::from_secs(3600));
        let (session, effects) = through_pass(s, completed(&[]), coverage, Duration::ZERO);

        match finish(&effects) {
            Some(SessionOutcome::Incomplete {
                passes: 1,
                reason: GuardrailReason::MaxPasses,
                coverage: Some(_),
                ..
            }) => {}
            other => panic!("expected pass-limit Incomplete, got {other:?}"),
        }
        assert!(start_run(&effects).is_none());
        assert!(session.is_done());
    }

    #[test]
    fn time_limit_stops_with_incomplete() {
        let coverage = snapshot(&[(Platform::Tiktok, 1, Some(5))]);
        let s = session().with_limits(8, Duration::from_secs(90 * 60));
        let (_, effects) = through_pass(s, completed(&[]), coverage, Duration::from_secs(90 * 60));
        assert!(matches!(
            finish(&effects),
            Some(SessionOutcome::Incomplete {
                reason: GuardrailReason::MaxDuration,
                ..
            })
        ));
    }

    #[test]
    fn timeout_reads_cache_once_then_fails() {
        let (session, _) = reduce(session(), PassEvent::Started { worker_health: None });
        let (session, effects) = reduce(
            session,
            PassEvent::PassFailed {
                error: SyncError::Timeout("status check exceeded 15s".into()),
            },
        );
        assert!(matches!(effects[..], [Effect::ReadCacheFallback]));
        assert!(session.fallback_attempted);

        let (session, effects) = reduce(session, PassEvent::CacheFallbackRead { result: None });
        match finish(&effects) {
            Some(SessionOutcome::Failed {
                error: SyncError::Timeout(_),
                fallback: None,
            }) => {}
            other => panic!("expected Failed(Timeout), got {other:?}"),
        }
        assert!(session.is_done());
    }

    #[test]
    fn rejected_request_fails_immediately() {
        let (_, effects) = reduce(
            session(),
            PassEvent::PassFailed {
                error: SyncError::rejected(422, "unknown platform"),
            },
        );
        assert!(matches!(
            finish(&effects),
            Some(SessionOutcome::Failed {
                error: SyncError::BackendRejected { .. },
                ..
            })
        ));
        assert!(effects
            .iter()
            .all(|e| !matches!(e, Effect::ReadCacheFallback)));
    }

    #[test]
    fn run_failure_surfaces_backend_message() {
        let (_, effects) = reduce(
            session(),
            PassEvent::PassFailed {
                error: SyncError::RunFailed {
                    run_id: "run-1".into(),
                    message: "quota exhausted".into(),
                },
            },
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Report(Progress::Failed { message, .. }) if message.contains("quota exhausted")
        )));
    }

    #[test]
    fn still_running_is_not_a_failure() {
        let (_, effects) = reduce(
            session(),
            PassEvent::PassFailed {
                error: SyncError::StillRunning {
                    run_id: "run-1".into(),
                    attempts: 80,
                },
            },
        );
        assert!(matches!(
            finish(&effects),
            Some(SessionOutcome::StillRunning { passes: 1, .. })
        ));
        assert!(matches!(
            &effects[0],
            Effect::Report(Progress::StillRunning { attempts: 80, run_id, .. }) if run_id == "run-1"
        ));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Report(Progress::Failed { .. }))));
    }

    #[test]
    fn superseded_session_goes_quiet() {
        let (session, effects) = reduce(
            session(),
            PassEvent::PassFailed {
                error: SyncError::Superseded,
            },
        );
        assert!(effects.is_empty());
        let (_, effects) = reduce(session, PassEvent::Started { worker_health: None });
        assert!(effects.is_empty());
    }
}
