//! The convergence loop.
//!
//! Drains the effects `scheduler::reduce` asks for, performs each one against
//! the backend, and feeds the result back as the next event until the session
//! finishes.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use socialsync_common::{
    CoverageMode, EngineConfig, Platform, SyncError, SyncResult, Window, WorkerHealth,
};

use crate::cache::{CacheParams, CacheRequest, DiscoveryCache};
use crate::coordinator::RunCoordinator;
use crate::coverage::CoverageEvaluator;
use crate::epoch::EpochRegistry;
use crate::merge::WindowViews;
use crate::poller::{PollPolicy, StatusPoller};
use crate::progress::{Progress, ProgressSink, TracingProgressSink};
use crate::scheduler::{reduce, Effect, PassEvent, PassSession, SessionOutcome};
use crate::traits::{CoverageSource, IngestBackend};

/// One window to converge, for one community.
#[derive(Debug, Clone)]
pub struct ConvergeRequest {
    pub community: String,
    pub window: Window,
    pub platforms: BTreeSet<Platform>,
    pub flairs: BTreeSet<String>,
    pub coverage_mode: CoverageMode,
    pub max_pages: Option<u32>,
}

impl ConvergeRequest {
    pub fn new(community: impl Into<String>, window: Window, platforms: BTreeSet<Platform>) -> Self {
        Self {
            community: community.into(),
            window,
            platforms,
            flairs: BTreeSet::new(),
            coverage_mode: CoverageMode::default(),
            max_pages: None,
        }
    }

    /// The cache read that serves this window's discovery.
    pub fn cache_request(&self) -> CacheRequest {
        CacheRequest::new(self.community.clone(), self.window.key.clone()).with_params(CacheParams {
            start: self.window.start,
            end: self.window.end,
            platforms: self.platforms.clone(),
            flairs: self.flairs.clone(),
            max_pages: self.max_pages,
        })
    }
}

/// Collaborators for a [`ConvergenceEngine`].
#[derive(TypedBuilder)]
pub struct EngineDeps<B, C> {
    pub backend: Arc<B>,
    pub coverage: Arc<C>,
    #[builder(default = Arc::new(TracingProgressSink))]
    pub sink: Arc<dyn ProgressSink>,
    #[builder(default)]
    pub epochs: Arc<EpochRegistry>,
    #[builder(default)]
    pub config: EngineConfig,
    /// Shared with a prefetcher so both read through one in-flight map.
    #[builder(default)]
    pub cache: Option<Arc<DiscoveryCache<B>>>,
    #[builder(default)]
    pub policy: Option<PollPolicy>,
    #[builder(default = true)]
    pub probe_worker_health: bool,
}

pub struct ConvergenceEngine<B, C> {
    backend: Arc<B>,
    cache: Arc<DiscoveryCache<B>>,
    coordinator: RunCoordinator<B>,
    poller: StatusPoller<B>,
    evaluator: CoverageEvaluator<C>,
    sink: Arc<dyn ProgressSink>,
    epochs: Arc<EpochRegistry>,
    config: EngineConfig,
    probe_worker_health: bool,
}

impl<B, C> ConvergenceEngine<B, C>
where
    B: IngestBackend + 'static,
    C: CoverageSource,
{
    pub fn new(deps: EngineDeps<B, C>) -> Self {
        let cache = deps.cache.unwrap_or_else(|| {
            Arc::new(DiscoveryCache::new(
                Arc::clone(&deps.backend),
                Arc::new(WindowViews::default()),
            ))
        });
        let policy = deps
            .policy
            .unwrap_or_else(|| PollPolicy::from_config(&deps.config));

        Self {
            coordinator: RunCoordinator::new(Arc::clone(&deps.backend)),
            poller: StatusPoller::new(Arc::clone(&deps.backend), Arc::clone(&cache), policy),
            evaluator: CoverageEvaluator::new(deps.coverage),
            backend: deps.backend,
            cache,
            sink: deps.sink,
            epochs: deps.epochs,
            config: deps.config,
            probe_worker_health: deps.probe_worker_health,
        }
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache<B>> {
        &self.cache
    }

    pub fn epochs(&self) -> &Arc<EpochRegistry> {
        &self.epochs
    }

    pub fn coordinator(&self) -> &RunCoordinator<B> {
        &self.coordinator
    }

    /// Stop any session running for `window_key`. It ends with `Superseded`.
    pub fn cancel(&self, window_key: &str) {
        self.epochs.cancel(window_key);
    }

    /// Run passes for one window until coverage converges or a guardrail stops it.
    ///
    /// Starting a session supersedes any session already running for the
    /// same window key. The superseded call returns `Err(Superseded)` and
    /// writes nothing further.
    pub async fn converge(&self, request: &ConvergeRequest) -> SyncResult<SessionOutcome> {
        let window_key = request.window.key.clone();
        let session_id = Uuid::new_v4();
        let token = self.epochs.advance(&window_key);
        let started = Instant::now();
        let cache_request = request.cache_request();

        info!(
            %session_id,
            window_key = %window_key,
            platforms = request.platforms.len(),
            max_passes = self.config.max_passes,
            epoch = token.epoch(),
            "Convergence session started"
        );

        let worker_health = if self.probe_worker_health {
            self.worker_health().await
        } else {
            None
        };
        token.check()?;

        let session = PassSession::new(&request.window, request.platforms.clone())
            .with_limits(self.config.max_passes, self.config.max_duration)
            .with_flairs(request.flairs.clone())
            .with_coverage_mode(request.coverage_mode);
        let (mut session, effects) = reduce(session, PassEvent::Started { worker_health });
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            token.check()?;

            let event = match effect {
                Effect::Report(progress) => {
                    self.sink.report(progress);
                    continue;
                }
                Effect::Finish(outcome) => {
                    info!(
                        %session_id,
                        window_key = %window_key,
                        passes = session.pass,
                        elapsed_secs = started.elapsed().as_secs(),
                        outcome = outcome_name(&outcome),
                        "Convergence session finished"
                    );
                    return Ok(outcome);
                }
                Effect::StartRun(run) => match self.coordinator.start(&run).await {
                    Ok(handle) => PassEvent::RunQueued { handle },
                    Err(error) => PassEvent::PassFailed { error },
                },
                Effect::PollRun { run_id } => {
                    let sink = &self.sink;
                    let current = &session;
                    let polled = self
                        .poller
                        .wait_and_read(&run_id, &cache_request, &token, |status, attempt| {
                            sink.report(current.polling(status, attempt))
                        })
                        .await;
                    match polled {
                        Ok(outcome) => PassEvent::RunFinished {
                            status: outcome.status,
                            discovery: outcome.discovery,
                        },
                        Err(error) => PassEvent::PassFailed { error },
                    }
                }
                Effect::RequeueMirror { platforms } => {
                    match self
                        .evaluator
                        .requeue_mirror(session.window_start, session.window_end, &platforms)
                        .await
                    {
                        Ok(queued_jobs) => self.sink.report(Progress::MirrorRequeued {
                            window_key: window_key.clone(),
                            queued_jobs,
                            platforms,
                        }),
                        Err(e) => {
                            warn!(window_key = %window_key, error = %e, "Mirror requeue failed");
                        }
                    }
                    continue;
                }
                Effect::EvaluateCoverage => {
                    let evaluated = self
                        .evaluator
                        .evaluate(
                            session.window_start,
                            session.window_end,
                            &session.requested,
                            session.coverage_mode,
                            session.last_coverage.as_ref(),
                        )
                        .await;
                    match evaluated {
                        Ok(snapshot) => PassEvent::CoverageEvaluated {
                            snapshot,
                            elapsed: started.elapsed(),
                        },
                        Err(error) => PassEvent::PassFailed { error },
                    }
                }
                Effect::ReadCacheFallback => match self.cache.lookup(&cache_request, true).await {
                    Ok(result) => PassEvent::CacheFallbackRead { result },
                    Err(e) => {
                        warn!(window_key = %window_key, error = %e, "Cache fallback read failed");
                        PassEvent::CacheFallbackRead { result: None }
                    }
                },
            };

            if let PassEvent::PassFailed { error } = &event {
                if error.is_superseded() {
                    return Err(SyncError::Superseded);
                }
                warn!(
                    %session_id,
                    window_key = %window_key,
                    pass = session.pass,
                    error = %error,
                    "Pass failed"
                );
            }
            token.check()?;

            let (next, effects) = reduce(session, event);
            session = next;
            queue.extend(effects);
        }

        Err(SyncError::Other(format!(
            "session for {window_key} stopped without an outcome"
        )))
    }

    /// Best-effort probe. Failures are logged and dropped.
    async fn worker_health(&self) -> Option<WorkerHealth> {
        match tokio::time::timeout(self.config.timeouts.metadata, self.backend.worker_health()).await {
            Ok(Ok(health)) => {
                info!(
                    healthy = ?health.healthy,
                    workers = ?health.healthy_workers,
                    "Worker health"
                );
                Some(health)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Worker health probe failed");
                None
            }
            Err(_) => {
                warn!("Worker health probe timed out");
                None
            }
        }
    }
}

fn outcome_name(outcome: &SessionOutcome) -> &'static str {
    match outcome {
        SessionOutcome::Succeeded { .. } => "succeeded",
        SessionOutcome::Incomplete { .. } => "incomplete",
        SessionOutcome::Failed { .. } => "failed",
        SessionOutcome::StillRunning { .. } => "still_running",
    }
}
