//! Polling a run until it reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use socialsync_common::{DiscoveryResult, EngineConfig, RunState, RunStatus, SyncError, SyncResult};

use crate::cache::{CacheRequest, DiscoveryCache};
use crate::epoch::EpochToken;
use crate::traits::IngestBackend;

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Consecutive transient failures tolerated before giving up.
    pub transient_budget: u32,
    /// Delay after `n` consecutive failures is `backoff[min(n, len - 1)]`.
    pub backoff: Vec<Duration>,
    pub call_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 80,
            transient_budget: 5,
            backoff: vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(10),
                Duration::from_secs(15),
            ],
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl PollPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max_attempts: config.poll_attempts,
            transient_budget: config.transient_budget,
            backoff: config.poll_backoff.clone(),
            call_timeout: config.timeouts.run_status,
        }
    }

    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 || self.backoff.is_empty() {
            return self.interval;
        }
        let index = (failures as usize).min(self.backoff.len() - 1);
        self.backoff[index]
    }
}

/// A finished run and the window's discovery as re-read through the cache.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub status: RunStatus,
    pub discovery: Option<Arc<DiscoveryResult>>,
}

pub struct StatusPoller<B> {
    backend: Arc<B>,
    cache: Arc<DiscoveryCache<B>>,
    policy: PollPolicy,
}

impl<B: IngestBackend + 'static> StatusPoller<B> {
    pub fn new(backend: Arc<B>, cache: Arc<DiscoveryCache<B>>, policy: PollPolicy) -> Self {
        Self {
            backend,
            cache,
            policy,
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Poll until `Completed`/`Partial`. `on_status` sees every successful read.
    ///
    /// Errors: `RunFailed`/`RunCancelled` with the backend's message, `Timeout`
    /// once transient failures exceed the budget, `StillRunning` at the attempt
    /// cap, `Superseded` as soon as `token` goes stale.
    pub async fn wait<F>(&self, run_id: &str, token: &EpochToken, mut on_status: F) -> SyncResult<RunStatus>
    where
        F: FnMut(&RunStatus, u32),
    {
        let mut failures: u32 = 0;

        for attempt in 1..=self.policy.max_attempts {
            token.check()?;

            let read = match tokio::time::timeout(
                self.policy.call_timeout,
                self.backend.run_status(run_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(format!(
                    "status check for run {run_id} exceeded {}s",
                    self.policy.call_timeout.as_secs()
                ))),
            };

            match read {
                Ok(status) => {
                    failures = 0;
                    token.check()?;
                    on_status(&status, attempt);
                    match status.state {
                        RunState::Completed | RunState::Partial => {
                            info!(run_id, attempt, state = %status.state, "Run finished");
                            return Ok(status);
                        }
                        RunState::Failed => {
                            return Err(SyncError::RunFailed {
                                run_id: run_id.to_string(),
                                message: status
                                    .error_message
                                    .unwrap_or_else(|| "run failed".to_string()),
                            });
                        }
                        RunState::Cancelled => {
                            return Err(SyncError::RunCancelled {
                                run_id: run_id.to_string(),
                                message: status
                                    .error_message
                                    .unwrap_or_else(|| "run cancelled".to_string()),
                            });
                        }
                        RunState::Queued | RunState::Running => {
                            debug!(run_id, attempt, state = %status.state, "Run still in progress");
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures > self.policy.transient_budget {
                        warn!(run_id, failures, error = %e, "Status checks kept failing, giving up");
                        return Err(match e {
                            SyncError::Timeout(_) => e,
                            other => SyncError::Timeout(other.to_string()),
                        });
                    }
                    warn!(run_id, failures, error = %e, "Transient status check failure, retrying");
                }
                Err(e) => return Err(e),
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.delay_after(failures)).await;
            }
        }

        warn!(run_id, attempts = self.policy.max_attempts, "Run still running after poll budget");
        Err(SyncError::StillRunning {
            run_id: run_id.to_string(),
            attempts: self.policy.max_attempts,
        })
    }

    /// [`wait`](Self::wait), then read the window back through the cache.
    pub async fn wait_and_read<F>(
        &self,
        run_id: &str,
        window: &CacheRequest,
        token: &EpochToken,
        on_status: F,
    ) -> SyncResult<PollOutcome>
    where
        F: FnMut(&RunStatus, u32),
    {
        let status = self.wait(run_id, token, on_status).await?;
        let discovery = self.cache.lookup(window, true).await?;
        token.check()?;
        Ok(PollOutcome { status, discovery })
    }
}
