//! Progress reports emitted on every session transition.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use socialsync_common::{CoverageSnapshot, Platform, RunState, RunTotals, WorkerHealth};

/// Why a session stopped without converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailReason {
    MaxPasses,
    MaxDuration,
}

impl fmt::Display for GuardrailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardrailReason::MaxPasses => f.write_str("pass limit"),
            GuardrailReason::MaxDuration => f.write_str("time limit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Progress {
    Queued {
        window_key: String,
        pass: u32,
        max_passes: u32,
        run_id: String,
        jobs: Option<u32>,
        shards: BTreeSet<Platform>,
        worker_health: Option<WorkerHealth>,
    },
    Polling {
        window_key: String,
        pass: u32,
        run_id: String,
        attempt: u32,
        state: RunState,
        totals: RunTotals,
    },
    PassFinished {
        window_key: String,
        pass: u32,
        max_passes: u32,
        state: RunState,
        totals: RunTotals,
        coverage: CoverageSnapshot,
    },
    Continuing {
        window_key: String,
        next_pass: u32,
        max_passes: u32,
        shards: BTreeSet<Platform>,
    },
    Succeeded {
        window_key: String,
        passes: u32,
        coverage: CoverageSnapshot,
    },
    Incomplete {
        window_key: String,
        passes: u32,
        max_passes: u32,
        reason: GuardrailReason,
        coverage: Option<CoverageSnapshot>,
    },
    Failed {
        window_key: String,
        pass: u32,
        message: String,
    },
    MirrorRequeued {
        window_key: String,
        queued_jobs: u64,
        platforms: BTreeSet<Platform>,
    },
    /// The poll budget ran out with the run still going.
    StillRunning {
        window_key: String,
        pass: u32,
        run_id: String,
        attempts: u32,
    },
}

impl Progress {
    pub fn window_key(&self) -> &str {
        match self {
            Progress::Queued { window_key, .. }
            | Progress::Polling { window_key, .. }
            | Progress::PassFinished { window_key, .. }
            | Progress::Continuing { window_key, .. }
            | Progress::Succeeded { window_key, .. }
            | Progress::Incomplete { window_key, .. }
            | Progress::Failed { window_key, .. }
            | Progress::MirrorRequeued { window_key, .. }
            | Progress::StillRunning { window_key, .. } => window_key,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Progress::Succeeded { .. }
                | Progress::Incomplete { .. }
                | Progress::Failed { .. }
                | Progress::StillRunning { .. }
        )
    }
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

fn shard_label(shards: &BTreeSet<Platform>) -> String {
    if shards.is_empty() {
        return "all platforms".to_string();
    }
    shards
        .iter()
        .map(Platform::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// "Coverage 45/90 (50.0%)", plus the media mirror reading when there is one.
fn coverage_text(coverage: &CoverageSnapshot) -> String {
    match &coverage.mirror {
        Some(mirror) => format!("Coverage {} · Mirror {}", coverage.label(), mirror.label()),
        None => format!("Coverage {}", coverage.label()),
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Queued {
                window_key,
                pass,
                max_passes,
                run_id,
                jobs,
                shards,
                ..
            } => {
                write!(
                    f,
                    "Pass {pass}/{max_passes} queued for {window_key} ({}) · run {}",
                    shard_label(shards),
                    short_id(run_id)
                )?;
                if let Some(jobs) = jobs {
                    write!(f, " · {jobs} job(s)")?;
                }
                Ok(())
            }
            Progress::Polling {
                pass,
                run_id,
                attempt,
                state,
                totals,
                ..
            } => {
                let done = totals.completed_jobs + totals.failed_jobs;
                write!(f, "Pass {pass} · run {} {state}", short_id(run_id))?;
                if totals.total_jobs > 0 {
                    write!(f, " {done}/{}", totals.total_jobs)?;
                }
                write!(f, " · check {attempt}")
            }
            Progress::PassFinished {
                pass,
                max_passes,
                state,
                totals,
                coverage,
                ..
            } => {
                let verb = match state {
                    RunState::Failed => "failed",
                    RunState::Cancelled => "cancelled",
                    _ => "complete",
                };
                write!(
                    f,
                    "Pass {pass}/{max_passes} ingest {verb}: {} job(s) finished",
                    totals.completed_jobs
                )?;
                if totals.total_jobs > 0 {
                    write!(f, " of {}", totals.total_jobs)?;
                }
                write!(f, ", {} scraped", totals.items_found_total)?;
                if totals.failed_jobs > 0 {
                    write!(f, " · {} failed", totals.failed_jobs)?;
                }
                write!(f, " · {}", coverage_text(coverage))
            }
            Progress::Continuing {
                next_pass,
                max_passes,
                shards,
                ..
            } => write!(
                f,
                "Auto-continuing pass {next_pass}/{max_passes} ({})...",
                shard_label(shards)
            ),
            Progress::Succeeded {
                window_key,
                passes,
                coverage,
            } => write!(
                f,
                "{window_key} up to date after {passes} pass(es) · {}",
                coverage_text(coverage)
            ),
            Progress::Incomplete {
                window_key,
                passes,
                max_passes,
                reason,
                coverage,
            } => {
                write!(f, "{window_key} incomplete")?;
                if let Some(coverage) = coverage {
                    write!(f, " · {}", coverage_text(coverage))?;
                }
                write!(f, " ({reason} reached after {passes}/{max_passes} passes)")
            }
            Progress::Failed {
                window_key,
                pass,
                message,
            } => write!(f, "{window_key} failed on pass {pass}: {message}"),
            Progress::MirrorRequeued {
                queued_jobs,
                platforms,
                ..
            } => write!(
                f,
                "Requeued {queued_jobs} mirror job(s) ({})",
                shard_label(platforms)
            ),
            Progress::StillRunning {
                window_key,
                pass,
                run_id,
                attempts,
            } => write!(
                f,
                "{window_key} pass {pass} · run {} still running after {attempts} checks. Check back later.",
                short_id(run_id)
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressSink
// ---------------------------------------------------------------------------

pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}

impl<T: ProgressSink + ?Sized> ProgressSink for Arc<T> {
    fn report(&self, progress: Progress) {
        (**self).report(progress)
    }
}

/// Logs every report. The default sink outside tests.
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn report(&self, progress: Progress) {
        match &progress {
            Progress::Failed { .. } | Progress::Incomplete { .. } | Progress::StillRunning { .. } => {
                warn!(window_key = %progress.window_key(), "{progress}")
            }
            _ => info!(window_key = %progress.window_key(), "{progress}"),
        }
    }
}

/// Records every report in order (for test assertions).
#[derive(Default)]
pub struct MemoryProgressSink {
    reports: Mutex<Vec<Progress>>,
}

impl MemoryProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Progress> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<Progress> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl ProgressSink for MemoryProgressSink {
    fn report(&self, progress: Progress) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(progress);
    }
}
