//! Windowed, multi-pass coverage convergence for social ingestion.
//!
//! A season splits into windows (`windows`). For one window the engine
//! starts backend runs, polls them, measures saved vs reported coverage and
//! reruns the platforms that are still behind until everything is up to date
//! or a pass/time guardrail stops it (`engine`, `scheduler`). Discovery reads
//! go through a deduplicating cache (`cache`) whose partial results are
//! merged into one view per window (`merge`).

pub mod backend;
pub mod cache;
pub mod civil_time;
pub mod coordinator;
pub mod coverage;
pub mod engine;
pub mod epoch;
pub mod merge;
pub mod poller;
pub mod prefetch;
pub mod progress;
pub mod scheduler;
pub mod traits;
pub mod windows;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cache::{CacheParams, CacheRequest, DiscoveryCache};
pub use coordinator::{RunCoordinator, RunHandle, RunRequest, RunStarted};
pub use coverage::CoverageEvaluator;
pub use engine::{ConvergeRequest, ConvergenceEngine, EngineDeps};
pub use epoch::{EpochRegistry, EpochToken};
pub use merge::{PayloadMerger, WindowViews};
pub use poller::{PollPolicy, StatusPoller};
pub use prefetch::{PrefetchSummary, Prefetcher};
pub use progress::{GuardrailReason, Progress, ProgressSink, TracingProgressSink};
pub use scheduler::{reduce, Effect, PassEvent, PassSession, SessionOutcome};
pub use traits::{CoverageSource, IngestBackend, RawCoverage, SeasonCalendar};
pub use windows::{CutoverRule, WindowResolver};
