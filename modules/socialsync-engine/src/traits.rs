// Trait seams for the engine's collaborators.
//
// IngestBackend: runs, run status, discovery cache reads, worker health.
// CoverageSource: saved vs platform-reported counts and media mirroring for a window.
// SeasonCalendar: episode air dates and externally computed periods.
//
// IngestClient implements all three (backend.rs). testing.rs provides
// in-memory versions so the convergence loop runs without a network.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use socialsync_common::{
    DiscoveryResult, Episode, ExternalPeriod, MirrorSnapshot, Platform, RunStatus, SyncResult,
    Timestamp, WorkerHealth,
};

use crate::cache::CacheRequest;
use crate::coordinator::{RunRequest, RunStarted};

// ---------------------------------------------------------------------------
// IngestBackend
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IngestBackend: Send + Sync {
    /// Start a run. Returns as soon as the backend has queued it.
    async fn create_run(&self, request: &RunRequest) -> SyncResult<RunStarted>;

    /// One status read. No polling.
    async fn run_status(&self, run_id: &str) -> SyncResult<RunStatus>;

    /// Cached discovery for many windows in one call, keyed by
    /// [`CacheRequest::key`]. A key absent from the map is a miss.
    async fn bulk_lookup(
        &self,
        requests: &[CacheRequest],
    ) -> SyncResult<HashMap<String, Option<DiscoveryResult>>>;

    /// Cached discovery for one window. `None` means no data yet.
    async fn lookup(&self, request: &CacheRequest) -> SyncResult<Option<DiscoveryResult>>;

    async fn worker_health(&self) -> SyncResult<WorkerHealth>;
}

#[async_trait]
impl<T: IngestBackend + ?Sized> IngestBackend for Arc<T> {
    async fn create_run(&self, request: &RunRequest) -> SyncResult<RunStarted> {
        (**self).create_run(request).await
    }

    async fn run_status(&self, run_id: &str) -> SyncResult<RunStatus> {
        (**self).run_status(run_id).await
    }

    async fn bulk_lookup(
        &self,
        requests: &[CacheRequest],
    ) -> SyncResult<HashMap<String, Option<DiscoveryResult>>> {
        (**self).bulk_lookup(requests).await
    }

    async fn lookup(&self, request: &CacheRequest) -> SyncResult<Option<DiscoveryResult>> {
        (**self).lookup(request).await
    }

    async fn worker_health(&self) -> SyncResult<WorkerHealth> {
        (**self).worker_health().await
    }
}

// ---------------------------------------------------------------------------
// CoverageSource
// ---------------------------------------------------------------------------

/// Raw counts as the backend reports them, before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCoverage {
    pub saved: u64,
    pub reported: Option<u64>,
}

#[async_trait]
pub trait CoverageSource: Send + Sync {
    /// Counts for the whole window, for each requested platform.
    async fn coverage(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<BTreeMap<Platform, RawCoverage>>;

    /// Media mirroring state for the whole window.
    async fn mirror_coverage(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<MirrorSnapshot>;

    /// Queue mirror jobs for unmirrored media. Returns the number of jobs queued.
    async fn requeue_mirror(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<u64>;
}

#[async_trait]
impl<T: CoverageSource + ?Sized> CoverageSource for Arc<T> {
    async fn coverage(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<BTreeMap<Platform, RawCoverage>> {
        (**self).coverage(start, end, platforms).await
    }

    async fn mirror_coverage(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<MirrorSnapshot> {
        (**self).mirror_coverage(start, end, platforms).await
    }

    async fn requeue_mirror(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<u64> {
        (**self).requeue_mirror(start, end, platforms).await
    }
}

// ---------------------------------------------------------------------------
// SeasonCalendar
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SeasonCalendar: Send + Sync {
    async fn episodes(&self, season_id: &str) -> SyncResult<Vec<Episode>>;

    /// Externally computed periods. Optional: an empty list is normal.
    async fn periods(&self, season_id: &str) -> SyncResult<Vec<ExternalPeriod>>;
}
