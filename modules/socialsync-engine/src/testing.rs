// In-memory collaborators for engine tests.
//
// One mock per trait seam:
// - MockBackend (IngestBackend): scripted run statuses, keyed cache, call counters
// - ScriptedCoverage (CoverageSource): one coverage snapshot per call, last repeats;
//   same for mirror coverage, plus recorded mirror requeues
// - MockCalendar (SeasonCalendar): fixed episodes and periods
//
// Plus helpers for building DiscoveryResult and RunStatus values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use socialsync_common::{
    DiscoveryResult, DiscoveryTotals, Episode, ExternalItem, ExternalPeriod, MirrorSnapshot,
    Platform, PlatformMirror, RunState, RunStatus, SyncError, SyncResult, Timestamp, WorkerHealth,
};

use crate::cache::CacheRequest;
use crate::coordinator::{RunRequest, RunStarted};
use crate::traits::{CoverageSource, IngestBackend, RawCoverage, SeasonCalendar};

pub use crate::progress::MemoryProgressSink;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A non-exhaustive discovery result holding `items`.
pub fn discovery(items: Vec<ExternalItem>) -> DiscoveryResult {
    let fetched = items.len() as u64;
    let matched = items.iter().filter(|i| i.is_match).count() as u64;
    DiscoveryResult {
        items,
        totals: DiscoveryTotals {
            fetched,
            matched,
            tracked_flair: fetched,
        },
        ..DiscoveryResult::empty()
    }
}

/// Mirror coverage from `(platform, still unmirrored, scanned)` entries. The
/// window is ready when nothing is left to mirror.
pub fn mirror_snapshot<I>(entries: I) -> MirrorSnapshot
where
    I: IntoIterator<Item = (Platform, u64, u64)>,
{
    let mut snapshot = MirrorSnapshot::default();
    for (platform, needs, scanned) in entries {
        let counts = PlatformMirror {
            up_to_date: needs == 0,
            needs_mirror: needs,
            mirrored: scanned.saturating_sub(needs),
            scanned,
            ..PlatformMirror::default()
        };
        snapshot.overall.needs_mirror += needs;
        snapshot.overall.mirrored += counts.mirrored;
        snapshot.overall.scanned += scanned;
        snapshot.by_platform.insert(platform, counts);
    }
    snapshot.overall.up_to_date = snapshot.overall.needs_mirror == 0;
    snapshot
}

pub fn status(run_id: &str, state: RunState) -> RunStatus {
    RunStatus::new(run_id, state)
}

/// A completed run whose jobs failed for `failed` platforms.
pub fn completed_with_failures(run_id: &str, failed: &[Platform]) -> RunStatus {
    let mut s = RunStatus::new(run_id, RunState::Completed);
    s.totals.failed_jobs = failed.len() as u64;
    s.totals.total_jobs = s.totals.failed_jobs + 1;
    s.totals.completed_jobs = 1;
    s.totals.failed_platforms = failed.iter().copied().collect();
    s
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    run_ids: Vec<String>,
    created: Vec<RunRequest>,
    scripts: HashMap<String, Vec<SyncResult<RunStatus>>>,
    status_calls: HashMap<String, usize>,
    cache: HashMap<String, DiscoveryResult>,
    scoped_cache: HashMap<(String, BTreeSet<Platform>), DiscoveryResult>,
    lookup_calls: usize,
    bulk_calls: usize,
    last_bulk_size: usize,
}

pub struct MockBackend {
    state: Mutex<BackendState>,
    default_script: Vec<SyncResult<RunStatus>>,
    latency: Duration,
    lookup_error: Option<SyncError>,
    create_error: Option<SyncError>,
    bulk_endpoint: bool,
    worker_health: SyncResult<WorkerHealth>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            default_script: vec![Ok(status("", RunState::Completed))],
            latency: Duration::ZERO,
            lookup_error: None,
            create_error: None,
            bulk_endpoint: true,
            worker_health: Ok(WorkerHealth {
                queue_enabled: Some(true),
                healthy: Some(true),
                healthy_workers: Some(2),
                reason: None,
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids handed out by `create_run`, in order. Afterwards ids are `run-N`.
    pub fn with_run_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state).run_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Status reads for one run, in order. The last entry repeats.
    pub fn on_status(self, run_id: &str, script: Vec<SyncResult<RunStatus>>) -> Self {
        lock(&self.state).scripts.insert(run_id.to_string(), script);
        self
    }

    /// Script for runs without one of their own. Defaults to one `Completed` read.
    pub fn with_default_statuses(mut self, script: Vec<SyncResult<RunStatus>>) -> Self {
        self.default_script = script;
        self
    }

    pub fn on_cache(self, key: &str, result: DiscoveryResult) -> Self {
        self.put_cache(key, result);
        self
    }

    /// Cached data answered only to requests for exactly these platforms.
    /// Takes precedence over [`on_cache`](Self::on_cache) for the same key.
    pub fn on_scoped_cache<I>(self, key: &str, platforms: I, result: DiscoveryResult) -> Self
    where
        I: IntoIterator<Item = Platform>,
    {
        self.put_scoped_cache(key, platforms, result);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_lookups(mut self, error: SyncError) -> Self {
        self.lookup_error = Some(error);
        self
    }

    pub fn fail_create(mut self, error: SyncError) -> Self {
        self.create_error = Some(error);
        self
    }

    /// Bulk reads answer 404 like a backend that predates the endpoint.
    pub fn without_bulk_endpoint(mut self) -> Self {
        self.bulk_endpoint = false;
        self
    }

    pub fn with_worker_health(mut self, health: SyncResult<WorkerHealth>) -> Self {
        self.worker_health = health;
        self
    }

    /// Change cached data mid-test, e.g. after a run lands.
    pub fn put_cache(&self, key: &str, result: DiscoveryResult) {
        lock(&self.state).cache.insert(key.to_string(), result);
    }

    pub fn put_scoped_cache<I>(&self, key: &str, platforms: I, result: DiscoveryResult)
    where
        I: IntoIterator<Item = Platform>,
    {
        lock(&self.state)
            .scoped_cache
            .insert((key.to_string(), platforms.into_iter().collect()), result);
    }

    pub fn created_runs(&self) -> Vec<RunRequest> {
        lock(&self.state).created.clone()
    }

    pub fn status_calls(&self, run_id: &str) -> usize {
        lock(&self.state).status_calls.get(run_id).copied().unwrap_or(0)
    }

    pub fn lookup_calls(&self) -> usize {
        lock(&self.state).lookup_calls
    }

    pub fn bulk_calls(&self) -> usize {
        lock(&self.state).bulk_calls
    }

    pub fn last_bulk_size(&self) -> usize {
        lock(&self.state).last_bulk_size
    }

    pub fn max_concurrent_lookups(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl BackendState {
    fn cached(&self, request: &CacheRequest) -> Option<DiscoveryResult> {
        let key = request.key();
        self.scoped_cache
            .get(&(key.clone(), request.params.platforms.clone()))
            .or_else(|| self.cache.get(&key))
            .cloned()
    }
}

#[async_trait]
impl IngestBackend for MockBackend {
    async fn create_run(&self, request: &RunRequest) -> SyncResult<RunStarted> {
        if let Some(e) = &self.create_error {
            return Err(e.clone());
        }
        let mut state = lock(&self.state);
        state.created.push(request.clone());
        let n = state.created.len();
        let run_id = if state.run_ids.is_empty() {
            format!("run-{n}")
        } else {
            state.run_ids.remove(0)
        };
        Ok(RunStarted {
            run_id,
            state: RunState::Queued,
            jobs: Some(request.platforms.len() as u32),
        })
    }

    async fn run_status(&self, run_id: &str) -> SyncResult<RunStatus> {
        let reply = {
            let mut state = lock(&self.state);
            let calls = state.status_calls.entry(run_id.to_string()).or_insert(0);
            *calls += 1;
            let index = *calls - 1;
            let script = state.scripts.get(run_id).unwrap_or(&self.default_script);
            match script.get(index).or_else(|| script.last()) {
                Some(Ok(s)) => {
                    let mut s = s.clone();
                    s.run_id = run_id.to_string();
                    Ok(s)
                }
                Some(Err(e)) => Err(e.clone()),
                None => Ok(status(run_id, RunState::Running)),
            }
        };
        self.delay().await;
        reply
    }

    async fn bulk_lookup(
        &self,
        requests: &[CacheRequest],
    ) -> SyncResult<HashMap<String, Option<DiscoveryResult>>> {
        if !self.bulk_endpoint {
            return Err(SyncError::rejected(404, "Not Found"));
        }
        {
            let mut state = lock(&self.state);
            state.bulk_calls += 1;
            state.last_bulk_size = requests.len();
        }
        self.delay().await;
        if let Some(e) = &self.lookup_error {
            return Err(e.clone());
        }
        let state = lock(&self.state);
        Ok(requests
            .iter()
            .filter_map(|r| state.cached(r).map(|d| (r.key(), Some(d))))
            .collect())
    }

    async fn lookup(&self, request: &CacheRequest) -> SyncResult<Option<DiscoveryResult>> {
        lock(&self.state).lookup_calls += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.delay().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(e) = &self.lookup_error {
            return Err(e.clone());
        }
        Ok(lock(&self.state).cached(request))
    }

    async fn worker_health(&self) -> SyncResult<WorkerHealth> {
        self.worker_health.clone()
    }
}

// ---------------------------------------------------------------------------
// ScriptedCoverage
// ---------------------------------------------------------------------------

/// Returns the next scripted snapshot on each call. The last one repeats.
/// Mirror coverage reads ready when no mirror pass is scripted.
#[derive(Default)]
pub struct ScriptedCoverage {
    passes: Vec<BTreeMap<Platform, RawCoverage>>,
    mirror_passes: Vec<MirrorSnapshot>,
    error: Option<SyncError>,
    requeue_error: Option<SyncError>,
    calls: AtomicUsize,
    mirror_calls: AtomicUsize,
    requeued: Mutex<Vec<BTreeSet<Platform>>>,
}

impl ScriptedCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass<I>(mut self, counts: I) -> Self
    where
        I: IntoIterator<Item = (Platform, u64, Option<u64>)>,
    {
        self.passes.push(
            counts
                .into_iter()
                .map(|(p, saved, reported)| (p, RawCoverage { saved, reported }))
                .collect(),
        );
        self
    }

    /// Next mirror read, as `(platform, still unmirrored, scanned)`.
    pub fn mirror_pass<I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (Platform, u64, u64)>,
    {
        self.mirror_passes.push(mirror_snapshot(entries));
        self
    }

    pub fn fail_with(mut self, error: SyncError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn fail_requeue(mut self, error: SyncError) -> Self {
        self.requeue_error = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn mirror_calls(&self) -> usize {
        self.mirror_calls.load(Ordering::SeqCst)
    }

    /// Platform sets passed to `requeue_mirror`, in order.
    pub fn requeued(&self) -> Vec<BTreeSet<Platform>> {
        lock(&self.requeued).clone()
    }
}

#[async_trait]
impl CoverageSource for ScriptedCoverage {
    async fn coverage(
        &self,
        _start: Option<Timestamp>,
        _end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<BTreeMap<Platform, RawCoverage>> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let snapshot = self
            .passes
            .get(index)
            .or_else(|| self.passes.last())
            .cloned()
            .unwrap_or_default();
        Ok(snapshot
            .into_iter()
            .filter(|(p, _)| platforms.contains(p))
            .collect())
    }

    async fn mirror_coverage(
        &self,
        _start: Option<Timestamp>,
        _end: Option<Timestamp>,
        _platforms: &BTreeSet<Platform>,
    ) -> SyncResult<MirrorSnapshot> {
        let index = self.mirror_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .mirror_passes
            .get(index)
            .or_else(|| self.mirror_passes.last())
            .cloned()
            .unwrap_or_else(|| MirrorSnapshot {
                overall: PlatformMirror {
                    up_to_date: true,
                    ..PlatformMirror::default()
                },
                by_platform: BTreeMap::new(),
            }))
    }

    async fn requeue_mirror(
        &self,
        _start: Option<Timestamp>,
        _end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<u64> {
        lock(&self.requeued).push(platforms.clone());
        match &self.requeue_error {
            Some(e) => Err(e.clone()),
            None => Ok(platforms.len() as u64),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCalendar
// ---------------------------------------------------------------------------

pub struct MockCalendar {
    episodes: SyncResult<Vec<Episode>>,
    periods: SyncResult<Vec<ExternalPeriod>>,
}

impl Default for MockCalendar {
    fn default() -> Self {
        Self {
            episodes: Ok(Vec::new()),
            periods: Ok(Vec::new()),
        }
    }
}

impl MockCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_episodes(mut self, episodes: Vec<Episode>) -> Self {
        self.episodes = Ok(episodes);
        self
    }

    pub fn with_periods(mut self, periods: Vec<ExternalPeriod>) -> Self {
        self.periods = Ok(periods);
        self
    }

    pub fn fail_episodes(mut self, error: SyncError) -> Self {
        self.episodes = Err(error);
        self
    }

    pub fn fail_periods(mut self, error: SyncError) -> Self {
        self.periods = Err(error);
        self
    }
}

#[async_trait]
impl SeasonCalendar for MockCalendar {
    async fn episodes(&self, _season_id: &str) -> SyncResult<Vec<Episode>> {
        self.episodes.clone()
    }

    async fn periods(&self, _season_id: &str) -> SyncResult<Vec<ExternalPeriod>> {
        self.periods.clone()
    }
}
