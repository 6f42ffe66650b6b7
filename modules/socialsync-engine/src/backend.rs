//! `IngestClient` behind the engine's trait seams.
//!
//! Converts wire payloads into domain types. Malformed items and unknown
//! enum strings are skipped with a warning rather than failing the call.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tracing::warn;

use ingest_client::{
    BulkCacheRequest, CacheEntry, CacheKeyRequest, CacheQuery, CoverageRequest, CreateRunRequest,
    DiscoveryItem, DiscoveryPayload, IngestClient, IngestError, MirrorCoverageResponse,
    MirrorRequeueRequest, PlatformMirrorPayload, RunResponse,
};
use socialsync_common::{
    DiscoveryResult, DiscoveryTotals, Episode, ExternalItem, ExternalPeriod, MirrorSnapshot,
    Platform, PlatformMirror, RunState, RunStatus, RunTotals, Sort, SyncError, SyncResult,
    Timestamp, WorkerHealth,
};

use crate::cache::CacheRequest;
use crate::civil_time::{parse_date, parse_instant};
use crate::coordinator::{RunRequest, RunStarted};
use crate::merge::PayloadMerger;
use crate::traits::{CoverageSource, IngestBackend, RawCoverage, SeasonCalendar};

/// Classify a client error: connection-level failures are retryable
/// timeouts, HTTP rejections are surfaced verbatim.
pub fn sync_error(err: IngestError) -> SyncError {
    match err {
        IngestError::Timeout(msg) | IngestError::Network(msg) => SyncError::Timeout(msg),
        IngestError::Api { status, message } | IngestError::NotFound { status, message } => {
            SyncError::BackendRejected {
                status: Some(status),
                message,
            }
        }
        IngestError::Parse(msg) => SyncError::BackendRejected {
            status: None,
            message: msg,
        },
    }
}

fn platform_names(platforms: &BTreeSet<Platform>) -> Vec<String> {
    platforms.iter().map(|p| p.as_str().to_string()).collect()
}

fn cache_query(request: &CacheRequest) -> CacheQuery {
    CacheQuery {
        date_start: request.params.start,
        date_end: request.params.end,
        platforms: platform_names(&request.params.platforms),
        flairs: request.params.flairs.iter().cloned().collect(),
        max_pages: request.params.max_pages,
    }
}

fn parse_platforms(names: &[String]) -> BTreeSet<Platform> {
    names
        .iter()
        .filter_map(|name| match name.parse::<Platform>() {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(platform = %name, error = %e, "Skipping unknown platform");
                None
            }
        })
        .collect()
}

fn parse_sorts(tags: &[String]) -> BTreeSet<Sort> {
    tags.iter().filter_map(|t| t.parse::<Sort>().ok()).collect()
}

fn instant(value: Option<&str>) -> Option<Timestamp> {
    value.and_then(parse_instant)
}

fn to_item(item: &DiscoveryItem) -> Option<ExternalItem> {
    let id = item.external_id.as_deref().map(str::trim).unwrap_or("");
    if id.is_empty() {
        warn!("Skipping discovery item without an id");
        return None;
    }
    Some(ExternalItem {
        external_id: id.to_string(),
        posted_at: instant(item.posted_at.as_deref()),
        score: item.score.unwrap_or(0),
        comment_count: item.comment_count.unwrap_or(0),
        flair: item.flair.clone(),
        source_tags: parse_sorts(&item.source_tags),
        is_match: item.is_match.unwrap_or(false),
    })
}

pub(crate) fn to_discovery(payload: &DiscoveryPayload) -> DiscoveryResult {
    let items: Vec<ExternalItem> = payload.items.iter().filter_map(to_item).collect();
    let fetched = items.len() as u64;
    let matched = items.iter().filter(|i| i.is_match).count() as u64;
    DiscoveryResult {
        source_tags_seen: parse_sorts(&payload.source_tags),
        pages_fetched: payload.pages_fetched.unwrap_or(0),
        max_pages_applied: payload.max_pages_applied.unwrap_or(0),
        window_exhaustive: payload.window_exhaustive.unwrap_or(false),
        window_start: instant(payload.window_start.as_deref()),
        window_end: instant(payload.window_end.as_deref()),
        totals: DiscoveryTotals {
            fetched: payload.totals.fetched.unwrap_or(fetched),
            matched: payload.totals.matched.unwrap_or(matched),
            tracked_flair: payload.totals.tracked_flair.unwrap_or(fetched),
        },
        items,
    }
}

/// Canonical view of one cache entry. Partial slices are merged over the
/// base payload; an entry with no payload at all is a miss.
pub(crate) fn entry_discovery(entry: &CacheEntry) -> Option<DiscoveryResult> {
    let base = entry.discovery.as_ref().map(to_discovery);
    if entry.partials.is_empty() {
        return base.or_else(|| entry.hit.then(DiscoveryResult::empty));
    }
    let partials: Vec<DiscoveryResult> = entry.partials.iter().map(to_discovery).collect();
    Some(PayloadMerger::new().merge(base.iter().chain(partials.iter())))
}

pub(crate) fn to_run_status(run: &RunResponse) -> RunStatus {
    let state = RunState::from_wire(&run.status).unwrap_or_else(|| {
        warn!(run_id = %run.run_id, status = %run.status, "Unknown run status, treating as running");
        RunState::Running
    });

    let completed = run.summary.completed_jobs.unwrap_or(0);
    let failed = run.summary.failed_jobs.unwrap_or(0);
    let total = run.summary.total_jobs.unwrap_or(0).max(completed + failed);

    RunStatus {
        run_id: run.run_id.clone(),
        state,
        totals: RunTotals {
            total_jobs: total,
            completed_jobs: completed,
            failed_jobs: failed,
            items_found_total: run.summary.items_found_total.unwrap_or(0),
            failed_platforms: parse_platforms(&run.summary.failed_platforms),
        },
        queue_depth: run.queue_depth,
        updated_at: instant(run.updated_at.as_deref()),
        error_message: run.error.clone().filter(|m| !m.trim().is_empty()),
    }
}

#[async_trait]
impl IngestBackend for IngestClient {
    async fn create_run(&self, request: &RunRequest) -> SyncResult<RunStarted> {
        let body = CreateRunRequest {
            window_key: request.window_key.clone(),
            date_start: request.start,
            date_end: request.end,
            platforms: platform_names(&request.platforms),
            flairs: request.flairs.iter().cloned().collect(),
            coverage_mode: request.coverage_mode.as_str().to_string(),
            config_hash: request.config_hash(),
            pass: request.pass,
        };
        let created = IngestClient::create_run(self, &body).await.map_err(sync_error)?;
        Ok(RunStarted {
            state: RunState::from_wire(&created.status).unwrap_or(RunState::Queued),
            run_id: created.run_id,
            jobs: created.jobs,
        })
    }

    async fn run_status(&self, run_id: &str) -> SyncResult<RunStatus> {
        let run = self.get_run(run_id).await.map_err(sync_error)?;
        Ok(to_run_status(&run))
    }

    async fn bulk_lookup(
        &self,
        requests: &[CacheRequest],
    ) -> SyncResult<HashMap<String, Option<DiscoveryResult>>> {
        let body = BulkCacheRequest {
            entries: requests
                .iter()
                .map(|r| CacheKeyRequest {
                    key: r.key(),
                    query: cache_query(r),
                })
                .collect(),
        };
        let response = self.bulk_cache(&body).await.map_err(sync_error)?;
        Ok(response
            .results
            .iter()
            .map(|(key, entry)| (key.clone(), entry_discovery(entry)))
            .collect())
    }

    async fn lookup(&self, request: &CacheRequest) -> SyncResult<Option<DiscoveryResult>> {
        match self.cache(&request.key(), &cache_query(request)).await {
            Ok(entry) => Ok(entry_discovery(&entry)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(sync_error(e)),
        }
    }

    async fn worker_health(&self) -> SyncResult<WorkerHealth> {
        let health = IngestClient::worker_health(self).await.map_err(sync_error)?;
        Ok(WorkerHealth {
            queue_enabled: health.queue_enabled,
            healthy: health.healthy,
            healthy_workers: health.healthy_workers,
            reason: health.reason,
        })
    }
}

#[async_trait]
impl CoverageSource for IngestClient {
    async fn coverage(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<BTreeMap<Platform, RawCoverage>> {
        let body = CoverageRequest {
            date_start: start,
            date_end: end,
            platforms: platform_names(platforms),
        };
        let response = IngestClient::coverage(self, &body).await.map_err(sync_error)?;

        let mut out = BTreeMap::new();
        for (name, counts) in &response.by_platform {
            let Ok(platform) = name.parse::<Platform>() else {
                warn!(platform = %name, "Skipping coverage for unknown platform");
                continue;
            };
            out.insert(
                platform,
                RawCoverage {
                    saved: counts.saved.unwrap_or(0),
                    reported: counts.reported,
                },
            );
        }
        Ok(out)
    }

    async fn mirror_coverage(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<MirrorSnapshot> {
        let body = CoverageRequest {
            date_start: start,
            date_end: end,
            platforms: platform_names(platforms),
        };
        let response = IngestClient::mirror_coverage(self, &body)
            .await
            .map_err(sync_error)?;
        Ok(mirror_snapshot(&response))
    }

    async fn requeue_mirror(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<u64> {
        let mut queued = 0;
        for platform in platforms {
            let body = MirrorRequeueRequest {
                platform: platform.as_str().to_string(),
                date_start: start,
                date_end: end,
                failed_only: false,
            };
            let response = IngestClient::requeue_mirror(self, &body)
                .await
                .map_err(sync_error)?;
            queued += response.queued_jobs.unwrap_or(0);
        }
        Ok(queued)
    }
}

fn mirror_state(payload: &PlatformMirrorPayload) -> PlatformMirror {
    PlatformMirror {
        up_to_date: payload.up_to_date.unwrap_or(false),
        needs_mirror: payload.needs_mirror_count.unwrap_or(0),
        mirrored: payload.mirrored_count.unwrap_or(0),
        failed: payload.failed_count.unwrap_or(0),
        pending: payload.pending_count.unwrap_or(0),
        scanned: payload.posts_scanned.unwrap_or(0),
    }
}

fn mirror_snapshot(response: &MirrorCoverageResponse) -> MirrorSnapshot {
    let mut by_platform = BTreeMap::new();
    for (name, payload) in &response.by_platform {
        let Ok(platform) = name.parse::<Platform>() else {
            warn!(platform = %name, "Skipping mirror coverage for unknown platform");
            continue;
        };
        by_platform.insert(platform, mirror_state(payload));
    }
    MirrorSnapshot {
        overall: mirror_state(&response.overall),
        by_platform,
    }
}

#[async_trait]
impl SeasonCalendar for IngestClient {
    async fn episodes(&self, season_id: &str) -> SyncResult<Vec<Episode>> {
        let episodes = self.season_episodes(season_id).await.map_err(sync_error)?;
        Ok(episodes
            .into_iter()
            .map(|e| Episode {
                number: e.episode_number,
                air_date: e.air_date.as_deref().and_then(parse_date),
                live_thread_at: instant(e.live_thread_at.as_deref()),
            })
            .collect())
    }

    async fn periods(&self, season_id: &str) -> SyncResult<Vec<ExternalPeriod>> {
        let periods = match self.season_periods(season_id).await {
            Ok(periods) => periods,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(sync_error(e)),
        };
        Ok(periods
            .into_iter()
            .filter_map(|p| {
                let label = p.label?.trim().to_string();
                (!label.is_empty()).then(|| ExternalPeriod {
                    start: instant(p.start.as_deref()),
                    end: instant(p.end.as_deref()),
                    label,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_client::RunSummary;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> DiscoveryPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn client_errors_classify_for_retry() {
        assert!(sync_error(IngestError::Timeout("35s".into())).is_transient());
        assert!(sync_error(IngestError::Network("connection reset".into())).is_transient());

        let rejected = sync_error(IngestError::Api {
            status: 422,
            message: "bad platform".into(),
        });
        assert!(!rejected.is_transient());
        assert!(matches!(
            rejected,
            SyncError::BackendRejected { status: Some(422), .. }
        ));
        assert!(sync_error(IngestError::NotFound {
            status: 404,
            message: "no route".into()
        })
        .is_not_found());
    }

    #[test]
    fn mirror_counts_map_and_unknown_platforms_drop() {
        let response: MirrorCoverageResponse = serde_json::from_value(json!({
            "up_to_date": false,
            "needs_mirror_count": 2,
            "posts_scanned": 9,
            "by_platform": {
                "tiktok": { "up_to_date": true, "posts_scanned": 4 },
                "instagram": { "needs_mirror_count": 2, "failed_count": 1, "posts_scanned": 5 },
                "myspace": { "up_to_date": true }
            }
        }))
        .unwrap();
        let mirror = mirror_snapshot(&response);

        assert!(!mirror.is_ready());
        assert_eq!(mirror.by_platform.len(), 2);
        assert_eq!(mirror.by_platform[&Platform::Instagram].failed, 1);
        assert!(!mirror.by_platform[&Platform::Instagram].up_to_date);
        assert_eq!(mirror.stale_platforms(), BTreeSet::from([Platform::Instagram]));
        assert_eq!(mirror.label(), "7/9 (77.8%)");
    }

    #[test]
    fn malformed_items_are_skipped() {
        let result = to_discovery(&payload(json!({
            "items": [
                {"external_id": "p1", "posted_at": "2025-03-04T01:00:00Z", "num_comments": 7},
                {"external_id": "   "},
                {"score": 3}
            ],
            "window_exhaustive": true
        })));
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].comment_count, 7);
        assert!(result.items[0].posted_at.is_some());
        assert_eq!(result.totals.fetched, 1);
        assert!(result.window_exhaustive);
    }

    #[test]
    fn entry_merges_partials_over_base() {
        let entry = CacheEntry {
            hit: true,
            discovery: Some(payload(json!({
                "items": [{"external_id": "p1", "posted_at": "2025-03-04T01:00:00Z", "num_comments": 5}]
            }))),
            partials: vec![payload(json!({
                "items": [
                    {"external_id": "p1", "posted_at": "2025-03-04T02:00:00Z", "num_comments": 3},
                    {"external_id": "p2"}
                ]
            }))],
        };
        let merged = entry_discovery(&entry).unwrap();
        assert_eq!(merged.items.len(), 2);
        let p1 = merged.items.iter().find(|i| i.external_id == "p1").unwrap();
        assert_eq!(p1.comment_count, 3);
    }

    #[test]
    fn entry_without_payload_is_a_miss() {
        let entry = CacheEntry {
            hit: false,
            discovery: None,
            partials: vec![],
        };
        assert!(entry_discovery(&entry).is_none());
    }

    #[test]
    fn run_totals_never_undercount_finished_jobs() {
        let run = RunResponse {
            run_id: "r1".into(),
            status: "running".into(),
            summary: RunSummary {
                total_jobs: Some(2),
                completed_jobs: Some(3),
                failed_jobs: Some(1),
                items_found_total: Some(40),
                failed_platforms: vec!["tiktok".into(), "myspace".into()],
            },
            queue_depth: None,
            updated_at: None,
            error: Some("  ".into()),
            discovery: None,
        };
        let status = to_run_status(&run);
        assert_eq!(status.totals.total_jobs, 4);
        assert_eq!(status.totals.failed_platforms, BTreeSet::from([Platform::Tiktok]));
        assert!(status.error_message.is_none());
    }

    #[test]
    fn unknown_status_is_treated_as_running() {
        let run: RunResponse =
            serde_json::from_value(json!({"run_id": "r1", "status": "warming_up"})).unwrap();
        assert_eq!(to_run_status(&run).state, RunState::Running);

        let run: RunResponse =
            serde_json::from_value(json!({"run_id": "r1", "status": "retrying"})).unwrap();
        assert_eq!(to_run_status(&run).state, RunState::Queued);
    }
}
