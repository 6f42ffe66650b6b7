use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Runs ---

/// Body for `POST /runs`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRunRequest {
    pub window_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_end: Option<DateTime<Utc>>,
    /// Empty means "all platforms".
    pub platforms: Vec<String>,
    pub flairs: Vec<String>,
    pub coverage_mode: String,
    pub config_hash: String,
    pub pass: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: String,
    pub status: String,
    #[serde(default)]
    pub jobs: Option<u32>,
}

/// Aggregate job counters the backend keeps per run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub total_jobs: Option<u64>,
    #[serde(default)]
    pub completed_jobs: Option<u64>,
    #[serde(default)]
    pub failed_jobs: Option<u64>,
    #[serde(default)]
    pub items_found_total: Option<u64>,
    /// Platforms owning at least one failed job.
    #[serde(default)]
    pub failed_platforms: Vec<String>,
}

/// Response of `GET /runs/{run_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub status: String,
    #[serde(default)]
    pub summary: RunSummary,
    #[serde(default)]
    pub queue_depth: Option<u32>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Present once the run has resolved its discovery window.
    #[serde(default)]
    pub discovery: Option<DiscoveryPayload>,
}

// --- Discovery payloads ---

/// One discovered post as the backend serializes it. Everything is optional
/// because partial slices routinely omit fields.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryItem {
    #[serde(alias = "reddit_post_id")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub posted_at: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default, alias = "num_comments")]
    pub comment_count: Option<i64>,
    #[serde(default, alias = "link_flair_text")]
    pub flair: Option<String>,
    #[serde(default, alias = "source_sorts")]
    pub source_tags: Vec<String>,
    #[serde(default, alias = "is_show_match")]
    pub is_match: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryTotalsPayload {
    #[serde(default)]
    pub fetched: Option<u64>,
    #[serde(default)]
    pub matched: Option<u64>,
    #[serde(default)]
    pub tracked_flair: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryPayload {
    #[serde(default, alias = "threads")]
    pub items: Vec<DiscoveryItem>,
    #[serde(default, alias = "source_sorts")]
    pub source_tags: Vec<String>,
    #[serde(default)]
    pub pages_fetched: Option<u32>,
    #[serde(default)]
    pub max_pages_applied: Option<u32>,
    #[serde(default)]
    pub window_exhaustive: Option<bool>,
    #[serde(default)]
    pub window_start: Option<String>,
    #[serde(default)]
    pub window_end: Option<String>,
    #[serde(default)]
    pub totals: DiscoveryTotalsPayload,
}

// --- Cache ---

/// Query parameters shared by the bulk and singular cache endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CacheQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_end: Option<DateTime<Utc>>,
    pub platforms: Vec<String>,
    pub flairs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheKeyRequest {
    pub key: String,
    #[serde(flatten)]
    pub query: CacheQuery,
}

/// Body for `POST /cache/bulk`.
#[derive(Debug, Clone, Serialize)]
pub struct BulkCacheRequest {
    pub entries: Vec<CacheKeyRequest>,
}

/// One key's answer. A miss carries no payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub hit: bool,
    #[serde(default)]
    pub discovery: Option<DiscoveryPayload>,
    /// Incremental slices the backend has not merged yet.
    #[serde(default)]
    pub partials: Vec<DiscoveryPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkCacheResponse {
    #[serde(default)]
    pub results: HashMap<String, CacheEntry>,
}

// --- Coverage ---

/// Body for `POST /coverage`.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_end: Option<DateTime<Utc>>,
    pub platforms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformCoveragePayload {
    #[serde(default, alias = "saved_comments")]
    pub saved: Option<u64>,
    #[serde(default, alias = "reported_comments")]
    pub reported: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoverageResponse {
    #[serde(default)]
    pub by_platform: HashMap<String, PlatformCoveragePayload>,
}

// --- Media mirroring ---

/// Mirror state for one platform. Missing counts read as zero.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformMirrorPayload {
    #[serde(default)]
    pub up_to_date: Option<bool>,
    #[serde(default)]
    pub needs_mirror_count: Option<u64>,
    #[serde(default)]
    pub mirrored_count: Option<u64>,
    #[serde(default)]
    pub failed_count: Option<u64>,
    #[serde(default)]
    pub pending_count: Option<u64>,
    #[serde(default)]
    pub posts_scanned: Option<u64>,
}

/// Answer to `POST /coverage/mirror`. Takes the same body as `POST /coverage`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MirrorCoverageResponse {
    #[serde(flatten)]
    pub overall: PlatformMirrorPayload,
    #[serde(default)]
    pub by_platform: HashMap<String, PlatformMirrorPayload>,
}

/// Body for `POST /mirror/requeue`.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorRequeueRequest {
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_end: Option<DateTime<Utc>>,
    pub failed_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MirrorRequeueResponse {
    #[serde(default)]
    pub queued_jobs: Option<u64>,
    #[serde(default)]
    pub failed: Option<u64>,
}

// --- Worker health ---

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerHealthPayload {
    #[serde(default)]
    pub queue_enabled: Option<bool>,
    #[serde(default)]
    pub healthy: Option<bool>,
    #[serde(default)]
    pub healthy_workers: Option<u32>,
    #[serde(default)]
    pub reason: Option<String>,
}

// --- Season metadata ---

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodePayload {
    pub episode_number: u32,
    #[serde(default)]
    pub air_date: Option<String>,
    /// Creation time of the episode's live discussion thread, when known.
    #[serde(default)]
    pub live_thread_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeasonEpisodesResponse {
    #[serde(default)]
    pub episodes: Vec<EpisodePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeriodPayload {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeasonPeriodsResponse {
    #[serde(default, alias = "weekly")]
    pub periods: Vec<PeriodPayload>,
}
