use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

// --- Platforms ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Instagram,
    Tiktok,
    Twitter,
    Youtube,
    Facebook,
    Threads,
    Reddit,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Instagram,
        Platform::Tiktok,
        Platform::Twitter,
        Platform::Youtube,
        Platform::Facebook,
        Platform::Threads,
        Platform::Reddit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Twitter => "twitter",
            Platform::Youtube => "youtube",
            Platform::Facebook => "facebook",
            Platform::Threads => "threads",
            Platform::Reddit => "reddit",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::Tiktok),
            "twitter" | "x" => Ok(Platform::Twitter),
            "youtube" => Ok(Platform::Youtube),
            "facebook" => Ok(Platform::Facebook),
            "threads" => Ok(Platform::Threads),
            "reddit" => Ok(Platform::Reddit),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Listing a post was discovered through. Provenance only; never affects identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sort {
    New,
    Hot,
    Top,
}

impl FromStr for Sort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(Sort::New),
            "hot" => Ok(Sort::Hot),
            "top" => Ok(Sort::Top),
            other => Err(format!("unknown sort: {other}")),
        }
    }
}

// --- Season calendar ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub number: u32,
    pub air_date: Option<NaiveDate>,
    /// Creation time of the episode's live discussion post, if one was found.
    pub live_thread_at: Option<Timestamp>,
}

impl Episode {
    pub fn new(number: u32, air_date: Option<NaiveDate>) -> Self {
        Self {
            number,
            air_date,
            live_thread_at: None,
        }
    }

    pub fn with_live_thread_at(mut self, at: Timestamp) -> Self {
        self.live_thread_at = Some(at);
        self
    }
}

/// A boundary supplied by the season analytics API, identified only by its label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPeriod {
    pub label: String,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

// --- Windows ---

/// Which slot of the season a window covers. Orders pre-season first,
/// episodes by number, post-season last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKey {
    PreSeason,
    Episode(u32),
    PostSeason,
}

impl ContainerKey {
    /// Stable key used in cache lookups and run requests.
    pub fn as_key(&self) -> String {
        match self {
            ContainerKey::PreSeason => "period-preseason".to_string(),
            ContainerKey::Episode(n) => format!("episode-{n}"),
            ContainerKey::PostSeason => "period-postseason".to_string(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ContainerKey::PreSeason => "Pre-Season".to_string(),
            ContainerKey::Episode(n) => format!("Episode {n}"),
            ContainerKey::PostSeason => "Post-Season".to_string(),
        }
    }

    pub fn kind(&self) -> WindowKind {
        match self {
            ContainerKey::Episode(_) => WindowKind::Episode,
            ContainerKey::PreSeason | ContainerKey::PostSeason => WindowKind::Period,
        }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Episode,
    Period,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    FromPeriodApi,
    FallbackDerived,
    FromCache,
}

/// A retrieval window. `None` bounds mean "no constraint on that side",
/// never "invalid".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub key: String,
    pub label: String,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub kind: WindowKind,
    pub provenance: Provenance,
    pub episode_number: Option<u32>,
}

impl Window {
    /// Half-open containment: `start <= at < end`, open sides unconstrained.
    pub fn contains(&self, at: Timestamp) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at < e)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

// --- Discovery ---

/// A discovered post. Identity is `external_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalItem {
    pub external_id: String,
    pub posted_at: Option<Timestamp>,
    pub score: i64,
    pub comment_count: i64,
    pub flair: Option<String>,
    pub source_tags: BTreeSet<Sort>,
    /// Whether the backend's matcher tied this post to the tracked show.
    #[serde(default)]
    pub is_match: bool,
}

impl ExternalItem {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            posted_at: None,
            score: 0,
            comment_count: 0,
            flair: None,
            source_tags: BTreeSet::new(),
            is_match: false,
        }
    }

    pub fn posted_at(mut self, at: Timestamp) -> Self {
        self.posted_at = Some(at);
        self
    }

    pub fn comments(mut self, count: i64) -> Self {
        self.comment_count = count;
        self
    }

    pub fn score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }

    pub fn flair(mut self, flair: impl Into<String>) -> Self {
        self.flair = Some(flair.into());
        self
    }

    pub fn tag(mut self, sort: Sort) -> Self {
        self.source_tags.insert(sort);
        self
    }

    pub fn matched(mut self) -> Self {
        self.is_match = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryTotals {
    pub fetched: u64,
    pub matched: u64,
    pub tracked_flair: u64,
}

/// One window's canonical merged view. Immutable once built; merging
/// always produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub items: Vec<ExternalItem>,
    pub source_tags_seen: BTreeSet<Sort>,
    pub pages_fetched: u32,
    pub max_pages_applied: u32,
    pub window_exhaustive: bool,
    pub window_start: Option<Timestamp>,
    pub window_end: Option<Timestamp>,
    pub totals: DiscoveryTotals,
}

impl DiscoveryResult {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            source_tags_seen: BTreeSet::new(),
            pages_fetched: 0,
            max_pages_applied: 0,
            window_exhaustive: false,
            window_start: None,
            window_end: None,
            totals: DiscoveryTotals::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// --- Runs ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl RunState {
    /// Map the backend's status vocabulary. Unknown strings return `None`.
    pub fn from_wire(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" | "retrying" => Some(RunState::Queued),
            "running" => Some(RunState::Running),
            "completed" | "succeeded" => Some(RunState::Completed),
            "partial" => Some(RunState::Partial),
            "failed" => Some(RunState::Failed),
            "cancelled" | "canceled" => Some(RunState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Queued | RunState::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Partial)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Partial => "partial",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub items_found_total: u64,
    pub failed_platforms: BTreeSet<Platform>,
}

/// Backend-owned run, as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
    pub totals: RunTotals,
    pub queue_depth: Option<u32>,
    pub updated_at: Option<Timestamp>,
    pub error_message: Option<String>,
}

impl RunStatus {
    pub fn new(run_id: impl Into<String>, state: RunState) -> Self {
        Self {
            run_id: run_id.into(),
            state,
            totals: RunTotals::default(),
            queue_depth: None,
            updated_at: None,
            error_message: None,
        }
    }
}

/// Hint passed to the backend about how much work a run should do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageMode {
    /// Post metrics and comments.
    #[default]
    Metrics,
    /// Metrics plus media mirroring.
    FullSync,
}

impl CoverageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageMode::Metrics => "metrics",
            CoverageMode::FullSync => "full_sync",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub queue_enabled: Option<bool>,
    pub healthy: Option<bool>,
    pub healthy_workers: Option<u32>,
    pub reason: Option<String>,
}

// --- Coverage ---

/// Saved vs reported counts for one platform. `saved` is already clamped
/// to `reported` so stale duplicate rows never read as >100%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCoverage {
    pub saved: u64,
    pub raw_saved: u64,
    /// `None` when the platform exposes no count of its own.
    pub reported: Option<u64>,
}

impl PlatformCoverage {
    pub fn new(raw_saved: u64, reported: Option<u64>) -> Self {
        let saved = match reported {
            Some(r) => raw_saved.min(r),
            None => raw_saved,
        };
        Self {
            saved,
            raw_saved,
            reported,
        }
    }

    /// With no reported count there is nothing to converge toward.
    pub fn up_to_date(&self) -> bool {
        match self.reported {
            Some(r) => self.saved >= r,
            None => true,
        }
    }

    pub fn ratio(&self) -> Option<f64> {
        match self.reported {
            Some(0) => Some(1.0),
            Some(r) => Some(self.saved as f64 / r as f64),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    pub by_platform: BTreeMap<Platform, PlatformCoverage>,
    /// Media mirroring state. Only read for full-sync sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorSnapshot>,
}

impl CoverageSnapshot {
    pub fn all_up_to_date(&self) -> bool {
        self.by_platform.values().all(PlatformCoverage::up_to_date)
    }

    /// Comment coverage is complete and, when mirroring was read, so is that.
    pub fn converged(&self) -> bool {
        self.all_up_to_date() && self.mirror.as_ref().map_or(true, MirrorSnapshot::is_ready)
    }

    /// Stale comment platforms plus platforms with media left to mirror.
    pub fn platforms_to_rerun(&self) -> BTreeSet<Platform> {
        let mut platforms = self.stale_platforms();
        if let Some(mirror) = &self.mirror {
            platforms.extend(mirror.stale_platforms());
        }
        platforms
    }

    pub fn stale_platforms(&self) -> BTreeSet<Platform> {
        self.by_platform
            .iter()
            .filter(|(_, c)| !c.up_to_date())
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn total_saved(&self) -> u64 {
        self.by_platform.values().map(|c| c.saved).sum()
    }

    /// Sum of known reported counts. Platforms without one contribute their saved count.
    pub fn total_reported(&self) -> u64 {
        self.by_platform
            .values()
            .map(|c| c.reported.unwrap_or(c.saved))
            .sum()
    }

    /// `"saved/reported (pct%)"`, 100% when nothing was reported.
    pub fn label(&self) -> String {
        coverage_label(self.total_saved(), self.total_reported())
    }

    /// Carry the higher raw saved count forward from an earlier pass of the
    /// same session, so coverage never regresses on eventually-consistent reads.
    pub fn monotonic_over(self, previous: Option<&CoverageSnapshot>) -> CoverageSnapshot {
        let Some(previous) = previous else {
            return self;
        };
        let CoverageSnapshot {
            mut by_platform,
            mirror,
        } = self;
        for (platform, prev) in &previous.by_platform {
            by_platform
                .entry(*platform)
                .and_modify(|cur| {
                    if prev.raw_saved > cur.raw_saved {
                        *cur = PlatformCoverage::new(prev.raw_saved, cur.reported);
                    }
                })
                .or_insert(*prev);
        }
        CoverageSnapshot {
            by_platform,
            mirror,
        }
    }
}

/// Media mirroring counts for one platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMirror {
    pub up_to_date: bool,
    pub needs_mirror: u64,
    pub mirrored: u64,
    pub failed: u64,
    pub pending: u64,
    pub scanned: u64,
}

impl PlatformMirror {
    pub fn is_ready(&self) -> bool {
        self.up_to_date && self.needs_mirror == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSnapshot {
    /// Backend's verdict for the whole window.
    pub overall: PlatformMirror,
    pub by_platform: BTreeMap<Platform, PlatformMirror>,
}

impl MirrorSnapshot {
    pub fn is_ready(&self) -> bool {
        self.overall.up_to_date
    }

    pub fn stale_platforms(&self) -> BTreeSet<Platform> {
        self.by_platform
            .iter()
            .filter(|(_, m)| !m.is_ready())
            .map(|(p, _)| *p)
            .collect()
    }

    /// `"ready/scanned (pct%)"`, where ready is scanned minus still-unmirrored.
    pub fn label(&self) -> String {
        let scanned = self.overall.scanned;
        let ready = scanned.saturating_sub(self.overall.needs_mirror);
        coverage_label(ready, scanned)
    }
}

pub fn coverage_label(saved: u64, reported: u64) -> String {
    let pct = if reported > 0 {
        (saved.min(reported) as f64 / reported as f64) * 100.0
    } else {
        100.0
    };
    format!("{saved}/{reported} ({pct:.1}%)")
}
