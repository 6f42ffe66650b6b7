//! Season windows: pre-season, one per episode, post-season.

use std::collections::BTreeMap;

use chrono::NaiveTime;
use chrono_tz::Tz;
use tracing::{debug, warn};

use socialsync_common::normalize::match_period_label;
use socialsync_common::{
    ContainerKey, EngineConfig, Episode, ExternalPeriod, Provenance, Timestamp, Window,
};

use crate::civil_time::{add_civil_days, civil_instant, civil_midnight};
use crate::traits::SeasonCalendar;

/// Bounds a cached discovery payload observed for itself.
pub type ObservedBounds = (Option<Timestamp>, Option<Timestamp>);

/// Civil clock times that split pre-season from episode 1 on the premiere's
/// air date. The live discussion thread is assumed to open at `episode_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutoverRule {
    pub pre_season_end: NaiveTime,
    pub episode_start: NaiveTime,
}

impl CutoverRule {
    /// Both windows meet at the same instant.
    pub fn exact(at: NaiveTime) -> Self {
        Self {
            pre_season_end: at,
            episode_start: at,
        }
    }
}

impl Default for CutoverRule {
    fn default() -> Self {
        Self {
            pre_season_end: NaiveTime::from_hms_opt(19, 0, 0).unwrap_or(NaiveTime::MIN),
            episode_start: NaiveTime::from_hms_opt(19, 1, 1).unwrap_or(NaiveTime::MIN),
        }
    }
}

pub struct WindowResolver {
    tz: Tz,
    cutover: CutoverRule,
    post_season_days: i64,
}

impl WindowResolver {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            cutover: CutoverRule::default(),
            post_season_days: 7,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.timezone)
            .with_cutover(CutoverRule {
                pre_season_end: config.pre_season_end,
                episode_start: config.episode_start,
            })
            .with_post_season_days(config.post_season_days)
    }

    pub fn with_cutover(mut self, cutover: CutoverRule) -> Self {
        self.cutover = cutover;
        self
    }

    pub fn with_post_season_days(mut self, days: u32) -> Self {
        self.post_season_days = i64::from(days);
        self
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn resolve(
        &self,
        episodes: &[Episode],
        periods: &[ExternalPeriod],
    ) -> BTreeMap<ContainerKey, Window> {
        self.resolve_with_cache(episodes, periods, &BTreeMap::new())
    }

    /// Derive every window of a season.
    ///
    /// Precedence per key: period API bounds, then derived bounds, then bounds a
    /// cached payload observed (only when nothing else bounds the window).
    pub fn resolve_with_cache(
        &self,
        episodes: &[Episode],
        periods: &[ExternalPeriod],
        cached: &BTreeMap<ContainerKey, ObservedBounds>,
    ) -> BTreeMap<ContainerKey, Window> {
        let episodes = dedup_episodes(episodes);
        let mut windows = self.derive(&episodes);

        self.apply_periods(&mut windows, periods);

        for (key, (start, end)) in cached {
            let window = windows.entry(*key).or_insert_with(|| blank_window(*key));
            if window.is_unbounded() && (start.is_some() || end.is_some()) {
                window.start = *start;
                window.end = *end;
                window.provenance = Provenance::FromCache;
            }
        }

        debug!(
            episodes = episodes.len(),
            periods = periods.len(),
            windows = windows.len(),
            "Resolved season windows"
        );
        windows
    }

    /// Fetch a season's calendar and resolve it. Calendar failures degrade to
    /// fewer (or unbounded) windows instead of failing.
    pub async fn load<S: SeasonCalendar + ?Sized>(
        &self,
        calendar: &S,
        season_id: &str,
    ) -> BTreeMap<ContainerKey, Window> {
        let (episodes, periods) =
            tokio::join!(calendar.episodes(season_id), calendar.periods(season_id));

        let episodes = episodes.unwrap_or_else(|e| {
            warn!(season_id, error = %e, "Episode list unavailable, windows will be unbounded");
            Vec::new()
        });
        let periods = periods.unwrap_or_else(|e| {
            warn!(season_id, error = %e, "Season periods unavailable, using derived bounds");
            Vec::new()
        });

        self.resolve(&episodes, &periods)
    }

    fn derive(&self, episodes: &[Episode]) -> BTreeMap<ContainerKey, Window> {
        let mut windows = BTreeMap::new();

        let starts: Vec<Option<Timestamp>> = episodes
            .iter()
            .enumerate()
            .map(|(i, ep)| self.episode_start(ep, i == 0))
            .collect();

        let mut pre_season = blank_window(ContainerKey::PreSeason);
        pre_season.end = episodes.first().and_then(|ep| self.pre_season_end(ep));
        windows.insert(ContainerKey::PreSeason, pre_season);

        let mut last_end = None;
        for (i, ep) in episodes.iter().enumerate() {
            let start = starts[i];
            let week_later = start.map(|s| add_civil_days(self.tz, s, self.post_season_days));
            let end = match starts.get(i + 1) {
                Some(Some(next)) => match start {
                    Some(s) if *next <= s => week_later,
                    _ => Some(*next),
                },
                Some(None) => None,
                None => week_later,
            };

            let key = ContainerKey::Episode(ep.number);
            let mut window = blank_window(key);
            window.start = start;
            window.end = end;
            windows.insert(key, window);
            last_end = end;
        }

        let mut post_season = blank_window(ContainerKey::PostSeason);
        if let Some(start) = last_end {
            post_season.start = Some(start);
            post_season.end = Some(add_civil_days(self.tz, start, self.post_season_days));
        }
        windows.insert(ContainerKey::PostSeason, post_season);

        windows
    }

    fn episode_start(&self, ep: &Episode, premiere: bool) -> Option<Timestamp> {
        if let Some(live) = ep.live_thread_at {
            return Some(live);
        }
        let date = ep.air_date?;
        Some(if premiere {
            civil_instant(self.tz, date, self.cutover.episode_start)
        } else {
            civil_midnight(self.tz, date)
        })
    }

    fn pre_season_end(&self, premiere: &Episode) -> Option<Timestamp> {
        if let Some(live) = premiere.live_thread_at {
            return Some(live);
        }
        premiere
            .air_date
            .map(|date| civil_instant(self.tz, date, self.cutover.pre_season_end))
    }

    fn apply_periods(&self, windows: &mut BTreeMap<ContainerKey, Window>, periods: &[ExternalPeriod]) {
        let mut claimed = Vec::new();
        for period in periods {
            let Some(key) = match_period_label(&period.label) else {
                continue;
            };
            // First matching label wins.
            if claimed.contains(&key) || (period.start.is_none() && period.end.is_none()) {
                continue;
            }
            claimed.push(key);

            let window = windows.entry(key).or_insert_with(|| blank_window(key));
            if period.start.is_some() {
                window.start = period.start;
            }
            if period.end.is_some() {
                window.end = period.end;
            }
            window.provenance = Provenance::FromPeriodApi;
        }
    }
}

fn blank_window(key: ContainerKey) -> Window {
    Window {
        key: key.as_key(),
        label: key.label(),
        start: None,
        end: None,
        kind: key.kind(),
        provenance: Provenance::FallbackDerived,
        episode_number: match key {
            ContainerKey::Episode(n) => Some(n),
            _ => None,
        },
    }
}

/// Sort by number; a repeated number keeps its earliest air date and live time.
fn dedup_episodes(episodes: &[Episode]) -> Vec<Episode> {
    let mut by_number: BTreeMap<u32, Episode> = BTreeMap::new();
    for ep in episodes {
        by_number
            .entry(ep.number)
            .and_modify(|existing| {
                existing.air_date = earliest(existing.air_date, ep.air_date);
                existing.live_thread_at = earliest(existing.live_thread_at, ep.live_thread_at);
            })
            .or_insert_with(|| ep.clone());
    }
    by_number.into_values().collect()
}

fn earliest<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
