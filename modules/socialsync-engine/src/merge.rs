//! Merging partial discovery fetches into one canonical view per query.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use socialsync_common::normalize::flair_key;
use socialsync_common::{DiscoveryResult, DiscoveryTotals, ExternalItem, Timestamp};

/// Pure merge of partial fetches. Never fails; blank ids are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadMerger {
    tracked_flairs: BTreeSet<String>,
}

impl PayloadMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `tracked_flair` totals against this label instead of every item.
    pub fn tracking(flair: &str) -> Self {
        Self::tracking_any([flair])
    }

    /// Count `tracked_flair` totals against any of these labels. With no
    /// usable label every item counts.
    pub fn tracking_any<I, S>(flairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tracked_flairs: flairs
                .into_iter()
                .filter_map(|f| flair_key(f.as_ref()))
                .collect(),
        }
    }

    pub fn merge<'a, I>(&self, partials: I) -> DiscoveryResult
    where
        I: IntoIterator<Item = &'a DiscoveryResult>,
    {
        let mut order: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, ExternalItem> = HashMap::new();
        let mut source_tags_seen = BTreeSet::new();
        let mut pages_fetched: u32 = 0;
        let mut max_pages_applied: u32 = 0;
        let mut window_exhaustive = true;
        let mut window_start: Option<Timestamp> = None;
        let mut window_end: Option<Timestamp> = None;
        let mut shards = 0usize;

        for partial in partials {
            shards += 1;
            pages_fetched = pages_fetched.saturating_add(partial.pages_fetched);
            max_pages_applied = max_pages_applied.max(partial.max_pages_applied);
            window_exhaustive &= partial.window_exhaustive;
            window_start = min_opt(window_start, partial.window_start);
            window_end = max_opt(window_end, partial.window_end);
            source_tags_seen.extend(partial.source_tags_seen.iter().copied());

            for item in &partial.items {
                let id = item.external_id.trim();
                if id.is_empty() {
                    continue;
                }
                source_tags_seen.extend(item.source_tags.iter().copied());
                match by_id.get_mut(id) {
                    Some(existing) => merge_duplicate(existing, item),
                    None => {
                        order.push(id.to_string());
                        let mut item = item.clone();
                        item.external_id = id.to_string();
                        by_id.insert(id.to_string(), item);
                    }
                }
            }
        }

        let mut items: Vec<ExternalItem> = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        items.sort_by(presentation_order);

        let totals = self.totals(&items);
        DiscoveryResult {
            items,
            source_tags_seen,
            pages_fetched,
            max_pages_applied,
            window_exhaustive: shards > 0 && window_exhaustive,
            window_start,
            window_end,
            totals,
        }
    }

    fn totals(&self, items: &[ExternalItem]) -> DiscoveryTotals {
        let tracked_flair = if self.tracked_flairs.is_empty() {
            items.len()
        } else {
            items
                .iter()
                .filter(|item| {
                    item.flair
                        .as_deref()
                        .and_then(flair_key)
                        .is_some_and(|key| self.tracked_flairs.contains(&key))
                })
                .count()
        };
        DiscoveryTotals {
            fetched: items.len() as u64,
            matched: items.iter().filter(|item| item.is_match).count() as u64,
            tracked_flair: tracked_flair as u64,
        }
    }
}

/// Keep the winning record's content; provenance is always additive.
fn merge_duplicate(existing: &mut ExternalItem, incoming: &ExternalItem) {
    let mut tags = existing.source_tags.clone();
    tags.extend(incoming.source_tags.iter().copied());
    let is_match = existing.is_match || incoming.is_match;

    if supersedes(incoming, existing) {
        let id = std::mem::take(&mut existing.external_id);
        *existing = incoming.clone();
        existing.external_id = id;
    }
    existing.source_tags = tags;
    existing.is_match = is_match;
}

/// Later `posted_at`, then more comments, then higher score. Ties keep the incumbent.
fn supersedes(candidate: &ExternalItem, incumbent: &ExternalItem) -> bool {
    candidate
        .posted_at
        .cmp(&incumbent.posted_at)
        .then(candidate.comment_count.cmp(&incumbent.comment_count))
        .then(candidate.score.cmp(&incumbent.score))
        == Ordering::Greater
}

/// Newest first (undated last), then most comments, then highest score.
fn presentation_order(a: &ExternalItem, b: &ExternalItem) -> Ordering {
    b.posted_at
        .cmp(&a.posted_at)
        .then(b.comment_count.cmp(&a.comment_count))
        .then(b.score.cmp(&a.score))
        .then(a.external_id.cmp(&b.external_id))
}

fn min_opt(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

// --- Per-query views ---

/// Latest merged view per query, keyed by the caller (the cache uses the
/// request signature). Every update builds a new value, so a reader holding
/// an `Arc` never observes a later merge.
#[derive(Default)]
pub struct WindowViews {
    views: Mutex<HashMap<String, Arc<DiscoveryResult>>>,
}

impl WindowViews {
    pub fn get(&self, key: &str) -> Option<Arc<DiscoveryResult>> {
        self.lock().get(key).cloned()
    }

    /// Fold a freshly read result into the view under `key`. An exhaustive
    /// read replaces the view outright; anything else is merged on top of it.
    /// Totals are recomputed by `merger` either way.
    pub fn absorb(
        &self,
        key: &str,
        merger: &PayloadMerger,
        incoming: &DiscoveryResult,
    ) -> Arc<DiscoveryResult> {
        let mut views = self.lock();
        let next = match views.get(key) {
            Some(current) if !incoming.window_exhaustive => {
                Arc::new(merger.merge([current.as_ref(), incoming]))
            }
            _ => Arc::new(merger.merge([incoming])),
        };
        views.insert(key.to_string(), Arc::clone(&next));
        next
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<DiscoveryResult>>> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use socialsync_common::Sort;

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 1, 8, hour, 0, 0).unwrap()
    }

    fn partial(items: Vec<ExternalItem>) -> DiscoveryResult {
        DiscoveryResult {
            items,
            pages_fetched: 1,
            max_pages_applied: 1,
            window_exhaustive: true,
            ..DiscoveryResult::empty()
        }
    }

    #[test]
    fn later_post_wins_and_tags_union() {
        let a = partial(vec![ExternalItem::new("p1").posted_at(at(1)).comments(5).tag(Sort::New)]);
        let b = partial(vec![ExternalItem::new("p1").posted_at(at(2)).comments(3).tag(Sort::Top)]);

        let merged = PayloadMerger::new().merge([&a, &b]);
        assert_eq!(merged.items.len(), 1);
        let item = &merged.items[0];
        assert_eq!(item.posted_at, Some(at(2)));
        assert_eq!(item.comment_count, 3);
        assert_eq!(item.source_tags, BTreeSet::from([Sort::New, Sort::Top]));
    }

    #[test]
    fn comment_count_then_score_break_ties() {
        let a = partial(vec![ExternalItem::new("p1").posted_at(at(1)).comments(5).score(1)]);
        let b = partial(vec![ExternalItem::new("p1").posted_at(at(1)).comments(9).score(0)]);
        let c = partial(vec![ExternalItem::new("p1").posted_at(at(1)).comments(9).score(4)]);

        let merged = PayloadMerger::new().merge([&a, &b, &c]);
        assert_eq!(merged.items[0].comment_count, 9);
        assert_eq!(merged.items[0].score, 4);
    }

    #[test]
    fn full_tie_keeps_first_seen_record() {
        let a = partial(vec![ExternalItem::new("p1").posted_at(at(1)).flair("Live")]);
        let b = partial(vec![ExternalItem::new("p1").posted_at(at(1)).flair("Other")]);
        let merged = PayloadMerger::new().merge([&a, &b]);
        assert_eq!(merged.items[0].flair.as_deref(), Some("Live"));
    }

    #[test]
    fn merge_is_idempotent() {
        let r = partial(vec![
            ExternalItem::new("p1").posted_at(at(3)).comments(2).matched(),
            ExternalItem::new("p2").posted_at(at(1)).comments(8),
        ]);
        let merger = PayloadMerger::new();
        let once = merger.merge([&r]);
        let twice = merger.merge([&r, &r]);
        assert_eq!(once.items, twice.items);
        assert_eq!(once.totals, twice.totals);
    }

    #[test]
    fn merge_is_order_independent() {
        let a = partial(vec![
            ExternalItem::new("p1").posted_at(at(1)).comments(5).tag(Sort::New),
            ExternalItem::new("p3").comments(1),
        ]);
        let mut b = partial(vec![
            ExternalItem::new("p1").posted_at(at(2)).comments(3).tag(Sort::Hot),
            ExternalItem::new("p2").posted_at(at(2)).comments(7),
        ]);
        b.window_exhaustive = false;
        b.pages_fetched = 3;

        let merger = PayloadMerger::new();
        assert_eq!(merger.merge([&a, &b]), merger.merge([&b, &a]));
    }

    #[test]
    fn aggregates_and_presentation_order() {
        let mut a = partial(vec![
            ExternalItem::new("old").posted_at(at(1)).comments(50),
            ExternalItem::new("undated").comments(99),
        ]);
        a.window_start = Some(at(0));
        a.max_pages_applied = 4;
        let mut b = partial(vec![
            ExternalItem::new("new-b").posted_at(at(5)).comments(1),
            ExternalItem::new("new-a").posted_at(at(5)).comments(1),
            ExternalItem::new("  ").posted_at(at(9)),
        ]);
        b.window_end = Some(at(6));
        b.window_exhaustive = false;
        b.pages_fetched = 2;

        let merged = PayloadMerger::new().merge([&a, &b]);
        let ids: Vec<&str> = merged.items.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["new-a", "new-b", "old", "undated"]);
        assert_eq!(merged.pages_fetched, 3);
        assert_eq!(merged.max_pages_applied, 4);
        assert!(!merged.window_exhaustive);
        assert_eq!(merged.window_start, Some(at(0)));
        assert_eq!(merged.window_end, Some(at(6)));
        assert_eq!(merged.totals.fetched, 4);
    }

    #[test]
    fn tracked_flair_is_case_and_decoration_insensitive() {
        let r = partial(vec![
            ExternalItem::new("a").flair(":fire: Live Thread :fire:"),
            ExternalItem::new("b").flair("live   thread"),
            ExternalItem::new("c").flair("Discussion"),
            ExternalItem::new("d"),
        ]);
        assert_eq!(PayloadMerger::tracking("LIVE THREAD").merge([&r]).totals.tracked_flair, 2);
        assert_eq!(PayloadMerger::new().merge([&r]).totals.tracked_flair, 4);
    }

    #[test]
    fn tracking_any_counts_each_listed_flair() {
        let r = partial(vec![
            ExternalItem::new("a").flair("Live Thread"),
            ExternalItem::new("b").flair("Post Episode"),
            ExternalItem::new("c").flair("Discussion"),
        ]);
        let merger = PayloadMerger::tracking_any(["live thread", "POST EPISODE", "  "]);
        assert_eq!(merger.merge([&r]).totals.tracked_flair, 2);
        assert_eq!(PayloadMerger::tracking_any([" "]), PayloadMerger::new());
    }

    #[test]
    fn empty_merge_is_not_exhaustive() {
        let merged = PayloadMerger::new().merge(std::iter::empty());
        assert!(merged.items.is_empty());
        assert!(!merged.window_exhaustive);
    }

    #[test]
    fn views_replace_on_exhaustive_read_and_merge_otherwise() {
        let views = WindowViews::default();
        let merger = PayloadMerger::new();
        let first = partial(vec![ExternalItem::new("p1")]);
        views.absorb("episode-1", &merger, &first);

        let mut slice = partial(vec![ExternalItem::new("p2")]);
        slice.window_exhaustive = false;
        let held = views.absorb("episode-1", &merger, &slice);
        assert_eq!(held.items.len(), 2);

        let full = partial(vec![ExternalItem::new("p3")]);
        let latest = views.absorb("episode-1", &merger, &full);
        assert_eq!(latest.items.len(), 1);
        assert_eq!(held.items.len(), 2);
        assert_eq!(views.get("episode-1").map(|v| v.items.len()), Some(1));
    }
}
