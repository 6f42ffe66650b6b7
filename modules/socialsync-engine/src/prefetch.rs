//! Warming the discovery cache for several windows at once.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::cache::{CacheRequest, DiscoveryCache};
use crate::epoch::EpochToken;
use crate::traits::IngestBackend;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchSummary {
    pub hits: usize,
    pub misses: usize,
    pub errors: usize,
    /// Lookups whose result arrived after the token went stale.
    pub skipped: usize,
}

pub struct Prefetcher<B> {
    cache: Arc<DiscoveryCache<B>>,
    concurrency: usize,
}

impl<B: IngestBackend + 'static> Prefetcher<B> {
    pub fn new(cache: Arc<DiscoveryCache<B>>, concurrency: usize) -> Self {
        Self {
            cache,
            concurrency: concurrency.max(1),
        }
    }

    /// Read every window through the cache, at most `concurrency` at a time.
    /// Failures are logged and counted, never returned. Stops early once
    /// `token` goes stale.
    pub async fn warm(&self, requests: Vec<CacheRequest>, token: &EpochToken) -> PrefetchSummary {
        let total = requests.len();
        let cache = &self.cache;

        let mut results = stream::iter(requests)
            .map(|request| async move {
                if !token.is_current() {
                    return (request, None);
                }
                let result = cache.lookup(&request, false).await;
                (request, Some(result))
            })
            .buffer_unordered(self.concurrency);

        let mut summary = PrefetchSummary::default();
        while let Some((request, result)) = results.next().await {
            if !token.is_current() {
                summary.skipped += 1;
                continue;
            }
            match result {
                Some(Ok(Some(_))) => summary.hits += 1,
                Some(Ok(None)) => summary.misses += 1,
                Some(Err(e)) => {
                    summary.errors += 1;
                    warn!(key = %request.key(), error = %e, "Prefetch lookup failed");
                }
                None => summary.skipped += 1,
            }
            debug!(key = %request.key(), "Prefetched");
        }

        info!(
            windows = total,
            hits = summary.hits,
            misses = summary.misses,
            errors = summary.errors,
            skipped = summary.skipped,
            "Prefetch finished"
        );
        summary
    }
}
