//! Discovery cache reads with in-flight dedup and a negative cache.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use socialsync_common::{DiscoveryResult, Platform, SyncResult, Timestamp};

use crate::merge::{PayloadMerger, WindowViews};
use crate::traits::IngestBackend;

/// Query parameters that scope one window's cached discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheParams {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub platforms: BTreeSet<Platform>,
    pub flairs: BTreeSet<String>,
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheRequest {
    pub community: String,
    pub window_key: String,
    pub params: CacheParams,
}

impl CacheRequest {
    pub fn new(community: impl Into<String>, window_key: impl Into<String>) -> Self {
        Self {
            community: community.into(),
            window_key: window_key.into(),
            params: CacheParams::default(),
        }
    }

    pub fn with_params(mut self, params: CacheParams) -> Self {
        self.params = params;
        self
    }

    /// Composite key the backend files discovery under.
    pub fn key(&self) -> String {
        format!("{}:{}", self.community, self.window_key)
    }

    /// Hash of the key plus every query parameter. Requests with equal
    /// signatures are interchangeable.
    pub fn signature(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_else(|_| self.key().into_bytes());
        hex::encode(Sha256::digest(&bytes))
    }

    /// Merger for this query's reads. The requested flairs are the tracked ones.
    pub fn merger(&self) -> PayloadMerger {
        PayloadMerger::tracking_any(&self.params.flairs)
    }
}

type LookupOutput = SyncResult<Option<Arc<DiscoveryResult>>>;
type SharedLookup = Shared<BoxFuture<'static, LookupOutput>>;

pub struct DiscoveryCache<B> {
    backend: Arc<B>,
    views: Arc<WindowViews>,
    in_flight: Mutex<HashMap<String, (u64, SharedLookup)>>,
    negative: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl<B: IngestBackend + 'static> DiscoveryCache<B> {
    pub fn new(backend: Arc<B>, views: Arc<WindowViews>) -> Self {
        Self {
            backend,
            views,
            in_flight: Mutex::new(HashMap::new()),
            negative: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn views(&self) -> &Arc<WindowViews> {
        &self.views
    }

    /// Merged view for exactly this query, if it has been read.
    pub fn view(&self, request: &CacheRequest) -> Option<Arc<DiscoveryResult>> {
        self.views.get(&request.signature())
    }

    /// Read one window. Concurrent identical requests share one backend call.
    /// A remembered miss answers `None` without a call until `refresh` is set;
    /// `refresh` also starts a new call rather than joining one in flight.
    pub async fn lookup(&self, request: &CacheRequest, refresh: bool) -> LookupOutput {
        let signature = request.signature();

        if !refresh && self.negative.lock().await.contains(&signature) {
            debug!(key = %request.key(), "Discovery cache: remembered miss");
            return Ok(None);
        }

        let (id, pending) = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&signature) {
                Some((id, pending)) if !refresh => {
                    debug!(key = %request.key(), "Discovery cache: joining in-flight lookup");
                    (*id, pending.clone())
                }
                _ => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let pending = self.spawn_lookup(request.clone());
                    in_flight.insert(signature.clone(), (id, pending.clone()));
                    (id, pending)
                }
            }
        };

        let result = pending.await;

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.get(&signature).is_some_and(|(current, _)| *current == id) {
                in_flight.remove(&signature);
            }
        }

        match &result {
            Ok(None) => {
                self.negative.lock().await.insert(signature);
            }
            Ok(Some(_)) => {
                self.negative.lock().await.remove(&signature);
            }
            Err(e) => {
                debug!(key = %request.key(), error = %e, "Discovery cache lookup failed");
            }
        }
        result
    }

    fn spawn_lookup(&self, request: CacheRequest) -> SharedLookup {
        let backend = Arc::clone(&self.backend);
        let views = Arc::clone(&self.views);
        async move {
            let found = backend.lookup(&request).await?;
            Ok(found.map(|result| views.absorb(&request.signature(), &request.merger(), &result)))
        }
        .boxed()
        .shared()
    }

    /// Read many windows in one backend call. Each miss is remembered on its
    /// own. Falls back to one [`lookup`](Self::lookup) per window when the
    /// backend has no bulk endpoint.
    pub async fn lookup_many(
        &self,
        requests: &[CacheRequest],
        refresh: bool,
    ) -> SyncResult<HashMap<String, Option<Arc<DiscoveryResult>>>> {
        let mut answers: HashMap<String, Option<Arc<DiscoveryResult>>> = HashMap::new();
        let mut pending: Vec<CacheRequest> = Vec::new();

        {
            let negative = self.negative.lock().await;
            for request in requests {
                if !refresh && negative.contains(&request.signature()) {
                    answers.insert(request.key(), None);
                } else if !pending.iter().any(|p| p == request) {
                    pending.push(request.clone());
                }
            }
        }

        if pending.is_empty() {
            return Ok(answers);
        }

        let mut found = match self.backend.bulk_lookup(&pending).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "Bulk cache endpoint unavailable, falling back to per-window lookups");
                for request in &pending {
                    let result = self.lookup(request, refresh).await?;
                    answers.insert(request.key(), result);
                }
                return Ok(answers);
            }
            Err(e) => return Err(e),
        };

        let mut negative = self.negative.lock().await;
        for request in &pending {
            let key = request.key();
            match found.remove(&key).flatten() {
                Some(result) => {
                    let signature = request.signature();
                    negative.remove(&signature);
                    let view = self.views.absorb(&signature, &request.merger(), &result);
                    answers.insert(key, Some(view));
                }
                None => {
                    negative.insert(request.signature());
                    answers.insert(key, None);
                }
            }
        }

        debug!(
            requested = requests.len(),
            fetched = pending.len(),
            hits = answers.values().filter(|v| v.is_some()).count(),
            "Bulk discovery lookup"
        );
        Ok(answers)
    }

    /// Forget a remembered miss so the next lookup asks the backend.
    pub async fn invalidate(&self, request: &CacheRequest) {
        self.negative.lock().await.remove(&request.signature());
    }
}
