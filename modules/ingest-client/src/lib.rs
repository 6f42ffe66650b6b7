pub mod error;
pub mod types;

use std::time::Duration;

pub use error::{IngestError, Result};
pub use types::{
    BulkCacheRequest, BulkCacheResponse, CacheEntry, CacheKeyRequest, CacheQuery,
    CoverageRequest, CoverageResponse, CreateRunRequest, CreateRunResponse, DiscoveryItem,
    DiscoveryPayload, DiscoveryTotalsPayload, EpisodePayload, MirrorCoverageResponse,
    MirrorRequeueRequest, MirrorRequeueResponse, PeriodPayload, PlatformCoveragePayload,
    PlatformMirrorPayload, RunResponse, RunSummary, SeasonEpisodesResponse,
    SeasonPeriodsResponse, WorkerHealthPayload,
};

use serde::de::DeserializeOwned;

/// Per-call deadlines. A request that outlives its deadline fails with
/// [`IngestError::Timeout`].
#[derive(Debug, Clone)]
pub struct RequestTimeouts {
    pub create_run: Duration,
    pub run_status: Duration,
    pub cache: Duration,
    pub coverage: Duration,
    pub metadata: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            create_run: Duration::from_secs(15),
            run_status: Duration::from_secs(15),
            cache: Duration::from_secs(35),
            coverage: Duration::from_secs(35),
            metadata: Duration::from_secs(12),
        }
    }
}

pub struct IngestClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeouts: RequestTimeouts,
}

impl IngestClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            timeouts: RequestTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: RequestTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request and decode a JSON body, mapping non-2xx to [`IngestError::Api`]
    /// or [`IngestError::NotFound`].
    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<T> {
        let resp = self.authorize(builder).timeout(timeout).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IngestError::from_status(
                status.as_u16(),
                extract_error_message(&body),
            ));
        }

        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Start an ingestion run. Returns immediately with the run id and its initial status.
    pub async fn create_run(&self, request: &CreateRunRequest) -> Result<CreateRunResponse> {
        let url = format!("{}/runs", self.base_url);
        let run: CreateRunResponse = self
            .send_json(
                self.client.post(&url).json(request),
                self.timeouts.create_run,
            )
            .await?;
        tracing::info!(
            run_id = %run.run_id,
            status = %run.status,
            window_key = %request.window_key,
            pass = request.pass,
            "Ingest run created"
        );
        Ok(run)
    }

    /// Fetch a run's current status. Single request, no polling.
    pub async fn get_run(&self, run_id: &str) -> Result<RunResponse> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let run: RunResponse = self
            .send_json(self.client.get(&url), self.timeouts.run_status)
            .await?;
        tracing::debug!(run_id, status = %run.status, "Fetched run status");
        Ok(run)
    }

    /// Look up many window keys at once. The backend answers every key with
    /// either a payload or a miss.
    pub async fn bulk_cache(&self, request: &BulkCacheRequest) -> Result<BulkCacheResponse> {
        let url = format!("{}/cache/bulk", self.base_url);
        let resp: BulkCacheResponse = self
            .send_json(self.client.post(&url).json(request), self.timeouts.cache)
            .await?;
        tracing::debug!(
            requested = request.entries.len(),
            answered = resp.results.len(),
            "Bulk cache lookup"
        );
        Ok(resp)
    }

    /// Legacy single-key lookup, for backends without the bulk endpoint.
    pub async fn cache(&self, key: &str, query: &CacheQuery) -> Result<CacheEntry> {
        let url = format!("{}/cache", self.base_url);
        let mut params: Vec<(&str, String)> = vec![("key", key.to_string())];
        if let Some(start) = query.date_start {
            params.push(("date_start", start.to_rfc3339()));
        }
        if let Some(end) = query.date_end {
            params.push(("date_end", end.to_rfc3339()));
        }
        if !query.platforms.is_empty() {
            params.push(("platforms", query.platforms.join(",")));
        }
        if !query.flairs.is_empty() {
            params.push(("flairs", query.flairs.join(",")));
        }
        if let Some(max_pages) = query.max_pages {
            params.push(("max_pages", max_pages.to_string()));
        }

        self.send_json(
            self.client.get(&url).query(&params),
            self.timeouts.cache,
        )
        .await
    }

    /// Saved vs platform-reported counts for a window.
    pub async fn coverage(&self, request: &CoverageRequest) -> Result<CoverageResponse> {
        let url = format!("{}/coverage", self.base_url);
        self.send_json(self.client.post(&url).json(request), self.timeouts.coverage)
            .await
    }

    /// Media mirroring state for a window. Same body as [`coverage`](Self::coverage).
    pub async fn mirror_coverage(&self, request: &CoverageRequest) -> Result<MirrorCoverageResponse> {
        let url = format!("{}/coverage/mirror", self.base_url);
        self.send_json(self.client.post(&url).json(request), self.timeouts.coverage)
            .await
    }

    /// Queue mirror jobs for one platform's unmirrored media in a window.
    pub async fn requeue_mirror(&self, request: &MirrorRequeueRequest) -> Result<MirrorRequeueResponse> {
        let url = format!("{}/mirror/requeue", self.base_url);
        let resp: MirrorRequeueResponse = self
            .send_json(self.client.post(&url).json(request), self.timeouts.coverage)
            .await?;
        tracing::info!(
            platform = %request.platform,
            queued_jobs = resp.queued_jobs.unwrap_or(0),
            "Mirror jobs requeued"
        );
        Ok(resp)
    }

    pub async fn worker_health(&self) -> Result<WorkerHealthPayload> {
        let url = format!("{}/workers/health", self.base_url);
        self.send_json(self.client.get(&url), self.timeouts.metadata)
            .await
    }

    /// Episode air dates for a season.
    pub async fn season_episodes(&self, season_id: &str) -> Result<Vec<EpisodePayload>> {
        let url = format!("{}/seasons/{}/episodes", self.base_url, season_id);
        let resp: SeasonEpisodesResponse = self
            .send_json(self.client.get(&url), self.timeouts.metadata)
            .await?;
        tracing::debug!(season_id, count = resp.episodes.len(), "Fetched season episodes");
        Ok(resp.episodes)
    }

    /// Externally computed period boundaries (free-text labels).
    pub async fn season_periods(&self, season_id: &str) -> Result<Vec<PeriodPayload>> {
        let url = format!("{}/seasons/{}/periods", self.base_url, season_id);
        let resp: SeasonPeriodsResponse = self
            .send_json(self.client.get(&url), self.timeouts.metadata)
            .await?;
        Ok(resp.periods)
    }
}

/// Pull `error` / `detail` out of a JSON error body, else return the body as-is.
fn extract_error_message(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: Option<String>,
        detail: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(message),
            ..
        })
        | Ok(ErrorBody {
            detail: Some(message),
            ..
        }) => message,
        _ => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_error_field() {
        assert_eq!(
            extract_error_message(r#"{"error":"season not found"}"#),
            "season not found"
        );
        assert_eq!(
            extract_error_message(r#"{"detail":"worker queue disabled"}"#),
            "worker queue disabled"
        );
    }

    #[test]
    fn error_message_falls_back_to_raw_body() {
        assert_eq!(extract_error_message("  Bad Gateway \n"), "Bad Gateway");
    }

    #[test]
    fn base_url_is_trimmed() {
        let client = IngestClient::new("https://ingest.example.com/api/", None);
        assert_eq!(client.base_url(), "https://ingest.example.com/api");
    }
}
