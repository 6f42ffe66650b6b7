//! Starting ingestion runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use socialsync_common::normalize::normalize_flair;
use socialsync_common::{CoverageMode, Platform, RunState, SyncResult, Timestamp};

use crate::traits::IngestBackend;

/// One run scoped to a window and a platform/flair subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub window_key: String,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub platforms: BTreeSet<Platform>,
    pub flairs: BTreeSet<String>,
    pub coverage_mode: CoverageMode,
    pub pass: u32,
}

#[derive(Serialize)]
struct CanonicalRun<'a> {
    window_key: &'a str,
    start: Option<String>,
    end: Option<String>,
    platforms: Vec<&'static str>,
    flairs: Vec<String>,
    coverage_mode: &'static str,
}

impl RunRequest {
    pub fn new(window_key: impl Into<String>, platforms: BTreeSet<Platform>) -> Self {
        Self {
            window_key: window_key.into(),
            start: None,
            end: None,
            platforms,
            flairs: BTreeSet::new(),
            coverage_mode: CoverageMode::default(),
            pass: 1,
        }
    }

    /// sha256 over the canonical JSON of everything that defines the work.
    /// The pass number is left out so every pass of a session hashes alike.
    pub fn config_hash(&self) -> String {
        let mut flairs: Vec<String> = self
            .flairs
            .iter()
            .filter_map(|f| normalize_flair(f))
            .map(|f| f.to_lowercase())
            .collect();
        flairs.sort();
        flairs.dedup();

        let canonical = CanonicalRun {
            window_key: &self.window_key,
            start: self.start.map(|t| t.to_rfc3339()),
            end: self.end.map(|t| t.to_rfc3339()),
            platforms: self.platforms.iter().map(Platform::as_str).collect(),
            flairs,
            coverage_mode: self.coverage_mode.as_str(),
        };
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// What the backend answered when a run was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStarted {
    pub run_id: String,
    pub state: RunState,
    pub jobs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: String,
    pub window_key: String,
    pub initial: RunState,
    pub jobs: Option<u32>,
    pub config_hash: String,
}

pub struct RunCoordinator<B> {
    backend: Arc<B>,
    current: Mutex<HashMap<String, String>>,
}

impl<B: IngestBackend> RunCoordinator<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            current: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self, request: &RunRequest) -> SyncResult<RunHandle> {
        let config_hash = request.config_hash();
        let started = self.backend.create_run(request).await?;

        info!(
            run_id = %started.run_id,
            window_key = %request.window_key,
            pass = request.pass,
            platforms = request.platforms.len(),
            jobs = ?started.jobs,
            state = %started.state,
            "Run started"
        );

        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.window_key.clone(), started.run_id.clone());

        Ok(RunHandle {
            run_id: started.run_id,
            window_key: request.window_key.clone(),
            initial: started.state,
            jobs: started.jobs,
            config_hash,
        })
    }

    /// Most recent run started for a window.
    pub fn current_run(&self, window_key: &str) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(window_key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    #[test]
    fn config_hash_ignores_pass_and_flair_formatting() {
        let mut a = RunRequest::new("episode-1", BTreeSet::from([Platform::Reddit]));
        a.flairs.insert("Live Thread".into());
        let mut b = a.clone();
        b.pass = 4;
        b.flairs = BTreeSet::from([":fire: live thread".to_string()]);

        assert_eq!(a.config_hash(), b.config_hash());
        assert_eq!(a.config_hash().len(), 64);
    }

    #[test]
    fn config_hash_changes_with_scope() {
        let a = RunRequest::new("episode-1", BTreeSet::from([Platform::Reddit]));
        let b = RunRequest::new("episode-1", BTreeSet::from([Platform::Reddit, Platform::Tiktok]));
        let mut c = a.clone();
        c.coverage_mode = CoverageMode::FullSync;
        assert_ne!(a.config_hash(), b.config_hash());
        assert_ne!(a.config_hash(), c.config_hash());
    }

    #[tokio::test]
    async fn start_returns_handle_and_tracks_current_run() {
        let backend = Arc::new(MockBackend::new().with_run_ids(["run-a", "run-b"]));
        let coordinator = RunCoordinator::new(Arc::clone(&backend));
        let request = RunRequest::new("episode-2", BTreeSet::from([Platform::Instagram]));

        let first = coordinator.start(&request).await.unwrap();
        assert_eq!(first.run_id, "run-a");
        assert_eq!(first.initial, RunState::Queued);
        assert_eq!(first.config_hash, request.config_hash());

        coordinator.start(&request).await.unwrap();
        assert_eq!(coordinator.current_run("episode-2").as_deref(), Some("run-b"));
        assert_eq!(backend.created_runs().len(), 2);
    }
}
