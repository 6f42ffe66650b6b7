//! Saved vs reported coverage for a whole window, plus media mirroring for
//! full-sync sessions.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use socialsync_common::{
    CoverageMode, CoverageSnapshot, Platform, PlatformCoverage, SyncResult, Timestamp,
};

use crate::traits::CoverageSource;

pub struct CoverageEvaluator<C> {
    source: Arc<C>,
}

impl<C: CoverageSource> CoverageEvaluator<C> {
    pub fn new(source: Arc<C>) -> Self {
        Self { source }
    }

    /// Evaluate every requested platform over the full window. `previous` is
    /// the snapshot from an earlier pass of the same session, if any. Full
    /// sync also reads mirror coverage.
    pub async fn evaluate(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
        mode: CoverageMode,
        previous: Option<&CoverageSnapshot>,
    ) -> SyncResult<CoverageSnapshot> {
        let raw = self.source.coverage(start, end, platforms).await?;

        let mut snapshot = CoverageSnapshot::default();
        for platform in platforms {
            let coverage = match raw.get(platform) {
                Some(counts) => PlatformCoverage::new(counts.saved, counts.reported),
                None => {
                    debug!(platform = %platform, "No coverage counts returned");
                    PlatformCoverage::new(0, None)
                }
            };
            snapshot.by_platform.insert(*platform, coverage);
        }

        if mode == CoverageMode::FullSync {
            let mirror = self.source.mirror_coverage(start, end, platforms).await?;
            debug!(
                ready = mirror.is_ready(),
                stale = mirror.stale_platforms().len(),
                "Mirror coverage"
            );
            snapshot.mirror = Some(mirror);
        }

        Ok(snapshot.monotonic_over(previous))
    }

    pub async fn requeue_mirror(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        platforms: &BTreeSet<Platform>,
    ) -> SyncResult<u64> {
        self.source.requeue_mirror(start, end, platforms).await
    }
}
