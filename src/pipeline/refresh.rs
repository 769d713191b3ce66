// Impact refresh and aggregation — the sentiment engine's cycle.
//
// Each cycle reads the current engagement of recently-scored posts, keeps
// only the posts whose counters moved since they were last seen (the change
// cache), rescores those, writes the new impacts, and then recomputes the
// aggregate series. Impact writes always land before aggregation so every
// sample reflects the freshest impacts of that cycle.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::persist::{persist_impacts, persist_samples, PersistReport};
use crate::aggregate::{compute_cycle, NormalizationPolicy, Window};
use crate::cache::ChangeCache;
use crate::db::models::{ImpactChange, PostKey};
use crate::db::{Database, StoreResult};
use crate::scheduler::CycleTask;
use crate::scoring::impact::compute_impact;

/// What one engine cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Recent posts whose engagement was read from the store.
    pub scanned: usize,
    /// Posts whose engagement changed and were rescored.
    pub changed: usize,
    pub impacts: PersistReport,
    /// `None` when aggregation was skipped this cycle.
    pub samples: Option<PersistReport>,
}

pub struct SentimentEngine {
    db: Arc<dyn Database>,
    cache: ChangeCache,
    windows: Vec<Window>,
    policy: NormalizationPolicy,
    /// How far back posts still get their impact refreshed.
    lookback_ms: i64,
    /// Inputs or impacts changed since the series were last written.
    aggregate_pending: bool,
}

impl SentimentEngine {
    /// Posts are refreshed for as long as the widest window can see them.
    pub fn new(
        db: Arc<dyn Database>,
        cache: ChangeCache,
        windows: Vec<Window>,
        policy: NormalizationPolicy,
    ) -> Self {
        let widest = windows
            .iter()
            .map(Window::seconds)
            .max()
            .unwrap_or(Window::DEFAULT_SECONDS);
        Self {
            db,
            cache,
            windows,
            policy,
            lookback_ms: widest.saturating_mul(1000),
            aggregate_pending: false,
        }
    }

    pub fn cache(&self) -> &ChangeCache {
        &self.cache
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Whether the next cycle will aggregate even without new changes.
    pub fn aggregate_pending(&self) -> bool {
        self.aggregate_pending
    }

    /// Rescore recent posts whose engagement changed and persist the new
    /// impacts. Returns `(scanned, changed, report)`.
    pub async fn refresh_impacts(
        &mut self,
        now_ms: i64,
    ) -> StoreResult<(usize, usize, PersistReport)> {
        let since_ms = now_ms.saturating_sub(self.lookback_ms);
        let rows = self.db.recent_engagement(since_ms).await?;

        let mut changes = Vec::new();
        for row in &rows {
            let snapshot = row.snapshot();
            if self.cache.consider(row.post_type, row.post_id, snapshot) {
                changes.push(ImpactChange {
                    post_type: row.post_type,
                    post_id: row.post_id,
                    impact: compute_impact(row.post_type, &snapshot),
                });
            }
        }

        match persist_impacts(self.db.as_ref(), &changes).await {
            Ok(report) => Ok((rows.len(), changes.len(), report)),
            Err(e) => {
                // Nothing in the batch committed: make sure these posts are
                // rescored next cycle even if their counters stay put.
                for change in &changes {
                    self.cache
                        .forget(&PostKey::new(change.post_type, change.post_id));
                }
                Err(e)
            }
        }
    }

    /// Recompute and append every aggregate series at `now_ms`.
    pub async fn aggregate(&self, now_ms: i64) -> StoreResult<PersistReport> {
        let samples = compute_cycle(self.db.as_ref(), now_ms, &self.windows, &self.policy).await?;
        persist_samples(self.db.as_ref(), &samples).await
    }

    /// One full cycle. Aggregation runs when impacts changed, or when the
    /// caller knows new inputs arrived (`inputs_changed`). Either reason is
    /// kept until the samples have been written, so a cycle that fails
    /// before or during aggregation aggregates on the next one.
    pub async fn run_cycle(
        &mut self,
        now_ms: i64,
        inputs_changed: bool,
    ) -> StoreResult<CycleReport> {
        self.aggregate_pending |= inputs_changed;
        let (scanned, changed, impacts) = self.refresh_impacts(now_ms).await?;
        self.aggregate_pending |= impacts.applied > 0;

        let samples = if self.aggregate_pending {
            let report = self.aggregate(now_ms).await?;
            self.aggregate_pending = false;
            Some(report)
        } else {
            debug!("No impact changes, skipping aggregation");
            None
        };

        Ok(CycleReport {
            scanned,
            changed,
            impacts,
            samples,
        })
    }
}

/// The `aggregate` role: refresh and aggregate on a fixed interval.
pub struct AggregateTask {
    engine: SentimentEngine,
}

impl AggregateTask {
    pub fn new(engine: SentimentEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &SentimentEngine {
        &self.engine
    }
}

#[async_trait]
impl CycleTask for AggregateTask {
    async fn run_cycle(&mut self, now_ms: i64) -> Result<()> {
        let report = self.engine.run_cycle(now_ms, false).await?;
        log_cycle(&report);
        Ok(())
    }
}

pub(crate) fn log_cycle(report: &CycleReport) {
    let (samples, sample_failures) = report
        .samples
        .map(|s| (s.applied, s.failed))
        .unwrap_or((0, 0));
    info!(
        scanned = report.scanned,
        changed = report.changed,
        impacts = report.impacts.applied,
        impact_failures = report.impacts.failed,
        samples,
        sample_failures,
        "Cycle complete"
    );
}
