// Ingest role — persist a stream batch, then run an engine cycle.
//
// Scored posts coming back from the classifier become `posts_sentiment`
// rows, raw posts update the engagement counters, third-party feed readings
// go to `external_sentiment`. After every batch the engine refreshes impacts
// and, if anything changed, recomputes the aggregate series.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncBufRead;
use tracing::{debug, info, warn};

use super::persist::PersistReport;
use super::refresh::{log_cycle, SentimentEngine};
use crate::db::models::{EngagementObservation, ExternalSample, PostSentiment};
use crate::db::{BatchOutcome, Database, StoreResult};
use crate::scheduler::CycleTask;
use crate::stream::{Envelope, Record, StreamBatcher};

/// What persisting one batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub posts: PersistReport,
    pub engagement: PersistReport,
    pub external: PersistReport,
    /// Records that failed validation.
    pub invalid: usize,
    /// Records of a type this engine doesn't consume.
    pub ignored: usize,
}

impl IngestSummary {
    /// Whether the batch brought anything the aggregate series depend on
    /// directly (new posts or new external readings).
    pub fn has_new_inputs(&self) -> bool {
        self.posts.applied > 0 || self.external.applied > 0
    }
}

fn report(outcome: &BatchOutcome, what: &str) -> PersistReport {
    for failure in &outcome.failures {
        warn!(index = failure.index, error = %failure.error, "Skipped {} record", what);
    }
    PersistReport {
        applied: outcome.applied,
        failed: outcome.failures.len(),
    }
}

/// Validate a batch of envelopes and write them to the store.
pub async fn ingest_batch(db: &dyn Database, batch: &[Envelope]) -> StoreResult<IngestSummary> {
    let mut summary = IngestSummary::default();
    let mut posts: Vec<PostSentiment> = Vec::new();
    let mut observations: Vec<EngagementObservation> = Vec::new();
    let mut external: Vec<ExternalSample> = Vec::new();

    for envelope in batch {
        match Record::parse(envelope) {
            Ok(Some(Record::ScoredPost(post))) => posts.push(post),
            Ok(Some(Record::RawPost(post))) => observations.push(post.to_observation()),
            Ok(Some(Record::External(sample))) => external.push(sample),
            Ok(None) => summary.ignored += 1,
            Err(e) => {
                warn!(error = %e, "Dropping invalid record");
                summary.invalid += 1;
            }
        }
    }

    if !posts.is_empty() {
        summary.posts = report(&db.upsert_posts(&posts).await?, "post");
    }
    if !observations.is_empty() {
        summary.engagement = report(&db.record_engagement(&observations).await?, "engagement");
    }
    if !external.is_empty() {
        summary.external = report(&db.insert_external_samples(&external).await?, "external");
    }

    debug!(
        posts = summary.posts.applied,
        engagement = summary.engagement.applied,
        external = summary.external.applied,
        invalid = summary.invalid,
        ignored = summary.ignored,
        "Batch persisted"
    );
    Ok(summary)
}

/// The `ingest` role as a scheduler task.
pub struct IngestTask<R> {
    batcher: StreamBatcher<R, Envelope>,
    engine: SentimentEngine,
    /// The batch being worked on. Kept until it has been written, so a
    /// batch hit by a connection failure is retried rather than lost.
    pending: Vec<Envelope>,
}

impl<R: AsyncBufRead + Unpin + Send> IngestTask<R> {
    pub fn new(batcher: StreamBatcher<R, Envelope>, engine: SentimentEngine) -> Self {
        Self {
            batcher,
            engine,
            pending: Vec::new(),
        }
    }

    pub fn engine(&self) -> &SentimentEngine {
        &self.engine
    }

    fn db(&self) -> Arc<dyn Database> {
        self.engine.db().clone()
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> CycleTask for IngestTask<R> {
    async fn ready(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            self.pending = self.batcher.next_batch().await;
        }
        Ok(())
    }

    async fn run_cycle(&mut self, now_ms: i64) -> Result<()> {
        info!(records = self.pending.len(), "Ingesting batch");
        let db = self.db();
        let summary = ingest_batch(db.as_ref(), &self.pending).await?;
        self.pending.clear();

        let report = self.engine.run_cycle(now_ms, summary.has_new_inputs()).await?;
        log_cycle(&report);
        Ok(())
    }
}
