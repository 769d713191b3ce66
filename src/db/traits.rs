// Database trait — backend-agnostic async interface for all store operations.
//
// Implementors: SqliteDatabase (wraps rusqlite), PgDatabase (wraps sqlx).
// All methods are async so both sync (rusqlite via Mutex) and native async
// (sqlx) backends fit behind a single interface.
//
// Batch writes run in one transaction with a savepoint per record. The outer
// Err is reserved for failures of the session itself; per-record failures
// come back inside the BatchOutcome.

use async_trait::async_trait;

use super::error::{StoreError, StoreResult};
use super::models::{
    EngagementObservation, ExternalCategory, ExternalSample, GlobalSentimentSample, ImpactChange,
    PostEngagement, PostKey, PostSentiment, PostType, WindowPost,
};

/// A record that failed inside an otherwise committed batch.
#[derive(Debug)]
pub struct RecordFailure {
    /// Position of the record in the submitted slice.
    pub index: usize,
    pub error: StoreError,
}

/// Result of a batch write with per-record isolation.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub failures: Vec<RecordFailure>,
}

impl BatchOutcome {
    pub fn record(&mut self, index: usize, result: StoreResult<()>) {
        match result {
            Ok(()) => self.applied += 1,
            Err(error) => self.failures.push(RecordFailure { index, error }),
        }
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    // --- Lifecycle ---

    /// Count the number of user-created tables in the database.
    async fn table_count(&self) -> StoreResult<i64>;

    // --- Posts ---

    /// Insert scored posts, or refresh the content of ones already stored.
    /// `created_at_ms` and `impact` of an existing row are left untouched.
    async fn upsert_posts(&self, posts: &[PostSentiment]) -> StoreResult<BatchOutcome>;

    /// Which of the given identities already have a scored row.
    async fn existing_post_keys(&self, keys: &[PostKey]) -> StoreResult<Vec<PostKey>>;

    /// Load one scored post.
    async fn get_post(&self, key: &PostKey) -> StoreResult<Option<PostSentiment>>;

    // --- Engagement ---

    /// Record raw engagement readings, keeping the running maximum per post.
    async fn record_engagement(
        &self,
        observations: &[EngagementObservation],
    ) -> StoreResult<BatchOutcome>;

    /// Current engagement of every scored post created at or after `since_ms`.
    /// Posts without any engagement reading are not returned.
    async fn recent_engagement(&self, since_ms: i64) -> StoreResult<Vec<PostEngagement>>;

    /// Write new impact values, one update per identity.
    async fn update_impacts(&self, changes: &[ImpactChange]) -> StoreResult<BatchOutcome>;

    // --- Aggregation inputs ---

    /// Impact and sentiment of the posts of the given types created in
    /// `[since_ms, until_ms]`.
    async fn window_posts(
        &self,
        post_types: &[PostType],
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<WindowPost>>;

    /// Store third-party sentiment readings.
    async fn insert_external_samples(
        &self,
        samples: &[ExternalSample],
    ) -> StoreResult<BatchOutcome>;

    /// Values of external readings of one category received in
    /// `[since_ms, until_ms]`.
    async fn external_values(
        &self,
        category: ExternalCategory,
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<f64>>;

    // --- Aggregate series ---

    /// Append aggregate samples.
    async fn insert_samples(&self, samples: &[GlobalSentimentSample])
        -> StoreResult<BatchOutcome>;

    /// The most recent sample of every (sentiment_type, window) series.
    async fn latest_samples(&self) -> StoreResult<Vec<GlobalSentimentSample>>;
}
