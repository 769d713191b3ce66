// Composition tests — the engine's stages chained over a real store.
//
// These tests exercise the data flow between modules:
//   envelopes -> ingest -> engagement -> change cache -> impacts -> aggregation
// against an in-memory SQLite database, with a manual clock and sleeper so
// nothing waits on real time.

#![cfg(feature = "sqlite")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use bullbear::aggregate::ensemble::{
    GLOBAL_EXTERNAL_ENSEMBLE, NEWS_EXTERNAL_ENSEMBLE, SOCIAL_EXTERNAL_ENSEMBLE,
    SOCIAL_INTERNAL_ENSEMBLE, STOCKTWITS, TWITTER,
};
use bullbear::aggregate::{NormalizationPolicy, Window};
use bullbear::cache::ChangeCache;
use bullbear::db::models::{
    EngagementObservation, ExternalCategory, ExternalSample, GlobalSentimentSample, ImpactChange,
    PostEngagement, PostKey, PostSentiment, PostType, WindowPost,
};
use bullbear::db::{
    sqlite_in_memory, BatchOutcome, Connector, Database, ReconnectingDatabase, Session, StoreError,
    StoreResult,
};
use bullbear::pipeline::filter::{FilterTask, TopicFilter};
use bullbear::pipeline::ingest::{ingest_batch, IngestTask};
use bullbear::pipeline::{persist_impacts, AggregateTask, PersistReport, SentimentEngine};
use bullbear::scheduler::{ManualClock, ManualSleeper, Scheduler, Sleeper};
use bullbear::stream::{Envelope, StreamBatcher};

const NOW: i64 = 1_700_000_000_000;
const HOUR_MS: i64 = 3_600_000;

// ============================================================
// Fixtures
// ============================================================

fn envelope(value: Value) -> Envelope {
    serde_json::from_value(value).unwrap()
}

fn scored_stocktwit(id: i64, sentiment: f64, created_at: i64) -> Envelope {
    envelope(json!({
        "msgType": "stocktwit-sentiment-response",
        "clientReceivedTsMs": created_at + 500,
        "data": {
            "id": id,
            "text": format!("post {id}"),
            "user": {"username": "trader"},
            "created_at": created_at
        },
        "predictions": {"values": {
            "bull_sentiment": sentiment,
            "vader_sentiment": sentiment,
            "bull_vader_sentiment": sentiment
        }}
    }))
}

fn scored_tweet(id: i64, sentiment: f64, created_at: i64) -> Envelope {
    envelope(json!({
        "msgType": "twitter-topic-sentiment-response",
        "clientReceivedTsMs": created_at + 500,
        "data": {
            "id": id,
            "text": format!("tsla tweet {id}"),
            "user": {"screen_name": "tweeter"},
            "created_at": created_at
        },
        "predictions": {"values": {
            "bull_sentiment": sentiment,
            "vader_sentiment": sentiment,
            "bull_vader_sentiment": sentiment
        }}
    }))
}

fn raw_stocktwit(id: i64, replies: i64, likes: i64, created_at: i64) -> Envelope {
    envelope(json!({
        "msgType": "stocktwit",
        "clientReceivedTsMs": created_at + 1_000,
        "data": {
            "id": id,
            "body": format!("$TSLA board post {id}"),
            "user": {"username": "trader"},
            "created_at": created_at,
            "conversation": {"replies": replies},
            "likes": {"total": likes}
        }
    }))
}

fn raw_tweet(msg_type: &str, id: i64, text: &str, retweets: i64, likes: i64) -> Envelope {
    envelope(json!({
        "msgType": msg_type,
        "clientReceivedTsMs": NOW,
        "data": {
            "id": id,
            "text": text,
            "user": {"screen_name": "tweeter"},
            "created_at": NOW - 1_000,
            "retweet_count": retweets,
            "favorite_count": likes
        }
    }))
}

fn external(msg_type: &str, field: &str, value: f64, received_at: i64) -> Envelope {
    envelope(json!({
        "msgType": msg_type,
        "clientReceivedTsMs": received_at,
        "data": {field: value}
    }))
}

fn engine(db: Arc<dyn Database>, capacity: usize) -> SentimentEngine {
    SentimentEngine::new(
        db,
        ChangeCache::new(capacity),
        vec![Window::default()],
        NormalizationPolicy::default(),
    )
}

async fn impact_of(db: &dyn Database, post_type: PostType, post_id: i64) -> i64 {
    db.get_post(&PostKey::new(post_type, post_id))
        .await
        .unwrap()
        .unwrap()
        .impact
}

fn sample_value(samples: &[GlobalSentimentSample], name: &str) -> Option<f64> {
    samples
        .iter()
        .find(|s| s.sentiment_type == name)
        .map(|s| s.sentiment_absolute)
}

// ============================================================
// Change detection: idempotence and sensitivity
// ============================================================

#[tokio::test]
async fn unchanged_engagement_is_written_once() {
    let db = sqlite_in_memory().unwrap();
    ingest_batch(
        db.as_ref(),
        &[
            scored_stocktwit(1, 0.8, NOW - HOUR_MS),
            raw_stocktwit(1, 2, 4, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();

    let mut engine = engine(db.clone(), 100);
    let first = engine.run_cycle(NOW, false).await.unwrap();
    assert_eq!(first.changed, 1);
    assert_eq!(first.impacts, PersistReport { applied: 1, failed: 0 });
    assert_eq!(impact_of(db.as_ref(), PostType::Stocktwit, 1).await, 7);

    let second = engine.run_cycle(NOW + 60_000, false).await.unwrap();
    assert_eq!(second.scanned, 1);
    assert_eq!(second.changed, 0);
    assert_eq!(second.impacts, PersistReport::default());
    assert!(second.samples.is_none());
}

#[tokio::test]
async fn more_likes_means_a_new_and_higher_impact() {
    let db = sqlite_in_memory().unwrap();
    ingest_batch(
        db.as_ref(),
        &[
            scored_tweet(5, 0.7, NOW - HOUR_MS),
            raw_tweet("twitter-topic", 5, "tesla", 2, 4),
        ],
    )
    .await
    .unwrap();

    let mut engine = engine(db.clone(), 100);
    engine.run_cycle(NOW, false).await.unwrap();
    let before = impact_of(db.as_ref(), PostType::TwitterTopic, 5).await;
    assert_eq!(before, 11);

    ingest_batch(db.as_ref(), &[raw_tweet("twitter-topic", 5, "tesla", 2, 9)])
        .await
        .unwrap();
    let report = engine.run_cycle(NOW + 1_000, false).await.unwrap();
    assert_eq!(report.changed, 1);
    let after = impact_of(db.as_ref(), PostType::TwitterTopic, 5).await;
    assert!(after > before);
    assert_eq!(after, 16);
}

#[tokio::test]
async fn stale_lower_reading_does_not_lower_impact() {
    let db = sqlite_in_memory().unwrap();
    ingest_batch(
        db.as_ref(),
        &[
            scored_stocktwit(3, 0.6, NOW - HOUR_MS),
            raw_stocktwit(3, 5, 5, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();
    let mut engine = engine(db.clone(), 100);
    engine.run_cycle(NOW, false).await.unwrap();

    ingest_batch(db.as_ref(), &[raw_stocktwit(3, 1, 1, NOW - HOUR_MS)])
        .await
        .unwrap();
    let report = engine.run_cycle(NOW + 1_000, false).await.unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(impact_of(db.as_ref(), PostType::Stocktwit, 3).await, 11);
}

#[tokio::test]
async fn evicted_post_is_rescored() {
    let db = sqlite_in_memory().unwrap();
    let mut batch = Vec::new();
    for id in 1..=3 {
        batch.push(scored_stocktwit(id, 0.6, NOW - HOUR_MS));
        batch.push(raw_stocktwit(id, 0, 1, NOW - HOUR_MS));
    }
    ingest_batch(db.as_ref(), &batch).await.unwrap();

    // Capacity 2 with 3 posts: every cycle evicts something, so identical
    // counters still produce writes.
    let mut engine = engine(db.clone(), 2);
    let first = engine.run_cycle(NOW, false).await.unwrap();
    assert_eq!(first.changed, 3);
    assert_eq!(engine.cache().len(), 2);

    let second = engine.run_cycle(NOW + 1_000, false).await.unwrap();
    assert!(second.changed >= 1);
}

// ============================================================
// Aggregation over windows
// ============================================================

#[tokio::test]
async fn only_posts_inside_the_window_count() {
    let db = sqlite_in_memory().unwrap();
    let width_ms = Window::DEFAULT_SECONDS * 1000;
    ingest_batch(
        db.as_ref(),
        &[
            scored_stocktwit(1, 0.9, NOW - 1_000),
            // Exactly on the lower bound: included.
            scored_stocktwit(2, 0.5, NOW - width_ms),
            // Just outside, and in the future: excluded.
            scored_stocktwit(3, 0.0, NOW - width_ms - 1),
            scored_stocktwit(4, 0.0, NOW + 5_000),
        ],
    )
    .await
    .unwrap();

    let engine = engine(db.clone(), 100);
    let report = engine.aggregate(NOW).await.unwrap();
    assert!(report.applied > 0);

    let samples = db.latest_samples().await.unwrap();
    // (1 * 0.4 + 1 * 0.0) / 2
    let stocktwits = sample_value(&samples, STOCKTWITS).unwrap();
    assert!((stocktwits - 0.2).abs() < 1e-9);
    assert!(sample_value(&samples, TWITTER).is_none());
    assert!(samples.iter().all(|s| s.created_at_ms == NOW));
}

#[tokio::test]
async fn every_tier_is_published() {
    let db = sqlite_in_memory().unwrap();
    ingest_batch(
        db.as_ref(),
        &[
            scored_stocktwit(1, 0.6, NOW - HOUR_MS),
            scored_tweet(2, 0.45, NOW - HOUR_MS),
            external("stocktwits-sentiment", "sentiment_percent", 60.0, NOW - HOUR_MS),
            external("stockfluence-sentiment", "sentiment_score", 100.0, NOW - HOUR_MS),
            external("benzinga-sentiment", "news_sentiment_score", 30.0, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();

    let mut engine = engine(db.clone(), 100);
    let report = engine.run_cycle(NOW, true).await.unwrap();
    assert_eq!(report.samples.map(|s| s.applied), Some(6));

    let samples = db.latest_samples().await.unwrap();
    let value = |name| sample_value(&samples, name).unwrap();
    assert!((value(STOCKTWITS) - 0.1).abs() < 1e-9);
    assert!((value(TWITTER) + 0.05).abs() < 1e-9);
    assert!((value(SOCIAL_INTERNAL_ENSEMBLE) - 26.25).abs() < 1e-9);
    // Stockfluence 100 on its 0-200 scale is 50.
    assert!((value(SOCIAL_EXTERNAL_ENSEMBLE) - 55.0).abs() < 1e-9);
    assert!((value(NEWS_EXTERNAL_ENSEMBLE) - 30.0).abs() < 1e-9);
    assert!((value(GLOBAL_EXTERNAL_ENSEMBLE) - 42.5).abs() < 1e-9);
}

#[tokio::test]
async fn impact_shifts_the_series() {
    let db = sqlite_in_memory().unwrap();
    ingest_batch(
        db.as_ref(),
        &[
            scored_stocktwit(1, 0.9, NOW - HOUR_MS),
            scored_stocktwit(2, 0.1, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();
    let mut engine = engine(db.clone(), 100);
    engine.run_cycle(NOW, true).await.unwrap();
    let neutral = sample_value(&db.latest_samples().await.unwrap(), STOCKTWITS).unwrap();
    assert!(neutral.abs() < 1e-9);

    ingest_batch(db.as_ref(), &[raw_stocktwit(1, 3, 6, NOW - HOUR_MS)])
        .await
        .unwrap();
    engine.run_cycle(NOW + 1_000, false).await.unwrap();
    let bullish = sample_value(&db.latest_samples().await.unwrap(), STOCKTWITS).unwrap();
    assert!(bullish > 0.0);
}

// ============================================================
// Failure isolation
// ============================================================

#[tokio::test]
async fn one_failed_update_leaves_the_others_committed() {
    let db = sqlite_in_memory().unwrap();
    ingest_batch(
        db.as_ref(),
        &[
            scored_stocktwit(1, 0.6, NOW - HOUR_MS),
            scored_stocktwit(3, 0.6, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();

    let changes: Vec<ImpactChange> = [(1, 4), (2, 9), (3, 6)]
        .into_iter()
        .map(|(post_id, impact)| ImpactChange {
            post_type: PostType::Stocktwit,
            post_id,
            impact,
        })
        .collect();

    let report = persist_impacts(db.as_ref(), &changes).await.unwrap();
    assert_eq!(report, PersistReport { applied: 2, failed: 1 });
    assert_eq!(impact_of(db.as_ref(), PostType::Stocktwit, 1).await, 4);
    assert_eq!(impact_of(db.as_ref(), PostType::Stocktwit, 3).await, 6);
}

#[tokio::test]
async fn invalid_records_are_dropped_not_fatal() {
    let db = sqlite_in_memory().unwrap();
    let broken = envelope(json!({
        "msgType": "stocktwit-sentiment-response",
        "clientReceivedTsMs": NOW,
        "data": {"id": 9, "text": "no predictions", "user": {"username": "x"}, "created_at": NOW}
    }));
    let unknown = envelope(json!({"msgType": "heartbeat", "data": {}}));

    let summary = ingest_batch(
        db.as_ref(),
        &[broken, unknown, scored_stocktwit(1, 0.6, NOW - HOUR_MS)],
    )
    .await
    .unwrap();
    assert_eq!(summary.invalid, 1);
    assert_eq!(summary.ignored, 1);
    assert_eq!(summary.posts.applied, 1);
    assert!(summary.has_new_inputs());
}

/// Delegates to a real store but fails the next impact or sample write as
/// if the connection had dropped.
struct DroppedConnection {
    inner: Arc<dyn Database>,
    fail_next_update: AtomicBool,
    fail_next_samples: AtomicBool,
}

impl DroppedConnection {
    fn new(inner: Arc<dyn Database>, fail_update: bool, fail_samples: bool) -> Self {
        Self {
            inner,
            fail_next_update: AtomicBool::new(fail_update),
            fail_next_samples: AtomicBool::new(fail_samples),
        }
    }
}

#[async_trait]
impl Database for DroppedConnection {
    async fn table_count(&self) -> StoreResult<i64> {
        self.inner.table_count().await
    }
    async fn upsert_posts(&self, posts: &[PostSentiment]) -> StoreResult<BatchOutcome> {
        self.inner.upsert_posts(posts).await
    }
    async fn existing_post_keys(&self, keys: &[PostKey]) -> StoreResult<Vec<PostKey>> {
        self.inner.existing_post_keys(keys).await
    }
    async fn get_post(&self, key: &PostKey) -> StoreResult<Option<PostSentiment>> {
        self.inner.get_post(key).await
    }
    async fn record_engagement(
        &self,
        observations: &[EngagementObservation],
    ) -> StoreResult<BatchOutcome> {
        self.inner.record_engagement(observations).await
    }
    async fn recent_engagement(&self, since_ms: i64) -> StoreResult<Vec<PostEngagement>> {
        self.inner.recent_engagement(since_ms).await
    }
    async fn update_impacts(&self, changes: &[ImpactChange]) -> StoreResult<BatchOutcome> {
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Connection("connection reset by peer".to_string()));
        }
        self.inner.update_impacts(changes).await
    }
    async fn window_posts(
        &self,
        post_types: &[PostType],
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<WindowPost>> {
        self.inner.window_posts(post_types, since_ms, until_ms).await
    }
    async fn insert_external_samples(
        &self,
        samples: &[ExternalSample],
    ) -> StoreResult<BatchOutcome> {
        self.inner.insert_external_samples(samples).await
    }
    async fn external_values(
        &self,
        category: ExternalCategory,
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<f64>> {
        self.inner.external_values(category, since_ms, until_ms).await
    }
    async fn insert_samples(
        &self,
        samples: &[GlobalSentimentSample],
    ) -> StoreResult<BatchOutcome> {
        if self.fail_next_samples.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Connection("connection reset by peer".to_string()));
        }
        self.inner.insert_samples(samples).await
    }
    async fn latest_samples(&self) -> StoreResult<Vec<GlobalSentimentSample>> {
        self.inner.latest_samples().await
    }
}

#[tokio::test]
async fn lost_impact_write_is_retried_next_cycle() {
    let inner = sqlite_in_memory().unwrap();
    ingest_batch(
        inner.as_ref(),
        &[
            scored_stocktwit(1, 0.8, NOW - HOUR_MS),
            raw_stocktwit(1, 2, 4, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();

    let flaky: Arc<dyn Database> = Arc::new(DroppedConnection::new(inner.clone(), true, false));
    let mut engine = engine(flaky, 100);

    let err = engine.run_cycle(NOW, false).await.unwrap_err();
    assert!(err.is_connection());
    assert_eq!(impact_of(inner.as_ref(), PostType::Stocktwit, 1).await, 1);

    // Same counters as before, but the failed write must not be forgotten.
    let report = engine.run_cycle(NOW + 1_000, false).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.impacts.applied, 1);
    assert_eq!(impact_of(inner.as_ref(), PostType::Stocktwit, 1).await, 7);
}

#[tokio::test]
async fn lost_sample_write_is_retried_next_cycle() {
    let inner = sqlite_in_memory().unwrap();
    ingest_batch(
        inner.as_ref(),
        &[
            scored_stocktwit(1, 0.8, NOW - HOUR_MS),
            raw_stocktwit(1, 2, 4, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();

    let flaky: Arc<dyn Database> = Arc::new(DroppedConnection::new(inner.clone(), false, true));
    let mut engine = engine(flaky, 100);

    // The impact commits, the samples don't.
    let err = engine.run_cycle(NOW, false).await.unwrap_err();
    assert!(err.is_connection());
    assert_eq!(impact_of(inner.as_ref(), PostType::Stocktwit, 1).await, 7);
    assert!(inner.latest_samples().await.unwrap().is_empty());
    assert!(engine.aggregate_pending());

    // Nothing changes any more, but the series still have to catch up.
    let report = engine.run_cycle(NOW + 1_000, false).await.unwrap();
    assert_eq!(report.changed, 0);
    assert!(report.samples.is_some_and(|s| s.applied > 0));
    assert!(!engine.aggregate_pending());
    let samples = inner.latest_samples().await.unwrap();
    assert!(samples.iter().all(|s| s.created_at_ms == NOW + 1_000));
    assert!(sample_value(&samples, STOCKTWITS).is_some());

    let idle = engine.run_cycle(NOW + 2_000, false).await.unwrap();
    assert!(idle.samples.is_none());
}

#[tokio::test]
async fn new_inputs_survive_a_failed_cycle() {
    let inner = sqlite_in_memory().unwrap();
    let summary = ingest_batch(inner.as_ref(), &[scored_stocktwit(1, 0.8, NOW - HOUR_MS)])
        .await
        .unwrap();
    assert!(summary.has_new_inputs());

    let flaky: Arc<dyn Database> = Arc::new(DroppedConnection::new(inner.clone(), false, true));
    let mut engine = engine(flaky, 100);

    assert!(engine.run_cycle(NOW, summary.has_new_inputs()).await.is_err());
    let report = engine.run_cycle(NOW + 1_000, false).await.unwrap();
    assert!(report.samples.is_some());
    assert!(sample_value(&inner.latest_samples().await.unwrap(), STOCKTWITS).is_some());
}

/// Refuses the first connection, hands out a session that drops on its
/// first impact write next, then healthy sessions.
struct FlakyConnector {
    inner: Arc<dyn Database>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self) -> anyhow::Result<Session> {
        match self.attempts.fetch_add(1, Ordering::SeqCst) {
            0 => anyhow::bail!("could not reach the database host"),
            1 => Ok(Session::direct(Arc::new(DroppedConnection::new(
                self.inner.clone(),
                true,
                false,
            )))),
            _ => Ok(Session::direct(self.inner.clone())),
        }
    }
}

#[tokio::test]
async fn lost_session_is_reopened_on_next_call() {
    let inner = sqlite_in_memory().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let db = ReconnectingDatabase::new(FlakyConnector {
        inner,
        attempts: attempts.clone(),
    });
    assert!(!db.is_connected().await);

    let err = db.latest_samples().await.unwrap_err();
    assert!(err.is_connection());
    assert!(!db.is_connected().await);

    assert!(db.latest_samples().await.unwrap().is_empty());
    assert!(db.is_connected().await);

    let err = db.update_impacts(&[]).await.unwrap_err();
    assert!(err.is_connection());
    assert!(!db.is_connected().await);

    db.update_impacts(&[]).await.unwrap();
    assert!(db.is_connected().await);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unreachable_store_at_startup_is_retried_each_cycle() {
    let inner = sqlite_in_memory().unwrap();
    ingest_batch(
        inner.as_ref(),
        &[
            scored_stocktwit(1, 0.8, NOW - HOUR_MS),
            raw_stocktwit(1, 2, 4, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let db: Arc<dyn Database> = Arc::new(ReconnectingDatabase::new(FlakyConnector {
        inner: inner.clone(),
        attempts: attempts.clone(),
    }));

    let clock = Arc::new(ManualClock::new(NOW));
    let sleeper = Arc::new(ManualSleeper::with_clock(clock.clone()));
    let scheduler = Scheduler::new(clock, sleeper, Duration::from_secs(60)).with_max_cycles(3);
    let mut task = AggregateTask::new(engine(db, 100));

    let (_tx, rx) = watch::channel(false);
    assert_eq!(scheduler.run(&mut task, rx).await, 3);

    // Refused, then dropped mid-write, then through.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(impact_of(inner.as_ref(), PostType::Stocktwit, 1).await, 7);
    let samples = inner.latest_samples().await.unwrap();
    assert!(samples.iter().all(|s| s.created_at_ms == NOW + 120_000));
    assert!(sample_value(&samples, STOCKTWITS).is_some());
}

// ============================================================
// Roles under the scheduler
// ============================================================

#[tokio::test]
async fn aggregate_role_skips_idle_cycles() {
    let db = sqlite_in_memory().unwrap();
    ingest_batch(
        db.as_ref(),
        &[
            scored_stocktwit(1, 0.8, NOW - HOUR_MS),
            raw_stocktwit(1, 0, 3, NOW - HOUR_MS),
        ],
    )
    .await
    .unwrap();

    let clock = Arc::new(ManualClock::new(NOW));
    let sleeper = Arc::new(ManualSleeper::with_clock(clock.clone()));
    let scheduler = Scheduler::new(clock.clone(), sleeper.clone(), Duration::from_secs(60))
        .with_max_cycles(2);
    let mut task = AggregateTask::new(engine(db.clone(), 100));

    let (_tx, rx) = watch::channel(false);
    assert_eq!(scheduler.run(&mut task, rx).await, 2);
    assert_eq!(sleeper.slept(), vec![Duration::from_secs(60); 2]);

    // Only the first cycle had impact changes to aggregate.
    let samples = db.latest_samples().await.unwrap();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.created_at_ms == NOW));
}

#[tokio::test]
async fn ingest_role_consumes_the_stream() {
    let db = sqlite_in_memory().unwrap();
    let lines = [
        scored_stocktwit(1, 0.8, NOW - HOUR_MS),
        raw_stocktwit(1, 1, 1, NOW - HOUR_MS),
        external("tipranks-news-sentiment", "current_buzz", 70.0, NOW - HOUR_MS),
    ]
    .iter()
    .map(|e| serde_json::to_string(e).unwrap() + "\n")
    .collect::<String>();
    let input: &'static [u8] = Box::leak(lines.into_bytes().into_boxed_slice());

    let clock = Arc::new(ManualClock::new(NOW));
    let sleeper = Arc::new(ManualSleeper::with_clock(clock.clone()));
    let batcher = StreamBatcher::new(
        input,
        10,
        Duration::from_millis(50),
        sleeper.clone() as Arc<dyn Sleeper>,
    );
    let mut task = IngestTask::new(batcher, engine(db.clone(), 100));
    let scheduler = Scheduler::new(clock, sleeper, Duration::ZERO).with_max_cycles(1);

    let (_tx, rx) = watch::channel(false);
    assert_eq!(scheduler.run(&mut task, rx).await, 1);

    assert_eq!(impact_of(db.as_ref(), PostType::Stocktwit, 1).await, 3);
    assert_eq!(task.engine().cache().len(), 1);
    let samples = db.latest_samples().await.unwrap();
    assert!(sample_value(&samples, STOCKTWITS).is_some());
    assert!((sample_value(&samples, NEWS_EXTERNAL_ENSEMBLE).unwrap() - 70.0).abs() < 1e-9);
}

#[tokio::test]
async fn filter_emits_each_wanted_post_once() {
    let db = sqlite_in_memory().unwrap();
    ingest_batch(db.as_ref(), &[scored_stocktwit(1, 0.5, NOW - HOUR_MS)])
        .await
        .unwrap();

    let batcher = StreamBatcher::new(
        &b""[..],
        10,
        Duration::from_millis(50),
        Arc::new(ManualSleeper::new()) as Arc<dyn Sleeper>,
    );
    let mut task = FilterTask::new(batcher, db.clone(), TopicFilter::default(), 100, Vec::new());

    let batch = || {
        vec![
            // Already scored.
            raw_stocktwit(1, 0, 0, NOW - HOUR_MS),
            raw_stocktwit(2, 0, 0, NOW - HOUR_MS),
            raw_stocktwit(2, 0, 0, NOW - HOUR_MS),
            raw_tweet("twitter-topic", 3, "Tesla deliveries beat", 0, 0),
            raw_tweet("twitter-topic", 4, "RT @someone: tesla", 0, 0),
            raw_tweet("twitter-user", 5, "lunch was great", 0, 0),
        ]
    };

    assert_eq!(task.filter_batch(batch()).await.unwrap(), 2);
    assert_eq!(task.filter_batch(batch()).await.unwrap(), 0);

    let output = String::from_utf8(task.output().clone()).unwrap();
    let requests: Vec<Value> = output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["msgType"], "stocktwit-sentiment-request");
    assert_eq!(requests[0]["data"]["text"], "$TSLA board post 2");
    assert!(requests[0]["data"].get("body").is_none());
    assert_eq!(requests[1]["msgType"], "twitter-topic-sentiment-request");
    assert_eq!(requests[1]["data"]["id"], 3);
}
