// SqliteDatabase — rusqlite backend implementing the Database trait.
//
// The Connection is wrapped in tokio::sync::Mutex because Connection is !Send.
// Trait methods lock the mutex, do synchronous rusqlite work, and return.
// The lock is never held across .await points.
//
// Batch writes open one transaction and wrap each record in a savepoint, so
// a failing row rolls back alone and the rest of the batch still commits.

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::error::{StoreError, StoreResult};
use super::models::{
    EngagementObservation, ExternalCategory, ExternalSample, GlobalSentimentSample, ImpactChange,
    PostEngagement, PostKey, PostSentiment, PostType, WindowPost,
};
use super::queries;
use super::traits::{BatchOutcome, Database};

pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Wrap an already-opened rusqlite Connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

/// Failures to begin or finish the transaction invalidate the whole batch.
fn session_error(err: rusqlite::Error) -> StoreError {
    StoreError::Connection(err.to_string())
}

/// Apply `op` to every item inside one transaction, one savepoint per item.
fn isolated_batch<T>(
    conn: &mut Connection,
    items: &[T],
    mut op: impl FnMut(&Connection, &T) -> StoreResult<()>,
) -> StoreResult<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    if items.is_empty() {
        return Ok(outcome);
    }

    let mut tx = conn.transaction().map_err(session_error)?;
    for (index, item) in items.iter().enumerate() {
        let savepoint = tx.savepoint().map_err(session_error)?;
        let result = op(&savepoint, item);
        if result.is_ok() {
            savepoint.commit().map_err(session_error)?;
        }
        // A savepoint dropped without commit rolls back to where it started.
        outcome.record(index, result);
    }
    tx.commit().map_err(session_error)?;

    Ok(outcome)
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn table_count(&self) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        Ok(super::schema::table_count(&conn)?)
    }

    async fn upsert_posts(&self, posts: &[PostSentiment]) -> StoreResult<BatchOutcome> {
        let mut conn = self.conn.lock().await;
        isolated_batch(&mut conn, posts, |c, post| {
            Ok(queries::upsert_post(c, post)?)
        })
    }

    async fn existing_post_keys(&self, keys: &[PostKey]) -> StoreResult<Vec<PostKey>> {
        let conn = self.conn.lock().await;
        let mut existing = Vec::new();
        for key in keys {
            if queries::post_exists(&conn, key)? {
                existing.push(*key);
            }
        }
        Ok(existing)
    }

    async fn get_post(&self, key: &PostKey) -> StoreResult<Option<PostSentiment>> {
        let conn = self.conn.lock().await;
        Ok(queries::get_post(&conn, key)?)
    }

    async fn record_engagement(
        &self,
        observations: &[EngagementObservation],
    ) -> StoreResult<BatchOutcome> {
        let mut conn = self.conn.lock().await;
        isolated_batch(&mut conn, observations, |c, obs| {
            Ok(queries::record_engagement(c, obs)?)
        })
    }

    async fn recent_engagement(&self, since_ms: i64) -> StoreResult<Vec<PostEngagement>> {
        let conn = self.conn.lock().await;
        Ok(queries::recent_engagement(&conn, since_ms)?)
    }

    async fn update_impacts(&self, changes: &[ImpactChange]) -> StoreResult<BatchOutcome> {
        let mut conn = self.conn.lock().await;
        isolated_batch(&mut conn, changes, |c, change| {
            match queries::update_impact(c, change)? {
                0 => Err(StoreError::Record(format!(
                    "no stored post {}:{}",
                    change.post_type, change.post_id
                ))),
                _ => Ok(()),
            }
        })
    }

    async fn window_posts(
        &self,
        post_types: &[PostType],
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<WindowPost>> {
        let conn = self.conn.lock().await;
        let mut rows = Vec::new();
        for post_type in post_types {
            rows.extend(queries::window_posts(&conn, *post_type, since_ms, until_ms)?);
        }
        Ok(rows)
    }

    async fn insert_external_samples(
        &self,
        samples: &[ExternalSample],
    ) -> StoreResult<BatchOutcome> {
        let mut conn = self.conn.lock().await;
        isolated_batch(&mut conn, samples, |c, sample| {
            Ok(queries::insert_external_sample(c, sample)?)
        })
    }

    async fn external_values(
        &self,
        category: ExternalCategory,
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<f64>> {
        let conn = self.conn.lock().await;
        Ok(queries::external_values(&conn, category, since_ms, until_ms)?)
    }

    async fn insert_samples(
        &self,
        samples: &[GlobalSentimentSample],
    ) -> StoreResult<BatchOutcome> {
        let mut conn = self.conn.lock().await;
        isolated_batch(&mut conn, samples, |c, sample| {
            Ok(queries::insert_sample(c, sample)?)
        })
    }

    async fn latest_samples(&self) -> StoreResult<Vec<GlobalSentimentSample>> {
        let conn = self.conn.lock().await;
        Ok(queries::latest_samples(&conn)?)
    }
}
