// PgDatabase — PostgreSQL backend implementing the Database trait.
//
// Uses sqlx PgPool for native async queries. All queries use runtime
// parameter binding (not compile-time macros) to avoid requiring
// DATABASE_URL at compile time.
//
// Key differences from SQLite:
// - BIGINT / DOUBLE PRECISION instead of INTEGER / REAL
// - GREATEST() instead of scalar MAX() for the engagement running max
// - DISTINCT ON for the latest sample of each series
// - GENERATED ALWAYS AS IDENTITY for auto-increment

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx_core::pool::Pool;
use sqlx_core::query::Query;
use sqlx_core::row::Row;
use sqlx_core::transaction::Transaction;
use sqlx_postgres::{PgArguments, PgRow, Postgres};

use super::error::{StoreError, StoreResult};
use super::models::{
    EngagementObservation, ExternalCategory, ExternalSample, GlobalSentimentSample, ImpactChange,
    PostEngagement, PostKey, PostSentiment, PostType, WindowPost,
};
use super::traits::{BatchOutcome, Database};

/// Type alias for the PostgreSQL connection pool.
pub type PgPool = Pool<Postgres>;

pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Connect to PostgreSQL and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending migrations.
    ///
    /// Holds a session-level advisory lock on a dedicated connection while
    /// migrating, so two processes starting together don't race to apply the
    /// same migration. The unlock always runs, even if a migration fails.
    async fn run_migrations(&self) -> Result<()> {
        // ASCII "BULLBEAR" as a big-endian i64.
        const MIGRATION_LOCK_KEY: i64 = 0x42554C4C42454152_u64 as i64;

        let mut lock_conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for migration advisory lock")?;

        sqlx_core::query::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await
            .context("Failed to acquire migration advisory lock")?;

        let migration_result: Result<()> = async {
            sqlx_core::query::query(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
            )
            .execute(&self.pool)
            .await?;

            let migrations = [
                (
                    1,
                    include_str!("../../migrations/postgres/0001_initial.sql"),
                ),
                (
                    2,
                    include_str!("../../migrations/postgres/0002_series_index.sql"),
                ),
            ];

            for (version, sql) in migrations {
                let applied: bool = sqlx_core::query::query(
                    "SELECT COUNT(*) > 0 FROM schema_version WHERE version = $1",
                )
                .bind(version)
                .fetch_one(&self.pool)
                .await
                .map(|row| row.get::<bool, _>(0))
                .unwrap_or(false);

                if !applied {
                    // Schema change and schema_version insert commit together.
                    let mut tx = self.pool.begin().await?;
                    sqlx_core::raw_sql::raw_sql(sql).execute(&mut *tx).await?;
                    tx.commit().await?;
                }
            }

            Ok(())
        }
        .await;

        let unlock_result = sqlx_core::query::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await
            .context("Failed to release migration advisory lock");

        // Migration error takes priority over unlock error.
        migration_result?;
        unlock_result?;

        Ok(())
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

fn session_error(err: sqlx_core::Error) -> StoreError {
    StoreError::Connection(err.to_string())
}

/// One transaction with a savepoint around every record.
///
/// A record whose statement fails is rolled back to its savepoint and
/// reported in the outcome. Only failures of the transaction itself (begin,
/// savepoint bookkeeping, commit) abort the batch.
struct RecordBatch {
    tx: Transaction<'static, Postgres>,
    next_index: usize,
    outcome: BatchOutcome,
}

impl RecordBatch {
    async fn begin(pool: &PgPool) -> StoreResult<Self> {
        let tx = pool.begin().await.map_err(session_error)?;
        Ok(Self {
            tx,
            next_index: 0,
            outcome: BatchOutcome::default(),
        })
    }

    async fn apply(&mut self, query: PgQuery<'_>) -> StoreResult<()> {
        self.apply_inner(query, false).await
    }

    /// Like `apply`, but an update that touches no row counts as a failure.
    async fn apply_update(&mut self, query: PgQuery<'_>) -> StoreResult<()> {
        self.apply_inner(query, true).await
    }

    async fn apply_inner(&mut self, query: PgQuery<'_>, require_row: bool) -> StoreResult<()> {
        let index = self.next_index;
        self.next_index += 1;

        sqlx_core::query::query("SAVEPOINT record")
            .execute(&mut *self.tx)
            .await
            .map_err(session_error)?;

        let result = match query.execute(&mut *self.tx).await {
            Ok(done) if require_row && done.rows_affected() == 0 => {
                Err(StoreError::Record("no stored row matched".to_string()))
            }
            Ok(_) => Ok(()),
            Err(err) => Err(StoreError::from(err)),
        };

        let release = if result.is_ok() {
            "RELEASE SAVEPOINT record"
        } else {
            "ROLLBACK TO SAVEPOINT record"
        };
        sqlx_core::query::query(release)
            .execute(&mut *self.tx)
            .await
            .map_err(session_error)?;

        self.outcome.record(index, result);
        Ok(())
    }

    async fn commit(self) -> StoreResult<BatchOutcome> {
        self.tx.commit().await.map_err(session_error)?;
        Ok(self.outcome)
    }
}

fn post_type_column(row: &PgRow, index: usize) -> StoreResult<PostType> {
    let tag = row.get::<String, _>(index);
    PostType::from_tag(&tag)
        .ok_or_else(|| StoreError::Record(format!("unknown post_type {tag}")))
}

#[async_trait]
impl Database for PgDatabase {
    async fn table_count(&self) -> StoreResult<i64> {
        let row = sqlx_core::query::query(
            "SELECT COUNT(*)::bigint FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0))
    }

    async fn upsert_posts(&self, posts: &[PostSentiment]) -> StoreResult<BatchOutcome> {
        if posts.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut batch = RecordBatch::begin(&self.pool).await?;
        for post in posts {
            batch
                .apply(
                    sqlx_core::query::query(
                        "INSERT INTO posts_sentiment
                            (post_type, post_id, body, link, user_name, sentiment_ml_model,
                             sentiment_vader_normalized, sentiment_mixed, impact,
                             created_at_ms, client_received_ms)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                         ON CONFLICT(post_type, post_id) DO UPDATE SET
                            body = EXCLUDED.body,
                            link = EXCLUDED.link,
                            user_name = EXCLUDED.user_name,
                            sentiment_ml_model = EXCLUDED.sentiment_ml_model,
                            sentiment_vader_normalized = EXCLUDED.sentiment_vader_normalized,
                            sentiment_mixed = EXCLUDED.sentiment_mixed,
                            client_received_ms = EXCLUDED.client_received_ms",
                    )
                    .bind(post.post_type.as_str())
                    .bind(post.post_id)
                    .bind(&post.body)
                    .bind(&post.link)
                    .bind(&post.user_name)
                    .bind(post.sentiment_ml_model)
                    .bind(post.sentiment_vader_normalized)
                    .bind(post.sentiment_mixed)
                    .bind(post.impact)
                    .bind(post.created_at_ms)
                    .bind(post.client_received_ms),
                )
                .await?;
        }
        batch.commit().await
    }

    async fn existing_post_keys(&self, keys: &[PostKey]) -> StoreResult<Vec<PostKey>> {
        let mut existing = Vec::new();
        for key in keys {
            let row = sqlx_core::query::query(
                "SELECT 1 FROM posts_sentiment WHERE post_type = $1 AND post_id = $2",
            )
            .bind(key.post_type.as_str())
            .bind(key.post_id)
            .fetch_optional(&self.pool)
            .await?;
            if row.is_some() {
                existing.push(*key);
            }
        }
        Ok(existing)
    }

    async fn get_post(&self, key: &PostKey) -> StoreResult<Option<PostSentiment>> {
        let row = sqlx_core::query::query(
            "SELECT post_type, post_id, body, link, user_name, sentiment_ml_model,
                    sentiment_vader_normalized, sentiment_mixed, impact, created_at_ms,
                    client_received_ms
             FROM posts_sentiment
             WHERE post_type = $1 AND post_id = $2",
        )
        .bind(key.post_type.as_str())
        .bind(key.post_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(PostSentiment {
                post_type: post_type_column(&r, 0)?,
                post_id: r.get(1),
                body: r.get(2),
                link: r.get(3),
                user_name: r.get(4),
                sentiment_ml_model: r.get(5),
                sentiment_vader_normalized: r.get(6),
                sentiment_mixed: r.get(7),
                impact: r.get(8),
                created_at_ms: r.get(9),
                client_received_ms: r.get(10),
            })),
            None => Ok(None),
        }
    }

    async fn record_engagement(
        &self,
        observations: &[EngagementObservation],
    ) -> StoreResult<BatchOutcome> {
        if observations.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut batch = RecordBatch::begin(&self.pool).await?;
        for obs in observations {
            batch
                .apply(
                    sqlx_core::query::query(
                        "INSERT INTO post_engagement
                            (post_type, post_id, interaction_total, likes_total, observed_at_ms)
                         VALUES ($1, $2, $3, $4, $5)
                         ON CONFLICT(post_type, post_id) DO UPDATE SET
                            interaction_total = GREATEST(post_engagement.interaction_total, EXCLUDED.interaction_total),
                            likes_total = GREATEST(post_engagement.likes_total, EXCLUDED.likes_total),
                            observed_at_ms = GREATEST(post_engagement.observed_at_ms, EXCLUDED.observed_at_ms)",
                    )
                    .bind(obs.post_type.as_str())
                    .bind(obs.post_id)
                    .bind(obs.interaction_total)
                    .bind(obs.likes_total)
                    .bind(obs.observed_at_ms),
                )
                .await?;
        }
        batch.commit().await
    }

    async fn recent_engagement(&self, since_ms: i64) -> StoreResult<Vec<PostEngagement>> {
        let rows = sqlx_core::query::query(
            "SELECT p.post_type, p.post_id, e.interaction_total, e.likes_total
             FROM posts_sentiment p
             JOIN post_engagement e
               ON e.post_type = p.post_type AND e.post_id = p.post_id
             WHERE p.created_at_ms >= $1
             ORDER BY p.post_type, p.post_id",
        )
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(PostEngagement {
                    post_type: post_type_column(r, 0)?,
                    post_id: r.get(1),
                    interaction_total: r.get(2),
                    likes_total: r.get(3),
                })
            })
            .collect()
    }

    async fn update_impacts(&self, changes: &[ImpactChange]) -> StoreResult<BatchOutcome> {
        if changes.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut batch = RecordBatch::begin(&self.pool).await?;
        for change in changes {
            batch
                .apply_update(
                    sqlx_core::query::query(
                        "UPDATE posts_sentiment SET impact = $1
                         WHERE post_type = $2 AND post_id = $3",
                    )
                    .bind(change.impact)
                    .bind(change.post_type.as_str())
                    .bind(change.post_id),
                )
                .await?;
        }
        batch.commit().await
    }

    async fn window_posts(
        &self,
        post_types: &[PostType],
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<WindowPost>> {
        let tags: Vec<String> = post_types.iter().map(|t| t.as_str().to_string()).collect();
        let rows = sqlx_core::query::query(
            "SELECT impact, sentiment_mixed
             FROM posts_sentiment
             WHERE post_type = ANY($1) AND created_at_ms >= $2 AND created_at_ms <= $3",
        )
        .bind(tags)
        .bind(since_ms)
        .bind(until_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| WindowPost {
                impact: r.get(0),
                sentiment_mixed: r.get(1),
            })
            .collect())
    }

    async fn insert_external_samples(
        &self,
        samples: &[ExternalSample],
    ) -> StoreResult<BatchOutcome> {
        if samples.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut batch = RecordBatch::begin(&self.pool).await?;
        for sample in samples {
            batch
                .apply(
                    sqlx_core::query::query(
                        "INSERT INTO external_sentiment
                            (feed, category, received_at_ms, sentiment_absolute)
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(sample.feed.as_str())
                    .bind(sample.feed.category().as_str())
                    .bind(sample.received_at_ms)
                    .bind(sample.sentiment_absolute),
                )
                .await?;
        }
        batch.commit().await
    }

    async fn external_values(
        &self,
        category: ExternalCategory,
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<f64>> {
        let rows = sqlx_core::query::query(
            "SELECT sentiment_absolute
             FROM external_sentiment
             WHERE category = $1 AND received_at_ms >= $2 AND received_at_ms <= $3",
        )
        .bind(category.as_str())
        .bind(since_ms)
        .bind(until_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get::<f64, _>(0)).collect())
    }

    async fn insert_samples(
        &self,
        samples: &[GlobalSentimentSample],
    ) -> StoreResult<BatchOutcome> {
        if samples.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut batch = RecordBatch::begin(&self.pool).await?;
        for sample in samples {
            batch
                .apply(
                    sqlx_core::query::query(
                        "INSERT INTO global_sentiment
                            (sentiment_type, sentiment_seconds_back, created_at_ms,
                             sentiment_absolute)
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(&sample.sentiment_type)
                    .bind(sample.sentiment_seconds_back)
                    .bind(sample.created_at_ms)
                    .bind(sample.sentiment_absolute),
                )
                .await?;
        }
        batch.commit().await
    }

    async fn latest_samples(&self) -> StoreResult<Vec<GlobalSentimentSample>> {
        let rows = sqlx_core::query::query(
            "SELECT DISTINCT ON (sentiment_type, sentiment_seconds_back)
                    sentiment_type, sentiment_seconds_back, created_at_ms, sentiment_absolute
             FROM global_sentiment
             ORDER BY sentiment_type, sentiment_seconds_back, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| GlobalSentimentSample {
                sentiment_type: r.get(0),
                sentiment_seconds_back: r.get(1),
                created_at_ms: r.get(2),
                sentiment_absolute: r.get(3),
            })
            .collect())
    }
}
