// Database queries — single-row operations for all SQLite tables.
//
// Every SQLite interaction goes through this module. This keeps SQL
// contained in one place and gives the rest of the app clean Rust interfaces.
// Batching and per-record isolation live in sqlite.rs.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{
    EngagementObservation, ExternalCategory, ExternalSample, GlobalSentimentSample, ImpactChange,
    PostEngagement, PostKey, PostSentiment, PostType, WindowPost,
};

impl ToSql for PostType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PostType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let tag = value.as_str()?;
        PostType::from_tag(tag).ok_or_else(|| FromSqlError::Other(format!("unknown post_type {tag}").into()))
    }
}

// --- Posts ---

/// Insert a scored post, or refresh its content if it's already stored.
/// `impact` and `created_at_ms` of an existing row are never overwritten.
pub fn upsert_post(conn: &Connection, post: &PostSentiment) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO posts_sentiment
            (post_type, post_id, body, link, user_name, sentiment_ml_model,
             sentiment_vader_normalized, sentiment_mixed, impact, created_at_ms,
             client_received_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(post_type, post_id) DO UPDATE SET
            body = excluded.body,
            link = excluded.link,
            user_name = excluded.user_name,
            sentiment_ml_model = excluded.sentiment_ml_model,
            sentiment_vader_normalized = excluded.sentiment_vader_normalized,
            sentiment_mixed = excluded.sentiment_mixed,
            client_received_ms = excluded.client_received_ms",
    )?
    .execute(params![
        post.post_type,
        post.post_id,
        post.body,
        post.link,
        post.user_name,
        post.sentiment_ml_model,
        post.sentiment_vader_normalized,
        post.sentiment_mixed,
        post.impact,
        post.created_at_ms,
        post.client_received_ms,
    ])?;
    Ok(())
}

/// Whether a scored row exists for this identity.
pub fn post_exists(conn: &Connection, key: &PostKey) -> rusqlite::Result<bool> {
    conn.prepare_cached(
        "SELECT COUNT(*) > 0 FROM posts_sentiment WHERE post_type = ?1 AND post_id = ?2",
    )?
    .query_row(params![key.post_type, key.post_id], |row| row.get(0))
}

/// Load one scored post.
pub fn get_post(conn: &Connection, key: &PostKey) -> rusqlite::Result<Option<PostSentiment>> {
    conn.prepare_cached(
        "SELECT post_type, post_id, body, link, user_name, sentiment_ml_model,
                sentiment_vader_normalized, sentiment_mixed, impact, created_at_ms,
                client_received_ms
         FROM posts_sentiment
         WHERE post_type = ?1 AND post_id = ?2",
    )?
    .query_row(params![key.post_type, key.post_id], post_from_row)
    .optional()
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<PostSentiment> {
    Ok(PostSentiment {
        post_type: row.get(0)?,
        post_id: row.get(1)?,
        body: row.get(2)?,
        link: row.get(3)?,
        user_name: row.get(4)?,
        sentiment_ml_model: row.get(5)?,
        sentiment_vader_normalized: row.get(6)?,
        sentiment_mixed: row.get(7)?,
        impact: row.get(8)?,
        created_at_ms: row.get(9)?,
        client_received_ms: row.get(10)?,
    })
}

// --- Engagement ---

/// Record an engagement reading. Counters only ever move up: a stale
/// re-delivery of an older reading leaves the stored maximum in place.
pub fn record_engagement(conn: &Connection, obs: &EngagementObservation) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO post_engagement
            (post_type, post_id, interaction_total, likes_total, observed_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(post_type, post_id) DO UPDATE SET
            interaction_total = MAX(post_engagement.interaction_total, excluded.interaction_total),
            likes_total = MAX(post_engagement.likes_total, excluded.likes_total),
            observed_at_ms = MAX(post_engagement.observed_at_ms, excluded.observed_at_ms)",
    )?
    .execute(params![
        obs.post_type,
        obs.post_id,
        obs.interaction_total,
        obs.likes_total,
        obs.observed_at_ms,
    ])?;
    Ok(())
}

/// Current engagement of scored posts created at or after `since_ms`.
pub fn recent_engagement(conn: &Connection, since_ms: i64) -> rusqlite::Result<Vec<PostEngagement>> {
    let mut stmt = conn.prepare_cached(
        "SELECT p.post_type, p.post_id, e.interaction_total, e.likes_total
         FROM posts_sentiment p
         JOIN post_engagement e
           ON e.post_type = p.post_type AND e.post_id = p.post_id
         WHERE p.created_at_ms >= ?1
         ORDER BY p.post_type, p.post_id",
    )?;

    let rows = stmt.query_map(params![since_ms], |row| {
        Ok(PostEngagement {
            post_type: row.get(0)?,
            post_id: row.get(1)?,
            interaction_total: row.get(2)?,
            likes_total: row.get(3)?,
        })
    })?;

    rows.collect()
}

/// Set a post's impact. Returns the number of rows touched (0 if the post
/// isn't stored).
pub fn update_impact(conn: &Connection, change: &ImpactChange) -> rusqlite::Result<usize> {
    conn.prepare_cached(
        "UPDATE posts_sentiment SET impact = ?1 WHERE post_type = ?2 AND post_id = ?3",
    )?
    .execute(params![change.impact, change.post_type, change.post_id])
}

// --- Aggregation inputs ---

/// Impact and sentiment of posts of one type created in `[since_ms, until_ms]`.
pub fn window_posts(
    conn: &Connection,
    post_type: PostType,
    since_ms: i64,
    until_ms: i64,
) -> rusqlite::Result<Vec<WindowPost>> {
    let mut stmt = conn.prepare_cached(
        "SELECT impact, sentiment_mixed
         FROM posts_sentiment
         WHERE post_type = ?1 AND created_at_ms >= ?2 AND created_at_ms <= ?3",
    )?;

    let rows = stmt.query_map(params![post_type, since_ms, until_ms], |row| {
        Ok(WindowPost {
            impact: row.get(0)?,
            sentiment_mixed: row.get(1)?,
        })
    })?;

    rows.collect()
}

/// Store a third-party sentiment reading.
pub fn insert_external_sample(conn: &Connection, sample: &ExternalSample) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO external_sentiment (feed, category, received_at_ms, sentiment_absolute)
         VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![
        sample.feed.as_str(),
        sample.feed.category().as_str(),
        sample.received_at_ms,
        sample.sentiment_absolute,
    ])?;
    Ok(())
}

/// External readings of one category received in `[since_ms, until_ms]`.
pub fn external_values(
    conn: &Connection,
    category: ExternalCategory,
    since_ms: i64,
    until_ms: i64,
) -> rusqlite::Result<Vec<f64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sentiment_absolute
         FROM external_sentiment
         WHERE category = ?1 AND received_at_ms >= ?2 AND received_at_ms <= ?3",
    )?;

    let rows = stmt.query_map(params![category.as_str(), since_ms, until_ms], |row| {
        row.get(0)
    })?;

    rows.collect()
}

// --- Aggregate series ---

/// Append one aggregate sample.
pub fn insert_sample(conn: &Connection, sample: &GlobalSentimentSample) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO global_sentiment
            (sentiment_type, sentiment_seconds_back, created_at_ms, sentiment_absolute)
         VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![
        sample.sentiment_type,
        sample.sentiment_seconds_back,
        sample.created_at_ms,
        sample.sentiment_absolute,
    ])?;
    Ok(())
}

/// The newest sample of each (type, window) series.
pub fn latest_samples(conn: &Connection) -> rusqlite::Result<Vec<GlobalSentimentSample>> {
    let mut stmt = conn.prepare(
        "SELECT g.sentiment_type, g.sentiment_seconds_back, g.created_at_ms, g.sentiment_absolute
         FROM global_sentiment g
         JOIN (
            SELECT MAX(id) AS id
            FROM global_sentiment
            GROUP BY sentiment_type, sentiment_seconds_back
         ) latest ON latest.id = g.id
         ORDER BY g.sentiment_type, g.sentiment_seconds_back",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(GlobalSentimentSample {
            sentiment_type: row.get(0)?,
            sentiment_seconds_back: row.get(1)?,
            created_at_ms: row.get(2)?,
            sentiment_absolute: row.get(3)?,
        })
    })?;

    rows.collect()
}
