// Database schema — table creation and migrations (SQLite).
//
// We use a simple version-based migration approach: a `schema_version` table
// tracks which migrations have run, and each migration is a function that
// executes SQL statements.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all tables if they don't exist yet.
///
/// This is idempotent — safe to call on every startup.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Tracks schema version for future migrations
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Posts that came back from the sentiment classifier
        CREATE TABLE IF NOT EXISTS posts_sentiment (
            post_type TEXT NOT NULL,                  -- stocktwit / twitter-topic / twitter-user
            post_id INTEGER NOT NULL,
            body TEXT NOT NULL,
            link TEXT NOT NULL,
            user_name TEXT NOT NULL,
            sentiment_ml_model REAL NOT NULL,
            sentiment_vader_normalized REAL NOT NULL,
            sentiment_mixed REAL NOT NULL,            -- 0.0 to 1.0, 0.5 neutral
            impact INTEGER NOT NULL DEFAULT 1 CHECK (impact >= 1),
            created_at_ms INTEGER NOT NULL,
            client_received_ms INTEGER NOT NULL,
            PRIMARY KEY (post_type, post_id)
        );

        -- Latest engagement counters seen in the raw feeds
        CREATE TABLE IF NOT EXISTS post_engagement (
            post_type TEXT NOT NULL,
            post_id INTEGER NOT NULL,
            interaction_total INTEGER NOT NULL DEFAULT 0,  -- replies or retweets
            likes_total INTEGER NOT NULL DEFAULT 0,
            observed_at_ms INTEGER NOT NULL,
            PRIMARY KEY (post_type, post_id)
        );

        -- Already-scored third-party sentiment readings
        CREATE TABLE IF NOT EXISTS external_sentiment (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            feed TEXT NOT NULL,
            category TEXT NOT NULL,                   -- social / news
            received_at_ms INTEGER NOT NULL,
            sentiment_absolute REAL NOT NULL
        );

        -- Aggregate sentiment series (append-only)
        CREATE TABLE IF NOT EXISTS global_sentiment (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sentiment_type TEXT NOT NULL,
            sentiment_seconds_back INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL,
            sentiment_absolute REAL NOT NULL
        );

        -- Window scans over recent posts
        CREATE INDEX IF NOT EXISTS idx_posts_created
            ON posts_sentiment(created_at_ms);

        -- Window scans over external readings
        CREATE INDEX IF NOT EXISTS idx_external_category_received
            ON external_sentiment(category, received_at_ms);
        ",
    )
    .context("Failed to create database tables")?;

    // Record initial schema version if not already set
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [1],
    )?;

    // Migration v2: index for "latest sample per series" lookups.
    // Consumers read the newest row of each (type, window) pair.
    run_migration(conn, 2, |c| {
        c.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_global_series
                ON global_sentiment(sentiment_type, sentiment_seconds_back, created_at_ms);",
        )
    })?;

    Ok(())
}

/// Run a migration if it hasn't been applied yet.
/// The migration function receives the connection and should execute its SQL.
fn run_migration<F>(conn: &Connection, version: i64, migrate: F) -> Result<()>
where
    F: FnOnce(&Connection) -> rusqlite::Result<()>,
{
    let already_applied: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM schema_version WHERE version = ?1",
        [version],
        |row| row.get(0),
    )?;

    if !already_applied {
        migrate(conn).with_context(|| format!("Migration v{version} failed"))?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}

/// Count the number of tables in the database (useful for init confirmation).
pub fn table_count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )
}
