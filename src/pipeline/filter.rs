// Filter role — pick raw posts worth sending to the sentiment classifier.
//
// Message board posts are all kept. Tweets are kept only when they mention
// one of the topic keywords and aren't retweets. Each post is emitted once:
// a bounded LRU remembers what was already emitted, and the store is asked
// which candidates already have a scored row. Survivors are rewritten into
// `<type>-sentiment-request` records on the output, one JSON line each.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::cache::LruCache;
use crate::db::models::PostKey;
use crate::db::Database;
use crate::scheduler::CycleTask;
use crate::stream::{Envelope, RawPost, Record, StreamBatcher};

/// Keywords a tweet must mention to be scored.
pub const DEFAULT_TOPIC_KEYWORDS: [&str; 6] =
    ["elon musk", "tesla", "tsla", "tslaq", "elonmusk", "model 3"];

/// Case-insensitive keyword match over post text.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    keywords: Vec<String>,
}

impl Default for TopicFilter {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_KEYWORDS.iter().map(|k| k.to_string()))
    }
}

impl TopicFilter {
    pub fn new(keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Whether this raw post should go to the classifier.
    pub fn wants(&self, post: &RawPost) -> bool {
        if !post.post_type.is_high_reach() {
            return true;
        }
        let text = post.text.to_lowercase();
        if text.starts_with("rt ") {
            return false;
        }
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

/// The `filter` role as a scheduler task.
pub struct FilterTask<R, W> {
    batcher: StreamBatcher<R, Envelope>,
    db: Arc<dyn Database>,
    topics: TopicFilter,
    emitted: LruCache<PostKey, ()>,
    out: W,
    pending: Vec<Envelope>,
}

impl<R, W> FilterTask<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        batcher: StreamBatcher<R, Envelope>,
        db: Arc<dyn Database>,
        topics: TopicFilter,
        capacity: usize,
        out: W,
    ) -> Self {
        Self {
            batcher,
            db,
            topics,
            emitted: LruCache::new(capacity),
            out,
            pending: Vec::new(),
        }
    }

    /// The output sink (tests read emitted records back from it).
    pub fn output(&self) -> &W {
        &self.out
    }

    /// Candidates of a batch: wanted, not yet emitted, first
    /// occurrence within the batch.
    fn candidates(&self, batch: Vec<Envelope>) -> Vec<(PostKey, Envelope)> {
        let mut seen_in_batch = HashSet::new();
        let mut candidates = Vec::new();

        for envelope in batch {
            let post = match Record::parse(&envelope) {
                Ok(Some(Record::RawPost(post))) => post,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Dropping invalid record");
                    continue;
                }
            };
            let key = post.key();
            if !self.topics.wants(&post)
                || self.emitted.contains(&key)
                || !seen_in_batch.insert(key)
            {
                continue;
            }
            candidates.push((key, envelope));
        }

        candidates
    }

    /// Filter one batch and write the resulting requests. Returns how many
    /// were emitted.
    pub async fn filter_batch(&mut self, batch: Vec<Envelope>) -> Result<usize> {
        let candidates = self.candidates(batch);
        if candidates.is_empty() {
            return Ok(0);
        }

        let keys: Vec<PostKey> = candidates.iter().map(|(key, _)| *key).collect();
        // Without the store we may re-request a post that was already
        // scored; the ingest side upserts, so that's harmless.
        let already_scored: HashSet<PostKey> = match self.db.existing_post_keys(&keys).await {
            Ok(existing) => existing.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Could not check for already-scored posts");
                HashSet::new()
            }
        };

        let mut emitted = 0;
        for (key, envelope) in candidates {
            self.emitted.put(key, ());
            if already_scored.contains(&key) {
                continue;
            }
            let mut line = serde_json::to_string(&envelope.into_sentiment_request())
                .context("Failed to encode sentiment request")?;
            line.push('\n');
            self.out
                .write_all(line.as_bytes())
                .await
                .context("Failed to write sentiment request")?;
            emitted += 1;
        }
        self.out.flush().await.context("Failed to flush output")?;

        Ok(emitted)
    }
}

#[async_trait]
impl<R, W> CycleTask for FilterTask<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn ready(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            self.pending = self.batcher.next_batch().await;
        }
        Ok(())
    }

    async fn run_cycle(&mut self, _now_ms: i64) -> Result<()> {
        let batch = std::mem::take(&mut self.pending);
        let received = batch.len();
        let emitted = self.filter_batch(batch).await?;
        info!(received, emitted, "Emitted records for inference");
        Ok(())
    }
}
