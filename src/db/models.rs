// Data models — Rust structs that map to database rows.
//
// These are the types that flow through the engine. They're separate from
// the database queries so other modules can use them without depending on
// rusqlite or sqlx directly.

use serde::{Deserialize, Serialize};

/// Source category of a post.
///
/// The tags are the ones used on the wire and in the `post_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PostType {
    /// Message-board post (StockTwits).
    #[serde(rename = "stocktwit")]
    Stocktwit,
    /// Tweet picked up by a topic search.
    #[serde(rename = "twitter-topic")]
    TwitterTopic,
    /// Tweet from a followed user timeline.
    #[serde(rename = "twitter-user")]
    TwitterUser,
}

impl PostType {
    pub const ALL: [PostType; 3] = [
        PostType::Stocktwit,
        PostType::TwitterTopic,
        PostType::TwitterUser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Stocktwit => "stocktwit",
            PostType::TwitterTopic => "twitter-topic",
            PostType::TwitterUser => "twitter-user",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "stocktwit" => Some(PostType::Stocktwit),
            "twitter-topic" => Some(PostType::TwitterTopic),
            "twitter-user" => Some(PostType::TwitterUser),
            _ => None,
        }
    }

    /// Whether the post comes from the larger social network, where a
    /// share reaches further than a reply on the message board.
    pub fn is_high_reach(&self) -> bool {
        matches!(self, PostType::TwitterTopic | PostType::TwitterUser)
    }
}

impl std::fmt::Display for PostType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Global identity of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostKey {
    pub post_type: PostType,
    pub post_id: i64,
}

impl PostKey {
    pub fn new(post_type: PostType, post_id: i64) -> Self {
        Self { post_type, post_id }
    }
}

impl std::fmt::Display for PostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.post_type, self.post_id)
    }
}

/// Engagement counters as last observed for a post. Used only for equality
/// checks in the change cache; never persisted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementSnapshot {
    pub post_type: PostType,
    /// Replies (message board) or retweets (Twitter).
    pub interaction_total: i64,
    pub likes_total: i64,
}

/// A recently-scored post together with its current engagement counters,
/// as returned by the store's engagement query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostEngagement {
    pub post_type: PostType,
    pub post_id: i64,
    pub interaction_total: i64,
    pub likes_total: i64,
}

impl PostEngagement {
    pub fn key(&self) -> PostKey {
        PostKey::new(self.post_type, self.post_id)
    }

    pub fn snapshot(&self) -> EngagementSnapshot {
        EngagementSnapshot {
            post_type: self.post_type,
            interaction_total: self.interaction_total,
            likes_total: self.likes_total,
        }
    }
}

/// One engagement reading taken from a raw source feed.
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementObservation {
    pub post_type: PostType,
    pub post_id: i64,
    pub interaction_total: i64,
    pub likes_total: i64,
    pub observed_at_ms: i64,
}

/// A post that has been through the sentiment classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostSentiment {
    pub post_type: PostType,
    pub post_id: i64,
    pub body: String,
    pub link: String,
    pub user_name: String,
    pub sentiment_ml_model: f64,
    pub sentiment_vader_normalized: f64,
    /// Blended classifier output in [0, 1]; 0.5 is neutral.
    pub sentiment_mixed: f64,
    pub impact: i64,
    pub created_at_ms: i64,
    pub client_received_ms: i64,
}

impl PostSentiment {
    pub fn key(&self) -> PostKey {
        PostKey::new(self.post_type, self.post_id)
    }
}

/// A new impact value for one post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImpactChange {
    pub post_type: PostType,
    pub post_id: i64,
    pub impact: i64,
}

/// The two columns the aggregator needs from a scored post.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPost {
    pub impact: i64,
    pub sentiment_mixed: f64,
}

/// Which external ensemble a third-party feed contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternalCategory {
    Social,
    News,
}

impl ExternalCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalCategory::Social => "social",
            ExternalCategory::News => "news",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "social" => Some(ExternalCategory::Social),
            "news" => Some(ExternalCategory::News),
            _ => None,
        }
    }
}

/// Third-party sentiment feeds ingested as already-scored samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternalFeed {
    StocktwitsSentiment,
    Stockfluence,
    Benzinga,
    TipranksNews,
}

impl ExternalFeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalFeed::StocktwitsSentiment => "stocktwits-sentiment",
            ExternalFeed::Stockfluence => "stockfluence-sentiment",
            ExternalFeed::Benzinga => "benzinga-sentiment",
            ExternalFeed::TipranksNews => "tipranks-news-sentiment",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "stocktwits-sentiment" => Some(ExternalFeed::StocktwitsSentiment),
            "stockfluence-sentiment" => Some(ExternalFeed::Stockfluence),
            "benzinga-sentiment" => Some(ExternalFeed::Benzinga),
            "tipranks-news-sentiment" => Some(ExternalFeed::TipranksNews),
            _ => None,
        }
    }

    pub fn category(&self) -> ExternalCategory {
        match self {
            ExternalFeed::StocktwitsSentiment | ExternalFeed::Stockfluence => {
                ExternalCategory::Social
            }
            ExternalFeed::Benzinga | ExternalFeed::TipranksNews => ExternalCategory::News,
        }
    }

    /// The `data` field holding the feed's score.
    pub fn value_field(&self) -> &'static str {
        match self {
            ExternalFeed::StocktwitsSentiment => "sentiment_percent",
            ExternalFeed::Stockfluence => "sentiment_score",
            ExternalFeed::Benzinga => "news_sentiment_score",
            ExternalFeed::TipranksNews => "current_buzz",
        }
    }

    /// Map the feed's native range onto its category's shared range.
    /// Stockfluence scores 0-200 where StockTwits reports a 0-100 percentage.
    pub fn normalize(&self, raw: f64) -> f64 {
        match self {
            ExternalFeed::Stockfluence => 0.5 * raw,
            _ => raw,
        }
    }
}

/// An already-scored reading from a third-party feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSample {
    pub feed: ExternalFeed,
    pub received_at_ms: i64,
    pub sentiment_absolute: f64,
}

/// One point of an aggregate sentiment series. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSentimentSample {
    pub sentiment_type: String,
    /// Width of the trailing window this sample summarizes.
    pub sentiment_seconds_back: i64,
    pub created_at_ms: i64,
    pub sentiment_absolute: f64,
}
