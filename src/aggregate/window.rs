// Trailing windows and the impact-weighted sentiment of the posts in them.
//
// A post's contribution is `impact * (sentiment_mixed - 0.5)`: positive when
// bullish, negative when bearish, scaled by how much engagement it drew. How
// the sum is normalized is a named policy, chosen per series.

use crate::db::models::WindowPost;

/// Neutral point of the classifier's sentiment scale.
pub const NEUTRAL_SENTIMENT: f64 = 0.5;

/// How the sum of weighted contributions is normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// Divide by the number of posts: the average weighted contribution.
    #[default]
    PerRow,
    /// Divide by the total impact: a true weighted mean of the offsets.
    ImpactWeighted,
}

impl Normalization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Normalization::PerRow => "per-row",
            Normalization::ImpactWeighted => "impact-weighted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "per-row" | "per_row" | "count" => Some(Normalization::PerRow),
            "impact-weighted" | "impact_weighted" | "impact" => Some(Normalization::ImpactWeighted),
            _ => None,
        }
    }
}

impl std::fmt::Display for Normalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A trailing window `[now - width, now]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    seconds: i64,
}

impl Window {
    /// Twelve hours, the window every series is published for by default.
    pub const DEFAULT_SECONDS: i64 = 12 * 3600;

    /// `None` unless the width is positive.
    pub fn new(seconds: i64) -> Option<Self> {
        (seconds > 0).then_some(Self { seconds })
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Inclusive bounds in epoch milliseconds for a cycle at `now_ms`.
    pub fn bounds(&self, now_ms: i64) -> (i64, i64) {
        let width_ms = self.seconds.saturating_mul(1000);
        (now_ms.saturating_sub(width_ms), now_ms)
    }
}

impl Default for Window {
    fn default() -> Self {
        Self {
            seconds: Self::DEFAULT_SECONDS,
        }
    }
}

/// Weighted sentiment of a set of posts, or `None` if there are none.
pub fn weighted_sentiment(posts: &[WindowPost], normalization: Normalization) -> Option<f64> {
    if posts.is_empty() {
        return None;
    }

    let sum: f64 = posts
        .iter()
        .map(|p| p.impact as f64 * (p.sentiment_mixed - NEUTRAL_SENTIMENT))
        .sum();

    let denominator = match normalization {
        Normalization::PerRow => posts.len() as f64,
        Normalization::ImpactWeighted => posts.iter().map(|p| p.impact as f64).sum(),
    };
    if denominator <= 0.0 {
        return None;
    }

    Some(sum / denominator)
}
