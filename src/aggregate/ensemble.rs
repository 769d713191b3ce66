// Ensemble series — everything published to `global_sentiment` each cycle.
//
// Tier 1: one series per source network, computed from that network's
//         posts in the window (`stocktwits`, `twitter`).
// Tier 2: `social_internal_ensemble` rescales this cycle's Tier-1 values to
//         0-100 and averages them; `social_external_ensemble` and
//         `news_external_ensemble` average the third-party feed readings of
//         their category received in the window.
// Tier 3: `global_external_ensemble` averages this cycle's two external
//         ensembles.
//
// A series with nothing in its window is skipped for that cycle rather than
// written as a null.

use tracing::debug;

use super::window::{weighted_sentiment, Normalization, Window, NEUTRAL_SENTIMENT};
use crate::db::models::{ExternalCategory, GlobalSentimentSample, PostType};
use crate::db::{Database, StoreResult};

pub const STOCKTWITS: &str = "stocktwits";
pub const TWITTER: &str = "twitter";
pub const SOCIAL_INTERNAL_ENSEMBLE: &str = "social_internal_ensemble";
pub const SOCIAL_EXTERNAL_ENSEMBLE: &str = "social_external_ensemble";
pub const NEWS_EXTERNAL_ENSEMBLE: &str = "news_external_ensemble";
pub const GLOBAL_EXTERNAL_ENSEMBLE: &str = "global_external_ensemble";

/// Multiplier applied to the mean shifted Tier-1 value. A neutral reading
/// lands on 25 and the full bull/bear swing of an impact-weighted series
/// spans 0 to 50; per-row series are not bounded.
const INTERNAL_ENSEMBLE_SCALE: f64 = 50.0;

/// A Tier-1 series and the post types it is computed from.
#[derive(Debug, Clone, Copy)]
pub struct SeriesSpec {
    pub name: &'static str,
    pub post_types: &'static [PostType],
}

pub const PRIMARY_SERIES: [SeriesSpec; 2] = [
    SeriesSpec {
        name: STOCKTWITS,
        post_types: &[PostType::Stocktwit],
    },
    SeriesSpec {
        name: TWITTER,
        post_types: &[PostType::TwitterTopic, PostType::TwitterUser],
    },
];

/// Normalization for each Tier-1 series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NormalizationPolicy {
    pub stocktwits: Normalization,
    pub twitter: Normalization,
}

impl NormalizationPolicy {
    /// The same policy for every series.
    pub fn uniform(normalization: Normalization) -> Self {
        Self {
            stocktwits: normalization,
            twitter: normalization,
        }
    }

    pub fn for_series(&self, name: &str) -> Normalization {
        match name {
            TWITTER => self.twitter,
            _ => self.stocktwits,
        }
    }
}

/// Plain mean, or `None` for no values.
pub fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Combine Tier-1 values into the internal social ensemble:
/// `50 * mean(0.5 + s)`.
pub fn internal_ensemble(tier1: &[f64]) -> Option<f64> {
    let shifted: Vec<f64> = tier1.iter().map(|s| NEUTRAL_SENTIMENT + s).collect();
    average(&shifted).map(|mean| INTERNAL_ENSEMBLE_SCALE * mean)
}

fn sample(name: &str, window: &Window, now_ms: i64, value: f64) -> GlobalSentimentSample {
    GlobalSentimentSample {
        sentiment_type: name.to_string(),
        sentiment_seconds_back: window.seconds(),
        created_at_ms: now_ms,
        sentiment_absolute: value,
    }
}

/// Compute every series for every window at cycle time `now_ms`.
///
/// All samples of one call share `created_at_ms = now_ms`. Nothing is
/// written; the caller persists the result.
pub async fn compute_cycle(
    db: &dyn Database,
    now_ms: i64,
    windows: &[Window],
    policy: &NormalizationPolicy,
) -> StoreResult<Vec<GlobalSentimentSample>> {
    let mut samples = Vec::new();

    for window in windows {
        let (since_ms, until_ms) = window.bounds(now_ms);

        // Tier 1
        let mut tier1 = Vec::with_capacity(PRIMARY_SERIES.len());
        for series in PRIMARY_SERIES {
            let posts = db.window_posts(series.post_types, since_ms, until_ms).await?;
            let normalization = policy.for_series(series.name);
            match weighted_sentiment(&posts, normalization) {
                Some(value) => {
                    tier1.push(value);
                    samples.push(sample(series.name, window, now_ms, value));
                }
                None => debug!(
                    series = series.name,
                    window_secs = window.seconds(),
                    "No posts in window"
                ),
            }
        }

        // Tier 2
        if let Some(value) = internal_ensemble(&tier1) {
            samples.push(sample(SOCIAL_INTERNAL_ENSEMBLE, window, now_ms, value));
        }

        let mut external = Vec::with_capacity(2);
        for (name, category) in [
            (SOCIAL_EXTERNAL_ENSEMBLE, ExternalCategory::Social),
            (NEWS_EXTERNAL_ENSEMBLE, ExternalCategory::News),
        ] {
            let values = db.external_values(category, since_ms, until_ms).await?;
            if let Some(value) = average(&values) {
                external.push(value);
                samples.push(sample(name, window, now_ms, value));
            }
        }

        // Tier 3
        if let Some(value) = average(&external) {
            samples.push(sample(GLOBAL_EXTERNAL_ENSEMBLE, window, now_ms, value));
        }
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_ensemble_rescales() {
        let value = internal_ensemble(&[0.10, -0.05]).unwrap();
        assert!((value - 26.25).abs() < 1e-9);
    }

    #[test]
    fn test_internal_ensemble_neutral_is_25() {
        assert_eq!(internal_ensemble(&[0.0]), Some(25.0));
        assert_eq!(internal_ensemble(&[]), None);
    }

    #[test]
    fn test_average() {
        assert_eq!(average(&[1.0, 2.0, 6.0]), Some(3.0));
        assert_eq!(average(&[]), None);
    }

    #[test]
    fn test_policy_per_series() {
        let policy = NormalizationPolicy {
            stocktwits: Normalization::PerRow,
            twitter: Normalization::ImpactWeighted,
        };
        assert_eq!(policy.for_series(TWITTER), Normalization::ImpactWeighted);
        assert_eq!(policy.for_series(STOCKTWITS), Normalization::PerRow);
        assert_eq!(
            NormalizationPolicy::uniform(Normalization::ImpactWeighted).stocktwits,
            Normalization::ImpactWeighted
        );
    }
}
