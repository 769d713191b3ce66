// Impact score — engagement-driven weight of a post.
//
// A post's impact is one plus its likes plus its interactions (replies on the
// message board, retweets on Twitter). A retweet carries a post to a much
// larger audience than a board reply does, so interactions on the
// high-reach network count three times.

use crate::db::models::{EngagementSnapshot, PostType};

/// Multiplier applied to interactions on the high-reach network.
pub const HIGH_REACH_INTERACTION_WEIGHT: i64 = 3;

/// Compute the impact of a post from its current engagement counters.
///
/// Always at least 1. Negative counters (which a healthy feed never sends)
/// are treated as zero, and sums saturate instead of overflowing.
pub fn compute_impact(post_type: PostType, snapshot: &EngagementSnapshot) -> i64 {
    let likes = snapshot.likes_total.max(0);
    let interactions = snapshot.interaction_total.max(0);
    let weighted_interactions = if post_type.is_high_reach() {
        interactions.saturating_mul(HIGH_REACH_INTERACTION_WEIGHT)
    } else {
        interactions
    };

    1i64.saturating_add(likes).saturating_add(weighted_interactions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(post_type: PostType, interaction_total: i64, likes_total: i64) -> EngagementSnapshot {
        EngagementSnapshot {
            post_type,
            interaction_total,
            likes_total,
        }
    }

    #[test]
    fn test_board_post_counts_interactions_once() {
        let s = snapshot(PostType::Stocktwit, 2, 4);
        assert_eq!(compute_impact(PostType::Stocktwit, &s), 7);
    }

    #[test]
    fn test_high_reach_interactions_tripled() {
        for post_type in [PostType::TwitterTopic, PostType::TwitterUser] {
            let s = snapshot(post_type, 2, 4);
            assert_eq!(compute_impact(post_type, &s), 11);
        }
    }

    #[test]
    fn test_no_engagement_is_one() {
        let s = snapshot(PostType::TwitterUser, 0, 0);
        assert_eq!(compute_impact(PostType::TwitterUser, &s), 1);
    }

    #[test]
    fn test_negative_counters_clamped() {
        let s = snapshot(PostType::Stocktwit, -5, -1);
        assert_eq!(compute_impact(PostType::Stocktwit, &s), 1);
    }

    #[test]
    fn test_saturates_on_overflow() {
        let s = snapshot(PostType::TwitterTopic, i64::MAX, i64::MAX);
        assert_eq!(compute_impact(PostType::TwitterTopic, &s), i64::MAX);
    }
}
