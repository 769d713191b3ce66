// Conditional persistence — writes the impact deltas and new samples of one
// cycle.
//
// Only changed identities reach `persist_impacts`. Each record is isolated:
// a failing row is logged and skipped and its siblings still commit. A
// failure of the session itself comes back as StoreError::Connection so the
// caller can abandon the cycle.

use tracing::{debug, warn};

use crate::db::models::{GlobalSentimentSample, ImpactChange};
use crate::db::{BatchOutcome, Database, StoreResult};

/// How many records of a persistence call landed and how many were skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub applied: usize,
    pub failed: usize,
}

impl PersistReport {
    fn from_outcome(outcome: &BatchOutcome) -> Self {
        Self {
            applied: outcome.applied,
            failed: outcome.failures.len(),
        }
    }
}

/// Write new impact values, one update per changed identity.
pub async fn persist_impacts(
    db: &dyn Database,
    changes: &[ImpactChange],
) -> StoreResult<PersistReport> {
    if changes.is_empty() {
        return Ok(PersistReport::default());
    }

    let outcome = db.update_impacts(changes).await?;
    for failure in &outcome.failures {
        if let Some(change) = changes.get(failure.index) {
            warn!(
                post_type = %change.post_type,
                post_id = change.post_id,
                impact = change.impact,
                error = %failure.error,
                "Impact update skipped"
            );
        }
    }

    let report = PersistReport::from_outcome(&outcome);
    debug!(applied = report.applied, failed = report.failed, "Impacts persisted");
    Ok(report)
}

/// Append the samples computed this cycle.
pub async fn persist_samples(
    db: &dyn Database,
    samples: &[GlobalSentimentSample],
) -> StoreResult<PersistReport> {
    if samples.is_empty() {
        return Ok(PersistReport::default());
    }

    let outcome = db.insert_samples(samples).await?;
    for failure in &outcome.failures {
        if let Some(sample) = samples.get(failure.index) {
            warn!(
                sentiment_type = %sample.sentiment_type,
                window_secs = sample.sentiment_seconds_back,
                error = %failure.error,
                "Sample insert skipped"
            );
        }
    }

    let report = PersistReport::from_outcome(&outcome);
    debug!(applied = report.applied, failed = report.failed, "Samples persisted");
    Ok(report)
}
