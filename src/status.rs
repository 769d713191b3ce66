// System status display — the latest published value of every series.

use anyhow::Result;
use chrono::DateTime;
use colored::Colorize;
use std::sync::Arc;

use crate::aggregate::ensemble::{SOCIAL_INTERNAL_ENSEMBLE, STOCKTWITS, TWITTER};
use crate::db::models::GlobalSentimentSample;
use crate::db::Database;

/// Display system status to the terminal.
pub async fn show(db: &Arc<dyn Database>, db_display: &str) -> Result<()> {
    println!("Database: {db_display}");

    let mut samples = db.latest_samples().await?;
    if samples.is_empty() {
        println!("Series: nothing published yet");
        println!("  Run `bullbear ingest` or `bullbear aggregate` to compute them");
        return Ok(());
    }
    samples.sort_by(|a, b| {
        a.sentiment_type
            .cmp(&b.sentiment_type)
            .then(a.sentiment_seconds_back.cmp(&b.sentiment_seconds_back))
    });

    println!(
        "\n{}",
        format!("=== Latest sentiment ({} series) ===", samples.len()).bold()
    );
    println!(
        "  {:<26} {:>8}  {:>10}  {}",
        "Series".dimmed(),
        "Window".dimmed(),
        "Value".dimmed(),
        "Computed at".dimmed(),
    );
    println!("  {}", "-".repeat(70).dimmed());

    for sample in &samples {
        println!(
            "  {:<26} {:>8}  {:>10}  {}",
            sample.sentiment_type,
            format_window(sample.sentiment_seconds_back),
            colorize_value(sample),
            format_timestamp(sample.created_at_ms),
        );
    }

    Ok(())
}

/// Where a series is neither bullish nor bearish. Per-source series are
/// offsets around zero, the internal ensemble is centred on 25 and the
/// external feeds report on a 0-100 scale.
fn neutral_point(series: &str) -> f64 {
    match series {
        STOCKTWITS | TWITTER => 0.0,
        SOCIAL_INTERNAL_ENSEMBLE => 25.0,
        _ => 50.0,
    }
}

fn colorize_value(sample: &GlobalSentimentSample) -> String {
    let text = format!("{:.4}", sample.sentiment_absolute);
    let neutral = neutral_point(&sample.sentiment_type);
    if sample.sentiment_absolute > neutral {
        text.green().to_string()
    } else if sample.sentiment_absolute < neutral {
        text.red().to_string()
    } else {
        text
    }
}

fn format_window(seconds: i64) -> String {
    if seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else if seconds % 60 == 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{seconds}s")
    }
}

fn format_timestamp(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_window() {
        assert_eq!(format_window(43200), "12h");
        assert_eq!(format_window(900), "15m");
        assert_eq!(format_window(45), "45s");
    }

    #[test]
    fn test_neutral_point_by_scale() {
        assert_eq!(neutral_point(STOCKTWITS), 0.0);
        assert_eq!(neutral_point(SOCIAL_INTERNAL_ENSEMBLE), 25.0);
        assert_eq!(neutral_point("news_external_ensemble"), 50.0);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(1_539_202_764_000), "2018-10-10 20:19:24 UTC");
    }
}
