//! Token efficiency analytics.
//!
//! Pure functions over token counts. A turn that spends fewer tokens than the one before it
//! scores above 50; one that spends more scores below. Scores are clamped to `0..=100`.
//!
//! ```
//! use tokenlingo::efficiency::{score, Trend};
//!
//! let s = score(200, 150);
//! assert_eq!(s.delta, 50);
//! assert_eq!(s.pct_improvement, 25.0);
//! assert_eq!(s.efficiency_score, 100.0);
//! assert_eq!(s.trend, Trend::Improving);
//! ```

use serde::{Deserialize, Serialize};

/// Score given to the first message of a session, which has nothing to compare against.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Percent change (either direction) below which a step counts as stable.
pub const STABLE_BAND_PCT: f64 = 5.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

impl Trend {
    fn classify(pct_improvement: f64) -> Self {
        if pct_improvement > STABLE_BAND_PCT {
            Trend::Improving
        } else if pct_improvement < -STABLE_BAND_PCT {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }
}

/// Comparison of one turn against the turn before it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencyScore {
    /// Tokens saved relative to the previous turn (negative when more were spent).
    pub delta: i64,
    pub pct_improvement: f64,
    pub efficiency_score: f64,
    pub trend: Trend,
}

impl EfficiencyScore {
    /// The score of a turn with no predecessor.
    pub fn neutral() -> Self {
        EfficiencyScore {
            delta: 0,
            pct_improvement: 0.0,
            efficiency_score: NEUTRAL_SCORE,
            trend: Trend::Stable,
        }
    }
}

/// Score `current` against `previous` total token counts.
///
/// A previous count of zero carries no signal and yields a neutral score.
pub fn score(previous: u64, current: u64) -> EfficiencyScore {
    if previous == 0 {
        return EfficiencyScore::neutral();
    }

    let delta = previous as i64 - current as i64;
    let pct_improvement = delta as f64 / previous as f64 * 100.0;
    let efficiency_score = (NEUTRAL_SCORE + pct_improvement * 2.0).clamp(0.0, 100.0);

    EfficiencyScore {
        delta,
        pct_improvement,
        efficiency_score,
        trend: Trend::classify(pct_improvement),
    }
}

/// Efficiency of an entire message sequence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesTrend {
    pub trend: Trend,
    /// Mean per-step percent improvement.
    pub average_improvement: f64,
    /// Largest single-step percent improvement, if the series has at least two points.
    pub best_improvement: Option<f64>,
    /// Smallest (most negative) single-step percent improvement.
    pub worst_improvement: Option<f64>,
    pub steps: usize,
}

impl Default for SeriesTrend {
    fn default() -> Self {
        SeriesTrend {
            trend: Trend::Stable,
            average_improvement: 0.0,
            best_improvement: None,
            worst_improvement: None,
            steps: 0,
        }
    }
}

/// Fold pairwise [`score`]s across a sequence of per-message token totals.
///
/// This is advisory analytics; the prompt phase is driven by iteration progress alone.
///
/// ```
/// use tokenlingo::efficiency::{trend_over_series, Trend};
///
/// let series = trend_over_series(&[400, 300, 310, 200]);
/// assert_eq!(series.steps, 3);
/// assert_eq!(series.trend, Trend::Improving);
/// assert!(series.worst_improvement.unwrap() < 0.0);
/// ```
pub fn trend_over_series(token_counts: &[u64]) -> SeriesTrend {
    let steps: Vec<f64> = token_counts
        .windows(2)
        .map(|pair| score(pair[0], pair[1]).pct_improvement)
        .collect();

    if steps.is_empty() {
        return SeriesTrend::default();
    }

    let average_improvement = steps.iter().sum::<f64>() / steps.len() as f64;
    let best_improvement = steps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let worst_improvement = steps.iter().copied().fold(f64::INFINITY, f64::min);

    SeriesTrend {
        trend: Trend::classify(average_improvement),
        average_improvement,
        best_improvement: Some(best_improvement),
        worst_improvement: Some(worst_improvement),
        steps: steps.len(),
    }
}
