use std::panic::{catch_unwind, AssertUnwindSafe};

use scholar_core::{Scholarship, UserProfile};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vader_sentiment::SentimentIntensityAnalyzer;

use crate::parse::parse_amount;

pub const GRANT_DIVISOR: f64 = 10_000.0;
pub const INTEREST_WEIGHT: f64 = 50.0;
pub const SENTIMENT_WEIGHT: f64 = 50.0;

/// Compound polarity of free text, in `[-1, 1]`.
pub trait SentimentAnalyzer: Send + Sync {
    fn compound(&self, text: &str) -> Option<f64>;
}

/// VADER lexicon analyzer. The lexicon is loaded once and shared.
pub struct VaderAnalyzer {
    inner: SentimentIntensityAnalyzer<'static>,
}

impl VaderAnalyzer {
    pub fn new() -> Self {
        Self {
            inner: SentimentIntensityAnalyzer::new(),
        }
    }
}

impl Default for VaderAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SentimentAnalyzer for VaderAnalyzer {
    fn compound(&self, text: &str) -> Option<f64> {
        let scores = catch_unwind(AssertUnwindSafe(|| self.inner.polarity_scores(text))).ok()?;
        scores.get("compound").copied()
    }
}

/// Analyzer that reports the same polarity for every text.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnalyzer(pub f64);

impl SentimentAnalyzer for FixedAnalyzer {
    fn compound(&self, _text: &str) -> Option<f64> {
        Some(self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub grant: f64,
    pub interest: f64,
    pub sentiment: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.grant + self.interest + self.sentiment
    }
}

pub fn score(
    user: &UserProfile,
    record: &Scholarship,
    analyzer: &dyn SentimentAnalyzer,
) -> ScoreBreakdown {
    let breakdown = ScoreBreakdown {
        grant: grant_score(record),
        interest: interest_score(user, record),
        sentiment: sentiment_score(record, analyzer),
    };
    debug!(
        link = %record.link,
        grant = breakdown.grant,
        interest = breakdown.interest,
        sentiment = breakdown.sentiment,
        "scored"
    );
    breakdown
}

pub fn grant_score(record: &Scholarship) -> f64 {
    record
        .amount
        .as_deref()
        .and_then(parse_amount)
        .map_or(0.0, |amount| amount / GRANT_DIVISOR)
}

/// Searchable text: description, details and eligibility criteria.
fn corpus(record: &Scholarship) -> Vec<&str> {
    record
        .description
        .as_deref()
        .into_iter()
        .chain(record.details.iter().map(String::as_str))
        .chain(record.eligibility_criteria.iter().map(String::as_str))
        .collect()
}

pub fn interest_score(user: &UserProfile, record: &Scholarship) -> f64 {
    let haystack = corpus(record).join(" ").to_lowercase();
    if haystack.trim().is_empty() {
        return 0.0;
    }
    let hits = user
        .interests
        .iter()
        .map(|interest| interest.trim().to_lowercase())
        .filter(|interest| !interest.is_empty() && haystack.contains(interest.as_str()))
        .count();
    hits as f64 * INTEREST_WEIGHT
}

pub fn sentiment_score(record: &Scholarship, analyzer: &dyn SentimentAnalyzer) -> f64 {
    let text = corpus(record).join(" ");
    if text.trim().is_empty() {
        return 0.0;
    }
    match analyzer.compound(&text) {
        Some(compound) if compound.is_finite() => {
            (compound.clamp(-1.0, 1.0) + 1.0) * SENTIMENT_WEIGHT
        }
        _ => {
            warn!(link = %record.link, "sentiment analysis failed");
            0.0
        }
    }
}
