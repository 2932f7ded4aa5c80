//! Eligibility filtering, scoring and ranking of scholarships for a user profile.

mod eligibility;
mod parse;
mod rank;
mod recommend;
mod score;

pub use eligibility::{deadline, is_eligible, Eligibility, EligibilityReason, DEADLINE_FORMAT};
pub use parse::{numbers, parse_amount, parse_range_label, RangeBounds};
pub use rank::{rank, ScoredScholarship, SHORTLIST_SIZE};
pub use recommend::{EngineConfig, RecommendError, RecommendationEngine};
pub use score::{
    grant_score, interest_score, score, sentiment_score, FixedAnalyzer, ScoreBreakdown,
    SentimentAnalyzer, VaderAnalyzer,
};

pub const CRATE_NAME: &str = "scholar-engine";
