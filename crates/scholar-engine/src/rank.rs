use std::cmp::Ordering;

use scholar_core::Scholarship;
use serde::{Deserialize, Serialize};

use crate::score::ScoreBreakdown;

pub const SHORTLIST_SIZE: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredScholarship {
    pub scholarship: Scholarship,
    pub score: ScoreBreakdown,
}

impl ScoredScholarship {
    pub fn total(&self) -> f64 {
        self.score.total()
    }
}

/// Highest total first; equal totals keep their fetch order.
pub fn rank(mut scored: Vec<ScoredScholarship>, limit: usize) -> Vec<ScoredScholarship> {
    scored.sort_by(|a, b| descending(a.total(), b.total()));
    scored.truncate(limit);
    scored
}

fn descending(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}
