use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use scholar_core::{QualifyingDimension, Scholarship, UserProfile};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::parse::parse_range_label;

/// Format of `due_date` on scraped records, e.g. "June 07, 2025".
pub const DEADLINE_FORMAT: &str = "%B %d, %Y";

const CATEGORICAL_CHECKS: [(QualifyingDimension, EligibilityReason); 4] = [
    (QualifyingDimension::AcademicMajor, EligibilityReason::AcademicMajorMismatch),
    (QualifyingDimension::Age, EligibilityReason::AgeMismatch),
    (QualifyingDimension::FinancialNeed, EligibilityReason::FinancialNeedMismatch),
    (QualifyingDimension::Gender, EligibilityReason::GenderMismatch),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityReason {
    Ok,
    InvalidDeadline,
    DeadlinePassed,
    AcademicMajorMismatch,
    AgeMismatch,
    FinancialNeedMismatch,
    GenderMismatch,
    GpaMismatch,
    SatMismatch,
}

impl EligibilityReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InvalidDeadline => "invalid_deadline",
            Self::DeadlinePassed => "deadline_passed",
            Self::AcademicMajorMismatch => "academic_major_mismatch",
            Self::AgeMismatch => "age_mismatch",
            Self::FinancialNeedMismatch => "financial_need_mismatch",
            Self::GenderMismatch => "gender_mismatch",
            Self::GpaMismatch => "gpa_mismatch",
            Self::SatMismatch => "sat_mismatch",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "Eligible",
            Self::InvalidDeadline => "The application deadline could not be read",
            Self::DeadlinePassed => "The application deadline has passed",
            Self::AcademicMajorMismatch => "Your academic major is not among the accepted majors",
            Self::AgeMismatch => "Your age is not among the accepted ages",
            Self::FinancialNeedMismatch => "Your financial need status does not match",
            Self::GenderMismatch => "Your gender does not match the requirement",
            Self::GpaMismatch => "Your GPA is outside the required range",
            Self::SatMismatch => "Your SAT score is outside the required range",
        }
    }
}

impl fmt::Display for EligibilityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: EligibilityReason,
}

impl Eligibility {
    fn pass() -> Self {
        Self {
            eligible: true,
            reason: EligibilityReason::Ok,
        }
    }

    fn fail(reason: EligibilityReason) -> Self {
        Self {
            eligible: false,
            reason,
        }
    }
}

/// Checks `user` against `record`'s requirements; the first failing check wins.
///
/// A requirement only applies when the record declares it and the user has a
/// value for it. An empty list on the record means "no restriction".
pub fn is_eligible(user: &UserProfile, record: &Scholarship, now: DateTime<Utc>) -> Eligibility {
    let verdict = check(user, record, now);
    debug!(link = %record.link, reason = verdict.reason.code(), "eligibility");
    verdict
}

fn check(user: &UserProfile, record: &Scholarship, now: DateTime<Utc>) -> Eligibility {
    if let Some(due) = record.due_date.as_deref() {
        match deadline(due) {
            None => return Eligibility::fail(EligibilityReason::InvalidDeadline),
            Some(deadline) if deadline < now => {
                return Eligibility::fail(EligibilityReason::DeadlinePassed)
            }
            Some(_) => {}
        }
    }

    for (dimension, reason) in CATEGORICAL_CHECKS {
        let accepted = record.dimension(dimension);
        if accepted.is_empty() {
            continue;
        }
        if let Some(label) = user.categorical(dimension) {
            if !accepted.iter().any(|value| value == label) {
                return Eligibility::fail(reason);
            }
        }
    }

    if let Some(gpa) = user.grade_point_average {
        if !in_any_range(record, QualifyingDimension::GradePointAverage, gpa) {
            return Eligibility::fail(EligibilityReason::GpaMismatch);
        }
    }
    if let Some(sat) = user.sat_score {
        if !in_any_range(record, QualifyingDimension::SatScore, f64::from(sat)) {
            return Eligibility::fail(EligibilityReason::SatMismatch);
        }
    }

    Eligibility::pass()
}

/// Midnight UTC of the deadline day.
pub fn deadline(due: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(due.trim(), DEADLINE_FORMAT)
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

// An unrestricted dimension always passes; malformed labels never match.
fn in_any_range(record: &Scholarship, dimension: QualifyingDimension, value: f64) -> bool {
    let labels = record.dimension(dimension);
    if labels.is_empty() {
        return true;
    }
    labels.iter().any(|label| match parse_range_label(label) {
        Some(bounds) => bounds.contains(value),
        None => {
            warn!(link = %record.link, %dimension, label, "malformed range label");
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scholar_core::Gender;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn record() -> Scholarship {
        Scholarship::new("https://x.test/a", "A")
    }

    #[test]
    fn deadline_boundary() {
        let user = UserProfile::new("u");
        let mut r = record();
        r.due_date = Some("June 07, 2025".into());

        assert!(is_eligible(&user, &r, at(2025, 6, 6)).eligible);
        let late = is_eligible(&user, &r, at(2025, 6, 8));
        assert_eq!(late.reason, EligibilityReason::DeadlinePassed);

        r.due_date = Some("2025-06-07".into());
        let bad = is_eligible(&user, &r, at(2025, 1, 1));
        assert_eq!(bad, Eligibility::fail(EligibilityReason::InvalidDeadline));
    }

    #[test]
    fn missing_user_value_passes_categorical_checks() {
        let user = UserProfile::new("u");
        let mut r = record();
        r.gender = vec!["Female".into()];
        r.academic_major = vec!["Art".into()];
        assert_eq!(is_eligible(&user, &r, at(2025, 1, 1)).reason, EligibilityReason::Ok);
    }

    #[test]
    fn categorical_mismatch_reports_dimension() {
        let mut user = UserProfile::new("u");
        user.gender = Some(Gender::Male);
        let mut r = record();
        r.gender = vec!["Female".into()];
        let verdict = is_eligible(&user, &r, at(2025, 1, 1));
        assert!(!verdict.eligible);
        assert_eq!(verdict.reason.code(), "gender_mismatch");

        r.gender.push("Male".into());
        assert!(is_eligible(&user, &r, at(2025, 1, 1)).eligible);
    }

    #[test]
    fn ranges_are_inclusive_and_or_combined() {
        let mut user = UserProfile::new("u");
        user.sat_score = Some(1400);
        user.grade_point_average = Some(2.0);
        let mut r = record();
        r.sat_score = vec![
            "SAT Scores From 400 To 1,000".into(),
            "SAT Scores From 1,201 To 1,400".into(),
        ];
        r.grade_point_average = vec!["Minimum Grade Point Average From 1.0 To 2.0".into()];
        assert!(is_eligible(&user, &r, at(2025, 1, 1)).eligible);

        user.sat_score = Some(1100);
        assert_eq!(
            is_eligible(&user, &r, at(2025, 1, 1)).reason,
            EligibilityReason::SatMismatch
        );
    }

    #[test]
    fn zero_gpa_is_still_checked() {
        let mut user = UserProfile::new("u");
        user.grade_point_average = Some(0.0);
        let mut r = record();
        r.grade_point_average = vec!["Minimum Grade Point Average From 3.1 To 3.5".into()];
        assert_eq!(
            is_eligible(&user, &r, at(2025, 1, 1)).reason,
            EligibilityReason::GpaMismatch
        );
    }

    #[test]
    fn malformed_label_does_not_match() {
        let mut user = UserProfile::new("u");
        user.grade_point_average = Some(3.0);
        let mut r = record();
        r.grade_point_average = vec!["Minimum GPA 2.5".into()];
        assert!(!is_eligible(&user, &r, at(2025, 1, 1)).eligible);
    }

    #[test]
    fn deadline_is_checked_before_dimensions() {
        let mut user = UserProfile::new("u");
        user.gender = Some(Gender::Male);
        let mut r = record();
        r.gender = vec!["Female".into()];
        r.due_date = Some("January 01, 2020".into());
        assert_eq!(
            is_eligible(&user, &r, at(2025, 1, 1)).reason,
            EligibilityReason::DeadlinePassed
        );
    }

    #[test]
    fn reasons_serialize_as_codes() {
        for reason in [EligibilityReason::Ok, EligibilityReason::FinancialNeedMismatch] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.code()));
        }
    }
}
