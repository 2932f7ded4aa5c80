//! Core domain model, fixed vocabularies and merge primitives for the scholarship finder.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{ParseError, Url};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scholar-core";

/// Declares a closed vocabulary whose wire and storage form is its label.
macro_rules! label_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }

            pub fn from_label(label: &str) -> Option<Self> {
                match label {
                    $($label => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

label_enum!(AcademicMajor {
    Aerospace => "Aerospace Technologies and Engineering",
    Art => "Art",
    Business => "Business Management",
    ChemicalEngineering => "Chemical Engineering",
    CivilEngineering => "Civil Engineering",
    Communications => "Communications",
    Chemistry => "Chemistry",
    Biochemistry => "Biochemistry",
    ComputerScience => "Computer Science",
    Cybersecurity => "Cybersecurity",
    Dentistry => "Dentistry",
    Design => "Design",
    ElectricalEngineering => "Electrical Engineering",
    Electronics => "Electronics",
    Finance => "Finance",
    Humanities => "Humanities",
    MechanicalEngineering => "Mechanical Engineering",
    Mathematics => "Mathematics",
    Medicine => "Medicine",
    Statistics => "Statistics",
});

label_enum!(AgeRange {
    Age13 => "13",
    Age14 => "14",
    Age15 => "15",
    Age16 => "16",
    Age17 => "17",
    Age18 => "18",
    Age19 => "19",
    Age20 => "20",
    Age21 => "21",
    Age22 => "22",
    Age23 => "23",
    Age24 => "24",
    Age25 => "25",
    Age26 => "26",
    Age27 => "27",
    Age28 => "28",
    Age29 => "29",
    Age30 => "30",
    Over30 => "Age Greater than 30",
});

label_enum!(Gender {
    Male => "Male",
    Female => "Female",
    Other => "Other",
});

label_enum!(FinancialNeed {
    Required => "Financial Need Required",
    NotRequired => "Financial Need not Required",
});

label_enum!(
    /// GPA brackets; the bounds are embedded in the label text.
    GpaRange {
        Gpa10To20 => "Minimum Grade Point Average From 1.0 To 2.0",
        Gpa21To25 => "Minimum Grade Point Average From 2.1 To 2.5",
        Gpa26To30 => "Minimum Grade Point Average From 2.6 To 3.0",
        Gpa31To35 => "Minimum Grade Point Average From 3.1 To 3.5",
        Gpa36To40 => "Minimum Grade Point Average From 3.6 To 4.0",
    }
);

label_enum!(
    /// SAT brackets; the bounds are embedded in the label text with thousands separators.
    SatRange {
        From400To1000 => "SAT Scores From 400 To 1,000",
        From1001To1200 => "SAT Scores From 1,001 To 1,200",
        From1201To1400 => "SAT Scores From 1,201 To 1,400",
        From1401To1600 => "SAT Scores From 1,401 To 1,600",
    }
);

/// The six attributes used both to categorize scholarships and to match users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualifyingDimension {
    AcademicMajor,
    Age,
    Gender,
    FinancialNeed,
    GradePointAverage,
    SatScore,
}

impl QualifyingDimension {
    pub const ALL: [QualifyingDimension; 6] = [
        QualifyingDimension::AcademicMajor,
        QualifyingDimension::Age,
        QualifyingDimension::Gender,
        QualifyingDimension::FinancialNeed,
        QualifyingDimension::GradePointAverage,
        QualifyingDimension::SatScore,
    ];

    pub fn field_name(self) -> &'static str {
        match self {
            QualifyingDimension::AcademicMajor => "academic_major",
            QualifyingDimension::Age => "age",
            QualifyingDimension::Gender => "gender",
            QualifyingDimension::FinancialNeed => "financial_need",
            QualifyingDimension::GradePointAverage => "grade_point_average",
            QualifyingDimension::SatScore => "sat_score",
        }
    }

    /// Whether `label` belongs to this dimension's vocabulary.
    pub fn accepts(self, label: &str) -> bool {
        match self {
            QualifyingDimension::AcademicMajor => AcademicMajor::from_label(label).is_some(),
            QualifyingDimension::Age => AgeRange::from_label(label).is_some(),
            QualifyingDimension::Gender => Gender::from_label(label).is_some(),
            QualifyingDimension::FinancialNeed => FinancialNeed::from_label(label).is_some(),
            QualifyingDimension::GradePointAverage => GpaRange::from_label(label).is_some(),
            QualifyingDimension::SatScore => SatRange::from_label(label).is_some(),
        }
    }
}

impl fmt::Display for QualifyingDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// Set-valued fields of a scholarship record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetField {
    Details,
    EligibilityCriteria,
    QualifiedBasedOn,
    Dimension(QualifyingDimension),
}

impl SetField {
    pub const ALL: [SetField; 9] = [
        SetField::Details,
        SetField::EligibilityCriteria,
        SetField::QualifiedBasedOn,
        SetField::Dimension(QualifyingDimension::AcademicMajor),
        SetField::Dimension(QualifyingDimension::Age),
        SetField::Dimension(QualifyingDimension::Gender),
        SetField::Dimension(QualifyingDimension::FinancialNeed),
        SetField::Dimension(QualifyingDimension::GradePointAverage),
        SetField::Dimension(QualifyingDimension::SatScore),
    ];

    pub fn column(self) -> &'static str {
        match self {
            SetField::Details => "details",
            SetField::EligibilityCriteria => "eligibility_criteria",
            SetField::QualifiedBasedOn => "qualified_based_on",
            SetField::Dimension(dimension) => dimension.field_name(),
        }
    }
}

/// Canonical scholarship record, keyed by its normalized `link`.
///
/// Set-valued fields keep first-seen order and never hold duplicates. An empty
/// list means the source never declared that field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scholarship {
    pub link: String,
    pub title: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub eligibility_criteria: Vec<String>,
    #[serde(default)]
    pub qualified_based_on: Vec<String>,
    #[serde(default)]
    pub academic_major: Vec<String>,
    #[serde(default)]
    pub age: Vec<String>,
    #[serde(default)]
    pub gender: Vec<String>,
    #[serde(default)]
    pub financial_need: Vec<String>,
    #[serde(default)]
    pub grade_point_average: Vec<String>,
    #[serde(default)]
    pub sat_score: Vec<String>,
}

impl Scholarship {
    pub fn new(link: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            title: title.into(),
            amount: None,
            due_date: None,
            description: None,
            details: Vec::new(),
            eligibility_criteria: Vec::new(),
            qualified_based_on: Vec::new(),
            academic_major: Vec::new(),
            age: Vec::new(),
            gender: Vec::new(),
            financial_need: Vec::new(),
            grade_point_average: Vec::new(),
            sat_score: Vec::new(),
        }
    }

    /// Builds the first canonical record for a key from a merge update.
    pub fn from_update(update: &MergeUpdate) -> Result<Self, RecordError> {
        let title = update
            .scalars
            .title
            .clone()
            .ok_or_else(|| RecordError::MissingTitle(update.link.clone()))?;
        let mut record = Scholarship::new(update.link.clone(), title);
        record.apply(update)?;
        Ok(record)
    }

    pub fn set(&self, field: SetField) -> &[String] {
        match field {
            SetField::Details => &self.details,
            SetField::EligibilityCriteria => &self.eligibility_criteria,
            SetField::QualifiedBasedOn => &self.qualified_based_on,
            SetField::Dimension(dimension) => self.dimension(dimension),
        }
    }

    pub fn set_mut(&mut self, field: SetField) -> &mut Vec<String> {
        match field {
            SetField::Details => &mut self.details,
            SetField::EligibilityCriteria => &mut self.eligibility_criteria,
            SetField::QualifiedBasedOn => &mut self.qualified_based_on,
            SetField::Dimension(QualifyingDimension::AcademicMajor) => &mut self.academic_major,
            SetField::Dimension(QualifyingDimension::Age) => &mut self.age,
            SetField::Dimension(QualifyingDimension::Gender) => &mut self.gender,
            SetField::Dimension(QualifyingDimension::FinancialNeed) => &mut self.financial_need,
            SetField::Dimension(QualifyingDimension::GradePointAverage) => {
                &mut self.grade_point_average
            }
            SetField::Dimension(QualifyingDimension::SatScore) => &mut self.sat_score,
        }
    }

    pub fn dimension(&self, dimension: QualifyingDimension) -> &[String] {
        match dimension {
            QualifyingDimension::AcademicMajor => &self.academic_major,
            QualifyingDimension::Age => &self.age,
            QualifyingDimension::Gender => &self.gender,
            QualifyingDimension::FinancialNeed => &self.financial_need,
            QualifyingDimension::GradePointAverage => &self.grade_point_average,
            QualifyingDimension::SatScore => &self.sat_score,
        }
    }

    /// Applies scalar overwrites and set additions; returns whether anything changed.
    ///
    /// Absent scalars never erase existing values and existing set elements are
    /// never removed, so applying the same update twice is a no-op.
    pub fn apply(&mut self, update: &MergeUpdate) -> Result<bool, RecordError> {
        if update.link != self.link {
            return Err(RecordError::KeyMismatch {
                expected: self.link.clone(),
                found: update.link.clone(),
            });
        }

        let mut changed = false;
        let scalars = &update.scalars;
        if let Some(title) = &scalars.title {
            changed |= overwrite(&mut self.title, title);
        }
        changed |= overwrite_opt(&mut self.amount, scalars.amount.as_ref());
        changed |= overwrite_opt(&mut self.due_date, scalars.due_date.as_ref());
        changed |= overwrite_opt(&mut self.description, scalars.description.as_ref());

        for (field, values) in update.additions.iter() {
            changed |= add_to_set(self.set_mut(field), values) > 0;
        }
        Ok(changed)
    }
}

fn overwrite(slot: &mut String, value: &str) -> bool {
    if slot == value {
        return false;
    }
    *slot = value.to_string();
    true
}

fn overwrite_opt(slot: &mut Option<String>, value: Option<&String>) -> bool {
    match value {
        Some(value) if slot.as_ref() != Some(value) => {
            *slot = Some(value.clone());
            true
        }
        _ => false,
    }
}

/// Appends every value not already present; returns how many were added.
pub fn add_to_set(target: &mut Vec<String>, values: &[String]) -> usize {
    let mut added = 0;
    for value in values {
        if !target.contains(value) {
            target.push(value.clone());
            added += 1;
        }
    }
    added
}

/// Scalar overwrites carried by one merge; `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarFields {
    pub title: Option<String>,
    pub amount: Option<String>,
    pub due_date: Option<String>,
    pub description: Option<String>,
}

impl ScalarFields {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.amount.is_none()
            && self.due_date.is_none()
            && self.description.is_none()
    }
}

/// Elements to union into set-valued fields, deduplicated on insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAdditions(BTreeMap<SetField, Vec<String>>);

impl SetAdditions {
    pub fn add(&mut self, field: SetField, values: impl IntoIterator<Item = String>) {
        let values: Vec<String> = values.into_iter().collect();
        if values.is_empty() {
            return;
        }
        add_to_set(self.0.entry(field).or_default(), &values);
    }

    pub fn get(&self, field: SetField) -> &[String] {
        self.0.get(&field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SetField, &[String])> {
        self.0.iter().map(|(field, values)| (*field, values.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }
}

/// One keyed upsert: "set these scalars" plus "add these elements to these sets".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeUpdate {
    pub link: String,
    pub scalars: ScalarFields,
    pub additions: SetAdditions,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record {0} cannot be created without a title")]
    MissingTitle(String),
    #[error("update for {found} applied to record {expected}")]
    KeyMismatch { expected: String, found: String },
}

/// A single qualifying-dimension value discovered by an ingestion pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionValue {
    pub dimension: QualifyingDimension,
    pub label: String,
}

/// Partial sighting of a scholarship handed from ingestion sources to the merger.
///
/// `title` and `link` are required by the merger but optional here so that a
/// malformed observation still deserializes and can be rejected with a reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScholarshipObservation {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub eligibility_criteria: Vec<String>,
    #[serde(default)]
    pub qualified_based_on: Vec<String>,
    #[serde(default)]
    pub dimension: Option<DimensionValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link is empty")]
    Empty,
    #[error("link {0} is not absolute")]
    Relative(String),
    #[error("link {0} is not a valid URL")]
    Invalid(String),
    #[error("unsupported link scheme {0}")]
    UnsupportedScheme(String),
    #[error("link {0} has no host")]
    MissingHost(String),
}

/// Normalizes a scholarship link into its canonical key.
///
/// Relative links (`/path`, `path`, `//host/path`) are resolved against `base`.
/// Parsing lower-cases the scheme and host, drops default ports and resolves
/// dot segments. Any fragment, empty query and trailing `/` is removed. Only
/// `http` and `https` are accepted.
pub fn normalize_link(raw: &str, base: Option<&str>) -> Result<String, LinkError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LinkError::Empty);
    }

    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(ParseError::RelativeUrlWithoutBase) => {
            let Some(base) = base else {
                return Err(LinkError::Relative(trimmed.to_string()));
            };
            Url::parse(base.trim())
                .and_then(|base| base.join(trimmed))
                .map_err(|_| LinkError::Invalid(trimmed.to_string()))?
        }
        Err(ParseError::EmptyHost) => return Err(LinkError::MissingHost(trimmed.to_string())),
        Err(_) => return Err(LinkError::Invalid(trimmed.to_string())),
    };

    if !matches!(url.scheme(), "http" | "https") {
        return Err(LinkError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(LinkError::MissingHost(trimmed.to_string()));
    }

    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);

    let bare_root = url.path() == "/" && url.query().is_none();
    let mut canonical = String::from(url);
    // An empty path still serializes as "/" for http(s).
    if bare_root {
        canonical.pop();
    }
    Ok(canonical)
}

/// Applicant profile matched against the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub academic_major: Option<AcademicMajor>,
    #[serde(default)]
    pub age: Option<AgeRange>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub financial_need: Option<FinancialNeed>,
    #[serde(default)]
    pub grade_point_average: Option<f64>,
    #[serde(default)]
    pub sat_score: Option<u32>,
    #[serde(default)]
    pub interests: Vec<String>,
    /// Last computed shortlist, replaced wholesale on every recomputation.
    #[serde(default)]
    pub recommend: Vec<Scholarship>,
}

pub const MAX_GPA: f64 = 4.0;
pub const MAX_SAT: u32 = 1600;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("grade point average {0} is outside 0-4")]
    GpaOutOfRange(f64),
    #[error("SAT score {0} is outside 0-1600")]
    SatOutOfRange(u32),
}

impl UserProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            academic_major: None,
            age: None,
            gender: None,
            financial_need: None,
            grade_point_average: None,
            sat_score: None,
            interests: Vec::new(),
            recommend: Vec::new(),
        }
    }

    /// Label of the user's value for a categorical dimension.
    ///
    /// GPA and SAT are numeric on the profile and always return `None` here.
    pub fn categorical(&self, dimension: QualifyingDimension) -> Option<&'static str> {
        match dimension {
            QualifyingDimension::AcademicMajor => self.academic_major.map(AcademicMajor::label),
            QualifyingDimension::Age => self.age.map(AgeRange::label),
            QualifyingDimension::Gender => self.gender.map(Gender::label),
            QualifyingDimension::FinancialNeed => self.financial_need.map(FinancialNeed::label),
            QualifyingDimension::GradePointAverage | QualifyingDimension::SatScore => None,
        }
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if let Some(gpa) = self.grade_point_average {
            if !(0.0..=MAX_GPA).contains(&gpa) {
                return Err(ProfileError::GpaOutOfRange(gpa));
            }
        }
        if let Some(sat) = self.sat_score {
            if sat > MAX_SAT {
                return Err(ProfileError::SatOutOfRange(sat));
            }
        }
        Ok(())
    }
}
