use scholar_core::{
    normalize_link, LinkError, MergeUpdate, QualifyingDimension, RecordError, ScalarFields,
    Scholarship, ScholarshipObservation, SetAdditions, SetField,
};
use scholar_storage::{ScholarshipStore, StoreError, UpsertOutcome};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("observation has no title")]
    MissingTitle,
    #[error("observation has no link")]
    MissingLink,
    #[error("invalid link: {0}")]
    Link(#[from] LinkError),
    #[error("{label:?} is not a known {dimension} value")]
    UnknownLabel {
        dimension: QualifyingDimension,
        label: String,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MergeError {
    /// Store failures are retryable; everything else is a bad observation.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, MergeError::Store(_))
    }
}

/// Record Merger: validates an observation and folds it into the canonical record.
#[derive(Debug, Clone, Default)]
pub struct Merger {
    link_base: Option<String>,
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link_base(mut self, base: impl Into<String>) -> Self {
        self.link_base = Some(base.into());
        self
    }

    pub fn link_base(&self) -> Option<&str> {
        self.link_base.as_deref()
    }

    /// Turns an observation into the keyed "set scalars + add to sets" update.
    pub fn prepare(&self, observation: &ScholarshipObservation) -> Result<MergeUpdate, MergeError> {
        let title = clean(&observation.title).ok_or(MergeError::MissingTitle)?;
        let raw_link = clean(&observation.link).ok_or(MergeError::MissingLink)?;
        let link = normalize_link(&raw_link, self.link_base())?;

        let mut additions = SetAdditions::default();
        additions.add(SetField::Details, clean_list(&observation.details));
        additions.add(
            SetField::EligibilityCriteria,
            clean_list(&observation.eligibility_criteria),
        );
        additions.add(
            SetField::QualifiedBasedOn,
            clean_list(&observation.qualified_based_on),
        );

        if let Some(value) = &observation.dimension {
            let label = value.label.trim();
            if !value.dimension.accepts(label) {
                return Err(MergeError::UnknownLabel {
                    dimension: value.dimension,
                    label: value.label.clone(),
                });
            }
            additions.add(SetField::Dimension(value.dimension), [label.to_string()]);
        }

        Ok(MergeUpdate {
            link,
            scalars: ScalarFields {
                title: Some(title),
                amount: clean(&observation.amount),
                due_date: clean(&observation.due_date),
                description: clean(&observation.description),
            },
            additions,
        })
    }

    /// `merge(existing_or_none, observation) -> canonical record`, without touching a store.
    pub fn merge(
        &self,
        existing: Option<Scholarship>,
        observation: &ScholarshipObservation,
    ) -> Result<Scholarship, MergeError> {
        let update = self.prepare(observation)?;
        match existing {
            None => Ok(Scholarship::from_update(&update)?),
            Some(mut record) => {
                record.apply(&update)?;
                Ok(record)
            }
        }
    }

    /// Merges one observation through a single atomic upsert; returns the canonical key.
    pub async fn merge_into<S: ScholarshipStore + ?Sized>(
        &self,
        store: &S,
        observation: &ScholarshipObservation,
    ) -> Result<(String, UpsertOutcome), MergeError> {
        let update = self.prepare(observation)?;
        let outcome = store.upsert_merge(&update).await?;
        debug!(link = %update.link, ?outcome, "merged observation");
        Ok((update.link, outcome))
    }
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
