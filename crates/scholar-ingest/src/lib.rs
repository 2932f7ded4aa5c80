//! Observation sources and the batch pipeline that folds them into the catalog.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scholar_core::{DimensionValue, ScholarshipObservation};
use scholar_storage::{ScholarshipStore, UpsertOutcome};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod merge;

pub use merge::{MergeError, Merger};

pub const CRATE_NAME: &str = "scholar-ingest";
pub const DEFAULT_LINK_BASE: &str = "https://www.scholarships.com";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait ObservationSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Base URL for site-relative links emitted by this source.
    fn link_base(&self) -> Option<&str> {
        None
    }

    async fn observations(&self) -> Result<Vec<ScholarshipObservation>, SourceError>;
}

/// One captured scraper pass, as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationBundle {
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub link_base: Option<String>,
    /// Category page the whole pass was listed under, e.g. the "Female" gender listing.
    #[serde(default)]
    pub dimension: Option<DimensionValue>,
    #[serde(default)]
    pub observations: Vec<ScholarshipObservation>,
}

impl ObservationBundle {
    /// Observations with the bundle-level dimension applied where they carry none.
    pub fn resolved_observations(&self) -> Vec<ScholarshipObservation> {
        self.observations
            .iter()
            .cloned()
            .map(|mut obs| {
                if obs.dimension.is_none() {
                    obs.dimension = self.dimension.clone();
                }
                obs
            })
            .collect()
    }
}

pub fn load_observation_bundle(path: impl AsRef<Path>) -> Result<ObservationBundle> {
    let path = path.as_ref();
    let bundle: ObservationBundle = read_json_file(path)?;
    if bundle.source_id.trim().is_empty() {
        anyhow::bail!("bundle {} has an empty source_id", path.display());
    }
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading bundle {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing bundle {}", path.display()))
}

/// Replays a bundle file captured by the scraper.
#[derive(Debug, Clone)]
pub struct JsonBundleSource {
    path: PathBuf,
    bundle: ObservationBundle,
}

impl JsonBundleSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bundle = load_observation_bundle(&path)?;
        Ok(Self { path, bundle })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bundle(&self) -> &ObservationBundle {
        &self.bundle
    }
}

#[async_trait]
impl ObservationSource for JsonBundleSource {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    fn link_base(&self) -> Option<&str> {
        self.bundle.link_base.as_deref()
    }

    async fn observations(&self) -> Result<Vec<ScholarshipObservation>, SourceError> {
        Ok(self.bundle.resolved_observations())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub observed: usize,
    pub created: usize,
    pub updated: usize,
    /// Observations that failed validation.
    pub rejected: usize,
    /// Observations the store could not persist.
    pub failed: usize,
}

impl IngestSummary {
    pub fn merged(&self) -> usize {
        self.created + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub link_base: Option<String>,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let link_base = std::env::var("SCHOLAR_LINK_BASE")
            .unwrap_or_else(|_| DEFAULT_LINK_BASE.to_string());
        let link_base = link_base.trim();
        Self {
            link_base: (!link_base.is_empty()).then(|| link_base.to_string()),
        }
    }

    pub fn merger(&self) -> Merger {
        match &self.link_base {
            Some(base) => Merger::new().with_link_base(base.clone()),
            None => Merger::new(),
        }
    }
}

/// Folds every observation from `source` into `store`.
///
/// Observations are merged one at a time; a rejected or failed observation is
/// logged and counted but does not stop the batch. Only a failure to read the
/// source itself aborts the run.
pub async fn ingest<S>(
    source: &dyn ObservationSource,
    store: &S,
    merger: &Merger,
) -> Result<IngestSummary, SourceError>
where
    S: ScholarshipStore + ?Sized,
{
    let run_id = Uuid::new_v4();
    let span = info_span!("ingest", %run_id, source_id = source.source_id());
    async move {
        let started_at = Utc::now();
        let merger = match source.link_base() {
            Some(base) => merger.clone().with_link_base(base),
            None => merger.clone(),
        };

        let observations = source.observations().await?;
        let mut summary = IngestSummary {
            run_id,
            source_id: source.source_id().to_string(),
            started_at,
            finished_at: started_at,
            observed: observations.len(),
            created: 0,
            updated: 0,
            rejected: 0,
            failed: 0,
        };

        for (index, observation) in observations.iter().enumerate() {
            match merger.merge_into(store, observation).await {
                Ok((_, UpsertOutcome::Created)) => summary.created += 1,
                Ok((_, UpsertOutcome::Merged)) => summary.updated += 1,
                Err(err) if err.is_store_failure() => {
                    summary.failed += 1;
                    warn!(
                        index,
                        link = ?observation.link,
                        error = %err,
                        "failed to persist observation"
                    );
                }
                Err(err) => {
                    summary.rejected += 1;
                    warn!(index, link = ?observation.link, error = %err, "rejected observation");
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            observed = summary.observed,
            created = summary.created,
            updated = summary.updated,
            rejected = summary.rejected,
            failed = summary.failed,
            "ingest finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}
