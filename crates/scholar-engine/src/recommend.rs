use std::time::Duration;

use chrono::{DateTime, Utc};
use scholar_core::{ProfileError, Scholarship, UserProfile};
use scholar_storage::{ProfileStore, ScholarshipStore, StoreError, MAX_QUERY_LIMIT};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::eligibility::is_eligible;
use crate::rank::{rank, ScoredScholarship, SHORTLIST_SIZE};
use crate::score::{score, SentimentAnalyzer, VaderAnalyzer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub batch_limit: usize,
    pub shortlist_size: usize,
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_limit: MAX_QUERY_LIMIT,
            shortlist_size: SHORTLIST_SIZE,
            timeout: Duration::from_millis(5_000),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_limit: std::env::var("SCHOLAR_BATCH_LIMIT")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|v| v.clamp(1, MAX_QUERY_LIMIT))
                .unwrap_or(defaults.batch_limit),
            shortlist_size: std::env::var("SCHOLAR_SHORTLIST_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(clamp_shortlist_size)
                .unwrap_or(defaults.shortlist_size),
            timeout: std::env::var("SCHOLAR_RECOMMEND_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
        }
    }
}

/// Keeps an overridden shortlist size within `1..=SHORTLIST_SIZE`.
fn clamp_shortlist_size(requested: usize) -> usize {
    requested.clamp(1, SHORTLIST_SIZE)
}

#[derive(Debug, Error)]
pub enum RecommendError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no profile stored for user {0}")]
    UnknownUser(Uuid),
    #[error("invalid profile: {0}")]
    Profile(#[from] ProfileError),
}

/// Filter, score and rank pipeline over one bounded batch of the catalog.
pub struct RecommendationEngine {
    config: EngineConfig,
    analyzer: Box<dyn SentimentAnalyzer>,
}

impl RecommendationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            analyzer: Box::<VaderAnalyzer>::default(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Box<dyn SentimentAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Pure part of the pipeline: no I/O, safe to run concurrently.
    pub fn evaluate(
        &self,
        user: &UserProfile,
        batch: Vec<Scholarship>,
        now: DateTime<Utc>,
    ) -> Vec<ScoredScholarship> {
        let scored = batch
            .into_iter()
            .filter(|record| is_eligible(user, record, now).eligible)
            .map(|record| ScoredScholarship {
                score: score(user, &record, self.analyzer.as_ref()),
                scholarship: record,
            })
            .collect();
        rank(scored, self.config.shortlist_size)
    }

    pub async fn generate<S>(
        &self,
        user: &UserProfile,
        store: &S,
    ) -> Result<Vec<ScoredScholarship>, RecommendError>
    where
        S: ScholarshipStore + ?Sized,
    {
        self.generate_at(user, store, Utc::now()).await
    }

    pub async fn generate_at<S>(
        &self,
        user: &UserProfile,
        store: &S,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredScholarship>, RecommendError>
    where
        S: ScholarshipStore + ?Sized,
    {
        let span = info_span!("recommend", user_id = %user.id);
        async move {
            user.validate()?;
            let batch = store.query_batch(0, self.config.batch_limit).await?;
            let fetched = batch.len();
            let shortlist = self.evaluate(user, batch, now);
            info!(fetched, shortlisted = shortlist.len(), "recommendations generated");
            Ok(shortlist)
        }
        .instrument(span)
        .await
    }

    /// API-edge variant: any failure is logged and yields an empty shortlist.
    pub async fn generate_or_empty<S>(
        &self,
        user: &UserProfile,
        store: &S,
    ) -> Vec<ScoredScholarship>
    where
        S: ScholarshipStore + ?Sized,
    {
        match self.generate(user, store).await {
            Ok(shortlist) => shortlist,
            Err(err) => {
                error!(
                    user_id = %user.id,
                    error = %err,
                    "recommendation failed; returning empty shortlist"
                );
                Vec::new()
            }
        }
    }

    /// Recomputes a stored user's shortlist and caches it on the profile.
    pub async fn refresh<S>(
        &self,
        user_id: Uuid,
        store: &S,
    ) -> Result<Vec<Scholarship>, RecommendError>
    where
        S: ScholarshipStore + ProfileStore + ?Sized,
    {
        let user = store
            .fetch_profile(user_id)
            .await?
            .ok_or(RecommendError::UnknownUser(user_id))?;
        let shortlist: Vec<Scholarship> = self
            .generate(&user, store)
            .await?
            .into_iter()
            .map(|scored| scored.scholarship)
            .collect();
        store.set_recommendations(user_id, &shortlist).await?;
        Ok(shortlist)
    }

    /// [`refresh`](Self::refresh) under the configured deadline; on timeout the
    /// profile's cached shortlist is returned instead.
    pub async fn recommend_within<S>(
        &self,
        user_id: Uuid,
        store: &S,
    ) -> Result<Vec<Scholarship>, RecommendError>
    where
        S: ScholarshipStore + ProfileStore + ?Sized,
    {
        match tokio::time::timeout(self.config.timeout, self.refresh(user_id, store)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    %user_id,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "recommendation timed out; serving cached shortlist"
                );
                let user = store
                    .fetch_profile(user_id)
                    .await?
                    .ok_or(RecommendError::UnknownUser(user_id))?;
                Ok(user.recommend)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::FixedAnalyzer;
    use crate::EligibilityReason;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use scholar_core::{Gender, MergeUpdate};
    use scholar_storage::{DimensionFilter, MemoryStore, UpsertOutcome};

    fn engine(compound: f64) -> RecommendationEngine {
        RecommendationEngine::new(EngineConfig::default())
            .with_analyzer(Box::new(FixedAnalyzer(compound)))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn student() -> UserProfile {
        let mut user = UserProfile::new("Ada");
        user.grade_point_average = Some(3.4);
        user.sat_score = Some(1250);
        user.gender = Some(Gender::Female);
        user.interests = vec!["robotics".into()];
        user
    }

    fn robotics_award() -> Scholarship {
        let mut r = Scholarship::new("https://x.test/robotics", "Robotics Award");
        r.gender = vec!["Female".into()];
        r.grade_point_average = vec!["Minimum Grade Point Average From 3.1 To 3.5".into()];
        r.sat_score = vec!["SAT Scores From 1,201 To 1,400".into()];
        r.amount = Some("$10,000".into());
        r.description = Some("Robotics scholarship".into());
        r
    }

    #[tokio::test]
    async fn end_to_end_shortlists_matching_record() {
        let store = MemoryStore::new();
        store.insert(&robotics_award()).await.unwrap();
        let user = student();

        assert_eq!(
            crate::is_eligible(&user, &robotics_award(), now()).reason,
            EligibilityReason::Ok
        );

        let shortlist = engine(0.5).generate_at(&user, &store, now()).await.unwrap();
        assert_eq!(shortlist.len(), 1);
        let top = &shortlist[0];
        assert_eq!(top.score.grant, 1.0);
        assert_eq!(top.score.interest, 50.0);
        assert_eq!(top.score.sentiment, 75.0);
        assert_eq!(top.total(), 126.0);
    }

    #[tokio::test]
    async fn ineligible_records_are_filtered_out() {
        let store = MemoryStore::new();
        let mut male_only = robotics_award();
        male_only.link = "https://x.test/male".into();
        male_only.gender = vec!["Male".into()];
        store.insert(&male_only).await.unwrap();
        store.insert(&robotics_award()).await.unwrap();

        let shortlist = engine(0.0).generate_at(&student(), &store, now()).await.unwrap();
        let links: Vec<_> = shortlist.iter().map(|s| s.scholarship.link.as_str()).collect();
        assert_eq!(links, ["https://x.test/robotics"]);
    }

    #[tokio::test]
    async fn store_failure_propagates_and_edge_returns_empty() {
        let store = MemoryStore::new();
        store.insert(&robotics_award()).await.unwrap();
        store.set_offline(true);

        let err = engine(0.0).generate(&student(), &store).await.unwrap_err();
        assert!(matches!(err, RecommendError::Store(StoreError::Unavailable(_))));
        assert!(engine(0.0).generate_or_empty(&student(), &store).await.is_empty());
    }

    #[tokio::test]
    async fn invalid_profile_is_rejected() {
        let store = MemoryStore::new();
        let mut user = student();
        user.grade_point_average = Some(7.0);
        let err = engine(0.0).generate(&user, &store).await.unwrap_err();
        assert!(matches!(err, RecommendError::Profile(_)));
    }

    #[tokio::test]
    async fn refresh_caches_shortlist_on_profile() {
        let store = MemoryStore::new();
        store.insert(&robotics_award()).await.unwrap();
        let user = student();
        store.upsert_profile(&user).await.unwrap();

        let shortlist = engine(0.0).refresh(user.id, &store).await.unwrap();
        let cached = store.fetch_profile(user.id).await.unwrap().unwrap().recommend;
        assert_eq!(shortlist, cached);
        assert_eq!(cached.len(), 1);

        let missing = engine(0.0).refresh(Uuid::new_v4(), &store).await.unwrap_err();
        assert!(matches!(missing, RecommendError::UnknownUser(_)));
    }

    struct SlowCatalog {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl ScholarshipStore for SlowCatalog {
        async fn get_by_key(&self, key: &str) -> Result<Option<Scholarship>, StoreError> {
            self.inner.get_by_key(key).await
        }

        async fn insert(&self, record: &Scholarship) -> Result<(), StoreError> {
            self.inner.insert(record).await
        }

        async fn upsert_merge(&self, update: &MergeUpdate) -> Result<UpsertOutcome, StoreError> {
            self.inner.upsert_merge(update).await
        }

        async fn query_batch(
            &self,
            skip: usize,
            limit: usize,
        ) -> Result<Vec<Scholarship>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.query_batch(skip, limit).await
        }

        async fn query_by_filter(
            &self,
            filter: &DimensionFilter,
            limit: usize,
        ) -> Result<Vec<Scholarship>, StoreError> {
            self.inner.query_by_filter(filter, limit).await
        }

        async fn delete_scholarship(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete_scholarship(key).await
        }
    }

    #[async_trait]
    impl ProfileStore for SlowCatalog {
        async fn fetch_profile(&self, id: Uuid) -> Result<Option<UserProfile>, StoreError> {
            self.inner.fetch_profile(id).await
        }

        async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), StoreError> {
            self.inner.upsert_profile(profile).await
        }

        async fn set_recommendations(
            &self,
            id: Uuid,
            shortlist: &[Scholarship],
        ) -> Result<(), StoreError> {
            self.inner.set_recommendations(id, shortlist).await
        }

        async fn delete_profile(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_profile(id).await
        }
    }

    #[tokio::test]
    async fn timeout_serves_cached_shortlist() {
        let store = SlowCatalog {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(500),
        };
        store.insert(&robotics_award()).await.unwrap();
        let mut user = student();
        user.recommend = vec![Scholarship::new("https://x.test/cached", "Cached")];
        store.upsert_profile(&user).await.unwrap();

        let engine = RecommendationEngine::new(EngineConfig {
            timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        })
        .with_analyzer(Box::new(FixedAnalyzer(0.0)));

        let served = engine.recommend_within(user.id, &store).await.unwrap();
        let links: Vec<_> = served.iter().map(|s| s.link.as_str()).collect();
        assert_eq!(links, ["https://x.test/cached"]);
    }

    #[test]
    fn shortlist_override_stays_in_range() {
        assert_eq!(clamp_shortlist_size(0), 1);
        assert_eq!(clamp_shortlist_size(3), 3);
        assert_eq!(clamp_shortlist_size(SHORTLIST_SIZE), SHORTLIST_SIZE);
        assert_eq!(clamp_shortlist_size(500), SHORTLIST_SIZE);
    }
}
