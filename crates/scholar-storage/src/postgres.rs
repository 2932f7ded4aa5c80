use std::sync::OnceLock;

use anyhow::Context;
use async_trait::async_trait;
use scholar_core::{MergeUpdate, RecordError, Scholarship, SetField, UserProfile};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    DimensionFilter, ProfileStore, ScholarshipStore, StoreError, UpsertOutcome, MAX_QUERY_LIMIT,
};

const SCALAR_COLUMNS: [&str; 5] = ["link", "title", "amount", "due_date", "description"];

/// PostgreSQL store; each merge is one `INSERT .. ON CONFLICT DO UPDATE`
/// statement so concurrent merges on a key are serialized by the row lock.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("opening postgres pool")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running scholarship migrations")?;
        info!("scholarship schema is up to date");
        Ok(())
    }
}

fn all_columns() -> String {
    SCALAR_COLUMNS
        .iter()
        .copied()
        .chain(SetField::ALL.iter().map(|field| field.column()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `column = existing || (additions not already present, in addition order)`.
fn union_assignment(column: &str, additions: &str) -> String {
    format!(
        "{column} = s.{column} || ARRAY(SELECT u.x \
         FROM unnest({additions}) WITH ORDINALITY AS u(x, n) \
         WHERE NOT (u.x = ANY(s.{column})) ORDER BY u.n)"
    )
}

fn scalar_assignments(source: impl Fn(usize, &str) -> String) -> Vec<String> {
    SCALAR_COLUMNS
        .iter()
        .enumerate()
        .skip(1)
        .map(|(idx, column)| format!("{column} = COALESCE({}, s.{column})", source(idx, *column)))
        .collect()
}

fn upsert_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let placeholders = (1..=SCALAR_COLUMNS.len() + SetField::ALL.len())
            .map(|n| format!("${n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut assignments = scalar_assignments(|_, column| format!("EXCLUDED.{column}"));
        assignments.extend(
            SetField::ALL
                .iter()
                .map(|field| {
                    union_assignment(field.column(), &format!("EXCLUDED.{}", field.column()))
                }),
        );
        assignments.push("updated_at = NOW()".to_string());
        format!(
            "INSERT INTO scholarships AS s ({}) VALUES ({placeholders}) \
             ON CONFLICT (link) DO UPDATE SET {} \
             RETURNING (xmax = 0) AS inserted",
            all_columns(),
            assignments.join(", ")
        )
    })
}

/// Merge for an update that carries no title: it may only touch an existing row.
fn merge_existing_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let mut assignments = scalar_assignments(|idx, _| format!("${}", idx + 1));
        assignments.extend(SetField::ALL.iter().enumerate().map(|(idx, field)| {
            union_assignment(
                field.column(),
                &format!("${}::text[]", SCALAR_COLUMNS.len() + idx + 1),
            )
        }));
        assignments.push("updated_at = NOW()".to_string());
        format!(
            "UPDATE scholarships AS s SET {} WHERE s.link = $1 RETURNING FALSE AS inserted",
            assignments.join(", ")
        )
    })
}

fn select_sql(tail: &str) -> String {
    format!("SELECT {} FROM scholarships {tail}", all_columns())
}

fn scholarship_from_row(row: &PgRow) -> Result<Scholarship, sqlx::Error> {
    let mut record = Scholarship::new(
        row.try_get::<String, _>("link")?,
        row.try_get::<String, _>("title")?,
    );
    record.amount = row.try_get("amount")?;
    record.due_date = row.try_get("due_date")?;
    record.description = row.try_get("description")?;
    for field in SetField::ALL {
        *record.set_mut(field) = row.try_get::<Vec<String>, _>(field.column())?;
    }
    Ok(record)
}

fn limit_param(limit: usize) -> i64 {
    limit.min(MAX_QUERY_LIMIT) as i64
}

fn optional_labels(
    filter: &DimensionFilter,
    dimension: scholar_core::QualifyingDimension,
) -> Option<Vec<String>> {
    let labels = filter.labels(dimension);
    if labels.is_empty() {
        None
    } else {
        Some(labels.to_vec())
    }
}

#[async_trait]
impl ScholarshipStore for PgStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<Scholarship>, StoreError> {
        let row = sqlx::query(&select_sql("WHERE link = $1"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(scholarship_from_row).transpose()?)
    }

    async fn insert(&self, record: &Scholarship) -> Result<(), StoreError> {
        let placeholders = (1..=SCALAR_COLUMNS.len() + SetField::ALL.len())
            .map(|n| format!("${n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO scholarships ({}) VALUES ({placeholders})",
            all_columns()
        );
        let mut query = sqlx::query(&sql)
            .bind(&record.link)
            .bind(&record.title)
            .bind(&record.amount)
            .bind(&record.due_date)
            .bind(&record.description);
        for field in SetField::ALL {
            query = query.bind(record.set(field).to_vec());
        }

        match query.execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateKey(record.link.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn upsert_merge(&self, update: &MergeUpdate) -> Result<UpsertOutcome, StoreError> {
        let sql = if update.scalars.title.is_some() {
            upsert_sql()
        } else {
            merge_existing_sql()
        };
        let scalars = &update.scalars;
        let mut query = sqlx::query(sql)
            .bind(&update.link)
            .bind(&scalars.title)
            .bind(&scalars.amount)
            .bind(&scalars.due_date)
            .bind(&scalars.description);
        for field in SetField::ALL {
            query = query.bind(update.additions.get(field).to_vec());
        }

        let row = query
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RecordError::MissingTitle(update.link.clone()))?;
        let inserted: bool = row.try_get("inserted")?;
        debug!(link = %update.link, inserted, "upserted scholarship");
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Merged
        })
    }

    async fn query_batch(&self, skip: usize, limit: usize) -> Result<Vec<Scholarship>, StoreError> {
        let rows = sqlx::query(&select_sql("ORDER BY seq OFFSET $1 LIMIT $2"))
            .bind(skip as i64)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(scholarship_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn query_by_filter(
        &self,
        filter: &DimensionFilter,
        limit: usize,
    ) -> Result<Vec<Scholarship>, StoreError> {
        let dimensions = scholar_core::QualifyingDimension::ALL;
        let predicates = dimensions
            .iter()
            .enumerate()
            .map(|(idx, dimension)| {
                format!(
                    "(${n}::text[] IS NULL OR {column} && ${n}::text[])",
                    n = idx + 1,
                    column = dimension.field_name()
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = select_sql(&format!(
            "WHERE {predicates} ORDER BY seq LIMIT ${}",
            dimensions.len() + 1
        ));

        let mut query = sqlx::query(&sql);
        for dimension in dimensions {
            query = query.bind(optional_labels(filter, dimension));
        }
        let rows = query
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(scholarship_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn delete_scholarship(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM scholarships WHERE link = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        debug!(link = key, deleted = result.rows_affected(), "deleted scholarship");
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn fetch_profile(&self, id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query("SELECT profile, recommend FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let profile: serde_json::Value = row.try_get("profile")?;
        let recommend: serde_json::Value = row.try_get("recommend")?;
        let mut profile: UserProfile = serde_json::from_value(profile)
            .map_err(|source| StoreError::Codec { what: "profile", source })?;
        profile.recommend = serde_json::from_value(recommend)
            .map_err(|source| StoreError::Codec { what: "recommendations", source })?;
        Ok(Some(profile))
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let mut stored = profile.clone();
        let recommend = std::mem::take(&mut stored.recommend);
        let profile_json = serde_json::to_value(&stored)
            .map_err(|source| StoreError::Codec { what: "profile", source })?;
        let recommend_json = serde_json::to_value(&recommend)
            .map_err(|source| StoreError::Codec { what: "recommendations", source })?;

        sqlx::query(
            r#"
            INSERT INTO users (id, name, profile, recommend)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   profile = EXCLUDED.profile,
                   recommend = EXCLUDED.recommend,
                   updated_at = NOW()
            "#,
        )
        .bind(profile.id)
        .bind(&profile.name)
        .bind(profile_json)
        .bind(recommend_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_recommendations(
        &self,
        id: Uuid,
        shortlist: &[Scholarship],
    ) -> Result<(), StoreError> {
        let recommend_json = serde_json::to_value(shortlist)
            .map_err(|source| StoreError::Codec { what: "recommendations", source })?;
        let result = sqlx::query(
            r#"
            UPDATE users
               SET recommend = $2,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(recommend_json)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingProfile(id));
        }
        Ok(())
    }

    async fn delete_profile(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
