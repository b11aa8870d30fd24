//! # PgEventStore
//!
//! An `EventStore` backed by PostgreSQL declarative partitioning.
//! Postgres routes writes and prunes reads by `occurred_at`; this module only needs to know
//! partition names when provisioning them.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;

use crate::config::PoolConfig;
use crate::error::StoreError;
use crate::partition::{PartitionKey, EVENTS_TABLE};
use crate::store::{AppendOutcome, EventStore, StageCount};
use crate::types::{Article, Metadata, NewEvent, PipelineEvent, Stage};

// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    article_url: String,
    stage: String,
    occurred_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
    service_name: String,
    metadata: Option<Json<Metadata>>,
    metadata_schema_version: i16,
    idempotency_key: String,
}

impl TryFrom<EventRow> for PipelineEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let stage: Stage = row
            .stage
            .parse()
            .map_err(|e| StoreError::query("SELECT", sqlx::Error::Decode(Box::new(e))))?;

        Ok(PipelineEvent {
            id: row.id,
            article_url: row.article_url,
            stage,
            occurred_at: row.occurred_at,
            received_at: row.received_at,
            service_name: row.service_name,
            metadata: row.metadata.map(|Json(metadata)| metadata),
            metadata_schema_version: row.metadata_schema_version,
            idempotency_key: row.idempotency_key,
        })
    }
}

fn into_events(rows: Vec<EventRow>) -> Result<Vec<PipelineEvent>, StoreError> {
    rows.into_iter().map(PipelineEvent::try_from).collect()
}

/// Map an insert failure onto the store's error taxonomy. Postgres reports a row that fits no
/// partition as a check violation.
fn classify_insert_error(error: sqlx::Error, event: &NewEvent) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        match db_error.code().as_deref() {
            Some(FOREIGN_KEY_VIOLATION) => {
                return StoreError::ArticleMissing(event.article_url.clone())
            }
            Some(CHECK_VIOLATION) if db_error.message().contains("no partition") => {
                return StoreError::PartitionMissing {
                    occurred_at: event.occurred_at,
                }
            }
            _ => {}
        }
    }
    StoreError::query("INSERT", error)
}

const EVENT_COLUMNS: &str = r#"
    id,
    article_url,
    stage,
    occurred_at,
    received_at,
    service_name,
    metadata,
    metadata_schema_version,
    idempotency_key
"#;

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn new(config: &PoolConfig) -> Result<Self, StoreError> {
        let pool = config
            .connect()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled migrations. Meant for local development and tests; deployed databases
    /// are migrated out of band.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_article(&self, url: &str) -> Result<Option<Article>, StoreError> {
        sqlx::query_as::<_, Article>(
            r#"
SELECT url, url_hash, domain, source_name, first_seen_at
FROM articles
WHERE url = $1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::query("SELECT", error))
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert_article(&self, candidate: Article) -> Result<(Article, bool), StoreError> {
        // ON CONFLICT makes insert-if-absent atomic; only the winner of a race gets a row back.
        let inserted = sqlx::query_as::<_, Article>(
            r#"
INSERT INTO articles
    (url, url_hash, domain, source_name, first_seen_at)
VALUES
    ($1, $2, $3, $4, $5)
ON CONFLICT (url) DO NOTHING
RETURNING url, url_hash, domain, source_name, first_seen_at
            "#,
        )
        .bind(&candidate.url)
        .bind(&candidate.url_hash)
        .bind(&candidate.domain)
        .bind(&candidate.source_name)
        .bind(candidate.first_seen_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::query("INSERT", error))?;

        if let Some(article) = inserted {
            return Ok((article, true));
        }

        // Articles are never deleted, so the conflicting row is still there
        let existing = self
            .fetch_article(&candidate.url)
            .await?
            .ok_or_else(|| StoreError::ArticleMissing(candidate.url.clone()))?;

        Ok((existing, false))
    }

    async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
INSERT INTO pipeline_events
    (article_url, stage, occurred_at, received_at, service_name, metadata, metadata_schema_version, idempotency_key)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (idempotency_key, occurred_at) DO NOTHING
RETURNING id
            "#,
        )
        .bind(&event.article_url)
        .bind(event.stage.as_str())
        .bind(event.occurred_at)
        .bind(event.received_at)
        .bind(&event.service_name)
        .bind(event.metadata.as_ref().map(Json))
        .bind(event.metadata_schema_version)
        .bind(&event.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| classify_insert_error(error, &event))?;

        Ok(match id {
            Some(id) => AppendOutcome::Inserted(id),
            None => AppendOutcome::AlreadyRecorded,
        })
    }

    async fn get_article(&self, url: &str) -> Result<Option<Article>, StoreError> {
        self.fetch_article(url).await
    }

    async fn events_for_article(&self, url: &str) -> Result<Vec<PipelineEvent>, StoreError> {
        let query = format!(
            r#"
SELECT {EVENT_COLUMNS}
FROM pipeline_events
WHERE article_url = $1
ORDER BY occurred_at, id
            "#
        );

        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(url)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::query("SELECT", error))?;

        into_events(rows)
    }

    async fn events_by_stage(
        &self,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PipelineEvent>, StoreError> {
        let query = format!(
            r#"
SELECT {EVENT_COLUMNS}
FROM pipeline_events
WHERE
    stage = $1
    AND occurred_at >= $2
    AND occurred_at < $3
ORDER BY occurred_at, id
LIMIT $4
            "#
        );

        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(stage.as_str())
            .bind(from)
            .bind(to)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::query("SELECT", error))?;

        into_events(rows)
    }

    async fn stage_counts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StageCount>, StoreError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
SELECT
    e.stage,
    COUNT(*) AS count,
    COUNT(DISTINCT e.article_url) AS unique_articles
FROM pipeline_events e
JOIN pipeline_stages s ON s.name = e.stage
WHERE
    e.occurred_at >= $1
    AND e.occurred_at < $2
GROUP BY e.stage, s.sort_order
ORDER BY s.sort_order
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::query("SELECT", error))?;

        rows.into_iter()
            .map(|(stage, count, unique_articles)| {
                let stage = stage
                    .parse()
                    .map_err(|e| StoreError::query("SELECT", sqlx::Error::Decode(Box::new(e))))?;
                Ok(StageCount {
                    stage,
                    count,
                    unique_articles,
                })
            })
            .collect()
    }

    async fn provision_partitions(
        &self,
        from: DateTime<Utc>,
        months: u32,
    ) -> Result<Vec<PartitionKey>, StoreError> {
        let mut created = vec![];

        for key in PartitionKey::horizon(from, months) {
            let table = key.table_name();
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(&table)
                .fetch_one(&self.pool)
                .await
                .map_err(|error| StoreError::query("SELECT", error))?;
            if exists {
                continue;
            }

            // Identifiers can't be bound, but both the name and the bounds come from the key.
            let statement = format!(
                r#"
CREATE TABLE IF NOT EXISTS "{table}"
    PARTITION OF {EVENTS_TABLE}
    FOR VALUES FROM ('{}') TO ('{}')
                "#,
                key.start().to_rfc3339(),
                key.end().to_rfc3339(),
            );

            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|error| StoreError::query("CREATE TABLE", error))?;

            created.push(key);
        }

        Ok(created)
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
SELECT child.relname::text
FROM pg_inherits
JOIN pg_class parent ON pg_inherits.inhparent = parent.oid
JOIN pg_class child ON pg_inherits.inhrelid = child.oid
WHERE parent.relname = $1
            "#,
        )
        .bind(EVENTS_TABLE)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::query("SELECT", error))?;

        let mut keys = names
            .iter()
            .map(|name| PartitionKey::parse_table_name(name))
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort();

        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::query("SELECT", error))?;

        Ok(())
    }
}
