use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{IdempotencyKeyPolicy, ValidationPolicy};
use crate::error::ValidationError;
use crate::identity::{derive_idempotency_key, extract_domain, hash_url};

pub const DEFAULT_METADATA_SCHEMA_VERSION: i16 = 1;

/// Producer-defined event metadata. Opaque to the core.
pub type Metadata = Map<String, Value>;

/// One named step of the content pipeline.
/// The set is closed: anything that doesn't parse into a `Stage` is rejected at ingestion.
/// Ordering is only used to present funnels; events may arrive in any stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Crawled,
    Indexed,
    Classified,
    Routed,
    Published,
}

impl Stage {
    /// Every stage, in canonical funnel order.
    pub const ALL: [Stage; 5] = [
        Stage::Crawled,
        Stage::Indexed,
        Stage::Classified,
        Stage::Routed,
        Stage::Published,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Crawled => "crawled",
            Stage::Indexed => "indexed",
            Stage::Classified => "classified",
            Stage::Routed => "routed",
            Stage::Published => "published",
        }
    }

    /// Position in the funnel, starting at 1. Mirrors the seeded `pipeline_stages` table.
    pub fn sort_order(&self) -> i16 {
        match self {
            Stage::Crawled => 1,
            Stage::Indexed => 2,
            Stage::Classified => 3,
            Stage::Routed => 4,
            Stage::Published => 5,
        }
    }

    pub fn is_valid(name: &str) -> bool {
        Stage::from_str(name).is_ok()
    }
}

impl FromStr for Stage {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawled" => Ok(Stage::Crawled),
            "indexed" => Ok(Stage::Indexed),
            "classified" => Ok(Stage::Classified),
            "routed" => Ok(Stage::Routed),
            "published" => Ok(Stage::Published),
            invalid => Err(ValidationError::InvalidStage(invalid.to_owned())),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical identity of a piece of content. Written once, on the first event seen for its url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Article {
    pub url: String,
    pub url_hash: String,
    pub domain: String,
    pub source_name: String,
    pub first_seen_at: DateTime<Utc>,
}

impl Article {
    /// Build the row that would be inserted if `url` has never been seen.
    pub fn new(url: &str, source_name: &str, first_seen_at: DateTime<Utc>) -> Self {
        Self {
            url: url.to_owned(),
            url_hash: hash_url(url),
            domain: extract_domain(url),
            source_name: source_name.to_owned(),
            first_seen_at,
        }
    }
}

/// A stage transition recorded for an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: i64,
    pub article_url: String,
    pub stage: Stage,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub metadata_schema_version: i16,
    pub idempotency_key: String,
}

/// The chunk of data needed to append an event. The store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub article_url: String,
    pub stage: Stage,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub service_name: String,
    pub metadata: Option<Metadata>,
    pub metadata_schema_version: i16,
    pub idempotency_key: String,
}

impl NewEvent {
    pub fn into_event(self, id: i64) -> PipelineEvent {
        PipelineEvent {
            id,
            article_url: self.article_url,
            stage: self.stage,
            occurred_at: self.occurred_at,
            received_at: self.received_at,
            service_name: self.service_name,
            metadata: self.metadata,
            metadata_schema_version: self.metadata_schema_version,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// The payload emitted by upstream services for a single stage transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub article_url: String,
    #[serde(default)]
    pub source_name: String,
    // Kept as a raw string so an unknown stage is a validation error rather than a decode error
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchIngestRequest {
    pub events: Vec<IngestRequest>,
}

impl BatchIngestRequest {
    pub fn validate(&self, max_batch_size: usize) -> Result<(), ValidationError> {
        if self.events.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if self.events.len() > max_batch_size {
            return Err(ValidationError::BatchTooLarge {
                size: self.events.len(),
                max: max_batch_size,
            });
        }
        Ok(())
    }
}

/// An `IngestRequest` that passed validation, with its stage parsed and its key resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub article_url: String,
    pub source_name: String,
    pub stage: Stage,
    pub occurred_at: DateTime<Utc>,
    pub service_name: String,
    pub idempotency_key: String,
    pub metadata: Option<Metadata>,
    /// Set when a caller-supplied key was replaced by the derived one.
    pub key_mismatch: bool,
}

impl ValidatedRequest {
    pub fn new_event(&self, received_at: DateTime<Utc>) -> NewEvent {
        NewEvent {
            article_url: self.article_url.clone(),
            stage: self.stage,
            occurred_at: self.occurred_at,
            received_at,
            service_name: self.service_name.clone(),
            metadata: self.metadata.clone(),
            metadata_schema_version: DEFAULT_METADATA_SCHEMA_VERSION,
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

fn require(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

impl IngestRequest {
    /// Check the request against `policy`. `now` is only used for the age and skew limits.
    pub fn validate(
        &self,
        policy: &ValidationPolicy,
        now: DateTime<Utc>,
    ) -> Result<ValidatedRequest, ValidationError> {
        require(&self.article_url, "article_url")?;
        require(&self.source_name, "source_name")?;
        require(&self.service_name, "service_name")?;
        let stage: Stage = self.stage.parse()?;

        let occurred_at = match self.occurred_at {
            Some(occurred_at) if occurred_at != DateTime::<Utc>::UNIX_EPOCH => {
                normalize_timestamp(occurred_at)
            }
            _ => return Err(ValidationError::ZeroOccurredAt),
        };

        if let Some(max_age) = policy.max_event_age {
            if occurred_at < now - max_age {
                return Err(ValidationError::StaleEvent { occurred_at });
            }
        }
        if let Some(skew) = policy.max_future_skew {
            if occurred_at > now + skew {
                return Err(ValidationError::FutureEvent { occurred_at });
            }
        }

        let metadata = match &self.metadata {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => return Err(ValidationError::MetadataNotAnObject),
        };

        let supplied = match &self.idempotency_key {
            Some(key) if key.trim().is_empty() => {
                return Err(ValidationError::EmptyIdempotencyKey)
            }
            Some(key) => Some(key.as_str()),
            None => None,
        };
        let derived = derive_idempotency_key(
            &self.service_name,
            stage,
            &self.article_url,
            occurred_at,
        );
        let (idempotency_key, key_mismatch) = match (policy.key_policy, supplied) {
            (IdempotencyKeyPolicy::TrustCaller, Some(key)) => (key.to_owned(), false),
            (IdempotencyKeyPolicy::Derive, Some(key)) => {
                let mismatch = key != derived;
                (derived, mismatch)
            }
            (_, None) => (derived, false),
        };

        Ok(ValidatedRequest {
            article_url: self.article_url.clone(),
            source_name: self.source_name.clone(),
            stage,
            occurred_at,
            service_name: self.service_name.clone(),
            idempotency_key,
            metadata,
            key_mismatch,
        })
    }
}

/// Truncate to the microsecond precision Postgres keeps for `timestamptz`.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(ts)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelStage {
    pub name: String,
    pub count: i64,
    pub unique_articles: i64,
}

impl FunnelStage {
    pub fn empty(stage: Stage) -> Self {
        Self {
            name: stage.as_str().to_owned(),
            count: 0,
            unique_articles: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelResponse {
    pub period: String,
    pub timezone: String,
    pub from: DateTime<chrono::FixedOffset>,
    pub to: DateTime<chrono::FixedOffset>,
    pub stages: Vec<FunnelStage>,
    pub generated_at: DateTime<Utc>,
}
