use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Enumeration of reasons an ingestion request is rejected before it reaches storage.
/// These are never retried by the core: resubmitting the same request yields the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("{0:?} is not a valid pipeline stage")]
    InvalidStage(String),
    #[error("occurred_at must be set")]
    ZeroOccurredAt,
    #[error("occurred_at {occurred_at} is older than the accepted window")]
    StaleEvent { occurred_at: DateTime<Utc> },
    #[error("occurred_at {occurred_at} is in the future")]
    FutureEvent { occurred_at: DateTime<Utc> },
    #[error("idempotency_key must not be empty when supplied")]
    EmptyIdempotencyKey,
    #[error("metadata must be a JSON object")]
    MetadataNotAnObject,
    #[error("batch holds no event")]
    EmptyBatch,
    #[error("batch holds {size} events, the maximum is {max}")]
    BatchTooLarge { size: usize, max: usize },
}

/// Enumeration of errors raised by an `EventStore`.
/// Errors that originate from sqlx are wrapped to provide additional context.
/// A duplicate event is not an error and never shows up here.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("no partition provisioned for events occurring at {occurred_at}")]
    PartitionMissing { occurred_at: DateTime<Utc> },
    #[error("no article recorded for {0}")]
    ArticleMissing(String),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("the write limiter is closed")]
    Closed,
    #[error("{0} is not a valid partition name")]
    InvalidPartitionName(String),
    #[error("running migrations failed with: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        StoreError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

/// Enumeration of errors for funnel queries.
#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("{0:?} is not a valid funnel period")]
    InvalidPeriod(String),
    #[error("funnel window must end after it starts: [{from}, {to})")]
    InvalidWindow {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while parsing configuration values from the environment.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not a valid idempotency key policy")]
    InvalidKeyPolicy(String),
    #[error("{0} is not a valid timezone")]
    InvalidTimezone(String),
    #[error("{0} is not a valid duration")]
    InvalidDuration(String),
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}
