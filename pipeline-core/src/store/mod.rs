use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::partition::PartitionKey;
use crate::types::{Article, NewEvent, PipelineEvent, Stage};

mod memory;
mod pg;

pub use memory::MemoryEventStore;
pub use pg::PgEventStore;

/// Result of appending an event. A redelivered event is a successful outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(i64),
    AlreadyRecorded,
}

impl AppendOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, AppendOutcome::Inserted(_))
    }
}

/// Event count and distinct article count for one stage over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCount {
    pub stage: Stage,
    pub count: i64,
    pub unique_articles: i64,
}

/// Logical append/query contract of the event log.
///
/// Implementations own partition routing: callers only ever pass timestamps and windows.
/// Windows are half-open, `[from, to)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert `candidate` unless a row for its url exists. Returns the stored row, which is the
    /// existing one when `created` is false. Must be atomic under concurrent callers.
    async fn upsert_article(&self, candidate: Article) -> Result<(Article, bool), StoreError>;

    /// Insert `event` unless `(idempotency_key, occurred_at)` is already recorded.
    async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome, StoreError>;

    async fn get_article(&self, url: &str) -> Result<Option<Article>, StoreError>;

    /// All events for an article, ordered by `occurred_at`.
    async fn events_for_article(&self, url: &str) -> Result<Vec<PipelineEvent>, StoreError>;

    /// Events of one stage in `[from, to)`, ordered by `occurred_at`, at most `limit` of them.
    async fn events_by_stage(
        &self,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PipelineEvent>, StoreError>;

    /// Count and distinct-article count per stage in `[from, to)`. Stages without events may be
    /// omitted.
    async fn stage_counts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StageCount>, StoreError>;

    /// Create any missing partition for the month of `from` and the `months` months after it.
    /// Returns the partitions that did not exist before.
    async fn provision_partitions(
        &self,
        from: DateTime<Utc>,
        months: u32,
    ) -> Result<Vec<PartitionKey>, StoreError>;

    /// Provisioned partitions, oldest first.
    async fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
