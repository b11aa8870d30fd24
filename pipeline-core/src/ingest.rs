use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::config::IngestConfig;
use crate::error::{StoreError, ValidationError};
use crate::metrics_consts::{
    ARTICLES_CREATED, IDEMPOTENCY_KEY_MISMATCH, INGEST_BATCHES, INGEST_BATCH_SIZE,
    INGEST_DURATION, INGEST_EVENTS, STORAGE_TIMEOUTS, WRITE_SATURATION,
};
use crate::store::{AppendOutcome, EventStore};
use crate::time::Clock;
use crate::types::{Article, BatchIngestRequest, IngestRequest, Stage, ValidatedRequest};

/// What happened to a single ingestion request.
#[derive(Debug)]
pub enum IngestResult {
    /// A new event row was written.
    Accepted { event_id: i64, article_created: bool },
    /// The event was already recorded. Retries land here and callers should treat it as success.
    Deduplicated { idempotency_key: String },
    /// Rejected before any storage access.
    Invalid(ValidationError),
    Failed(StoreError),
}

impl IngestResult {
    pub fn status(&self) -> IngestStatus {
        match self {
            IngestResult::Accepted { .. } => IngestStatus::Accepted,
            IngestResult::Deduplicated { .. } => IngestStatus::Deduplicated,
            IngestResult::Invalid(_) => IngestStatus::Invalid,
            IngestResult::Failed(_) => IngestStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            IngestResult::Accepted { .. } | IngestResult::Deduplicated { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Accepted,
    Deduplicated,
    Invalid,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Accepted => "accepted",
            IngestStatus::Deduplicated => "deduplicated",
            IngestStatus::Invalid => "invalid",
            IngestStatus::Failed => "failed",
        }
    }
}

/// Wire-friendly view of one batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemReport {
    pub index: usize,
    pub status: IngestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-item results of a batch, in input order, plus totals.
/// `failed` counts both validation and storage failures.
#[derive(Debug)]
pub struct BatchResult {
    pub results: Vec<IngestResult>,
    pub accepted: usize,
    pub deduplicated: usize,
    pub failed: usize,
}

impl BatchResult {
    fn from_results(results: Vec<IngestResult>) -> Self {
        let mut batch = BatchResult {
            results: Vec::with_capacity(results.len()),
            accepted: 0,
            deduplicated: 0,
            failed: 0,
        };

        for result in results {
            match result.status() {
                IngestStatus::Accepted => batch.accepted += 1,
                IngestStatus::Deduplicated => batch.deduplicated += 1,
                IngestStatus::Invalid | IngestStatus::Failed => batch.failed += 1,
            }
            batch.results.push(result);
        }

        batch
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn items(&self) -> Vec<BatchItemReport> {
        self.results
            .iter()
            .enumerate()
            .map(|(index, result)| {
                let (event_id, error) = match result {
                    IngestResult::Accepted { event_id, .. } => (Some(*event_id), None),
                    IngestResult::Deduplicated { .. } => (None, None),
                    IngestResult::Invalid(e) => (None, Some(e.to_string())),
                    IngestResult::Failed(e) => (None, Some(e.to_string())),
                };
                BatchItemReport {
                    index,
                    status: result.status(),
                    event_id,
                    error,
                }
            })
            .collect()
    }
}

/// Turns ingestion requests into event rows.
///
/// Cloning is cheap and clones share the write limiter, so the bound on in-flight storage
/// operations holds across every caller of the service.
#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: IngestConfig,
    write_limiter: Arc<Semaphore>,
}

impl IngestService {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>, config: IngestConfig) -> Self {
        // A zero permit semaphore would park every write forever
        let permits = config.max_concurrent_writes.max(1);
        Self {
            store,
            clock,
            config,
            write_limiter: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    /// Stop admitting writes. Items waiting on the limiter, and any later ones, fail with
    /// `StoreError::Closed`; writes already in flight run to completion.
    pub fn close(&self) {
        self.write_limiter.close();
    }

    #[instrument(skip_all, fields(stage = %req.stage, service = %req.service_name))]
    pub async fn ingest_one(&self, req: &IngestRequest) -> IngestResult {
        let start = Instant::now();
        let now = self.clock.now();

        let result = match req.validate(&self.config.validation, now) {
            Ok(validated) => self.record(validated).await,
            Err(e) => {
                debug!("rejected invalid event: {}", e);
                IngestResult::Invalid(e)
            }
        };

        let stage = req.stage.parse::<Stage>().map_or("unknown", |s| s.as_str());
        let labels = [("outcome", result.status().as_str()), ("stage", stage)];
        metrics::counter!(INGEST_EVENTS, &labels).increment(1);
        metrics::histogram!(INGEST_DURATION).record(start.elapsed().as_secs_f64());

        result
    }

    /// Ingest every request independently. Items run concurrently, bounded by the write limiter,
    /// and the results line up with `batch.events`. A failing item never affects the others.
    #[instrument(skip_all, fields(events = batch.events.len()))]
    pub async fn ingest_batch(
        &self,
        batch: &BatchIngestRequest,
    ) -> Result<BatchResult, ValidationError> {
        batch.validate(self.config.max_batch_size)?;

        metrics::counter!(INGEST_BATCHES).increment(1);
        metrics::histogram!(INGEST_BATCH_SIZE).record(batch.events.len() as f64);

        let results = join_all(batch.events.iter().map(|req| self.ingest_one(req))).await;
        let result = BatchResult::from_results(results);

        debug!(
            accepted = result.accepted,
            deduplicated = result.deduplicated,
            failed = result.failed,
            "ingested batch"
        );

        Ok(result)
    }

    async fn record(&self, req: ValidatedRequest) -> IngestResult {
        if req.key_mismatch {
            metrics::counter!(IDEMPOTENCY_KEY_MISMATCH).increment(1);
            debug!(
                article_url = %req.article_url,
                "caller idempotency key differs from the derived key, using the derived key"
            );
        }

        let _permit = match self.write_limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => return IngestResult::Failed(StoreError::Closed),
        };
        self.report_saturation();

        let received_at = self.clock.now();

        let candidate = Article::new(&req.article_url, &req.source_name, received_at);
        let article_created = match self
            .with_timeout(self.store.upsert_article(candidate))
            .await
        {
            Ok((_, created)) => created,
            Err(e) => {
                warn!(article_url = %req.article_url, "failed to upsert article: {}", e);
                return IngestResult::Failed(e);
            }
        };
        if article_created {
            metrics::counter!(ARTICLES_CREATED).increment(1);
        }

        let event = req.new_event(received_at);
        match self.with_timeout(self.store.append_event(event)).await {
            Ok(AppendOutcome::Inserted(event_id)) => IngestResult::Accepted {
                event_id,
                article_created,
            },
            Ok(AppendOutcome::AlreadyRecorded) => {
                debug!(idempotency_key = %req.idempotency_key, "event already recorded");
                IngestResult::Deduplicated {
                    idempotency_key: req.idempotency_key,
                }
            }
            Err(e) => {
                warn!(
                    article_url = %req.article_url,
                    stage = %req.stage,
                    "failed to append event: {}",
                    e
                );
                IngestResult::Failed(e)
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.storage_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(STORAGE_TIMEOUTS).increment(1);
                Err(StoreError::Timeout(self.config.storage_timeout))
            }
        }
    }

    fn report_saturation(&self) {
        let permits = self.config.max_concurrent_writes.max(1);
        metrics::gauge!(WRITE_SATURATION)
            .set(1f64 - self.write_limiter.available_permits() as f64 / permits as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::partition::PartitionKey;
    use crate::store::MemoryEventStore;
    use crate::time::ManualClock;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn service() -> (IngestService, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::with_partitions([PartitionKey::for_timestamp(
            now(),
        )]));
        let service = IngestService::new(
            store.clone(),
            Arc::new(ManualClock::new(now())),
            IngestConfig::default(),
        );
        (service, store)
    }

    fn request(stage: &str) -> IngestRequest {
        IngestRequest {
            article_url: "https://example.com/a".to_owned(),
            source_name: "example_com".to_owned(),
            stage: stage.to_owned(),
            occurred_at: Some(now() - Duration::minutes(1)),
            service_name: "crawler".to_owned(),
            idempotency_key: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_storage() {
        let (service, store) = service();

        let result = service.ingest_one(&request("archived")).await;

        assert!(matches!(
            result,
            IngestResult::Invalid(ValidationError::InvalidStage(_))
        ));
        assert_eq!(store.article_count().await, 0);
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_event_creates_article() {
        let (service, _) = service();

        let first = service.ingest_one(&request("crawled")).await;
        assert!(matches!(
            first,
            IngestResult::Accepted {
                article_created: true,
                ..
            }
        ));

        let second = service.ingest_one(&request("indexed")).await;
        assert!(matches!(
            second,
            IngestResult::Accepted {
                article_created: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_closed_service_fails_writes() {
        let (service, store) = service();
        service.close();

        let result = service.ingest_one(&request("crawled")).await;

        assert!(matches!(result, IngestResult::Failed(StoreError::Closed)));
        assert_eq!(store.event_count().await, 0);
    }

    #[test]
    fn test_batch_result_totals_and_report() {
        let result = BatchResult::from_results(vec![
            IngestResult::Accepted {
                event_id: 7,
                article_created: true,
            },
            IngestResult::Invalid(ValidationError::MissingField("article_url")),
            IngestResult::Deduplicated {
                idempotency_key: "k".to_owned(),
            },
            IngestResult::Failed(StoreError::ArticleMissing("https://example.com/a".to_owned())),
        ]);

        assert_eq!(result.len(), 4);
        assert_eq!(result.accepted, 1);
        assert_eq!(result.deduplicated, 1);
        assert_eq!(result.failed, 2);

        let items = result.items();
        assert_eq!(
            items[0],
            BatchItemReport {
                index: 0,
                status: IngestStatus::Accepted,
                event_id: Some(7),
                error: None,
            }
        );
        assert_eq!(items[1].status, IngestStatus::Invalid);
        assert_eq!(items[1].error.as_deref(), Some("article_url is required"));
        assert_eq!(items[2].status, IngestStatus::Deduplicated);
        assert_eq!(items[3].index, 3);
        assert_eq!(items[3].status, IngestStatus::Failed);
    }
}
