use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pipeline_core::{
    AppendOutcome, Article, EventStore, FunnelAggregator, FunnelConfig, IngestConfig,
    IngestRequest, IngestService, ManualClock, MemoryEventStore, NewEvent, PartitionKey,
    PipelineEvent, Stage, StageCount, StoreError,
};

#[allow(dead_code)]
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
}

/// A store with the current month, and the one before it, provisioned.
#[allow(dead_code)]
pub fn memory_store() -> Arc<MemoryEventStore> {
    let current = PartitionKey::for_timestamp(now());
    let previous = PartitionKey::for_timestamp(current.start() - Duration::days(1));
    Arc::new(MemoryEventStore::with_partitions([previous, current]))
}

#[allow(dead_code)]
pub fn ingest_service(store: Arc<dyn EventStore>, clock: &ManualClock) -> IngestService {
    IngestService::new(store, Arc::new(clock.clone()), IngestConfig::default())
}

#[allow(dead_code)]
pub fn funnel_aggregator(store: Arc<dyn EventStore>, clock: &ManualClock) -> FunnelAggregator {
    FunnelAggregator::new(store, Arc::new(clock.clone()), FunnelConfig::default())
}

#[allow(dead_code)]
pub fn create_request(
    url: &str,
    stage: &str,
    service: &str,
    occurred_at: DateTime<Utc>,
) -> IngestRequest {
    IngestRequest {
        article_url: url.to_owned(),
        source_name: "example_com".to_owned(),
        stage: stage.to_owned(),
        occurred_at: Some(occurred_at),
        service_name: service.to_owned(),
        idempotency_key: None,
        metadata: None,
    }
}

/// Wraps a store and sleeps before every write, to trip storage timeouts.
#[allow(dead_code)]
pub struct SlowStore {
    pub inner: Arc<MemoryEventStore>,
    pub delay: StdDuration,
}

#[async_trait]
impl EventStore for SlowStore {
    async fn upsert_article(&self, candidate: Article) -> Result<(Article, bool), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert_article(candidate).await
    }

    async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.append_event(event).await
    }

    async fn get_article(&self, url: &str) -> Result<Option<Article>, StoreError> {
        self.inner.get_article(url).await
    }

    async fn events_for_article(&self, url: &str) -> Result<Vec<PipelineEvent>, StoreError> {
        self.inner.events_for_article(url).await
    }

    async fn events_by_stage(
        &self,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PipelineEvent>, StoreError> {
        self.inner.events_by_stage(stage, from, to, limit).await
    }

    async fn stage_counts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StageCount>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.stage_counts(from, to).await
    }

    async fn provision_partitions(
        &self,
        from: DateTime<Utc>,
        months: u32,
    ) -> Result<Vec<PartitionKey>, StoreError> {
        self.inner.provision_partitions(from, months).await
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        self.inner.partitions().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Wraps a store and tracks how many writes are running at once.
#[allow(dead_code)]
pub struct CountingStore {
    pub inner: Arc<MemoryEventStore>,
    pub delay: StdDuration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn new(inner: Arc<MemoryEventStore>, delay: StdDuration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Most writes observed in flight at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn tracked<T>(&self, call: impl std::future::Future<Output = T>) -> T {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = call.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl EventStore for CountingStore {
    async fn upsert_article(&self, candidate: Article) -> Result<(Article, bool), StoreError> {
        self.tracked(self.inner.upsert_article(candidate)).await
    }

    async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome, StoreError> {
        self.tracked(self.inner.append_event(event)).await
    }

    async fn get_article(&self, url: &str) -> Result<Option<Article>, StoreError> {
        self.inner.get_article(url).await
    }

    async fn events_for_article(&self, url: &str) -> Result<Vec<PipelineEvent>, StoreError> {
        self.inner.events_for_article(url).await
    }

    async fn events_by_stage(
        &self,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PipelineEvent>, StoreError> {
        self.inner.events_by_stage(stage, from, to, limit).await
    }

    async fn stage_counts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StageCount>, StoreError> {
        self.inner.stage_counts(from, to).await
    }

    async fn provision_partitions(
        &self,
        from: DateTime<Utc>,
        months: u32,
    ) -> Result<Vec<PartitionKey>, StoreError> {
        self.inner.provision_partitions(from, months).await
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        self.inner.partitions().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}
