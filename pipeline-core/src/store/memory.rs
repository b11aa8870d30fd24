use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::partition::PartitionKey;
use crate::store::{AppendOutcome, EventStore, StageCount};
use crate::types::{Article, NewEvent, PipelineEvent, Stage};

/// One month of events. Rows are append-only and addressed by their slot in `events`.
#[derive(Default)]
struct Partition {
    events: Vec<PipelineEvent>,
    dedup: HashSet<(String, DateTime<Utc>)>,
    by_stage: BTreeSet<(Stage, DateTime<Utc>, usize)>,
    by_article: HashMap<String, Vec<usize>>,
    by_time: BTreeSet<(DateTime<Utc>, usize)>,
}

impl Partition {
    fn push(&mut self, event: PipelineEvent) {
        let slot = self.events.len();
        self.dedup
            .insert((event.idempotency_key.clone(), event.occurred_at));
        self.by_stage.insert((event.stage, event.occurred_at, slot));
        self.by_article
            .entry(event.article_url.clone())
            .or_default()
            .push(slot);
        self.by_time.insert((event.occurred_at, slot));
        self.events.push(event);
    }

    fn stage_slots(
        &self,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = usize> + '_ {
        self.by_stage
            .range((stage, from, 0)..(stage, to, 0))
            .map(|(_, _, slot)| *slot)
    }

    fn window_slots(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = usize> + '_ {
        self.by_time
            .range((from, 0)..(to, 0))
            .map(|(_, slot)| *slot)
    }
}

#[derive(Default)]
struct EventLog {
    next_id: i64,
    partitions: BTreeMap<PartitionKey, Partition>,
}

/// An `EventStore` that keeps everything in process memory, sharded by month in the application
/// layer. Writes for a month that hasn't been provisioned fail exactly like they do in Postgres.
#[derive(Default)]
pub struct MemoryEventStore {
    articles: RwLock<HashMap<String, Article>>,
    log: RwLock<EventLog>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(keys: impl IntoIterator<Item = PartitionKey>) -> Self {
        let partitions = keys
            .into_iter()
            .map(|key| (key, Partition::default()))
            .collect();

        Self {
            articles: RwLock::default(),
            log: RwLock::new(EventLog {
                next_id: 0,
                partitions,
            }),
        }
    }

    /// Total number of stored events, across partitions.
    pub async fn event_count(&self) -> usize {
        let log = self.log.read().await;
        log.partitions.values().map(|p| p.events.len()).sum()
    }

    pub async fn article_count(&self) -> usize {
        self.articles.read().await.len()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_article(&self, candidate: Article) -> Result<(Article, bool), StoreError> {
        // The write lock makes check-and-insert a single step for concurrent callers
        let mut articles = self.articles.write().await;
        if let Some(existing) = articles.get(&candidate.url) {
            return Ok((existing.clone(), false));
        }

        articles.insert(candidate.url.clone(), candidate.clone());
        Ok((candidate, true))
    }

    async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome, StoreError> {
        if !self.articles.read().await.contains_key(&event.article_url) {
            return Err(StoreError::ArticleMissing(event.article_url));
        }

        let mut log = self.log.write().await;
        let key = PartitionKey::for_timestamp(event.occurred_at);
        let EventLog {
            next_id,
            partitions,
        } = &mut *log;
        let partition = partitions
            .get_mut(&key)
            .ok_or(StoreError::PartitionMissing {
                occurred_at: event.occurred_at,
            })?;

        if partition
            .dedup
            .contains(&(event.idempotency_key.clone(), event.occurred_at))
        {
            return Ok(AppendOutcome::AlreadyRecorded);
        }

        *next_id += 1;
        let id = *next_id;
        partition.push(event.into_event(id));

        Ok(AppendOutcome::Inserted(id))
    }

    async fn get_article(&self, url: &str) -> Result<Option<Article>, StoreError> {
        Ok(self.articles.read().await.get(url).cloned())
    }

    async fn events_for_article(&self, url: &str) -> Result<Vec<PipelineEvent>, StoreError> {
        let log = self.log.read().await;
        let mut events: Vec<PipelineEvent> = log
            .partitions
            .values()
            .flat_map(|partition| {
                partition
                    .by_article
                    .get(url)
                    .into_iter()
                    .flatten()
                    .map(move |slot| partition.events[*slot].clone())
            })
            .collect();

        events.sort_by_key(|event| (event.occurred_at, event.id));
        Ok(events)
    }

    async fn events_by_stage(
        &self,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PipelineEvent>, StoreError> {
        if from >= to {
            return Ok(vec![]);
        }

        let log = self.log.read().await;
        let mut events = vec![];

        for key in PartitionKey::covering(from, to) {
            let Some(partition) = log.partitions.get(&key) else {
                continue;
            };
            for slot in partition.stage_slots(stage, from, to) {
                if events.len() == limit {
                    return Ok(events);
                }
                events.push(partition.events[slot].clone());
            }
        }

        Ok(events)
    }

    async fn stage_counts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StageCount>, StoreError> {
        if from >= to {
            return Ok(vec![]);
        }

        let log = self.log.read().await;
        let partitions: Vec<&Partition> = PartitionKey::covering(from, to)
            .iter()
            .filter_map(|key| log.partitions.get(key))
            .collect();

        let mut tally: BTreeMap<Stage, (i64, HashSet<&str>)> = BTreeMap::new();
        for partition in &partitions {
            for slot in partition.window_slots(from, to) {
                let event = &partition.events[slot];
                let (count, articles) = tally.entry(event.stage).or_default();
                *count += 1;
                articles.insert(event.article_url.as_str());
            }
        }

        let counts = tally
            .into_iter()
            .map(|(stage, (count, articles))| StageCount {
                stage,
                count,
                unique_articles: articles.len() as i64,
            })
            .collect();

        Ok(counts)
    }

    async fn provision_partitions(
        &self,
        from: DateTime<Utc>,
        months: u32,
    ) -> Result<Vec<PartitionKey>, StoreError> {
        let mut log = self.log.write().await;
        let mut created = vec![];

        for key in PartitionKey::horizon(from, months) {
            if !log.partitions.contains_key(&key) {
                log.partitions.insert(key, Partition::default());
                created.push(key);
            }
        }

        Ok(created)
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        Ok(self.log.read().await.partitions.keys().copied().collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
