use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use common::{create_request, ingest_service, memory_store, now, CountingStore, SlowStore};
use futures::future::join_all;
use pipeline_core::{
    derive_idempotency_key, BatchIngestRequest, EventStore, IdempotencyKeyPolicy, IngestConfig,
    IngestResult, IngestService, IngestStatus, ManualClock, Stage, StoreError, ValidationError,
    ValidationPolicy,
};
use serde_json::json;

mod common;

const URL: &str = "https://example.com/a";

#[tokio::test]
async fn test_same_request_twice_is_recorded_once() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = ingest_service(store.clone(), &clock);
    let req = create_request(URL, "crawled", "crawler", now() - Duration::minutes(1));

    let first = service.ingest_one(&req).await;
    assert!(matches!(first, IngestResult::Accepted { .. }));

    // A retry arrives later, after the upstream call timed out
    clock.advance(Duration::seconds(30));
    let second = service.ingest_one(&req).await;
    assert!(second.is_success());
    let IngestResult::Deduplicated { idempotency_key } = second else {
        panic!("expected a duplicate, got {:?}", second);
    };
    assert_eq!(
        idempotency_key,
        derive_idempotency_key("crawler", Stage::Crawled, URL, now() - Duration::minutes(1))
    );

    let events = store.events_for_article(URL).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].received_at, now());
}

#[tokio::test]
async fn test_recorded_event_matches_request() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = ingest_service(store.clone(), &clock);

    let mut req = create_request(URL, "classified", "classifier", now() - Duration::minutes(3));
    req.metadata = Some(json!({"quality_score": 72, "topics": ["crime", "local"]}));

    let IngestResult::Accepted {
        event_id,
        article_created,
    } = service.ingest_one(&req).await
    else {
        panic!("event should be accepted");
    };
    assert!(article_created);

    let events = store.events_for_article(URL).await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.id, event_id);
    assert_eq!(event.stage, Stage::Classified);
    assert_eq!(event.service_name, "classifier");
    assert_eq!(event.occurred_at, now() - Duration::minutes(3));
    assert_eq!(event.metadata_schema_version, 1);
    assert_eq!(
        event.metadata.as_ref().unwrap()["topics"],
        json!(["crime", "local"])
    );

    let article = store.get_article(URL).await.unwrap().unwrap();
    assert_eq!(article.domain, "example.com");
    assert_eq!(article.source_name, "example_com");
    assert_eq!(article.first_seen_at, now());
}

#[tokio::test]
async fn test_batch_isolates_invalid_items() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = ingest_service(store.clone(), &clock);

    let batch = BatchIngestRequest {
        events: vec![
            create_request(URL, "crawled", "crawler", now() - Duration::seconds(3)),
            create_request(URL, "shredded", "crawler", now() - Duration::seconds(2)),
            create_request(URL, "indexed", "index-manager", now() - Duration::seconds(1)),
        ],
    };

    let result = service.ingest_batch(&batch).await.unwrap();

    assert_eq!(result.len(), 3);
    assert!(matches!(result.results[0], IngestResult::Accepted { .. }));
    assert!(matches!(
        result.results[1],
        IngestResult::Invalid(ValidationError::InvalidStage(_))
    ));
    assert!(matches!(result.results[2], IngestResult::Accepted { .. }));
    assert_eq!(result.accepted, 2);
    assert_eq!(result.deduplicated, 0);
    assert_eq!(result.failed, 1);

    let statuses: Vec<IngestStatus> = result.items().iter().map(|item| item.status).collect();
    assert_eq!(
        statuses,
        vec![
            IngestStatus::Accepted,
            IngestStatus::Invalid,
            IngestStatus::Accepted
        ]
    );
    assert_eq!(store.event_count().await, 2);
}

#[tokio::test]
async fn test_batch_results_follow_input_order() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = ingest_service(store.clone(), &clock);

    let events: Vec<_> = (0..50)
        .map(|i| {
            create_request(
                &format!("https://example.com/{i}"),
                "crawled",
                "crawler",
                now() - Duration::seconds(i),
            )
        })
        .collect();
    let result = service
        .ingest_batch(&BatchIngestRequest { events })
        .await
        .unwrap();

    assert_eq!(result.accepted, 50);
    for (index, item) in result.results.iter().enumerate() {
        let IngestResult::Accepted { event_id, .. } = item else {
            panic!("item {index} was not accepted");
        };
        let url = format!("https://example.com/{index}");
        let stored = store.events_for_article(&url).await.unwrap();
        assert_eq!(stored[0].id, *event_id);
    }
}

#[tokio::test]
async fn test_duplicate_within_batch() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = ingest_service(store.clone(), &clock);
    let req = create_request(URL, "routed", "router", now() - Duration::seconds(5));

    let result = service
        .ingest_batch(&BatchIngestRequest {
            events: vec![req.clone(), req],
        })
        .await
        .unwrap();

    assert_eq!(result.accepted, 1);
    assert_eq!(result.deduplicated, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(store.event_count().await, 1);
}

#[tokio::test]
async fn test_batch_level_validation() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = IngestService::new(
        store.clone(),
        Arc::new(clock),
        IngestConfig {
            max_batch_size: 2,
            ..Default::default()
        },
    );

    let empty = service.ingest_batch(&BatchIngestRequest::default()).await;
    assert!(matches!(empty, Err(ValidationError::EmptyBatch)));

    let req = create_request(URL, "crawled", "crawler", now());
    let oversized = service
        .ingest_batch(&BatchIngestRequest {
            events: vec![req; 3],
        })
        .await;
    assert!(matches!(
        oversized,
        Err(ValidationError::BatchTooLarge { size: 3, max: 2 })
    ));
    assert_eq!(store.event_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_writers_create_one_article() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = ingest_service(store.clone(), &clock);

    let requests: Vec<_> = Stage::ALL
        .iter()
        .flat_map(|stage| {
            (0..8).map(move |i| {
                create_request(URL, stage.as_str(), "crawler", now() - Duration::seconds(i))
            })
        })
        .collect();

    let results = join_all(requests.iter().map(|req| {
        let service = service.clone();
        async move { service.ingest_one(req).await }
    }))
    .await;

    let created = results
        .iter()
        .filter(|result| {
            matches!(
                result,
                IngestResult::Accepted {
                    article_created: true,
                    ..
                }
            )
        })
        .count();
    assert_eq!(created, 1);
    assert_eq!(store.article_count().await, 1);
    assert_eq!(store.event_count().await, 40);
}

#[tokio::test]
async fn test_unprovisioned_month_fails_the_item() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = ingest_service(store.clone(), &clock);

    let far_future = now() + Duration::days(120);
    let result = service
        .ingest_one(&create_request(URL, "published", "publisher", far_future))
        .await;

    assert!(matches!(
        result,
        IngestResult::Failed(StoreError::PartitionMissing { occurred_at }) if occurred_at == far_future
    ));
    assert_eq!(store.event_count().await, 0);

    store.provision_partitions(far_future, 0).await.unwrap();
    let retried = service
        .ingest_one(&create_request(URL, "published", "publisher", far_future))
        .await;
    assert!(matches!(retried, IngestResult::Accepted { .. }));
}

#[tokio::test]
async fn test_slow_storage_times_out() {
    let inner = memory_store();
    let store = Arc::new(SlowStore {
        inner: inner.clone(),
        delay: StdDuration::from_millis(500),
    });
    let service = IngestService::new(
        store,
        Arc::new(ManualClock::new(now())),
        IngestConfig {
            storage_timeout: StdDuration::from_millis(20),
            ..Default::default()
        },
    );

    let result = service
        .ingest_one(&create_request(URL, "crawled", "crawler", now()))
        .await;

    assert!(matches!(
        result,
        IngestResult::Failed(StoreError::Timeout(timeout)) if timeout == StdDuration::from_millis(20)
    ));
    assert_eq!(inner.event_count().await, 0);
}

#[tokio::test]
async fn test_validation_limits_from_config() {
    let store = memory_store();
    let service = IngestService::new(
        store.clone(),
        Arc::new(ManualClock::new(now())),
        IngestConfig {
            validation: ValidationPolicy {
                max_event_age: Some(Duration::hours(24)),
                max_future_skew: Some(Duration::zero()),
                key_policy: IdempotencyKeyPolicy::Derive,
            },
            ..Default::default()
        },
    );

    let stale = service
        .ingest_one(&create_request(URL, "crawled", "crawler", now() - Duration::hours(30)))
        .await;
    assert!(matches!(
        stale,
        IngestResult::Invalid(ValidationError::StaleEvent { .. })
    ));

    let future = service
        .ingest_one(&create_request(URL, "crawled", "crawler", now() + Duration::minutes(1)))
        .await;
    assert!(matches!(
        future,
        IngestResult::Invalid(ValidationError::FutureEvent { .. })
    ));

    assert_eq!(store.article_count().await, 0);
}

#[tokio::test]
async fn test_trusted_caller_keys() {
    let store = memory_store();
    let service = IngestService::new(
        store.clone(),
        Arc::new(ManualClock::new(now())),
        IngestConfig {
            validation: ValidationPolicy {
                key_policy: IdempotencyKeyPolicy::TrustCaller,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let occurred_at = now() - Duration::minutes(1);

    // Different services, same caller key and time: the store treats them as one event
    let mut first = create_request(URL, "crawled", "crawler", occurred_at);
    first.idempotency_key = Some("batch-17-item-3".to_owned());
    let mut second = create_request(URL, "crawled", "crawler-v2", occurred_at);
    second.idempotency_key = Some("batch-17-item-3".to_owned());

    assert!(matches!(
        service.ingest_one(&first).await,
        IngestResult::Accepted { .. }
    ));
    assert!(matches!(
        service.ingest_one(&second).await,
        IngestResult::Deduplicated { idempotency_key } if idempotency_key == "batch-17-item-3"
    ));
}

#[tokio::test]
async fn test_derived_keys_ignore_caller_mistakes() {
    let store = memory_store();
    let clock = ManualClock::new(now());
    let service = ingest_service(store.clone(), &clock);
    let occurred_at = now() - Duration::minutes(1);

    let mut first = create_request(URL, "indexed", "index-manager", occurred_at);
    first.idempotency_key = Some("typo".to_owned());
    let mut retry = first.clone();
    retry.idempotency_key = Some("different-typo".to_owned());

    assert!(matches!(
        service.ingest_one(&first).await,
        IngestResult::Accepted { .. }
    ));
    assert!(matches!(
        service.ingest_one(&retry).await,
        IngestResult::Deduplicated { .. }
    ));

    let events = store.events_for_article(URL).await.unwrap();
    assert_eq!(
        events[0].idempotency_key,
        derive_idempotency_key("index-manager", Stage::Indexed, URL, occurred_at)
    );
}

fn bounded_service(store: Arc<CountingStore>, clock: &ManualClock, permits: usize) -> IngestService {
    IngestService::new(
        store,
        Arc::new(clock.clone()),
        IngestConfig {
            max_concurrent_writes: permits,
            ..IngestConfig::default()
        },
    )
}

fn distinct_articles(count: usize) -> BatchIngestRequest {
    BatchIngestRequest {
        events: (0..count)
            .map(|i| {
                create_request(
                    &format!("https://example.com/story/{i}"),
                    "crawled",
                    "crawler",
                    now() - Duration::seconds(i as i64 + 1),
                )
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_batch_writes_respect_concurrency_limit() {
    let store = Arc::new(CountingStore::new(memory_store(), StdDuration::from_millis(5)));
    let clock = ManualClock::new(now());
    let service = bounded_service(store.clone(), &clock, 3);

    let result = service.ingest_batch(&distinct_articles(40)).await.unwrap();

    assert_eq!(result.accepted, 40);
    assert_eq!(result.failed, 0);
    assert!(store.peak() <= 3, "peak in flight was {}", store.peak());
    assert!(store.peak() > 1, "batch items never overlapped");
}

#[tokio::test]
async fn test_concurrent_batches_share_the_limit() {
    let store = Arc::new(CountingStore::new(memory_store(), StdDuration::from_millis(5)));
    let clock = ManualClock::new(now());
    let service = bounded_service(store.clone(), &clock, 2);

    let first = distinct_articles(15);
    let mut second = distinct_articles(15);
    for req in &mut second.events {
        req.stage = "indexed".to_owned();
        req.service_name = "index-manager".to_owned();
    }

    let (a, b) = tokio::join!(service.ingest_batch(&first), service.ingest_batch(&second));

    assert_eq!(a.unwrap().accepted, 15);
    assert_eq!(b.unwrap().accepted, 15);
    assert!(store.peak() <= 2, "peak in flight was {}", store.peak());
    assert_eq!(store.inner.event_count().await, 30);
}
