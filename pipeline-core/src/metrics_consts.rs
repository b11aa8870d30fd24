// Labeled by outcome (accepted, deduplicated, invalid, failed) and stage
pub const INGEST_EVENTS: &str = "pipeline_ingest_events_total";
pub const INGEST_DURATION: &str = "pipeline_ingest_duration_seconds";
pub const INGEST_BATCHES: &str = "pipeline_ingest_batches_total";
pub const INGEST_BATCH_SIZE: &str = "pipeline_ingest_batch_size";
// Caller-supplied keys that differ from the derived one
pub const IDEMPOTENCY_KEY_MISMATCH: &str = "pipeline_idempotency_key_mismatch_total";
pub const ARTICLES_CREATED: &str = "pipeline_articles_created_total";
pub const WRITE_SATURATION: &str = "pipeline_write_saturation_percent";
pub const STORAGE_TIMEOUTS: &str = "pipeline_storage_timeouts_total";
pub const FUNNEL_QUERIES: &str = "pipeline_funnel_queries_total";
pub const FUNNEL_DURATION: &str = "pipeline_funnel_duration_seconds";
pub const PARTITIONS_CREATED: &str = "pipeline_partitions_created_total";
pub const PARTITIONS_PROVISIONED: &str = "pipeline_partitions_provisioned";
pub const PROVISION_FAILURES: &str = "pipeline_partition_provision_failures_total";
