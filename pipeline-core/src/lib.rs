// Modules stay private and the parts callers need are re-exported, so internals can move around
// without breaking the public API

// Identity
mod identity;
pub use identity::derive_idempotency_key;
pub use identity::extract_domain;
pub use identity::hash_url;
pub use identity::short_hash;
pub use identity::IDEMPOTENCY_KEY_SEPARATOR;
pub use identity::UNKNOWN_DOMAIN;

// Types
mod types;
pub use types::normalize_timestamp;
pub use types::Article;
pub use types::BatchIngestRequest;
pub use types::FunnelResponse;
pub use types::FunnelStage;
pub use types::IngestRequest;
pub use types::Metadata;
pub use types::NewEvent;
pub use types::PipelineEvent;
pub use types::Stage;
pub use types::ValidatedRequest;
pub use types::DEFAULT_METADATA_SCHEMA_VERSION;

// Errors
mod error;
// Config values that failed to parse
pub use error::ConfigError;
// Funnel windows and periods that make no sense, or a failed storage read
pub use error::FunnelError;
// Persistence failures - connections, queries, missing partitions or articles, timeouts
pub use error::StoreError;
// Requests rejected before storage is touched
pub use error::ValidationError;

// Config
mod config;
pub use config::Config;
pub use config::DisplayTimezone;
pub use config::EnvMsDuration;
pub use config::FunnelConfig;
pub use config::IdempotencyKeyPolicy;
pub use config::IngestConfig;
pub use config::PoolConfig;
pub use config::ValidationPolicy;

// Time
mod time;
pub use time::Clock;
pub use time::ManualClock;
pub use time::SystemClock;

// Storage
mod partition;
pub use partition::PartitionKey;
pub use partition::EVENTS_TABLE;
pub use partition::MAX_HORIZON_MONTHS;

mod store;
pub use store::AppendOutcome;
pub use store::EventStore;
pub use store::MemoryEventStore;
pub use store::PgEventStore;
pub use store::StageCount;

// Ingestion
mod ingest;
pub use ingest::BatchItemReport;
pub use ingest::BatchResult;
pub use ingest::IngestResult;
pub use ingest::IngestService;
pub use ingest::IngestStatus;

// Funnels
mod funnel;
pub use funnel::FunnelAggregator;
pub use funnel::FunnelPeriod;

pub mod metrics_consts;
