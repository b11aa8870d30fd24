use std::sync::Arc;

use pipeline_core::metrics_consts::{
    PARTITIONS_CREATED, PARTITIONS_PROVISIONED, PROVISION_FAILURES,
};
use pipeline_core::{Clock, EventStore, PartitionKey, StoreError};
use tracing::{error, info};

use crate::metrics::now_seconds;

const LAST_PROVISIONED_AT: &str = "pipeline_partitions_last_provisioned_timestamp";

/// Keeps monthly event partitions provisioned ahead of traffic.
pub struct Provisioner {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    horizon_months: u32,
}

impl Provisioner {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>, horizon_months: u32) -> Self {
        Self {
            store,
            clock,
            horizon_months,
        }
    }

    /// Create any partition missing from the current month through the horizon.
    /// Returns the partitions created by this run.
    pub async fn run_once(&self) -> Result<Vec<PartitionKey>, StoreError> {
        let now = self.clock.now();

        let created = match self
            .store
            .provision_partitions(now, self.horizon_months)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                metrics::counter!(PROVISION_FAILURES).increment(1);
                error!("failed to provision partitions: {}", e);
                return Err(e);
            }
        };

        for key in &created {
            info!(partition = %key, table = key.table_name(), "created partition");
        }
        metrics::counter!(PARTITIONS_CREATED).increment(created.len() as u64);

        let provisioned = self.store.partitions().await?;
        metrics::gauge!(PARTITIONS_PROVISIONED).set(provisioned.len() as f64);
        metrics::gauge!(LAST_PROVISIONED_AT).set(now_seconds());

        Ok(created)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}
