use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;
use pipeline_core::{PgEventStore, SystemClock};
use pipeline_janitor::config::Config;
use pipeline_janitor::handlers::app;
use pipeline_janitor::health::{HealthHandle, HealthRegistry};
use pipeline_janitor::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use pipeline_janitor::provisioner::Provisioner;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn provision_loop(
    provisioner: Arc<Provisioner>,
    liveness: HealthHandle,
    interval_secs: u64,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match provisioner.run_once().await {
            Ok(created) => {
                info!(created = created.len(), "provisioning pass complete");
                liveness.report_healthy().await;
            }
            // Retried on the next tick; liveness lapses if it keeps failing past the deadline
            Err(e) => error!("provisioning pass failed with: {}", e),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    config.validate().expect("invalid configuration");

    let store = PgEventStore::new(&config.pool_config())
        .await
        .expect("failed to connect to the database");
    if config.run_migrations {
        store.migrate().await.expect("failed to run migrations");
    }

    let provisioner = Arc::new(Provisioner::new(
        Arc::new(store),
        Arc::new(SystemClock::default()),
        config.partition_horizon_months,
    ));

    let liveness = HealthRegistry::new();
    let provisioner_liveness = liveness
        .register(
            "provisioner",
            Duration::from_secs(config.provision_interval_secs * 4),
        )
        .await;

    info!(
        horizon_months = config.partition_horizon_months,
        interval_secs = config.provision_interval_secs,
        "starting pipeline janitor"
    );

    let provisioning = tokio::spawn(provision_loop(
        provisioner.clone(),
        provisioner_liveness,
        config.provision_interval_secs,
    ));

    let recorder_handle = setup_metrics_recorder().expect("failed to install metrics recorder");
    let router = setup_metrics_routes(app(liveness, provisioner), recorder_handle);
    let bind = config.bind();
    let http_server = tokio::spawn(async move { serve(router, &bind).await });

    tokio::select! {
        res = provisioning => {
            error!("provisioning loop exited");
            if let Err(e) = res {
                error!("provisioning loop failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server task failed with: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("exiting");
}
