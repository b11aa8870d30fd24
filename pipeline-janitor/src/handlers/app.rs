use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::health::{HealthRegistry, HealthStatus};
use crate::provisioner::Provisioner;

#[derive(Clone)]
struct AppState {
    liveness: HealthRegistry,
    provisioner: Arc<Provisioner>,
}

pub fn app(liveness: HealthRegistry, provisioner: Arc<Provisioner>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(liveness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            liveness,
            provisioner,
        })
}

pub async fn index() -> &'static str {
    "pipeline janitor"
}

async fn liveness_check(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status().await
}

// Ready once the database answers
async fn readiness(State(state): State<AppState>) -> (StatusCode, String) {
    match state.provisioner.ping().await {
        Ok(()) => (StatusCode::OK, "ready".to_owned()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
