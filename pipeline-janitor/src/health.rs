use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Liveness of the janitor's background loops.
///
/// Each loop registers a component and must report healthy more often than its deadline.
/// The process is healthy only while every component is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    Starting,
    HealthyUntil(DateTime<Utc>),
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(until) if *until > now)
    }
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    pub async fn report_healthy(&self) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.deadline).unwrap_or(chrono::Duration::zero());
        self.report_status(ComponentStatus::HealthyUntil(until)).await;
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        self.components
            .write()
            .await
            .insert(self.component.clone(), status);
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        self.components
            .write()
            .await
            .insert(component.to_owned(), ComponentStatus::Starting);

        HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let now = Utc::now();
        let components = self.components.read().await.clone();
        // An empty registry has nothing running yet
        let healthy = !components.is_empty() && components.values().all(|s| s.is_healthy(now));

        HealthStatus {
            healthy,
            components,
        }
    }
}
