use async_trait::async_trait;
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::broker::{BrokerHealth, MessageBroker};

/// Connectivity probe for a service's own data store.
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    async fn ping(&self) -> bool;
}

#[derive(Clone)]
struct HealthState {
    broker: Arc<dyn MessageBroker>,
    database: Option<Arc<dyn DatabaseProbe>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    broker: &'static str,
    database: &'static str,
}

/// Health endpoint for a worker process without a data store.
pub fn router(broker: Arc<dyn MessageBroker>) -> Router {
    router_with_database(broker, None)
}

/// Health endpoint reporting broker and database connectivity separately.
///
/// Returns 200 while every configured dependency is up and 503 otherwise,
/// so orchestrators can route around a degraded worker without killing it
/// mid-recovery.
pub fn router_with_database(
    broker: Arc<dyn MessageBroker>,
    database: Option<Arc<dyn DatabaseProbe>>,
) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(HealthState { broker, database })
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let broker_up = state.broker.health().await == BrokerHealth::Reachable;
    let (database_up, database) = match &state.database {
        None => (true, "not-configured"),
        Some(probe) => {
            if probe.ping().await {
                (true, "reachable")
            } else {
                (false, "unreachable")
            }
        }
    };

    let healthy = broker_up && database_up;
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        broker: if broker_up { "reachable" } else { "unreachable" },
        database,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
