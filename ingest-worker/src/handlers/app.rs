use std::sync::Arc;

use axum::{extract::State, routing, Router};
use health::{HealthRegistry, HealthStatus};
use ingest_common::channel::MessageChannel;

use super::messages;

#[derive(Clone)]
pub struct AppState {
    /// Publishes raw content submitted over HTTP into the pipeline's queue.
    pub producer: Arc<dyn MessageChannel>,
    pub liveness: HealthRegistry,
    pub readiness: HealthRegistry,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_liveness", routing::get(liveness))
        .route("/_readiness", routing::get(readiness))
        .route("/messages", routing::post(messages::post_message))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "ingest"
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

async fn readiness(State(state): State<AppState>) -> HealthStatus {
    state.readiness.get_status()
}
