use axum::{
    extract::State,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::cache::StateStore;
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::gateway::ConnectionState;
use crate::registry::Registry;

/// State for the status API.
#[derive(Clone)]
pub struct StatusAppState {
    pub connection: watch::Receiver<ConnectionState>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<Registry>,
    pub cache: Arc<StateStore>,
}

#[derive(Serialize)]
struct StatusResponse {
    connection: ConnectionState,
    dispatcher: DispatchStats,
    extensions: Vec<String>,
    cached_entities: usize,
}

pub fn create_status_router(state: StatusAppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .with_state(Arc::new(state))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status
async fn status(State(state): State<Arc<StatusAppState>>) -> Response {
    let connection = *state.connection.borrow();
    Json(StatusResponse {
        connection,
        dispatcher: state.dispatcher.metrics(),
        extensions: state.registry.extension_names(),
        cached_entities: state.cache.len(),
    })
    .into_response()
}
