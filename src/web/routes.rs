use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::static_files::{index_handler, script_handler};
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the application router
///
/// `/offer` and `/video/mjpeg` are mounted only when the state carries a
/// video source or MJPEG hub, `/ws` only when there is an input queue.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/", get(index_handler))
        .route("/js/:name", get(script_handler))
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::status));

    if state.video.is_some() {
        router = router.route("/offer", post(handlers::offer));
    }
    if state.mjpeg.is_some() {
        router = router.route("/video/mjpeg", get(handlers::mjpeg_stream));
    }
    if state.queue.is_some() {
        router = router.route("/ws", any(ws_handler));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
