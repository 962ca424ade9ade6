//! API routes

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use postbox_core::DeliveryCoordinator;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{deliver, health};
use crate::state::AppState;

/// Create the API router
pub fn create_router(coordinator: Arc<DeliveryCoordinator>) -> Router {
    let max_body = coordinator.config().get().lmtp.max_message_size;
    let state = AppState { coordinator };

    Router::new()
        .route(
            "/deliver",
            post(deliver::deliver)
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(max_body)),
        )
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
