//! Postbox API - HTTP ingress
//!
//! Delivers messages posted over HTTP through the same coordinator as the
//! LMTP listeners, and exposes health and metrics endpoints.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
