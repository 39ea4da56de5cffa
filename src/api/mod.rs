//! Operator API: thin axum handlers over the engine services, plus the
//! WebSocket push channel.

pub mod routes;

pub use routes::{router, AppState};
