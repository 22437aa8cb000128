//! flowrig-server: HTTP + WebSocket surface over the flowrig-core engine.
//!
//! Handlers are thin wrappers: every operation delegates to the engine,
//! registry, catalog or stores; errors map onto HTTP statuses via the
//! core taxonomy.

pub mod routes;
pub mod ws;

pub use routes::{router, AppState};
