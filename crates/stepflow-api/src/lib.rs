//! # Stepflow Dashboard API
//!
//! Monitoring and operations endpoints over a running deployment:
//!
//! - `GET /executions?status=&limit=&skip=`: newest-first listing
//! - `GET /executions/{id}`: document record, steps, and the raw KV hash
//! - `POST /executions/{id}/retry`: reset and re-enqueue
//! - `GET /stats`: per-status counts
//! - `POST /send`: submit an event
//!
//! Everything here is a thin adapter: writes go through the engine client
//! (retry deliberately uses the full reset path, not a bare re-enqueue) and
//! reads go through the document store.

pub mod config;
pub mod routes;

pub use config::ApiConfig;
pub use routes::{router, AppState};
