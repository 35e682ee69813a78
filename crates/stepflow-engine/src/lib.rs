//! # Stepflow Engine
//!
//! The execution core of stepflow: durable queueing, name-keyed dispatch and
//! per-step checkpointing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Client                              │
//! │   (writes the execution to both stores, enqueues the id)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │ (N dequeue loops, handler dispatch, retries, orphan rescue)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        StepRunner                            │
//! │  (memoizes each named step: memo map → KV cache → compute)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers are invoked at-least-once; individual steps complete successfully
//! at most once because a retried handler replays its finished steps from the
//! checkpoint cache.

pub mod client;
pub mod error;
pub mod handler;
pub mod step_runner;
pub mod worker;

pub use client::{Client, SubmitRequest};
pub use error::EngineError;
pub use handler::{EventEnvelope, FunctionHandler, Handler, HandlerContext, HandlerResult};
pub use step_runner::StepRunner;
pub use worker::{PoolStatus, WorkerPool, WorkerPoolConfig};
