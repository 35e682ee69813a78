//! # Stepflow Storage
//!
//! Store contracts and backends for the stepflow engine.
//!
//! The engine runs against two stores with distinct roles:
//!
//! - a **queue store** ([`QueueStore`]): string-only hashes for hot execution
//!   metadata, a blocking FIFO list carrying queued execution ids, and
//!   TTL-bound keys for scheduler leader election. The atomic blocking pop is
//!   the linearization point of the whole queue.
//! - a **document store** ([`DocStore`]): the durable source of truth, with
//!   typed collections, secondary indexes and history queries.
//!
//! Each contract ships a production backend (Redis / PostgreSQL) and an
//! in-memory backend with identical semantics for tests and single-process
//! deployments.

pub mod docs;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod queue;
pub mod redis;

pub use docs::{DocStore, ExecutionFilter, ExecutionUpdate, SortOrder};
pub use error::StoreError;
pub use memory::{MemoryDocStore, MemoryQueueStore};
pub use postgres::PostgresDocStore;
pub use queue::{QueueKeys, QueueStore, DEFAULT_QUEUE_PREFIX};
pub use self::redis::RedisQueueStore;
