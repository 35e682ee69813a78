//! # Stepflow Scheduler
//!
//! Fires registered handlers on their cron expressions by submitting events
//! through the engine client.
//!
//! Multiple scheduler instances may run against one deployment; a TTL-bound
//! leader key in the queue store elects a single firing instance. Followers
//! idle until the key expires or is released, then race to acquire it. On
//! acquisition the new leader starts its per-function timers and replays at
//! most one missed firing per function.

pub mod cron;
pub mod error;
pub mod scheduler;

pub use self::cron::CronSchedule;
pub use error::SchedulerError;
pub use scheduler::{Scheduler, SchedulerConfig};
