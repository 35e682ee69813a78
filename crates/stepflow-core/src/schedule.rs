//! Cron execution bookkeeping record

use serde::{Deserialize, Serialize};

/// Last-fire bookkeeping for one scheduled function.
///
/// The scheduler upserts this after every firing; missed-run detection reads
/// `last_execution_time` on leadership acquisition to decide whether a
/// catch-up firing is owed. Unique on `function_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronExecutionRecord {
    pub function_id: String,
    /// Milliseconds since epoch of the most recent firing.
    pub last_execution_time: i64,
    /// Next fire computed from the cron expression, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scheduled_time: Option<i64>,
    pub cron_expression: String,
    pub updated_at: i64,
}
