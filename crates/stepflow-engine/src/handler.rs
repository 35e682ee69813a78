//! Handler registration contract
//!
//! A handler binds an event name to an async function plus its retry policy
//! and optional cron schedule. Dispatch is name-keyed over raw JSON payloads;
//! typed decoding happens inside the handler, from `event.data`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::step_runner::StepRunner;

/// What a handler returns: its result value, or an opaque failure that is
/// recorded on the execution and fed to the retry policy.
pub type HandlerResult = anyhow::Result<Value>;

/// The event as delivered to a handler.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub name: String,
    pub data: Value,
    /// The execution id.
    pub id: String,
    /// Submission time of the execution, milliseconds since epoch.
    pub timestamp: i64,
}

/// Everything a handler invocation receives: the event and the step runner
/// bound to this execution.
pub struct HandlerContext {
    pub event: EventEnvelope,
    pub step: StepRunner,
}

/// A registered event handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The event name this handler owns.
    fn id(&self) -> &str;

    /// How many times a failed execution is re-enqueued before it is
    /// terminally failed. Zero means a single attempt.
    fn retries(&self) -> u32 {
        0
    }

    /// Delay before a retry re-enters the queue.
    fn retry_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Cron expression for scheduled invocation, if any.
    fn cron(&self) -> Option<&str> {
        None
    }

    async fn handle(&self, ctx: HandlerContext) -> HandlerResult;
}

type HandlerFn =
    Arc<dyn Fn(HandlerContext) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// A [`Handler`] built from a closure.
///
/// # Example
///
/// ```ignore
/// let handler = FunctionHandler::new("send-welcome", |ctx| async move {
///     let rendered = ctx
///         .step
///         .run("render template", || async { render(&ctx.event.data) })
///         .await?;
///     Ok(serde_json::json!({ "rendered": rendered }))
/// })
/// .with_retries(2)
/// .with_retry_delay(Duration::from_secs(5));
/// ```
#[derive(Clone)]
pub struct FunctionHandler {
    id: String,
    retries: u32,
    retry_delay: Duration,
    cron: Option<String>,
    run: HandlerFn,
}

impl FunctionHandler {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            id: id.into(),
            retries: 0,
            retry_delay: Duration::ZERO,
            cron: None,
            run: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron = Some(expression.into());
        self
    }
}

#[async_trait]
impl Handler for FunctionHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    fn cron(&self) -> Option<&str> {
        self.cron.as_deref()
    }

    async fn handle(&self, ctx: HandlerContext) -> HandlerResult {
        (self.run)(ctx).await
    }
}

impl std::fmt::Debug for FunctionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionHandler")
            .field("id", &self.id)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("cron", &self.cron)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_carries_metadata() {
        let handler = FunctionHandler::new("nightly-report", |_ctx| async {
            Ok(Value::Null)
        })
        .with_retries(3)
        .with_retry_delay(Duration::from_millis(250))
        .with_cron("0 0 3 * * *");

        assert_eq!(handler.id(), "nightly-report");
        assert_eq!(handler.retries(), 3);
        assert_eq!(handler.retry_delay(), Duration::from_millis(250));
        assert_eq!(handler.cron(), Some("0 0 3 * * *"));
    }

    #[test]
    fn defaults_are_single_attempt_unscheduled() {
        let handler = FunctionHandler::new("plain", |_ctx| async { Ok(Value::Null) });
        assert_eq!(handler.retries(), 0);
        assert_eq!(handler.retry_delay(), Duration::ZERO);
        assert_eq!(handler.cron(), None);
    }
}
