use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stepflow_api::{router, ApiConfig, AppState};
use stepflow_core::EventBus;
use stepflow_engine::Client;
use stepflow_storage::{
    DocStore, PostgresDocStore, QueueKeys, QueueStore, RedisQueueStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepflow_api=debug,stepflow_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ApiConfig::from_env()?;

    let queue: Arc<dyn QueueStore> =
        Arc::new(RedisQueueStore::connect(&config.redis_url).await?);
    let docs: Arc<dyn DocStore> =
        Arc::new(PostgresDocStore::connect(&config.database_url).await?);
    docs.ensure_indexes(true).await?;
    tracing::info!("store connections established");

    let keys = QueueKeys::new(config.queue_prefix.clone());
    let bus = EventBus::new();
    let client = Arc::new(Client::new(
        Arc::clone(&queue),
        Arc::clone(&docs),
        keys.clone(),
        bus,
    ));
    client.handshake().await?;

    let state = AppState {
        client,
        docs,
        queue,
        keys,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!("dashboard listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
