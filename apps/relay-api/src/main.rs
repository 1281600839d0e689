use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::config::Config;
use relay_api::db::kv::{MemoryStore, PresenceStore};
use relay_api::db::redis_store::RedisStore;
use relay_api::gateway::bus::{GroupBus, MemoryFabric, RedisBus};
use relay_api::AppState;

/// How long open connections get to release presence after shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let (store, bus): (Arc<dyn PresenceStore>, Arc<dyn GroupBus>) = match &config.redis_url {
        Some(url) => {
            // Sets outlive their members by one TTL window.
            let store = RedisStore::connect(url, &config.key_prefix, config.presence_ttl_secs * 2)
                .await
                .expect("failed to connect presence store to Redis");
            let bus = RedisBus::connect(url)
                .await
                .expect("failed to connect group bus to Redis");
            let store: Arc<dyn PresenceStore> = Arc::new(store);
            let bus: Arc<dyn GroupBus> = Arc::new(bus);
            (store, bus)
        }
        None => {
            tracing::warn!("REDIS_URL not set, running single-process with in-memory presence and bus");
            let store: Arc<dyn PresenceStore> = Arc::new(MemoryStore::new());
            let bus: Arc<dyn GroupBus> = Arc::new(MemoryFabric::new().attach());
            (store, bus)
        }
    };

    tracing::info!(
        instance_id = %config.instance_id,
        key_prefix = %config.key_prefix,
        auth = config.auth_api_key.is_some(),
        "relay-api configured"
    );

    let state = AppState::new(config, store, bus);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(relay_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .expect("server error");

    drain(&state).await;
    tracing::info!("relay-api stopped");
}

/// Resolve on SIGINT/SIGTERM and tell every connection to close.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!(connections = state.registry.len(), "shutdown requested");
    state.begin_shutdown();
}

/// Wait for connection tasks to release their presence, up to [`DRAIN_TIMEOUT`].
async fn drain(state: &AppState) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while !state.registry.is_empty() {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                remaining = state.registry.len(),
                "drain timed out, remaining presence will expire by TTL"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
