use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use radr::{
    AppState,
    config::Config,
    database::{MemoryStore, PgStore, RadrStore},
    events::{EventBus, LogNotifier, PushNotifier, WebhookNotifier, spawn_dispatcher},
    middleware::RateLimiter,
    router::build_router,
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
#[cfg(debug_assertions)]
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn open_store(config: &Config) -> Result<Arc<dyn RadrStore>, Box<dyn Error>> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'radr';").await?;
                Ok(())
            })
        })
        .connect(url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Connected to Postgres, migrations applied");
    Ok(Arc::new(PgStore::new(pool)))
}

fn notifier(config: &Config) -> Arc<dyn PushNotifier> {
    match config.push_webhook_url.as_deref() {
        Some(endpoint) => match WebhookNotifier::new(endpoint, config.push_timeout()) {
            Ok(webhook) => {
                tracing::info!("Push notifications go to {}", endpoint);
                Arc::new(webhook)
            }
            Err(e) => {
                tracing::warn!("Push webhook unavailable, falling back to logs: {}", e);
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store = open_store(&config).await?;
    let (events, rx) = EventBus::new();
    spawn_dispatcher(rx, store.clone(), notifier(&config), config.push_timeout());

    let rate_limiter = RateLimiter::from_config(&config)?;
    if rate_limiter.is_none() {
        tracing::info!("REDIS_URL not set, rate limiting disabled");
    }

    let state = AppState::new(store, config.clone(), events);
    let router = build_router(state, rate_limiter);

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(CorsLayer::permissive())
    };

    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
