use std::net::{IpAddr, SocketAddr};

use tolcprep_backend::{
    AppState, app,
    config::Config,
    database::Database,
    rate_limit::{RateLimitConfig, RateLimiter},
};
#[cfg(debug_assertions)]
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("Failed to load configuration");

    let db = match &config.database_url {
        Some(url) => Some(
            Database::connect(url)
                .await
                .expect("Failed to connect to Postgres"),
        ),
        None => {
            tracing::warn!("DATABASE_URL not set, running without a database");
            None
        }
    };

    if config.notify_subjects.is_empty() {
        tracing::warn!("NOTIFY_SUBJECTS not set, POST /realtime/notify refuses every caller");
    }

    let limit = RateLimitConfig::from_config(&config);
    let limiter = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).expect("Failed to create Redis client");
            tracing::info!("rate limit counters shared through Redis");
            RateLimiter::with_redis(limit, client)
        }
        None => {
            tracing::info!("rate limit counters kept in process memory, not shared between instances");
            RateLimiter::new(limit)
        }
    };

    let state = AppState::with_limiter(config, db, limiter);
    let router = app(state.clone());

    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding permissive CORS layer for development");
        router.layer(CorsLayer::permissive())
    };

    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    tracing::info!(
        "Server listening on {} (api {}, socket {})",
        addr,
        state.config.api_base_uri,
        state.config.ws_path
    );
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
