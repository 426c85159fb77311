use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};

use config::Config;
use database::Database;
use rate_limit::{RateLimitConfig, RateLimiter};
use realtime::Hub;

pub mod config;
pub mod database;
pub mod error;
pub mod middleware;
pub mod rate_limit;
pub mod realtime;
pub mod result;
pub mod routes;
pub mod utils;

/// Per-process state. Each instance owns its own limiter counters and hub.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Option<Database>,
    pub hub: Arc<Hub>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// State with an in-memory limiter built from `config`.
    pub fn new(config: Config, db: Option<Database>) -> Self {
        let limiter = RateLimiter::new(RateLimitConfig::from_config(&config));
        Self::with_limiter(config, db, limiter)
    }

    pub fn with_limiter(config: Config, db: Option<Database>, limiter: RateLimiter) -> Self {
        Self {
            config,
            db,
            hub: Arc::new(Hub::new()),
            rate_limiter: Arc::new(limiter),
        }
    }
}

/// API routes behind identity resolution and the rate limiter, plus the
/// socket endpoint.
pub fn app(state: AppState) -> Router {
    // layers run bottom-up: authenticate first so the limiter can key by user
    let api = Router::new()
        .route("/health", get(routes::health::health))
        .route("/realtime/stats", get(routes::realtime::stats))
        .route("/realtime/notify", post(routes::realtime::notify))
        .layer(from_fn_with_state(
            state.rate_limiter.clone(),
            middleware::rate_limit,
        ))
        .layer(from_fn_with_state(state.clone(), middleware::authenticate));

    Router::new()
        .nest(&state.config.api_base_uri, api)
        .route(&state.config.ws_path, get(realtime::socket::ws_handler))
        .layer(from_fn(middleware::log_errors))
        .with_state(state)
}
