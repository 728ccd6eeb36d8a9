mod alert_layer;
mod auth;
mod clients;
mod config;
mod db;
mod error;
mod handlers;
mod models;
mod notify;
mod rate_limit;
mod routes;
mod slots;

use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use config::Config;
use notify::Notifier;
use rate_limit::RateLimiter;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub notifier: Notifier,
    pub started_at: Instant,
}

/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config first so the alert layer knows where to send errors.
    let config = Config::from_env()?;
    let notifier = Notifier::new(config.bot_token.clone(), config.owner_tg_id);

    // ── Tracing: console + optional Telegram error alerts ──
    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    if notifier.is_enabled() {
        registry
            .with(alert_layer::AlertLayer::new(notifier.clone()))
            .init();
    } else {
        registry.init();
        tracing::warn!("BOT_TOKEN not set, notifications and the admin panel are disabled");
    }

    // ── Database ──
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    db::run_migrations(&pool).await?;
    db::ensure_owner(&pool, config.owner_tg_id).await?;

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState {
        db: pool,
        config,
        notifier,
        started_at: Instant::now(),
    });

    // ── Background task: block today's slots once they start ──
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(
            sweep_state.config.past_slot_sweep_secs,
        ));
        loop {
            interval.tick().await;
            let now = sweep_state.config.shop_now();
            if let Err(e) = handlers::closures::block_past_slots(
                &sweep_state.db,
                sweep_state.config.slot_duration_min,
                now,
            )
            .await
            {
                tracing::error!("past-slot sweep failed: {}", e);
            }
        }
    });

    // ── Background task: cleanup stale rate limit entries ──
    let rate_limiter = RateLimiter::new();
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    let app = routes::app(state, rate_limiter);

    tracing::info!("Barbershop server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
