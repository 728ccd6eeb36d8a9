use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers::{admin, booking, closures, health};
use crate::rate_limit::{rate_limit, RateLimiter, RateTier};
use crate::AppState;

/// Vite dev server, always allowed next to WEBAPP_URL.
const DEV_ORIGIN: &str = "http://localhost:5173";

/// CORS: whitelist WEBAPP_URL when configured, otherwise allow any origin.
fn cors(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let Some(webapp_url) = &config.webapp_url else {
        return layer.allow_origin(Any);
    };

    let origins: Vec<HeaderValue> = [webapp_url.as_str(), DEV_ORIGIN]
        .into_iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// The full HTTP API: one group per rate tier, plus unlimited health.
pub fn app(state: Arc<AppState>, limiter: RateLimiter) -> Router {
    let tier = |tier: RateTier| from_fn_with_state((limiter.clone(), tier), rate_limit);

    // 1. No limit: health checks
    let no_limit_routes = Router::new().route("/api/health", get(health::health));

    // 2. Public: read-only booking data
    let public_routes = Router::new()
        .route("/api/services", get(booking::list_services))
        .route("/api/calendar", get(booking::calendar))
        .route("/api/availability", get(booking::availability))
        .layer(tier(RateTier::Public));

    // 3. Booking: create and cancel
    let booking_routes = Router::new()
        .route("/api/reservations", post(booking::create_reservation))
        .route("/api/reservations/{id}", delete(booking::cancel_reservation))
        .layer(tier(RateTier::Booking));

    // 4. Admin panel
    let admin_routes = Router::new()
        .route(
            "/api/admin/services",
            get(admin::list_all_services).post(admin::create_service),
        )
        .route("/api/admin/services/{id}", put(admin::update_service))
        .route("/api/admin/reservations", get(admin::list_reservations))
        .route(
            "/api/admin/reservations/{id}",
            delete(admin::cancel_reservation),
        )
        .route(
            "/api/admin/reservations/{id}/status",
            put(admin::update_reservation_status),
        )
        .route(
            "/api/admin/blocked-hours",
            get(closures::list_blocked_hours).post(closures::create_blocked_hour),
        )
        .route(
            "/api/admin/blocked-hours/past",
            post(closures::sweep_past_slots),
        )
        .route(
            "/api/admin/blocked-hours/{id}",
            delete(closures::delete_blocked_hour),
        )
        .route(
            "/api/admin/vacations",
            get(closures::list_vacations).post(closures::create_vacation),
        )
        .route(
            "/api/admin/vacations/{id}",
            delete(closures::delete_vacation),
        )
        .route(
            "/api/admin/schedule",
            get(closures::get_schedule).put(closures::update_schedule),
        )
        .route("/api/admin/clients", get(admin::list_clients))
        .route(
            "/api/admin/clients/{phone}/block",
            put(admin::set_client_blocked),
        )
        .route(
            "/api/admin/roles",
            get(admin::list_admins).post(admin::add_admin),
        )
        .route("/api/admin/roles/{tg_id}", delete(admin::remove_admin))
        .layer(tier(RateTier::Admin));

    let cors = cors(&state.config);
    Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
