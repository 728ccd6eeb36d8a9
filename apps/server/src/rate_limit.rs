use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ApiResponse;

// ── Tiers ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateTier {
    /// Read-only public endpoints.
    Public,
    /// Reservation creation and cancellation.
    Booking,
    Admin,
}

/// Sliding-window budget for one tier.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateTier {
    pub fn config(self) -> RateLimitConfig {
        match self {
            Self::Public => RateLimitConfig {
                max_requests: 60,
                window: Duration::from_secs(60),
            },
            Self::Booking => RateLimitConfig {
                max_requests: 5,
                window: Duration::from_secs(300),
            },
            Self::Admin => RateLimitConfig {
                max_requests: 120,
                window: Duration::from_secs(60),
            },
        }
    }
}

// ── Limiter ──

/// In-memory per-IP sliding-window limiter shared by all tiers.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    hits: Arc<DashMap<(RateTier, IpAddr), Vec<Instant>>>,
    overrides: Arc<DashMap<RateTier, RateLimitConfig>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a tier's default budget.
    #[cfg(test)]
    pub fn with_config(self, tier: RateTier, config: RateLimitConfig) -> Self {
        self.overrides.insert(tier, config);
        self
    }

    fn config(&self, tier: RateTier) -> RateLimitConfig {
        self.overrides
            .get(&tier)
            .map(|c| *c)
            .unwrap_or_else(|| tier.config())
    }

    /// `Ok(())` if allowed, `Err(retry_after_secs)` if over budget.
    pub fn check(&self, tier: RateTier, ip: IpAddr) -> Result<(), u64> {
        let config = self.config(tier);
        let now = Instant::now();

        let mut entry = self.hits.entry((tier, ip)).or_default();
        entry.retain(|t| now.duration_since(*t) < config.window);

        if entry.len() >= config.max_requests as usize {
            let retry_after = entry
                .first()
                .map(|oldest| (*oldest + config.window).saturating_duration_since(now))
                .unwrap_or(config.window)
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        entry.push(now);
        Ok(())
    }

    /// Drop entries idle for more than twice their window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.hits.retain(|(tier, _), timestamps| {
            let cutoff = self.config(*tier).window * 2;
            timestamps.retain(|t| now.duration_since(*t) < cutoff);
            !timestamps.is_empty()
        });
    }
}

// ── IP extraction ──

/// Client IP from X-Forwarded-For (reverse proxy) or the socket.
pub fn extract_client_ip(req: &Request) -> IpAddr {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
    if let Some(ip) = forwarded {
        return ip;
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn too_many_requests(retry_after: u64) -> Response {
    let body = ApiResponse::<()>::error(format!(
        "Demasiadas solicitudes. Intenta de nuevo en {} segundos",
        retry_after
    ));
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(body),
    )
        .into_response()
}

/// Middleware; mount with `from_fn_with_state((limiter, tier), rate_limit)`.
pub async fn rate_limit(
    State((limiter, tier)): State<(RateLimiter, RateTier)>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check(tier, ip).map_err(|retry_after| {
        tracing::warn!(%ip, ?tier, retry_after, "rate limited");
        too_many_requests(retry_after)
    })?;
    Ok(next.run(req).await)
}
