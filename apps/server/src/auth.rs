use axum::http::{header, HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

use crate::error::{api_error, ApiError};
use crate::models::{AdminRole, TelegramUser};
use crate::{db, AppState};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of initData before it's considered expired (24 hours).
const MAX_AUTH_AGE_SECS: i64 = 86400;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("authorization scheme must be `tma`")]
    WrongScheme,
    #[error("initData has no hash")]
    MissingHash,
    #[error("initData expired ({age_secs}s old)")]
    Expired { age_secs: i64 },
    #[error("initData signature mismatch")]
    BadSignature,
    #[error("initData carries no valid user")]
    MissingUser,
}

/// HMAC-SHA256 of the data-check-string, keyed by the bot token
/// (see https://core.telegram.org/bots/webapps#validating-data-received-via-the-mini-app).
fn sign(data_check_string: &str, bot_token: &str) -> String {
    let mut secret_mac =
        HmacSha256::new_from_slice(b"WebAppData").expect("HMAC can take key of any size");
    secret_mac.update(bot_token.as_bytes());
    let secret_key = secret_mac.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&secret_key).expect("HMAC can take key of any size");
    mac.update(data_check_string.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Validate Telegram Mini App initData as of `now` (unix seconds).
pub fn validate_init_data(
    init_data: &str,
    bot_token: &str,
    now: i64,
) -> Result<TelegramUser, AuthError> {
    let params: BTreeMap<String, String> = url::form_urlencoded::parse(init_data.as_bytes())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let hash = params.get("hash").ok_or(AuthError::MissingHash)?;

    if let Some(auth_date) = params.get("auth_date").and_then(|d| d.parse::<i64>().ok()) {
        let age_secs = now - auth_date;
        if age_secs > MAX_AUTH_AGE_SECS {
            return Err(AuthError::Expired { age_secs });
        }
    }

    let data_check_string = params
        .iter()
        .filter(|(k, _)| k.as_str() != "hash")
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");

    if sign(&data_check_string, bot_token) != *hash {
        return Err(AuthError::BadSignature);
    }

    params
        .get("user")
        .and_then(|u| serde_json::from_str::<TelegramUser>(u).ok())
        .ok_or(AuthError::MissingUser)
}

/// Extract the Telegram user from `Authorization: tma <initData>`.
pub fn user_from_headers(headers: &HeaderMap, bot_token: &str) -> Result<TelegramUser, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingHeader)?;
    let init_data = value.strip_prefix("tma ").ok_or(AuthError::WrongScheme)?;
    validate_init_data(init_data, bot_token, chrono::Utc::now().timestamp())
}

/// An authenticated member of the admin role store.
#[derive(Debug, Clone)]
pub struct Admin {
    pub user: TelegramUser,
    pub role: AdminRole,
}

/// Authenticate the caller and check the admin role store.
pub async fn require_admin(headers: &HeaderMap, state: &AppState) -> Result<Admin, ApiError> {
    // An empty key would let anyone sign initData.
    if state.config.bot_token.is_empty() {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Panel de administración no configurado",
        ));
    }
    let user = user_from_headers(headers, &state.config.bot_token).map_err(|e| {
        tracing::warn!("admin auth rejected: {}", e);
        api_error(StatusCode::UNAUTHORIZED, "Autenticación inválida")
    })?;

    let role = db::admin_role(&state.db, user.id)
        .await
        .map_err(crate::error::db_error("admin_role"))?
        .ok_or_else(|| api_error(StatusCode::FORBIDDEN, "Acceso denegado"))?;

    Ok(Admin { user, role })
}

/// Like [`require_admin`], but only the owner passes.
pub async fn require_owner(headers: &HeaderMap, state: &AppState) -> Result<Admin, ApiError> {
    let admin = require_admin(headers, state).await?;
    if admin.role != AdminRole::Owner {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "Solo el dueño puede gestionar administradores",
        ));
    }
    Ok(admin)
}

#[cfg(test)]
pub mod test_support {
    use super::sign;

    /// Build a correctly signed `tma` header value for `user_id`.
    pub fn signed_header(bot_token: &str, user_id: i64, auth_date: i64) -> String {
        let user = format!(r#"{{"id":{user_id},"first_name":"Test"}}"#);
        let data_check_string = format!("auth_date={auth_date}\nuser={user}");
        let hash = sign(&data_check_string, bot_token);
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("auth_date", &auth_date.to_string())
            .append_pair("user", &user)
            .append_pair("hash", &hash)
            .finish();
        format!("tma {query}")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::signed_header;
    use super::*;
    use axum::http::HeaderValue;

    const TOKEN: &str = "123:abc";
    const NOW: i64 = 1_780_000_000;

    fn init_data(header: &str) -> &str {
        header.strip_prefix("tma ").unwrap()
    }

    #[test]
    fn test_valid_init_data() {
        let header = signed_header(TOKEN, 77, NOW - 60);
        let user = validate_init_data(init_data(&header), TOKEN, NOW).unwrap();
        assert_eq!(user.id, 77);
        assert_eq!(user.first_name, "Test");
    }

    #[test]
    fn test_wrong_token_rejected() {
        let header = signed_header(TOKEN, 77, NOW - 60);
        assert_eq!(
            validate_init_data(init_data(&header), "999:other", NOW).unwrap_err(),
            AuthError::BadSignature
        );
    }

    #[test]
    fn test_expired_rejected() {
        let header = signed_header(TOKEN, 77, NOW - MAX_AUTH_AGE_SECS - 1);
        assert!(matches!(
            validate_init_data(init_data(&header), TOKEN, NOW),
            Err(AuthError::Expired { .. })
        ));
    }

    #[test]
    fn test_missing_hash() {
        assert_eq!(
            validate_init_data("auth_date=1&user=%7B%7D", TOKEN, NOW).unwrap_err(),
            AuthError::MissingHash
        );
    }

    #[test]
    fn test_header_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            user_from_headers(&headers, TOKEN).unwrap_err(),
            AuthError::MissingHeader
        );
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(
            user_from_headers(&headers, TOKEN).unwrap_err(),
            AuthError::WrongScheme
        );
    }
}
