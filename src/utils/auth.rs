use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{self, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cyder_tools::auth::{decode_jwt, issue_jwt, DecodingKey, EncodingKey, JwtError, JwtValidation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::i18n::{tr, Msg};
use super::now_secs;
use crate::controller::error::{ErrorKind, RelayError};
use crate::database::token::Token;
use crate::relay::info::AuthContext;
use crate::schema::enum_def::TokenStatus;
use crate::service::app_state::AppState;

const ISSUER: &str = "cyder-relay";
const ADMIN_SUBJECT: &str = "ADMIN";
const ADMIN_TOKEN_ISSUE_SEC: u64 = 3600;

pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn issue_admin_token(&self, id: i64) -> String {
        let claims = RelayClaims::new(id, ADMIN_SUBJECT.to_string(), ADMIN_TOKEN_ISSUE_SEC);
        issue_jwt(&self.encoding, &claims)
    }

    pub fn decode_admin_token(&self, token: &str) -> Result<i64, JwtError> {
        let claims = self.decode(token)?;
        if claims.sub != ADMIN_SUBJECT {
            return Err(JwtError::Invalid);
        }
        claims.aud.parse::<i64>().map_err(|_| JwtError::Parse)
    }

    /// OAuth2 style bearer for API calls: `aud` is the user id, `sub` the token key.
    pub fn issue_bearer_token(&self, user_id: i64, token_key: &str, ttl_secs: u64) -> String {
        let claims = RelayClaims::new(user_id, token_key.to_string(), ttl_secs);
        issue_jwt(&self.encoding, &claims)
    }

    pub fn decode_bearer_token(&self, token: &str) -> Result<BearerClaims, JwtError> {
        let claims = self.decode(token)?;
        if claims.sub == ADMIN_SUBJECT {
            return Err(JwtError::Invalid);
        }
        let user_id = claims.aud.parse::<i64>().map_err(|_| JwtError::Parse)?;
        Ok(BearerClaims {
            user_id,
            token_key: claims.sub,
        })
    }

    fn decode(&self, token: &str) -> Result<RelayClaims, JwtError> {
        let validate = JwtValidation {
            validate_aud: false,
            issuer: ISSUER,
            required_spec: &["sub", "iat", "exp"],
        };
        decode_jwt::<RelayClaims>(&self.decoding, token, validate)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayClaims {
    aud: String,
    exp: u64,
    iat: u64,
    iss: String,
    sub: String,
}

impl RelayClaims {
    fn new(id: i64, sub: String, ttl_secs: u64) -> Self {
        let now = now_secs().max(0) as u64;
        RelayClaims {
            aud: id.to_string(),
            exp: now + ttl_secs,
            iat: now,
            iss: ISSUER.to_string(),
            sub,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BearerClaims {
    pub user_id: i64,
    pub token_key: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AdminIdentity {
    pub id: i64,
}

#[derive(Debug)]
pub enum AuthError {
    Empty,
    Invalid,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (error_code, error_message) = match self {
            AuthError::Empty => (1001, tr(Msg::AdminRequired)),
            AuthError::Invalid => (1002, tr(Msg::TokenInvalid)),
        };
        let body = Json(json!({
            "code": error_code,
            "msg": error_message,
        }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

pub fn bearer_value(req: &Request) -> Option<&str> {
    let header = req.headers().get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer") => Some(token),
        _ => None,
    }
}

pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response<Body>, AuthError> {
    let token = bearer_value(&req).ok_or(AuthError::Empty)?;
    let id = state.jwt.decode_admin_token(token).map_err(|_| AuthError::Invalid)?;
    req.extensions_mut().insert(AdminIdentity { id });
    Ok(next.run(req).await)
}

/// API key of a relay call. Each client family has its own header;
/// Gemini clients may also pass `?key=`.
pub fn api_key_value(req: &Request) -> Option<String> {
    if let Some(token) = bearer_value(req) {
        return Some(token.to_string());
    }
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = req.headers().get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    req.uri()
        .query()
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("key=")))
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

fn looks_like_jwt(value: &str) -> bool {
    value.split('.').count() == 3 && value.starts_with("ey")
}

/// Checks a token against its owner and decides the billing group.
pub fn check_token(token: &Token, user: Option<&crate::database::user::User>, known_groups: &[&str], now: i64) -> Result<String, RelayError> {
    match token.status {
        TokenStatus::Enabled => {}
        TokenStatus::Disabled => return Err(RelayError::invalid_credential(Msg::TokenDisabled)),
        TokenStatus::Expired => return Err(RelayError::invalid_credential(Msg::TokenExpired)),
        TokenStatus::Exhausted => return Err(RelayError::invalid_credential(Msg::TokenExhausted)),
    }
    if token.is_expired(now) {
        return Err(RelayError::invalid_credential(Msg::TokenExpired));
    }
    if !token.unlimited_quota && token.remain_quota <= 0 {
        return Err(RelayError::invalid_credential(Msg::TokenExhausted));
    }
    let user = user.ok_or_else(|| RelayError::invalid_credential(Msg::TokenInvalid))?;
    if !user.enabled {
        return Err(RelayError::new(ErrorKind::Client, http::StatusCode::FORBIDDEN, "user_disabled", tr(Msg::UserDisabled)));
    }
    match token.group.as_deref().filter(|g| !g.is_empty()) {
        None => Ok(user.group.clone()),
        Some(group) if group == user.group || known_groups.contains(&group) => Ok(group.to_string()),
        Some(group) => Err(RelayError::new(
            ErrorKind::Client,
            http::StatusCode::FORBIDDEN,
            "group_not_allowed",
            format!("{}: {}", tr(Msg::GroupNotAllowed), group),
        )),
    }
}

/// Resolves the caller of a relay route into an [`AuthContext`] extension.
pub async fn token_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response<Body>, RelayError> {
    let presented = api_key_value(&req).ok_or_else(|| RelayError::invalid_credential(Msg::TokenMissing))?;
    let (key, jwt_user) = if looks_like_jwt(&presented) {
        let claims = state
            .jwt
            .decode_bearer_token(&presented)
            .map_err(|_| RelayError::invalid_credential(Msg::TokenInvalid))?;
        (claims.token_key, Some(claims.user_id))
    } else {
        (presented, None)
    };

    let token = state
        .get_token(&key)
        .await
        .map_err(|e| RelayError::internal(e.to_string()))?
        .ok_or_else(|| RelayError::invalid_credential(Msg::TokenInvalid))?;
    if jwt_user.is_some_and(|id| id != token.user_id) {
        return Err(RelayError::invalid_credential(Msg::TokenInvalid));
    }
    let user = state.store.get_user(token.user_id)?;
    let known_groups: Vec<&str> = state.config.ratio.group_ratio.keys().map(String::as_str).collect();
    let using_group = check_token(&token, user.as_ref(), &known_groups, now_secs())?;
    let Some(user) = user else {
        return Err(RelayError::invalid_credential(Msg::TokenInvalid));
    };
    req.extensions_mut().insert(AuthContext { user, token, using_group });
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::user::User;

    #[test]
    fn admin_and_bearer_tokens_are_not_interchangeable() {
        let keys = JwtKeys::new(b"unit-test-secret");
        let admin = keys.issue_admin_token(1);
        assert_eq!(keys.decode_admin_token(&admin).unwrap(), 1);
        assert!(keys.decode_bearer_token(&admin).is_err());

        let bearer = keys.issue_bearer_token(42, "sk-abc", 600);
        let claims = keys.decode_bearer_token(&bearer).unwrap();
        assert_eq!(claims, BearerClaims { user_id: 42, token_key: "sk-abc".to_string() });
        assert!(keys.decode_admin_token(&bearer).is_err());
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let keys = JwtKeys::new(b"one");
        let other = JwtKeys::new(b"two");
        let token = other.issue_admin_token(1);
        assert!(keys.decode_admin_token(&token).is_err());
    }

    #[test]
    fn api_key_sources() {
        let req = Request::builder().uri("/v1beta/models/x?key=g-key").body(Body::empty()).unwrap();
        assert_eq!(api_key_value(&req).as_deref(), Some("g-key"));
        let req = Request::builder()
            .uri("/v1/messages")
            .header("x-api-key", "sk-claude")
            .body(Body::empty())
            .unwrap();
        assert_eq!(api_key_value(&req).as_deref(), Some("sk-claude"));
        let req = Request::builder()
            .uri("/v1/chat/completions")
            .header("authorization", "Bearer sk-openai")
            .body(Body::empty())
            .unwrap();
        assert_eq!(api_key_value(&req).as_deref(), Some("sk-openai"));
        let keys = JwtKeys::new(b"s");
        assert!(looks_like_jwt(&keys.issue_bearer_token(1, "sk-x", 60)));
        assert!(!looks_like_jwt("sk-abc"));
    }

    #[test]
    fn token_policy() {
        let user = User { id: 1, group: "default".into(), enabled: true, ..Default::default() };
        let token = Token { id: 1, user_id: 1, remain_quota: 10, expired_time: -1, ..Default::default() };
        assert_eq!(check_token(&token, Some(&user), &[], 100).unwrap(), "default");

        let vip = Token { group: Some("vip".into()), ..token.clone() };
        assert_eq!(check_token(&vip, Some(&user), &["vip"], 100).unwrap(), "vip");
        assert_eq!(check_token(&vip, Some(&user), &[], 100).unwrap_err().code, "group_not_allowed");

        let expired = Token { expired_time: 50, ..token.clone() };
        assert_eq!(check_token(&expired, Some(&user), &[], 100).unwrap_err().status, http::StatusCode::UNAUTHORIZED);
        let empty = Token { remain_quota: 0, ..token.clone() };
        assert!(check_token(&empty, Some(&user), &[], 100).is_err());
        let unlimited = Token { unlimited_quota: true, ..empty };
        assert!(check_token(&unlimited, Some(&user), &[], 100).is_ok());

        let banned = User { enabled: false, ..user };
        assert_eq!(check_token(&token, Some(&banned), &[], 100).unwrap_err().code, "user_disabled");
        assert!(check_token(&token, None, &[], 100).is_err());
    }
}
