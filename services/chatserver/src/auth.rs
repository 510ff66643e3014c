//! Bearer-token authentication.
//!
//! Token issuance lives in a separate identity service; this module only
//! validates access tokens (HS256) and resolves the `user_id` claim. The
//! middleware runs in front of every route, websocket upgrade included.
use crate::api::error::{ApiError, unauthorized};
use crate::app::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: i64,
    pub exp: i64,
    pub iat: i64,
}

/// Authenticated caller, injected into request extensions by [`require_auth`].
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authorization header missing")]
    MissingHeader,
    #[error("authorization header is not a bearer token")]
    MalformedHeader,
    #[error("token invalid")]
    Invalid,
    #[error("token expired")]
    Expired,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> ApiError {
        match err {
            AuthError::MissingHeader | AuthError::MalformedHeader => {
                unauthorized("Unauthorized", &err.to_string())
            }
            AuthError::Invalid => unauthorized("TOKEN_INVALID", "token invalid"),
            AuthError::Expired => unauthorized("TOKEN_EXPIRED", "token expired"),
        }
    }
}

pub fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::MissingHeader)?;
    header
        .strip_prefix(BEARER_PREFIX)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MalformedHeader)
}

pub fn validate_access_token(token: &str, secret: &str) -> Result<AccessClaims, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    let decoded = jsonwebtoken::decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|err| match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Invalid,
    })?;
    Ok(decoded.claims)
}

/// Sign an access token. Exists for tests and local tooling; production
/// tokens come from the identity service.
pub fn mint_access_token(
    user_id: i64,
    secret: &str,
    ttl: std::time::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now().timestamp();
    let claims = AccessClaims {
        user_id,
        iat: now,
        exp: now + ttl.as_secs() as i64,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Middleware: resolve the bearer token to an [`AuthUser`] or fail with 401.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let claims = match extract_bearer(header)
        .and_then(|token| validate_access_token(token, &state.jwt_secret))
    {
        Ok(claims) => claims,
        Err(err) => {
            tracing::debug!(error = %err, "request rejected");
            return ApiError::from(err).into_response();
        }
    };

    request.extensions_mut().insert(AuthUser(claims.user_id));
    next.run(request).await
}
