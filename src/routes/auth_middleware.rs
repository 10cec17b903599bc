use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{debug, error};

use crate::models::Permissions;
use crate::services::auth_service::{get_auth_token, permissions_from_claims, validate_jwt};
use crate::AppState;

/// Resolve the caller's [`Permissions`] and store them as a request extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // 1. No secret configured: authorization is off
    let Some(secret) = state.auth_secret.as_deref() else {
        req.extensions_mut().insert(Permissions::unrestricted());
        return Ok(next.run(req).await);
    };

    // 2. Get the auth token from the request
    let token = match get_auth_token(&req) {
        Ok(token) => token,
        Err(e) => {
            debug!("Rejecting request to {}: {}", req.uri().path(), e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    // 3. Validate Token
    let token_data = match validate_jwt(&token, secret) {
        Ok(token_data) => token_data,
        Err(e) => {
            error!("JWT validation failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    // 4. Hand the granted permissions to downstream handlers
    req.extensions_mut()
        .insert(permissions_from_claims(&token_data.claims));
    Ok(next.run(req).await)
}
