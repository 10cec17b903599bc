use axum::extract::Query;
use axum::http::{self};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use std::collections::HashMap;
use tracing::debug;

use crate::models::Permissions;

// Get the auth token from a request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| "Invalid Authorization header".to_string())?;
        return Ok(auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).to_string());
    }

    // 2. Try to get token from cookies
    if let Some(cookie_header) = req.headers().get(http::header::COOKIE) {
        let cookie_str = cookie_header
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;
        for c in cookie::Cookie::split_parse(cookie_str).flatten() {
            if c.name() == "auth_token" {
                return Ok(c.value().to_string());
            }
        }
    }

    // 3. Browsers cannot set headers on websocket upgrades, so accept a query parameter
    if let Ok(Query(params)) = Query::<HashMap<String, String>>::try_from_uri(req.uri()) {
        if let Some(token) = params.get("token").filter(|t| !t.is_empty()) {
            return Ok(token.clone());
        }
    }

    Err("No auth token in Authorization header, auth_token cookie or token parameter".to_string())
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}

/// Read the `permissions` claim: an object mapping a resource to its
/// capabilities. A token without the claim grants nothing.
pub fn permissions_from_claims(claims: &serde_json::Value) -> Permissions {
    let mut grants: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(resources) = claims.get("permissions").and_then(|v| v.as_object()) {
        for (resource, capabilities) in resources {
            let capabilities = capabilities
                .as_array()
                .map(|caps| caps.iter().filter_map(|c| c.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            grants.insert(resource.clone(), capabilities);
        }
    } else {
        debug!("Token carries no permissions claim");
    }
    Permissions::granted(grants)
}
