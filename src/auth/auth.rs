use axum::{http::StatusCode, Json};

use crate::models::{ErrorResponse, Permissions};

pub fn ensure_permission(
    permissions: &Permissions,
    resource: &str,
    capability: &str,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if permissions.allows(resource, capability) {
        return Ok(());
    }
    Err(ErrorResponse::reply(
        StatusCode::FORBIDDEN,
        format!("'{}' access to '{}' denied", capability, resource),
    ))
}
