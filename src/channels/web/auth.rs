//! Bearer-token middleware.
//!
//! Verifies `Authorization: Bearer <token>` and stores the resulting
//! [`AuthUser`] as a request extension for the handlers behind it.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::auth::AuthUser;
use crate::channels::web::errors::ApiError;
use crate::channels::web::server::GatewayState;
use crate::error::{AuthError, ServiceError};

pub async fn auth_middleware(
    State(state): State<Arc<GatewayState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    let token = bearer_token(&request)
        .map_err(|e| {
            tracing::debug!(%path, error = %e, "Rejected request without a usable bearer token");
            ServiceError::from(e)
        })?
        .to_string();
    let user: AuthUser = state.accounts.authenticate(&token).await.map_err(|e| {
        tracing::info!(%path, error = %e, "Bearer token rejected");
        e
    })?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

fn bearer_token(request: &Request) -> Result<&str, AuthError> {
    let value = request
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(token.trim())
}
