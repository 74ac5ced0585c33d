use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Claims;
use crate::database::{ControlPlane, TenantConnector};
use crate::error::ApiError;
use crate::server::AppState;

/// Caller verified to hold the configured root role
#[derive(Clone, Debug, Serialize)]
pub struct RootUser {
    pub subject: String,
    pub id: Option<Uuid>,
    pub email: Option<String>,
    pub role: String,
}

impl From<Claims> for RootUser {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.subject(),
            id: claims.id,
            email: claims.email,
            role: claims.role,
        }
    }
}

/// Raw `Authorization` header value, if present and valid UTF-8
pub fn authorization_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Guards `/api/root/*`: a valid bearer token whose role is the root role
pub async fn root_auth_middleware<P: ControlPlane, C: TenantConnector>(
    State(state): State<AppState<P, C>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorization = authorization_header(request.headers());
    let claims = state.verifier.verify_header(authorization.as_deref()).map_err(|e| {
        debug!("Root access denied: {}", e);
        ApiError::from(e)
    })?;

    if claims.role != &*state.root_role {
        warn!("Root access denied for {} with role '{}'", claims.subject(), claims.role);
        return Err(ApiError::forbidden("Root access required"));
    }

    request.extensions_mut().insert(RootUser::from(claims));
    Ok(next.run(request).await)
}
