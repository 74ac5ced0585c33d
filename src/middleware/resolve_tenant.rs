use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::auth::authorization_header;
use crate::auth::TokenVerifier;
use crate::database::{ControlPlane, TenantClient, TenantConnector, TenantRegistry};
use crate::error::ApiError;
use crate::server::AppState;
use crate::types::OrganizationId;

/// Who the request is acting as, resolved from the bearer token, the
/// control plane and the tenant's own employee table
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TenantIdentity {
    pub id: Uuid,
    pub email: String,
    pub employee_id: Uuid,
    pub organization_id: OrganizationId,
    pub organization_name: String,
    pub role: String,
}

/// Resolved identity plus the live handle for the caller's tenant schema,
/// inserted into request extensions for downstream handlers
pub struct TenantContext<T> {
    pub identity: TenantIdentity,
    pub client: Arc<T>,
}

impl<T> Clone for TenantContext<T> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            client: Arc::clone(&self.client),
        }
    }
}

/// Turn an `Authorization` header into a tenant context.
///
/// Steps run in a fixed order and the first failure is returned; nothing is
/// written and no partial context is produced.
pub async fn resolve_tenant<P: ControlPlane, C: TenantConnector>(
    registry: &TenantRegistry<P, C>,
    verifier: &TokenVerifier,
    authorization: Option<&str>,
) -> Result<TenantContext<C::Client>, ApiError> {
    let claims = verifier.verify_header(authorization).map_err(|e| {
        debug!("Token rejected: {}", e);
        ApiError::from(e)
    })?;

    let email = claims
        .email
        .as_deref()
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Token does not carry an email claim"))?
        .to_string();

    let user = registry
        .control_plane()
        .find_user_by_email(&email)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    let organization_id = user.organization_id.ok_or_else(|| {
        ApiError::validation_error("User is not assigned to an organization", None)
    })?;

    let organization = user
        .organization
        .ok_or_else(|| ApiError::not_found(format!("Organization {} not found", organization_id)))?;

    if !organization.is_active {
        warn!("Rejected request for inactive organization '{}'", organization.name);
        return Err(ApiError::tenant_inactive(format!(
            "Organization '{}' is inactive",
            organization.name
        )));
    }

    let schema = match organization.schema() {
        Some(Ok(schema)) => schema,
        Some(Err(e)) => return Err(ApiError::provisioning_error(e.to_string())),
        None => {
            return Err(ApiError::provisioning_error(format!(
                "Organization '{}' has no tenant schema",
                organization.name
            )))
        }
    };

    let client = registry.get_tenant_client(&schema).await?;

    let employee = client
        .find_employee(&email)
        .await?
        .ok_or_else(|| ApiError::not_found("Employee record not found"))?;

    debug!("Resolved {} to {} in {}", email, employee.id, schema);

    Ok(TenantContext {
        identity: TenantIdentity {
            id: user.id,
            email,
            employee_id: employee.id,
            organization_id,
            organization_name: organization.name,
            role: claims.role,
        },
        client,
    })
}

/// Resolve the tenant once per request and expose it as an extension
pub async fn resolve_tenant_middleware<P: ControlPlane, C: TenantConnector>(
    State(state): State<AppState<P, C>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorization = authorization_header(request.headers());
    let context = resolve_tenant(&state.registry, &state.verifier, authorization.as_deref()).await?;

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
