// handlers/elevated/root/provision.rs - POST /api/root/organizations/:id/provision

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Extension, Json,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::database::{ControlPlane, MigrationReport, TenantConnector};
use crate::error::ApiError;
use crate::middleware::{ApiResponse, ApiResult, RootUser};
use crate::server::AppState;
use crate::types::{OrganizationId, SchemaName};

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub schema_name: String,
}

/// Create, migrate and bind the tenant schema for an organization
pub async fn organization_provision<P: ControlPlane, C: TenantConnector>(
    State(state): State<AppState<P, C>>,
    Extension(root): Extension<RootUser>,
    Path(id): Path<Uuid>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> ApiResult<MigrationReport> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let schema = SchemaName::parse(body.schema_name)?;
    let organization = OrganizationId::new(id);

    info!("Provisioning {} for organization {} (requested by {})", schema, organization, root.subject);
    let report = state.registry.provision_schema(organization, &schema).await?;

    Ok(ApiResponse::created(report))
}
