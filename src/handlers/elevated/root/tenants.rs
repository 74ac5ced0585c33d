// handlers/elevated/root/tenants.rs - GET /api/root/tenants

use axum::extract::State;

use crate::database::{CachedTenant, ControlPlane, TenantConnector};
use crate::middleware::ApiResponse;
use crate::server::AppState;

/// Tenant pools currently held by this process
pub async fn tenant_list<P: ControlPlane, C: TenantConnector>(
    State(state): State<AppState<P, C>>,
) -> ApiResponse<Vec<CachedTenant>> {
    ApiResponse::success(state.registry.snapshot())
}
