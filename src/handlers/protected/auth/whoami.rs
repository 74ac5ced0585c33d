// handlers/protected/auth/whoami.rs - GET /api/auth/whoami handler

use axum::Extension;
use serde::Serialize;

use crate::database::{TenantClient, TenantConnector};
use crate::middleware::{ApiResponse, TenantContext, TenantIdentity};
use crate::types::SchemaName;

#[derive(Debug, Serialize)]
pub struct Whoami {
    #[serde(flatten)]
    pub identity: TenantIdentity,
    pub schema: SchemaName,
}

/// Identity the request resolved to, and the schema it is served from
pub async fn whoami_get<C: TenantConnector>(
    Extension(ctx): Extension<TenantContext<C::Client>>,
) -> ApiResponse<Whoami> {
    ApiResponse::success(Whoami {
        schema: ctx.client.schema().clone(),
        identity: ctx.identity,
    })
}
