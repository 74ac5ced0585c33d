// handlers/public/mod.rs - Public handlers (no authentication required)

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::database::{ControlPlane, TenantConnector};
use crate::server::AppState;

/// GET / - service information
pub async fn root() -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "name": "FieldForce API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Multi-tenant field-sales backend, one PostgreSQL schema per organization",
            "endpoints": {
                "home": "/ (public)",
                "health": "/health (public)",
                "auth": "/api/auth/whoami (tenant)",
                "root": "/api/root/* (requires root role)",
            }
        }
    }))
}

/// GET /health - control-plane reachability and tenant cache size
pub async fn health<P: ControlPlane, C: TenantConnector>(
    State(state): State<AppState<P, C>>,
) -> impl IntoResponse {
    let now = chrono::Utc::now();
    let cached = state.registry.snapshot().len();

    match state.registry.control_plane().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "status": "ok",
                    "timestamp": now,
                    "database": "ok",
                    "tenant_pools": cached,
                }
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "error": "database unavailable",
                "data": {
                    "status": "degraded",
                    "timestamp": now,
                    "database_error": e.to_string(),
                    "tenant_pools": cached,
                }
            })),
        ),
    }
}
