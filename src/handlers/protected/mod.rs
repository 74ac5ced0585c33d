// handlers/protected/mod.rs - Tenant-scoped handlers
//
// Every route here runs behind resolve_tenant_middleware, so handlers receive
// a TenantContext with the caller's identity and tenant handle.
pub mod auth;
