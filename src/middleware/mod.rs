pub mod auth;
pub mod resolve_tenant;
pub mod response;

pub use auth::{root_auth_middleware, RootUser};
pub use resolve_tenant::{resolve_tenant, resolve_tenant_middleware, TenantContext, TenantIdentity};
pub use response::{ApiResponse, ApiResult};
