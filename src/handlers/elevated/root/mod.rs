// handlers/elevated/root/mod.rs - tenant administration

pub mod provision; // POST /api/root/organizations/:id/provision
pub mod tenants; // GET /api/root/tenants

pub use provision::organization_provision;
pub use tenants::tenant_list;
