pub mod control_plane;
pub mod error;
pub mod migrations;
pub mod models;
pub mod registry;
pub mod tenant;

pub use control_plane::{ControlPlane, PgControlPlane};
pub use error::DatabaseError;
pub use migrations::{MigrationReport, SchemaState};
pub use registry::{CachedTenant, MigrationSummary, RegistryOptions, TenantRegistry};
pub use tenant::{PgTenantClient, PgTenantConnector, TenantClient, TenantConnector};

/// Registry wired to PostgreSQL, as the server and CLI run it
pub type PgRegistry = TenantRegistry<PgControlPlane, PgTenantConnector>;
