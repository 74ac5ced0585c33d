use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{OrganizationId, SchemaName};

/// Control-plane organization row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub schema_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    /// Typed schema name, `None` until the organization is provisioned
    pub fn schema(&self) -> Option<Result<SchemaName, crate::database::DatabaseError>> {
        self.schema_name.clone().map(SchemaName::parse)
    }
}

/// Organization that has a tenant schema assigned
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedOrganization {
    pub id: OrganizationId,
    pub name: String,
    pub schema: SchemaName,
}
