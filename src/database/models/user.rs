use serde::Serialize;
use uuid::Uuid;

use crate::database::models::organization::Organization;
use crate::types::OrganizationId;

/// Control-plane login account joined with its organization.
/// The password hash is never loaded here.
#[derive(Debug, Clone, Serialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub is_active: bool,
    pub organization_id: Option<OrganizationId>,
    pub organization: Option<Organization>,
}
