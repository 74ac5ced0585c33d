use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, Executor, FromRow, PgPool};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::database::error::DatabaseError;
use crate::database::migrations::{self, MigrationReport, MANIFEST};
use crate::database::models::{Organization, ProvisionedOrganization, UserAccount};
use crate::types::{OrganizationId, SchemaName};

/// Shared store of organizations and login accounts
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Login account by email, joined with its organization
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, DatabaseError>;

    /// Every organization that has a schema assigned, active or not
    async fn provisioned_organizations(&self) -> Result<Vec<ProvisionedOrganization>, DatabaseError>;

    /// Create `schema`, migrate it from version zero and bind it to
    /// `organization`, as one unit of work
    async fn provision(
        &self,
        organization: OrganizationId,
        schema: &SchemaName,
    ) -> Result<MigrationReport, DatabaseError>;

    async fn ping(&self) -> Result<(), DatabaseError>;

    async fn close(&self);
}

/// Control-plane tables. Tenant schemas live in the same database.
const CONTROL_PLANE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS organizations (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name        TEXT NOT NULL UNIQUE,
        schema_name TEXT UNIQUE,
        is_active   BOOLEAN NOT NULL DEFAULT TRUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS users (
        id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        email           TEXT NOT NULL UNIQUE,
        password_hash   TEXT NOT NULL,
        role            TEXT NOT NULL,
        organization_id UUID REFERENCES organizations(id),
        is_active       BOOLEAN NOT NULL DEFAULT TRUE,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
"#;

#[derive(FromRow)]
struct UserOrganizationRow {
    id: Uuid,
    email: String,
    role: String,
    is_active: bool,
    organization_id: Option<OrganizationId>,
    org_id: Option<OrganizationId>,
    org_name: Option<String>,
    org_schema_name: Option<String>,
    org_is_active: Option<bool>,
    org_created_at: Option<chrono::DateTime<chrono::Utc>>,
    org_updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<UserOrganizationRow> for UserAccount {
    fn from(row: UserOrganizationRow) -> Self {
        let organization = match (row.org_id, row.org_name, row.org_created_at, row.org_updated_at) {
            (Some(id), Some(name), Some(created_at), Some(updated_at)) => Some(Organization {
                id,
                name,
                schema_name: row.org_schema_name,
                is_active: row.org_is_active.unwrap_or(false),
                created_at,
                updated_at,
            }),
            _ => None,
        };

        UserAccount {
            id: row.id,
            email: row.email,
            role: row.role,
            is_active: row.is_active,
            organization_id: row.organization_id,
            organization,
        }
    }
}

/// PostgreSQL control plane: one long-lived pool
pub struct PgControlPlane {
    pool: PgPool,
}

impl PgControlPlane {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        if config.url.is_empty() {
            return Err(DatabaseError::ConfigMissing("DATABASE_URL"));
        }
        url::Url::parse(&config.url)
            .map_err(|e| DatabaseError::InvalidDatabaseUrl(e.to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout))
            .connect(&config.url)
            .await?;

        info!("Connected control-plane pool");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The shared control-plane handle
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the control-plane tables if they are missing
    pub async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        (&self.pool).execute(CONTROL_PLANE_SQL).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for PgControlPlane {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, DatabaseError> {
        let row = sqlx::query_as::<_, UserOrganizationRow>(
            r#"
            SELECT
                u.id, u.email, u.role, u.is_active, u.organization_id,
                o.id AS org_id,
                o.name AS org_name,
                o.schema_name AS org_schema_name,
                o.is_active AS org_is_active,
                o.created_at AS org_created_at,
                o.updated_at AS org_updated_at
            FROM users u
            LEFT JOIN organizations o ON o.id = u.organization_id
            WHERE u.email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserAccount::from))
    }

    async fn provisioned_organizations(&self) -> Result<Vec<ProvisionedOrganization>, DatabaseError> {
        let rows: Vec<(OrganizationId, String, String)> = sqlx::query_as(
            "SELECT id, name, schema_name FROM organizations WHERE schema_name IS NOT NULL ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut organizations = Vec::with_capacity(rows.len());
        for (id, name, schema_name) in rows {
            match SchemaName::parse(schema_name) {
                Ok(schema) => organizations.push(ProvisionedOrganization { id, name, schema }),
                Err(e) => {
                    return Err(DatabaseError::Provisioning(format!("organization '{}': {}", name, e)));
                }
            }
        }
        Ok(organizations)
    }

    async fn provision(
        &self,
        organization: OrganizationId,
        schema: &SchemaName,
    ) -> Result<MigrationReport, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(Option<String>,)> =
            sqlx::query_as("SELECT schema_name FROM organizations WHERE id = $1 FOR UPDATE")
                .bind(organization)
                .fetch_optional(&mut *tx)
                .await?;
        let (current,) = current
            .ok_or_else(|| DatabaseError::NotFound(format!("Organization {} not found", organization)))?;

        let report = match current {
            Some(existing) if existing == schema.as_str() => {
                // Retry of a provisioning that already committed
                migrations::migrate(&mut *tx, schema, MANIFEST).await?
            }
            Some(existing) => {
                return Err(DatabaseError::Conflict(format!(
                    "Organization {} is already bound to schema '{}'",
                    organization, existing
                )));
            }
            None => {
                let owner: Option<(OrganizationId,)> =
                    sqlx::query_as("SELECT id FROM organizations WHERE schema_name = $1")
                        .bind(schema.as_str())
                        .fetch_optional(&mut *tx)
                        .await?;
                if let Some((other,)) = owner {
                    return Err(DatabaseError::Conflict(format!(
                        "Schema '{}' already belongs to organization {}",
                        schema, other
                    )));
                }

                // Bound first: the migrator narrows search_path to the tenant schema
                sqlx::query("UPDATE organizations SET schema_name = $2, updated_at = NOW() WHERE id = $1")
                    .bind(organization)
                    .bind(schema.as_str())
                    .execute(&mut *tx)
                    .await?;

                migrations::create_and_migrate(&mut *tx, schema, MANIFEST).await?
            }
        };

        tx.commit().await?;
        info!("Provisioned schema {} for organization {}", schema, organization);
        Ok(report)
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.pool.is_closed() {
            warn!("Control-plane pool already closed");
            return;
        }
        self.pool.close().await;
        info!("Closed control-plane pool");
    }
}
