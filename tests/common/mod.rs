use anyhow::{Context, Result};
use sqlx::Executor;
use uuid::Uuid;

use fieldforce_api::config::DatabaseConfig;
use fieldforce_api::database::{
    PgControlPlane, PgRegistry, PgTenantConnector, RegistryOptions, TenantRegistry,
};
use fieldforce_api::types::{OrganizationId, SchemaName};

/// Registry against `TEST_DATABASE_URL`, or `None` when it is not set so the
/// caller can skip
pub async fn registry() -> Result<Option<PgRegistry>> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping PostgreSQL test");
        return Ok(None);
    };

    let config = DatabaseConfig {
        url,
        max_connections: 5,
        tenant_max_connections: 2,
        connection_timeout: 10,
        ..DatabaseConfig::default()
    };
    let control_plane = PgControlPlane::connect(&config)
        .await
        .context("connecting to TEST_DATABASE_URL")?;
    control_plane.ensure_schema().await?;

    Ok(Some(TenantRegistry::new(
        control_plane,
        PgTenantConnector::from_config(&config)?,
        RegistryOptions::default(),
    )))
}

/// Schema name unique to this run
pub fn unique_schema(prefix: &str) -> SchemaName {
    let suffix = Uuid::new_v4().simple().to_string();
    SchemaName::parse(format!("{}_{}", prefix, &suffix[..12])).expect("valid schema name")
}

pub async fn create_organization(registry: &PgRegistry, name: &str, is_active: bool) -> Result<OrganizationId> {
    let (id,): (OrganizationId,) =
        sqlx::query_as("INSERT INTO organizations (name, is_active) VALUES ($1, $2) RETURNING id")
            .bind(format!("{} {}", name, Uuid::new_v4().simple()))
            .bind(is_active)
            .fetch_one(registry.control_plane().pool())
            .await?;
    Ok(id)
}

pub async fn create_user(
    registry: &PgRegistry,
    email: &str,
    role: &str,
    organization: Option<OrganizationId>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (email, password_hash, role, organization_id) VALUES ($1, 'x', $2, $3)",
    )
    .bind(email)
    .bind(role)
    .bind(organization)
    .execute(registry.control_plane().pool())
    .await?;
    Ok(())
}

/// Remove what a test created. Tenant pools must already be closed.
pub async fn cleanup(registry: &PgRegistry, schemas: &[&SchemaName], organizations: &[OrganizationId]) -> Result<()> {
    let pool = registry.control_plane().pool();
    for organization in organizations {
        sqlx::query("DELETE FROM users WHERE organization_id = $1")
            .bind(organization)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(organization)
            .execute(pool)
            .await?;
    }
    for schema in schemas {
        pool.execute(format!("DROP SCHEMA IF EXISTS {} CASCADE", schema.quoted()).as_str())
            .await?;
    }
    Ok(())
}
