use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::database::error::DatabaseError;
use crate::database::migrations::{self, MigrationReport, SchemaState, MANIFEST};
use crate::database::models::Employee;
use crate::types::SchemaName;

/// Placeholder substituted with the schema name in tenant connection URLs
pub const SCHEMA_PLACEHOLDER: &str = "{schema}";

/// A live connection handle bound to exactly one tenant schema
#[async_trait]
pub trait TenantClient: Send + Sync + 'static {
    fn schema(&self) -> &SchemaName;

    /// Tenant-local employee by login email
    async fn find_employee(&self, email: &str) -> Result<Option<Employee>, DatabaseError>;
}

/// Opens, migrates and closes tenant handles for the registry
#[async_trait]
pub trait TenantConnector: Send + Sync + 'static {
    type Client: TenantClient;

    /// Open a handle for an existing schema and bring the schema to the
    /// latest manifest version before returning it
    async fn open(&self, schema: &SchemaName) -> Result<Self::Client, DatabaseError>;

    /// Bring an existing schema to the latest manifest version without
    /// keeping a handle
    async fn migrate(&self, schema: &SchemaName) -> Result<MigrationReport, DatabaseError>;

    async fn inspect(&self, schema: &SchemaName) -> Result<SchemaState, DatabaseError>;

    async fn close(&self, client: &Self::Client);
}

/// Tenant handle backed by a pool whose connections have `search_path` set
/// to the tenant schema, so unqualified table names resolve inside it
#[derive(Debug)]
pub struct PgTenantClient {
    schema: SchemaName,
    pool: PgPool,
}

impl PgTenantClient {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TenantClient for PgTenantClient {
    fn schema(&self) -> &SchemaName {
        &self.schema
    }

    async fn find_employee(&self, email: &str) -> Result<Option<Employee>, DatabaseError> {
        let employee = sqlx::query_as::<_, Employee>(
            "SELECT id, email, first_name, last_name, is_active, created_at
             FROM employees
             WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(employee)
    }
}

pub struct PgTenantConnector {
    url_template: String,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgTenantConnector {
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url_template = config
            .tenant_url_template
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| config.url.clone());

        if url_template.is_empty() {
            return Err(DatabaseError::ConfigMissing("DATABASE_URL"));
        }

        Ok(Self {
            url_template,
            max_connections: config.tenant_max_connections,
            acquire_timeout: Duration::from_secs(config.connection_timeout),
        })
    }

    fn connect_options(&self, schema: &SchemaName) -> Result<PgConnectOptions, DatabaseError> {
        let url = build_connection_string(&self.url_template, schema)?;
        let options = PgConnectOptions::from_str(&url)
            .map_err(|e| DatabaseError::InvalidDatabaseUrl(e.to_string()))?
            .options([("search_path", schema.as_str())]);
        Ok(options)
    }

    async fn migrate_on(conn: &mut PgConnection, schema: &SchemaName) -> Result<MigrationReport, DatabaseError> {
        let mut tx = conn.begin().await?;
        let report = migrations::migrate(&mut *tx, schema, MANIFEST).await?;
        tx.commit().await?;
        Ok(report)
    }

    async fn connect_single(&self, schema: &SchemaName) -> Result<PgConnection, DatabaseError> {
        Ok(PgConnection::connect_with(&self.connect_options(schema)?).await?)
    }
}

async fn close_quietly(conn: PgConnection, schema: &SchemaName) {
    if let Err(e) = conn.close().await {
        debug!("Error closing maintenance connection for {}: {}", schema, e);
    }
}

#[async_trait]
impl TenantConnector for PgTenantConnector {
    type Client = PgTenantClient;

    async fn open(&self, schema: &SchemaName) -> Result<PgTenantClient, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(self.connect_options(schema)?)
            .await?;

        let migrated = match pool.acquire().await {
            Ok(mut conn) => Self::migrate_on(&mut *conn, schema).await,
            Err(e) => Err(e.into()),
        };
        let report = match migrated {
            Ok(report) => report,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        info!(
            "Created tenant pool for: {} (schema version {})",
            schema, report.to_version
        );
        Ok(PgTenantClient { schema: schema.clone(), pool })
    }

    async fn migrate(&self, schema: &SchemaName) -> Result<MigrationReport, DatabaseError> {
        let mut conn = self.connect_single(schema).await?;
        let result = Self::migrate_on(&mut conn, schema).await;
        close_quietly(conn, schema).await;
        result
    }

    async fn inspect(&self, schema: &SchemaName) -> Result<SchemaState, DatabaseError> {
        let mut conn = self.connect_single(schema).await?;
        let result = migrations::inspect(&mut conn, schema, MANIFEST)
            .await
            .map_err(DatabaseError::from);
        close_quietly(conn, schema).await;
        result
    }

    async fn close(&self, client: &PgTenantClient) {
        client.pool.close().await;
        info!("Closed tenant pool: {}", client.schema);
    }
}

/// Tenant connection URL: the template with `{schema}` substituted, checked
/// to still be a valid URL
pub fn build_connection_string(template: &str, schema: &SchemaName) -> Result<String, DatabaseError> {
    let raw = template.replace(SCHEMA_PLACEHOLDER, schema.as_str());
    let url = url::Url::parse(&raw).map_err(|e| DatabaseError::InvalidDatabaseUrl(e.to_string()))?;
    Ok(url.into())
}
