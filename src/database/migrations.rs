//! Tenant schema migrations.
//!
//! Every tenant schema carries the same tables. The manifest below is the
//! ordered list of steps that builds them; `_schema_migrations` inside each
//! schema records which steps have been applied and the checksum of the SQL
//! that was run. All entry points expect to run inside a transaction so that
//! a failed step leaves the schema exactly as it was.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Executor, PgConnection};
use thiserror::Error;
use tracing::{debug, info};

use crate::database::error::DatabaseError;
use crate::types::SchemaName;

/// Version bookkeeping table created inside each tenant schema
pub const VERSION_TABLE: &str = "_schema_migrations";

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A row of `_schema_migrations`
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AppliedMigration {
    pub version: i64,
    pub checksum: String,
}

/// Lifecycle of one tenant schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchemaState {
    Unprovisioned,
    Provisioning,
    Current { version: i64 },
    Stale { version: i64, target: i64 },
    Migrating,
}

impl SchemaState {
    pub fn is_current(&self) -> bool {
        matches!(self, SchemaState::Current { .. })
    }
}

/// Outcome of bringing one schema up to date
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub schema: SchemaName,
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<i64>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("schema '{0}' is not provisioned")]
    SchemaMissing(SchemaName),

    #[error("migration {version} ({name}) was modified after it was applied")]
    ChecksumMismatch { version: i64, name: &'static str },

    #[error("schema has migration {0} applied which this build does not know about")]
    UnknownVersion(i64),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database(err.into())
    }
}

impl From<MigrationError> for DatabaseError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Database(inner) if inner.is_connection() => inner,
            other => DatabaseError::Provisioning(other.to_string()),
        }
    }
}

/// Latest version in the manifest
pub fn target_version(manifest: &[Migration]) -> i64 {
    manifest.last().map(|m| m.version).unwrap_or(0)
}

/// Steps from `manifest` that still need to run, in order.
///
/// Fails if an applied step no longer matches its SQL or if the schema is
/// ahead of this build.
pub fn plan<'m>(
    manifest: &'m [Migration],
    applied: &[AppliedMigration],
) -> Result<Vec<&'m Migration>, MigrationError> {
    for row in applied {
        match manifest.iter().find(|m| m.version == row.version) {
            Some(step) if step.checksum() != row.checksum => {
                return Err(MigrationError::ChecksumMismatch {
                    version: step.version,
                    name: step.name,
                });
            }
            Some(_) => {}
            None => return Err(MigrationError::UnknownVersion(row.version)),
        }
    }

    Ok(manifest
        .iter()
        .filter(|m| !applied.iter().any(|a| a.version == m.version))
        .collect())
}

pub async fn schema_exists(conn: &mut PgConnection, schema: &SchemaName) -> Result<bool, MigrationError> {
    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
            .bind(schema.as_str())
            .fetch_one(&mut *conn)
            .await?;
    Ok(exists)
}

async fn applied_migrations(
    conn: &mut PgConnection,
    schema: &SchemaName,
) -> Result<Vec<AppliedMigration>, MigrationError> {
    let qualified = format!("{}.{}", schema.quoted(), VERSION_TABLE);

    let (has_table,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
        .bind(&qualified)
        .fetch_one(&mut *conn)
        .await?;
    if !has_table {
        return Ok(Vec::new());
    }

    let rows = sqlx::query_as::<_, AppliedMigration>(&format!(
        "SELECT version, checksum FROM {} ORDER BY version",
        qualified
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Read-only view of where `schema` stands against `manifest`
pub async fn inspect(
    conn: &mut PgConnection,
    schema: &SchemaName,
    manifest: &[Migration],
) -> Result<SchemaState, MigrationError> {
    if !schema_exists(conn, schema).await? {
        return Ok(SchemaState::Unprovisioned);
    }
    let applied = applied_migrations(conn, schema).await?;
    let version = applied.last().map(|a| a.version).unwrap_or(0);
    let pending = plan(manifest, &applied)?;

    if pending.is_empty() {
        Ok(SchemaState::Current { version })
    } else {
        Ok(SchemaState::Stale { version, target: target_version(manifest) })
    }
}

/// Bring an existing schema to the latest manifest version.
///
/// Must run inside a transaction. Takes a transaction-scoped advisory lock on
/// the schema name so concurrent processes migrate one at a time. When the
/// schema is already current nothing but the lock and two catalog reads is
/// executed.
pub async fn migrate(
    conn: &mut PgConnection,
    schema: &SchemaName,
    manifest: &[Migration],
) -> Result<MigrationReport, MigrationError> {
    if !schema_exists(conn, schema).await? {
        return Err(MigrationError::SchemaMissing(schema.clone()));
    }
    apply_pending(conn, schema, manifest).await
}

/// Create the schema if needed and apply the whole manifest from version zero.
/// Must run inside a transaction.
pub async fn create_and_migrate(
    conn: &mut PgConnection,
    schema: &SchemaName,
    manifest: &[Migration],
) -> Result<MigrationReport, MigrationError> {
    (&mut *conn)
        .execute(format!("CREATE SCHEMA IF NOT EXISTS {}", schema.quoted()).as_str())
        .await?;
    info!("Ensured tenant schema: {}", schema);
    apply_pending(conn, schema, manifest).await
}

async fn apply_pending(
    conn: &mut PgConnection,
    schema: &SchemaName,
    manifest: &[Migration],
) -> Result<MigrationReport, MigrationError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(schema.as_str())
        .execute(&mut *conn)
        .await?;

    let applied = applied_migrations(conn, schema).await?;
    let from_version = applied.last().map(|a| a.version).unwrap_or(0);
    let pending = plan(manifest, &applied)?;

    if pending.is_empty() {
        debug!("Schema {} already at version {}", schema, from_version);
        return Ok(MigrationReport {
            schema: schema.clone(),
            from_version,
            to_version: from_version,
            applied: Vec::new(),
        });
    }

    (&mut *conn)
        .execute(format!("SET LOCAL search_path TO {}", schema.quoted()).as_str())
        .await?;
    (&mut *conn)
        .execute(
            format!(
                "CREATE TABLE IF NOT EXISTS {VERSION_TABLE} (
                    version    BIGINT PRIMARY KEY,
                    name       TEXT NOT NULL,
                    checksum   TEXT NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )"
            )
            .as_str(),
        )
        .await?;

    let mut versions = Vec::with_capacity(pending.len());
    for step in pending {
        (&mut *conn).execute(step.sql).await?;
        sqlx::query(&format!(
            "INSERT INTO {VERSION_TABLE} (version, name, checksum) VALUES ($1, $2, $3)"
        ))
        .bind(step.version)
        .bind(step.name)
        .bind(step.checksum())
        .execute(&mut *conn)
        .await?;

        info!("Applied migration {} ({}) to {}", step.version, step.name, schema);
        versions.push(step.version);
    }

    Ok(MigrationReport {
        schema: schema.clone(),
        from_version,
        to_version: versions.last().copied().unwrap_or(from_version),
        applied: versions,
    })
}

/// Tenant schema manifest. Statements run with `search_path` set to the
/// tenant schema, so table names are unqualified. Never edit an entry that
/// has shipped; append a new one.
pub const MANIFEST: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_employees",
        sql: r#"
            CREATE TABLE employees (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                email       TEXT NOT NULL UNIQUE,
                first_name  TEXT NOT NULL,
                last_name   TEXT NOT NULL,
                designation TEXT,
                phone       TEXT,
                manager_id  UUID REFERENCES employees(id) ON DELETE SET NULL,
                is_active   BOOLEAN NOT NULL DEFAULT TRUE,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
        "#,
    },
    Migration {
        version: 2,
        name: "create_directory",
        sql: r#"
            CREATE TABLE hospitals (
                id         UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name       TEXT NOT NULL,
                city       TEXT,
                address    TEXT,
                phone      TEXT,
                created_by UUID REFERENCES employees(id) ON DELETE SET NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE doctors (
                id             UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                first_name     TEXT NOT NULL,
                last_name      TEXT NOT NULL,
                specialization TEXT,
                email          TEXT,
                phone          TEXT,
                hospital_id    UUID REFERENCES hospitals(id) ON DELETE SET NULL,
                created_by     UUID REFERENCES employees(id) ON DELETE SET NULL,
                created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX doctors_hospital_idx ON doctors(hospital_id);

            CREATE TABLE chemists (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                shop_name   TEXT NOT NULL,
                owner_name  TEXT,
                license_no  TEXT,
                email       TEXT,
                phone       TEXT,
                address     TEXT,
                created_by  UUID REFERENCES employees(id) ON DELETE SET NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
        "#,
    },
    Migration {
        version: 3,
        name: "create_tasks",
        sql: r#"
            CREATE TABLE tasks (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                title       TEXT NOT NULL,
                description TEXT,
                status      TEXT NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'in_progress', 'completed', 'cancelled')),
                due_date    DATE,
                assignee_id UUID NOT NULL REFERENCES employees(id) ON DELETE CASCADE,
                doctor_id   UUID REFERENCES doctors(id) ON DELETE SET NULL,
                chemist_id  UUID REFERENCES chemists(id) ON DELETE SET NULL,
                created_by  UUID REFERENCES employees(id) ON DELETE SET NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX tasks_assignee_idx ON tasks(assignee_id);
        "#,
    },
    Migration {
        version: 4,
        name: "create_orders",
        sql: r#"
            CREATE TABLE orders (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                chemist_id  UUID NOT NULL REFERENCES chemists(id) ON DELETE RESTRICT,
                employee_id UUID NOT NULL REFERENCES employees(id) ON DELETE RESTRICT,
                status      TEXT NOT NULL DEFAULT 'placed'
                            CHECK (status IN ('placed', 'confirmed', 'dispatched', 'delivered', 'cancelled')),
                total       NUMERIC(12, 2) NOT NULL DEFAULT 0,
                notes       TEXT,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE order_items (
                id           UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                order_id     UUID NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                product_name TEXT NOT NULL,
                quantity     INTEGER NOT NULL CHECK (quantity > 0),
                unit_price   NUMERIC(12, 2) NOT NULL CHECK (unit_price >= 0)
            );
            CREATE INDEX order_items_order_idx ON order_items(order_id);
        "#,
    },
    Migration {
        version: 5,
        name: "create_reports",
        sql: r#"
            CREATE TABLE visit_reports (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                employee_id UUID NOT NULL REFERENCES employees(id) ON DELETE CASCADE,
                doctor_id   UUID REFERENCES doctors(id) ON DELETE SET NULL,
                chemist_id  UUID REFERENCES chemists(id) ON DELETE SET NULL,
                hospital_id UUID REFERENCES hospitals(id) ON DELETE SET NULL,
                visited_at  TIMESTAMPTZ NOT NULL,
                summary     TEXT,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX visit_reports_employee_idx ON visit_reports(employee_id, visited_at DESC);

            CREATE TABLE audit_reports (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                employee_id UUID NOT NULL REFERENCES employees(id) ON DELETE CASCADE,
                chemist_id  UUID REFERENCES chemists(id) ON DELETE SET NULL,
                findings    JSONB NOT NULL DEFAULT '{}'::jsonb,
                audited_at  TIMESTAMPTZ NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
        "#,
    },
    Migration {
        version: 6,
        name: "add_updated_at_triggers",
        sql: r#"
            CREATE OR REPLACE FUNCTION touch_updated_at() RETURNS TRIGGER AS $fn$
            BEGIN
                NEW.updated_at = NOW();
                RETURN NEW;
            END;
            $fn$ LANGUAGE plpgsql;

            CREATE TRIGGER employees_updated_at BEFORE UPDATE ON employees
                FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
            CREATE TRIGGER hospitals_updated_at BEFORE UPDATE ON hospitals
                FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
            CREATE TRIGGER doctors_updated_at BEFORE UPDATE ON doctors
                FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
            CREATE TRIGGER chemists_updated_at BEFORE UPDATE ON chemists
                FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
            CREATE TRIGGER tasks_updated_at BEFORE UPDATE ON tasks
                FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
            CREATE TRIGGER orders_updated_at BEFORE UPDATE ON orders
                FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
            CREATE TRIGGER visit_reports_updated_at BEFORE UPDATE ON visit_reports
                FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
            CREATE TRIGGER audit_reports_updated_at BEFORE UPDATE ON audit_reports
                FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
        "#,
    },
];
