//! In-memory stand-ins for the control plane and the tenant database, plus
//! token minting, for unit tests that exercise the registry and the
//! resolution step without PostgreSQL.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::auth::{Claims, TokenVerifier};
use crate::database::control_plane::ControlPlane;
use crate::database::migrations::{target_version, MigrationError, MigrationReport, SchemaState, MANIFEST};
use crate::database::models::{Employee, Organization, ProvisionedOrganization, UserAccount};
use crate::database::registry::{RegistryOptions, TenantRegistry};
use crate::database::tenant::{TenantClient, TenantConnector};
use crate::database::DatabaseError;
use crate::server::AppState;
use crate::types::{OrganizationId, SchemaName};

pub const TEST_SECRET: &str = "test-secret";

pub fn schema(name: &str) -> SchemaName {
    SchemaName::parse(name).unwrap()
}

pub fn mint_token_with(email: Option<&str>, role: &str, ttl_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        id: Some(Uuid::new_v4()),
        email: email.map(str::to_string),
        role: role.to_string(),
        exp: now + ttl_secs,
        iat: Some(now),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(TEST_SECRET.as_bytes())).unwrap()
}

/// Sign an arbitrary claim set with the test secret
pub fn mint_raw(claims: &serde_json::Value) -> String {
    encode(&Header::default(), claims, &EncodingKey::from_secret(TEST_SECRET.as_bytes())).unwrap()
}

pub fn mint_token(email: &str, role: &str) -> String {
    mint_token_with(Some(email), role, 3600)
}

/// `Authorization` header value carrying a fresh token
pub fn bearer(email: &str, role: &str) -> String {
    format!("Bearer {}", mint_token(email, role))
}

#[derive(Debug, Default)]
struct FakeSchema {
    version: i64,
    employees: HashMap<String, Uuid>,
}

/// The tenant side of a database server: schemas with a version and
/// an employee table. Counts every migration step it executes.
#[derive(Debug, Default)]
pub struct FakeCluster {
    schemas: Mutex<HashMap<SchemaName, FakeSchema>>,
    ddl: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_schema(&self, schema: &SchemaName, version: i64) {
        self.schemas.lock().unwrap().entry(schema.clone()).or_default().version = version;
    }

    pub fn version(&self, schema: &SchemaName) -> Option<i64> {
        self.schemas.lock().unwrap().get(schema).map(|s| s.version)
    }

    pub fn ddl_statements(&self) -> usize {
        self.ddl.load(Ordering::SeqCst)
    }

    pub fn add_employee(&self, schema: &SchemaName, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.schemas
            .lock()
            .unwrap()
            .entry(schema.clone())
            .or_default()
            .employees
            .insert(email.to_string(), id);
        id
    }

    fn employee(&self, schema: &SchemaName, email: &str) -> Option<Uuid> {
        self.schemas.lock().unwrap().get(schema)?.employees.get(email).copied()
    }

    fn exists(&self, schema: &SchemaName) -> bool {
        self.schemas.lock().unwrap().contains_key(schema)
    }

    fn migrate(&self, schema: &SchemaName) -> Result<MigrationReport, DatabaseError> {
        let mut schemas = self.schemas.lock().unwrap();
        let entry = schemas
            .get_mut(schema)
            .ok_or_else(|| DatabaseError::from(MigrationError::SchemaMissing(schema.clone())))?;

        let from_version = entry.version;
        let applied: Vec<i64> = MANIFEST
            .iter()
            .map(|m| m.version)
            .filter(|v| *v > from_version)
            .collect();
        self.ddl.fetch_add(applied.len(), Ordering::SeqCst);
        entry.version = applied.last().copied().unwrap_or(from_version);

        Ok(MigrationReport {
            schema: schema.clone(),
            from_version,
            to_version: entry.version,
            applied,
        })
    }

    fn inspect(&self, schema: &SchemaName) -> SchemaState {
        let target = target_version(MANIFEST);
        match self.version(schema) {
            None => SchemaState::Unprovisioned,
            Some(version) if version == target => SchemaState::Current { version },
            Some(version) => SchemaState::Stale { version, target },
        }
    }
}

struct FakeUser {
    id: Uuid,
    role: String,
    organization_id: Option<OrganizationId>,
}

pub struct FakeControlPlane {
    cluster: Arc<FakeCluster>,
    organizations: Mutex<HashMap<OrganizationId, Organization>>,
    users: Mutex<HashMap<String, FakeUser>>,
    delay: Mutex<Option<Duration>>,
    provisions: AtomicUsize,
    closed: AtomicBool,
}

impl FakeControlPlane {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            organizations: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            provisions: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn add_organization(&self, name: &str, schema_name: Option<&str>, is_active: bool) -> Organization {
        let now = Utc::now();
        let organization = Organization {
            id: OrganizationId::new(Uuid::new_v4()),
            name: name.to_string(),
            schema_name: schema_name.map(str::to_string),
            is_active,
            created_at: now,
            updated_at: now,
        };
        self.organizations
            .lock()
            .unwrap()
            .insert(organization.id, organization.clone());
        organization
    }

    pub fn add_user(&self, email: &str, role: &str, organization_id: Option<OrganizationId>) -> UserAccount {
        let id = Uuid::new_v4();
        self.users.lock().unwrap().insert(
            email.to_string(),
            FakeUser { id, role: role.to_string(), organization_id },
        );
        UserAccount {
            id,
            email: email.to_string(),
            role: role.to_string(),
            is_active: true,
            organization_id,
            organization: organization_id.and_then(|id| self.organization(id)),
        }
    }

    pub fn organization(&self, id: OrganizationId) -> Option<Organization> {
        self.organizations.lock().unwrap().get(&id).cloned()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn provision_count(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, DatabaseError> {
        let users = self.users.lock().unwrap();
        let Some(user) = users.get(email) else {
            return Ok(None);
        };
        Ok(Some(UserAccount {
            id: user.id,
            email: email.to_string(),
            role: user.role.clone(),
            is_active: true,
            organization_id: user.organization_id,
            organization: user.organization_id.and_then(|id| self.organization(id)),
        }))
    }

    async fn provisioned_organizations(&self) -> Result<Vec<ProvisionedOrganization>, DatabaseError> {
        let mut organizations: Vec<ProvisionedOrganization> = self
            .organizations
            .lock()
            .unwrap()
            .values()
            .filter_map(|org| {
                let schema = SchemaName::parse(org.schema_name.clone()?).ok()?;
                Some(ProvisionedOrganization { id: org.id, name: org.name.clone(), schema })
            })
            .collect();
        organizations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(organizations)
    }

    async fn provision(
        &self,
        organization: OrganizationId,
        schema: &SchemaName,
    ) -> Result<MigrationReport, DatabaseError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.provisions.fetch_add(1, Ordering::SeqCst);

        let mut organizations = self.organizations.lock().unwrap();
        let current = organizations
            .get(&organization)
            .ok_or_else(|| DatabaseError::NotFound(format!("Organization {} not found", organization)))?
            .schema_name
            .clone();

        match current {
            Some(existing) if existing == schema.as_str() => self.cluster.migrate(schema),
            Some(existing) => Err(DatabaseError::Conflict(format!(
                "Organization {} is already bound to schema '{}'",
                organization, existing
            ))),
            None => {
                if organizations.values().any(|o| o.schema_name.as_deref() == Some(schema.as_str())) {
                    return Err(DatabaseError::Conflict(format!("Schema '{}' is taken", schema)));
                }
                if !self.cluster.exists(schema) {
                    self.cluster.create_schema(schema, 0);
                }
                let report = self.cluster.migrate(schema)?;
                if let Some(org) = organizations.get_mut(&organization) {
                    org.schema_name = Some(schema.to_string());
                }
                Ok(report)
            }
        }
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::Connection("control plane closed".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct FakeClient {
    schema: SchemaName,
    cluster: Arc<FakeCluster>,
}

#[async_trait]
impl TenantClient for FakeClient {
    fn schema(&self) -> &SchemaName {
        &self.schema
    }

    async fn find_employee(&self, email: &str) -> Result<Option<Employee>, DatabaseError> {
        Ok(self.cluster.employee(&self.schema, email).map(|id| Employee {
            id,
            email: email.to_string(),
            first_name: "Test".to_string(),
            last_name: "Employee".to_string(),
            is_active: true,
            created_at: Utc::now(),
        }))
    }
}

/// Connector over a `FakeCluster` that counts opens and closes
pub struct FakeConnector {
    cluster: Arc<FakeCluster>,
    delay: Option<Duration>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_next: Mutex<Option<DatabaseError>>,
}

impl FakeConnector {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            delay: None,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
        }
    }

    /// Make every open take at least `delay`, so concurrent callers overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_next_open(&self, err: DatabaseError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenantConnector for FakeConnector {
    type Client = FakeClient;

    async fn open(&self, schema: &SchemaName) -> Result<FakeClient, DatabaseError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.fail_next.lock().unwrap().take();
        if let Some(err) = failure {
            return Err(err);
        }
        self.cluster.migrate(schema)?;
        Ok(FakeClient { schema: schema.clone(), cluster: Arc::clone(&self.cluster) })
    }

    async fn migrate(&self, schema: &SchemaName) -> Result<MigrationReport, DatabaseError> {
        self.cluster.migrate(schema)
    }

    async fn inspect(&self, schema: &SchemaName) -> Result<SchemaState, DatabaseError> {
        Ok(self.cluster.inspect(schema))
    }

    async fn close(&self, _client: &FakeClient) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub type FakeRegistry = TenantRegistry<FakeControlPlane, FakeConnector>;

/// A registry over fakes with helpers to seed organizations, users and
/// tenant employees
pub struct Fixture {
    pub cluster: Arc<FakeCluster>,
    pub registry: Arc<FakeRegistry>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_options(RegistryOptions::default())
    }

    pub fn with_options(options: RegistryOptions) -> Self {
        let cluster = FakeCluster::new();
        let registry = TenantRegistry::new(
            FakeControlPlane::new(Arc::clone(&cluster)),
            FakeConnector::new(Arc::clone(&cluster)).with_delay(Duration::from_millis(10)),
            options,
        );
        Self { cluster, registry: Arc::new(registry) }
    }

    pub fn organization(&self, name: &str, schema_name: Option<&str>, is_active: bool) -> Organization {
        self.registry.control_plane().add_organization(name, schema_name, is_active)
    }

    pub fn user(&self, email: &str, role: &str, organization_id: Option<OrganizationId>) -> UserAccount {
        self.registry.control_plane().add_user(email, role, organization_id)
    }

    /// Employee row in `schema_name`, creating the schema at version zero if needed
    pub fn employee(&self, schema_name: &str, email: &str) -> Uuid {
        self.cluster.add_employee(&schema(schema_name), email)
    }

    pub fn state(&self) -> AppState<FakeControlPlane, FakeConnector> {
        AppState::new(
            Arc::clone(&self.registry),
            TokenVerifier::new(TEST_SECRET, 0),
            "root",
        )
    }
}
