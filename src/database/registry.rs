//! Tenant connection registry.
//!
//! Single owner of the control-plane handle and of every tenant handle. A
//! schema's cache slot moves `Opening -> Ready`; the `Opening` slot is
//! installed under the state lock before anything is awaited and carries a
//! shared future, so every concurrent first caller for a schema awaits the
//! same open and receives the same `Arc`.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::database::control_plane::ControlPlane;
use crate::database::error::DatabaseError;
use crate::database::migrations::{MigrationReport, SchemaState};
use crate::database::tenant::TenantConnector;
use crate::types::{OrganizationId, SchemaName};

type OpenResult<T> = Result<Arc<T>, DatabaseError>;
type PendingOpen<T> = Shared<BoxFuture<'static, OpenResult<T>>>;

enum Slot<T> {
    Opening { attempt: u64, pending: PendingOpen<T> },
    Ready { client: Arc<T>, last_used: Instant },
}

struct RegistryState<T> {
    slots: HashMap<SchemaName, Slot<T>>,
    provisioning: HashSet<SchemaName>,
    next_attempt: u64,
    closed: bool,
}

impl<T> RegistryState<T> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            provisioning: HashSet::new(),
            next_attempt: 0,
            closed: false,
        }
    }

    /// True while `schema`'s slot is still the open started as `attempt`
    fn owns(&self, schema: &SchemaName, attempt: u64) -> bool {
        matches!(self.slots.get(schema), Some(Slot::Opening { attempt: a, .. }) if *a == attempt)
    }

    fn ready_count(&self) -> usize {
        self.slots.values().filter(|s| matches!(s, Slot::Ready { .. })).count()
    }

    /// Remove least-recently-used ready handles until at most `capacity`
    /// remain. Only handles no request currently holds are candidates, and
    /// `keep` is never evicted.
    fn evict_idle(&mut self, capacity: usize, keep: &SchemaName) -> Vec<(SchemaName, Arc<T>)> {
        let mut evicted = Vec::new();
        while self.ready_count() > capacity {
            let victim = self
                .slots
                .iter()
                .filter_map(|(name, slot)| match slot {
                    Slot::Ready { client, last_used }
                        if name != keep && Arc::strong_count(client) == 1 =>
                    {
                        Some((name.clone(), *last_used))
                    }
                    _ => None,
                })
                .min_by_key(|(_, used)| *used)
                .map(|(name, _)| name);

            let Some(name) = victim else { break };
            if let Some(Slot::Ready { client, .. }) = self.slots.remove(&name) {
                evicted.push((name, client));
            }
        }
        evicted
    }
}

fn lock_state<T>(state: &Mutex<RegistryState<T>>) -> MutexGuard<'_, RegistryState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Upper bound on cached tenant pools; `None` keeps every pool
    pub max_tenant_pools: Option<NonZeroUsize>,
}

/// Result of `initialize_migrations`
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationSummary {
    pub schemas: usize,
    pub up_to_date: usize,
    pub migrated: Vec<MigrationReport>,
}

impl MigrationSummary {
    fn record(&mut self, report: MigrationReport) {
        self.schemas += 1;
        if report.is_noop() {
            self.up_to_date += 1;
        } else {
            self.migrated.push(report);
        }
    }
}

/// One cache entry as reported by `snapshot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedTenant {
    pub schema: SchemaName,
    pub status: &'static str,
    pub idle_secs: Option<u64>,
}

/// Marks a schema as being provisioned for as long as it lives
struct ProvisioningClaim<'a, T> {
    state: &'a Mutex<RegistryState<T>>,
    schema: SchemaName,
}

impl<'a, T> ProvisioningClaim<'a, T> {
    fn acquire(state: &'a Mutex<RegistryState<T>>, schema: &SchemaName) -> Result<Self, DatabaseError> {
        let mut guard = lock_state(state);
        if guard.closed {
            return Err(DatabaseError::RegistryClosed);
        }
        if !guard.provisioning.insert(schema.clone()) {
            return Err(DatabaseError::Conflict(format!(
                "Schema '{}' is already being provisioned",
                schema
            )));
        }
        Ok(Self { state, schema: schema.clone() })
    }
}

impl<T> Drop for ProvisioningClaim<'_, T> {
    fn drop(&mut self) {
        lock_state(self.state).provisioning.remove(&self.schema);
    }
}

/// Process-wide authority for tenant connection handles.
///
/// Constructed once at startup and shared through `Arc`; nothing reaches it
/// through a global.
pub struct TenantRegistry<P: ControlPlane, C: TenantConnector> {
    control_plane: P,
    connector: Arc<C>,
    state: Arc<Mutex<RegistryState<C::Client>>>,
    options: RegistryOptions,
}

impl<P: ControlPlane, C: TenantConnector> TenantRegistry<P, C> {
    pub fn new(control_plane: P, connector: C, options: RegistryOptions) -> Self {
        Self {
            control_plane,
            connector: Arc::new(connector),
            state: Arc::new(Mutex::new(RegistryState::new())),
            options,
        }
    }

    /// Shared long-lived handle for organization and user queries
    pub fn control_plane(&self) -> &P {
        &self.control_plane
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Live handle for `schema`, opening and migrating it on first use.
    ///
    /// Concurrent first calls for the same schema share one open. After
    /// `close_all_connections` every call fails with `RegistryClosed`.
    pub async fn get_tenant_client(&self, schema: &SchemaName) -> Result<Arc<C::Client>, DatabaseError> {
        let pending = {
            let mut guard = lock_state(&*self.state);
            let state = &mut *guard;
            if state.closed {
                return Err(DatabaseError::RegistryClosed);
            }

            let pending = match state.slots.get_mut(schema) {
                Some(Slot::Ready { client, last_used }) => {
                    *last_used = Instant::now();
                    return Ok(Arc::clone(client));
                }
                Some(Slot::Opening { pending, .. }) => pending.clone(),
                None => {
                    let attempt = state.next_attempt;
                    state.next_attempt += 1;
                    let pending = self.start_open(schema.clone(), attempt);
                    state.slots.insert(
                        schema.clone(),
                        Slot::Opening { attempt, pending: pending.clone() },
                    );
                    debug!("Opening tenant pool for: {} (attempt {})", schema, attempt);
                    pending
                }
            };
            pending
        };

        pending.await
    }

    /// Runs the open on its own task so it finishes and settles its slot
    /// even when every caller awaiting it has gone away
    fn start_open(&self, schema: SchemaName, attempt: u64) -> PendingOpen<C::Client> {
        let connector = Arc::clone(&self.connector);
        let task_state = Arc::clone(&self.state);
        let task_schema = schema.clone();
        let capacity = self.options.max_tenant_pools;

        let task = tokio::spawn(async move {
            let opened = connector.open(&task_schema).await;
            settle_open(&*task_state, connector.as_ref(), &task_schema, attempt, capacity, opened).await
        });

        let state = Arc::clone(&self.state);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    {
                        let mut state = lock_state(&*state);
                        if state.owns(&schema, attempt) {
                            state.slots.remove(&schema);
                        }
                    }
                    error!("Open task for tenant {} did not complete: {}", schema, e);
                    Err(DatabaseError::Connection(format!(
                        "Opening tenant pool for {} was aborted",
                        schema
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Create a tenant schema for a newly onboarded organization, migrate it
    /// to the latest version and record it on the organization, atomically
    pub async fn provision_schema(
        &self,
        organization: OrganizationId,
        schema: &SchemaName,
    ) -> Result<MigrationReport, DatabaseError> {
        let _claim = ProvisioningClaim::acquire(&*self.state, schema)?;

        let report = self.control_plane.provision(organization, schema).await.map_err(|e| {
            error!("Provisioning {} for organization {} failed: {}", schema, organization, e);
            e
        })?;

        info!(
            "Schema {} provisioned at version {} ({} step(s) applied)",
            schema,
            report.to_version,
            report.applied.len()
        );
        Ok(report)
    }

    /// Bring every provisioned schema to the latest version. Stops at the
    /// first failure; callers at startup must treat an error as fatal.
    pub async fn initialize_migrations(&self) -> Result<MigrationSummary, DatabaseError> {
        let organizations = self.control_plane.provisioned_organizations().await?;
        info!("Checking migrations for {} tenant schema(s)", organizations.len());

        let mut summary = MigrationSummary::default();
        for organization in organizations {
            let report = self.connector.migrate(&organization.schema).await.map_err(|e| {
                error!(
                    "Migration of {} (organization '{}') failed: {}",
                    organization.schema, organization.name, e
                );
                match e {
                    e if e.is_connection() => e,
                    DatabaseError::Provisioning(msg) => DatabaseError::Provisioning(format!(
                        "{} (organization '{}'): {}",
                        organization.schema, organization.name, msg
                    )),
                    other => DatabaseError::Provisioning(format!(
                        "{} (organization '{}'): {}",
                        organization.schema, organization.name, other
                    )),
                }
            })?;
            summary.record(report);
        }

        info!(
            "Tenant migrations complete: {} schema(s), {} migrated, {} already current",
            summary.schemas,
            summary.migrated.len(),
            summary.up_to_date
        );
        Ok(summary)
    }

    /// Lifecycle state of `schema` as this process sees it
    pub async fn schema_state(&self, schema: &SchemaName) -> Result<SchemaState, DatabaseError> {
        {
            let state = lock_state(&*self.state);
            if state.provisioning.contains(schema) {
                return Ok(SchemaState::Provisioning);
            }
            if matches!(state.slots.get(schema), Some(Slot::Opening { .. })) {
                return Ok(SchemaState::Migrating);
            }
        }
        self.connector.inspect(schema).await
    }

    /// Cached schemas, sorted by name
    pub fn snapshot(&self) -> Vec<CachedTenant> {
        let state = lock_state(&*self.state);
        let mut entries: Vec<CachedTenant> = state
            .slots
            .iter()
            .map(|(schema, slot)| match slot {
                Slot::Opening { .. } => CachedTenant {
                    schema: schema.clone(),
                    status: "opening",
                    idle_secs: None,
                },
                Slot::Ready { last_used, .. } => CachedTenant {
                    schema: schema.clone(),
                    status: "ready",
                    idle_secs: Some(last_used.elapsed().as_secs()),
                },
            })
            .collect();
        entries.sort_by(|a, b| a.schema.cmp(&b.schema));
        entries
    }

    pub fn is_closed(&self) -> bool {
        lock_state(&*self.state).closed
    }

    /// Close every cached tenant pool and refuse further lookups. The
    /// control-plane handle is left open. Returns the number of pools closed.
    pub async fn close_all_connections(&self) -> usize {
        let drained: Vec<(SchemaName, Arc<C::Client>)> = {
            let mut state = lock_state(&*self.state);
            state.closed = true;
            let drained = state
                .slots
                .drain()
                .filter_map(|(schema, slot)| match slot {
                    Slot::Ready { client, .. } => Some((schema, client)),
                    Slot::Opening { .. } => None,
                })
                .collect();
            drained
        };

        let count = drained.len();
        for (schema, client) in drained {
            if Arc::strong_count(&client) > 1 {
                debug!("Closing tenant pool {} while requests still hold it", schema);
            }
            self.connector.close(&client).await;
        }
        info!("Closed {} tenant pool(s)", count);
        count
    }

    /// Disconnect the control plane. Tenant pools are closed first if that
    /// has not happened yet.
    pub async fn disconnect_control_plane(&self) {
        if !self.is_closed() {
            warn!("Control plane disconnect requested with tenant pools still open");
            self.close_all_connections().await;
        }
        self.control_plane.close().await;
    }

    /// Full teardown in shutdown order
    pub async fn shutdown(&self) {
        self.close_all_connections().await;
        self.disconnect_control_plane().await;
    }
}

async fn settle_open<C: TenantConnector>(
    state: &Mutex<RegistryState<C::Client>>,
    connector: &C,
    schema: &SchemaName,
    attempt: u64,
    capacity: Option<NonZeroUsize>,
    opened: Result<C::Client, DatabaseError>,
) -> OpenResult<C::Client> {
    let client = match opened {
        Ok(client) => Arc::new(client),
        Err(e) => {
            {
                let mut state = lock_state(state);
                if state.owns(schema, attempt) {
                    state.slots.remove(schema);
                }
            }
            warn!("Failed to open tenant pool for {}: {}", schema, e);
            return Err(e);
        }
    };

    let (accepted, evicted) = {
        let mut state = lock_state(state);
        if state.closed || !state.owns(schema, attempt) {
            (false, Vec::new())
        } else {
            state.slots.insert(
                schema.clone(),
                Slot::Ready { client: Arc::clone(&client), last_used: Instant::now() },
            );
            let evicted = match capacity {
                Some(capacity) => state.evict_idle(capacity.get(), schema),
                None => Vec::new(),
            };
            (true, evicted)
        }
    };

    for (name, idle) in evicted {
        connector.close(&idle).await;
        info!("Evicted idle tenant pool: {}", name);
    }

    if accepted {
        Ok(client)
    } else {
        connector.close(&client).await;
        info!("Discarded tenant pool for {} opened after registry close", schema);
        Err(DatabaseError::RegistryClosed)
    }
}
