//! HTTP surface and process lifecycle.
//!
//! Boot is two-phase: the control plane is connected and every provisioned
//! tenant schema migrated before the listener is bound, so a schema that
//! cannot be brought current stops the process instead of failing requests.
//! On shutdown tenant pools are closed before the control plane.

use anyhow::Context;
use axum::{
    http::HeaderValue,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::auth::TokenVerifier;
use crate::config::AppConfig;
use crate::database::{
    ControlPlane, PgControlPlane, PgRegistry, PgTenantConnector, RegistryOptions, TenantConnector,
    TenantRegistry,
};
use crate::handlers;
use crate::middleware::{resolve_tenant_middleware, root_auth_middleware};

/// Shared request state: the registry and what is needed to check tokens
pub struct AppState<P: ControlPlane, C: TenantConnector> {
    pub registry: Arc<TenantRegistry<P, C>>,
    pub verifier: Arc<TokenVerifier>,
    pub root_role: Arc<str>,
}

impl<P: ControlPlane, C: TenantConnector> Clone for AppState<P, C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            verifier: Arc::clone(&self.verifier),
            root_role: Arc::clone(&self.root_role),
        }
    }
}

impl<P: ControlPlane, C: TenantConnector> AppState<P, C> {
    pub fn new(registry: Arc<TenantRegistry<P, C>>, verifier: TokenVerifier, root_role: &str) -> Self {
        Self {
            registry,
            verifier: Arc::new(verifier),
            root_role: Arc::from(root_role),
        }
    }
}

pub fn app<P: ControlPlane, C: TenantConnector>(state: AppState<P, C>) -> Router {
    Router::new()
        // Public
        .route("/", get(handlers::public::root))
        .route("/health", get(handlers::public::health::<P, C>))
        .merge(tenant_routes(state.clone()))
        .merge(root_routes(state.clone()))
        .with_state(state)
}

fn tenant_routes<P: ControlPlane, C: TenantConnector>(state: AppState<P, C>) -> Router<AppState<P, C>> {
    use handlers::protected::auth;

    Router::new()
        .route("/api/auth/whoami", get(auth::whoami_get::<C>))
        .route_layer(middleware::from_fn_with_state(state, resolve_tenant_middleware::<P, C>))
}

fn root_routes<P: ControlPlane, C: TenantConnector>(state: AppState<P, C>) -> Router<AppState<P, C>> {
    use handlers::elevated::root;

    Router::new()
        .route(
            "/api/root/organizations/:id/provision",
            post(root::organization_provision::<P, C>),
        )
        .route("/api/root/tenants", get(root::tenant_list::<P, C>))
        .route_layer(middleware::from_fn_with_state(state, root_auth_middleware::<P, C>))
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .security
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}

/// Phase one: connect, create control-plane tables, migrate every tenant.
/// Any error here must abort startup.
pub async fn bootstrap(config: &AppConfig) -> anyhow::Result<Arc<PgRegistry>> {
    let control_plane = PgControlPlane::connect(&config.database)
        .await
        .context("connecting to control-plane database")?;
    control_plane
        .ensure_schema()
        .await
        .context("creating control-plane tables")?;

    let connector = PgTenantConnector::from_config(&config.database)?;
    let registry = TenantRegistry::new(
        control_plane,
        connector,
        RegistryOptions { max_tenant_pools: config.database.pool_capacity() },
    );

    if let Err(e) = registry.initialize_migrations().await {
        registry.disconnect_control_plane().await;
        return Err(anyhow::Error::new(e).context("migrating tenant schemas"));
    }

    Ok(Arc::new(registry))
}

/// Boot, serve until SIGINT/SIGTERM, then tear down tenant pools and the
/// control plane in that order
pub async fn run(config: &AppConfig) -> anyhow::Result<()> {
    info!("Starting FieldForce API in {:?} mode", config.environment);

    let registry = bootstrap(config).await?;
    let state = AppState::new(
        Arc::clone(&registry),
        TokenVerifier::from_config(&config.security),
        &config.security.root_role,
    );

    let mut router = app(state);
    if config.security.enable_cors {
        router = router.layer(cors_layer(config));
    }
    if config.api.enable_request_logging {
        router = router.layer(TraceLayer::new_for_http());
    }

    let bind_addr = format!("0.0.0.0:{}", config.api.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            registry.shutdown().await;
            return Err(anyhow::Error::new(e).context(format!("failed to bind {}", bind_addr)));
        }
    };
    info!("FieldForce API listening on http://{}", bind_addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let closed = registry.close_all_connections().await;
    info!("Shutdown: closed {} tenant pool(s)", closed);
    registry.disconnect_control_plane().await;

    served.context("server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
