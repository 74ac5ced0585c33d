mod common;

use anyhow::Result;
use std::sync::Arc;

use fieldforce_api::database::migrations::{target_version, MANIFEST};
use fieldforce_api::database::{DatabaseError, SchemaState, TenantClient};

#[tokio::test]
async fn schemas_are_isolated_and_migrations_idempotent() -> Result<()> {
    let Some(registry) = common::registry().await? else {
        return Ok(());
    };

    let schema_a = common::unique_schema("it_a");
    let schema_b = common::unique_schema("it_b");
    let org_a = common::create_organization(&registry, "Isolation A", true).await?;
    let org_b = common::create_organization(&registry, "Isolation B", true).await?;

    let report = registry.provision_schema(org_a, &schema_a).await?;
    assert_eq!(report.from_version, 0);
    assert_eq!(report.to_version, target_version(MANIFEST));
    registry.provision_schema(org_b, &schema_b).await?;

    // Retrying the same binding is a no-op
    assert!(registry.provision_schema(org_a, &schema_a).await?.is_noop());
    // A different schema for a bound organization is refused
    assert!(matches!(
        registry.provision_schema(org_a, &schema_b).await,
        Err(DatabaseError::Conflict(_))
    ));

    let client_a = registry.get_tenant_client(&schema_a).await?;
    let client_b = registry.get_tenant_client(&schema_b).await?;

    sqlx::query("INSERT INTO employees (email, first_name, last_name) VALUES ($1, 'Alice', 'A')")
        .bind("alice@a.test")
        .execute(client_a.pool())
        .await?;

    assert!(client_a.find_employee("alice@a.test").await?.is_some());
    assert!(client_b.find_employee("alice@a.test").await?.is_none());

    let summary = registry.initialize_migrations().await?;
    assert!(summary.migrated.iter().all(|r| r.schema != schema_a && r.schema != schema_b));

    assert_eq!(
        registry.schema_state(&schema_a).await?,
        SchemaState::Current { version: target_version(MANIFEST) }
    );

    drop((client_a, client_b));
    registry.close_all_connections().await;
    common::cleanup(&registry, &[&schema_a, &schema_b], &[org_a, org_b]).await?;
    registry.disconnect_control_plane().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_first_access_shares_one_pool() -> Result<()> {
    let Some(registry) = common::registry().await? else {
        return Ok(());
    };

    let schema = common::unique_schema("it_sf");
    let org = common::create_organization(&registry, "Single Flight", true).await?;
    registry.provision_schema(org, &schema).await?;

    let clients = futures::future::join_all((0..8).map(|_| registry.get_tenant_client(&schema))).await;
    let first = clients[0].as_ref().map_err(Clone::clone)?;
    for client in &clients {
        assert!(Arc::ptr_eq(first, client.as_ref().map_err(Clone::clone)?));
    }
    assert_eq!(registry.snapshot().len(), 1);

    drop(clients);
    registry.close_all_connections().await;
    assert!(matches!(
        registry.get_tenant_client(&schema).await,
        Err(DatabaseError::RegistryClosed)
    ));

    common::cleanup(&registry, &[&schema], &[org]).await?;
    registry.disconnect_control_plane().await;
    Ok(())
}

#[tokio::test]
async fn unprovisioned_schema_is_not_opened() -> Result<()> {
    let Some(registry) = common::registry().await? else {
        return Ok(());
    };

    let schema = common::unique_schema("it_none");
    assert_eq!(registry.schema_state(&schema).await?, SchemaState::Unprovisioned);
    assert!(matches!(
        registry.get_tenant_client(&schema).await,
        Err(DatabaseError::Provisioning(_))
    ));
    assert!(registry.snapshot().is_empty());

    registry.shutdown().await;
    Ok(())
}
