use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config;
use crate::database::{
    MigrationReport, MigrationSummary, PgControlPlane, PgRegistry, PgTenantConnector,
    RegistryOptions, SchemaState, TenantRegistry,
};
use crate::types::{OrganizationId, SchemaName};

#[derive(Parser)]
#[command(name = "fieldforce")]
#[command(about = "FieldForce admin CLI - tenant schema provisioning and migrations")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in human-readable text format")]
    pub text: bool,

    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    #[command(about = "Bring every provisioned tenant schema to the latest version")]
    Migrate,

    #[command(about = "Create, migrate and bind the schema for an organization")]
    Provision {
        #[arg(help = "Organization id")]
        organization_id: Uuid,
        #[arg(help = "Tenant schema name")]
        schema: String,
    },

    #[command(about = "Show the migration state of a tenant schema")]
    Status {
        #[arg(help = "Tenant schema name")]
        schema: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

/// Registry over the configured database, without the startup migration pass
async fn connect() -> anyhow::Result<PgRegistry> {
    let config = config::config();
    let control_plane = PgControlPlane::connect(&config.database)
        .await
        .context("connecting to control-plane database")?;
    control_plane.ensure_schema().await?;

    Ok(TenantRegistry::new(
        control_plane,
        PgTenantConnector::from_config(&config.database)?,
        RegistryOptions { max_tenant_pools: config.database.pool_capacity() },
    ))
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);
    let registry = connect().await?;

    let result = match cli.command {
        Commands::Migrate => migrate(&registry, &output_format).await,
        Commands::Provision { organization_id, schema } => {
            provision(&registry, &output_format, organization_id, &schema).await
        }
        Commands::Status { schema } => status(&registry, &output_format, &schema).await,
    };

    registry.shutdown().await;
    result
}

async fn migrate(registry: &PgRegistry, output_format: &OutputFormat) -> anyhow::Result<()> {
    let summary = registry.initialize_migrations().await?;
    output(output_format, &summary, summary_text(&summary))
}

async fn provision(
    registry: &PgRegistry,
    output_format: &OutputFormat,
    organization_id: Uuid,
    schema: &str,
) -> anyhow::Result<()> {
    let schema = SchemaName::parse(schema)?;
    let report = registry
        .provision_schema(OrganizationId::new(organization_id), &schema)
        .await?;
    output(output_format, &report, report_text(&report))
}

async fn status(registry: &PgRegistry, output_format: &OutputFormat, schema: &str) -> anyhow::Result<()> {
    let schema = SchemaName::parse(schema)?;
    let state = registry.schema_state(&schema).await?;
    output(output_format, &json!({ "schema": schema, "status": state }), state_text(&schema, &state))
}

fn output<T: Serialize>(output_format: &OutputFormat, data: &T, text: String) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "success": true, "data": data }))?);
        }
        OutputFormat::Text => println!("{}", text),
    }
    Ok(())
}

fn report_text(report: &MigrationReport) -> String {
    if report.is_noop() {
        format!("✓ {} already at version {}", report.schema, report.to_version)
    } else {
        format!(
            "✓ {} migrated from version {} to {} ({} step(s))",
            report.schema,
            report.from_version,
            report.to_version,
            report.applied.len()
        )
    }
}

fn summary_text(summary: &MigrationSummary) -> String {
    let mut lines = vec![format!(
        "✓ {} tenant schema(s) checked, {} migrated, {} already current",
        summary.schemas,
        summary.migrated.len(),
        summary.up_to_date
    )];
    lines.extend(summary.migrated.iter().map(|r| format!("  {}", report_text(r))));
    lines.join("\n")
}

fn state_text(schema: &SchemaName, state: &SchemaState) -> String {
    match state {
        SchemaState::Unprovisioned => format!("{}: not provisioned", schema),
        SchemaState::Provisioning => format!("{}: provisioning", schema),
        SchemaState::Current { version } => format!("{}: current (version {})", schema, version),
        SchemaState::Stale { version, target } => {
            format!("{}: stale (version {}, latest {})", schema, version, target)
        }
        SchemaState::Migrating => format!("{}: migrating", schema),
    }
}
