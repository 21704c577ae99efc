//! Citadb CLI - diagnostics and recovery operations for the scheduling database

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use citadb::audit::{AuditWriter, RequestContext};
use citadb::config::{load_file_config, DbConfig};
use citadb::db::schema::ensure_audit_schema;
use citadb::db::DbAdapter;
use citadb::resolver::ProfessionalResolver;
use citadb::ui;
use citadb::undo::UndoEngine;

#[derive(Parser)]
#[command(name = "citadb")]
#[command(version = "0.0.1")]
#[command(about = "Dual-dialect persistence, audit trail and undo engine for the clinic scheduler")]
#[command(long_about = r#"
Citadb owns the scheduling system's database plumbing:
  • One query surface over MySQL or Postgres
  • Append-only audit trail for tracked mutations
  • Undo of appointment changes from audit snapshots
  • Doctor identifier resolution (id, license code, email or name)

Example usage:
  citadb ping
  citadb init-schema
  citadb resolve "COL-4411"
  citadb undo 1523
  citadb audit-tail --resource 31 --limit 10
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file with non-secret defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the configured database once and report the outcome
    Ping,

    /// Create the audit trail tables for the active dialect
    InitSchema,

    /// Resolve a doctor identifier to its stored key
    Resolve {
        /// Numeric id, license code, email or full name
        token: String,
    },

    /// Undo the mutation recorded by an audit entry
    Undo {
        /// Audit entry id
        audit_id: i64,

        /// Bearer token identifying the actor (optional)
        #[arg(long)]
        bearer: Option<String>,
    },

    /// Show the newest audit entries
    AuditTail {
        /// Restrict to one resource id
        #[arg(short, long)]
        resource: Option<String>,

        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let file = load_file_config(cli.config.as_deref())?;
    let config = DbConfig::from_env(file.as_ref())?;
    let adapter = DbAdapter::new(config);

    match cli.command {
        Commands::Ping => {
            let target = adapter.resolved_config();
            ui::header("Connection probe");
            ui::status("dialect", target.dialect);
            ui::status("host", &format!("{}:{}", target.host, target.port));
            ui::status("database", &target.database);
            ui::status("tls", &target.tls.to_string());

            let report = adapter.test_once().await;
            if report.ok {
                ui::success("SELECT 1 round-trip succeeded");
            } else {
                ui::error(&format!(
                    "probe failed: {}",
                    report.error.unwrap_or_else(|| "unknown error".to_string())
                ));
                std::process::exit(1);
            }
        }

        Commands::InitSchema => {
            adapter.connect_with_retry().await?;
            ensure_audit_schema(&adapter).await?;
            ui::success("audit trail schema is in place");
        }

        Commands::Resolve { token } => {
            adapter.connect_with_retry().await?;
            let resolver = ProfessionalResolver::new(&adapter);
            println!("{} Resolving '{}'...", ui::Icons::SEARCH, token);
            let key = resolver.resolve(&token).await?;
            ui::success(&format!("resolved to {key}"));
        }

        Commands::Undo { audit_id, bearer } => {
            adapter.connect_with_retry().await?;
            let secret =
                std::env::var("JWT_SECRET").unwrap_or_else(|_| "secreto".to_string());
            let ctx = RequestContext::from_bearer(
                bearer.as_deref(),
                &secret,
                None,
                Some(format!("citadb-cli/{}", env!("CARGO_PKG_VERSION"))),
            );

            let engine = UndoEngine::new(&adapter);
            let outcome = engine.undo(audit_id, &ctx).await?;
            ui::success(outcome.describe());
            println!("{}", serde_json::to_string_pretty(&outcome.restored_to())?);
        }

        Commands::AuditTail { resource, limit } => {
            adapter.connect_with_retry().await?;
            let writer = AuditWriter::new(&adapter);
            let entries = writer.recent(resource.as_deref(), limit).await?;

            if entries.is_empty() {
                println!("∅ No audit entries found.");
            } else {
                let rows: Vec<ui::AuditRow> = entries
                    .iter()
                    .map(|e| ui::AuditRow {
                        id: e.id,
                        event: e.event_type.clone(),
                        resource: match (&e.resource_type, &e.resource_id) {
                            (Some(t), Some(i)) => format!("{t}/{i}"),
                            (Some(t), None) => t.clone(),
                            _ => "-".to_string(),
                        },
                        actor: e.changed_by.clone().unwrap_or_else(|| "-".to_string()),
                        when: e.created_at.clone().unwrap_or_else(|| "-".to_string()),
                    })
                    .collect();
                println!("{}", ui::audit_table(&rows));
            }
        }
    }

    Ok(())
}
