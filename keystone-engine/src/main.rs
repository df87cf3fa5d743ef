//! Keystone Engine Entry Point
//!
//! One-shot commands for cron-style invocation, plus `run` for the
//! long-lived job daemon.

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use keystone_core::{DigestMailer, KeystoneResult, OrganizationId, ShipmentId};
use keystone_engine::{
    conflict_jobs_task, evaluate_shipment_delay, init_tracing, logistics_kpis, payment_kpis,
    preview_next_digest, run_all_escalations, run_conflict_digest, DbConfig, JobConfig,
    LogisticsKpis, MailerConfig, PaymentKpis, PgStorage, TelemetryConfig,
};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "keystone")]
#[command(about = "Procurement conflict detection and escalation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create tables and indexes if missing
    Migrate,
    /// Run the invoice, change order and milestone escalation scans once
    Escalate,
    /// Send the conflict digest once
    Digest,
    /// Show what the next digest would contain without sending it
    PreviewDigest,
    /// Re-run the delay check for one shipment
    CheckDelay { shipment_id: ShipmentId },
    /// Logistics and payment KPIs for one organization
    Kpis { organization_id: OrganizationId },
    /// Run escalations and digests on their intervals until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> KeystoneResult<()> {
    let cli = Cli::parse();
    init_tracing(&TelemetryConfig::from_env())?;

    let db_config = DbConfig::from_env();
    let store = PgStorage::from_config(&db_config)?;

    match cli.command {
        Commands::Migrate => {
            store.ensure_schema().await?;
        }
        Commands::Escalate => {
            let summary = run_all_escalations(&store, Utc::now()).await;
            print_json(&summary);
        }
        Commands::Digest => {
            let mailer = MailerConfig::from_env().build()?;
            let result = run_conflict_digest(&store, mailer.as_ref(), Utc::now()).await;
            print_json(&result);
        }
        Commands::PreviewDigest => {
            let preview = preview_next_digest(&store, Utc::now()).await?;
            print_json(&preview);
        }
        Commands::CheckDelay { shipment_id } => {
            let evaluation = evaluate_shipment_delay(&store, shipment_id, Utc::now()).await?;
            print_json(&evaluation);
        }
        Commands::Kpis { organization_id } => {
            let now = Utc::now();
            let kpis = OrganizationKpis {
                logistics: logistics_kpis(&store, organization_id, now).await?,
                payments: payment_kpis(&store, organization_id, now).await?,
            };
            print_json(&kpis);
        }
        Commands::Run => {
            store.ensure_schema().await?;
            let mailer: Arc<dyn DigestMailer> = Arc::from(MailerConfig::from_env().build()?);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let jobs = tokio::spawn(conflict_jobs_task(
                Arc::new(store),
                mailer,
                JobConfig::from_env(),
                shutdown_rx,
            ));

            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);

            match jobs.await {
                Ok(metrics) => print_json(&metrics.snapshot()),
                Err(e) => tracing::error!(error = %e, "Conflict jobs task panicked"),
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct OrganizationKpis {
    logistics: LogisticsKpis,
    payments: PaymentKpis,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!(error = %e, "Failed to render result"),
    }
}
