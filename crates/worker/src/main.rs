//! Accrue Background Worker
//!
//! Handles scheduled jobs:
//! - Reconciliation pull of provider subscription state (every 15 minutes)
//! - Billing invariant checks (daily at 4:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use accrue_billing::{
    BillingOptions, BillingService, InvariantCheckSummary, InvariantChecker, ReconcileSummary,
};
use accrue_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

fn log_reconcile_summary(summary: &ReconcileSummary) {
    if summary.needs_attention > 0 || summary.errors > 0 {
        warn!(
            checked = summary.checked,
            updated = summary.updated,
            ended = summary.ended,
            unchanged = summary.unchanged,
            needs_attention = summary.needs_attention,
            provider_repaired = summary.provider_repaired,
            errors = summary.errors,
            "Reconciliation finished with records needing attention"
        );
    } else {
        info!(
            checked = summary.checked,
            updated = summary.updated,
            ended = summary.ended,
            unchanged = summary.unchanged,
            provider_repaired = summary.provider_repaired,
            "Reconciliation complete"
        );
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants healthy");
    } else {
        warn!(
            checks_run = summary.checks_run,
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Billing invariant violations found"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Accrue Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let billing = match BillingService::from_env(pool.clone(), BillingOptions::default()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;
    let mut jobs = 0;

    // Job 1: Reconcile local records against the provider
    // Cron: every 15 minutes
    match billing.reconciler.clone() {
        Some(reconciler) => {
            scheduler
                .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
                    let reconciler = reconciler.clone();
                    Box::pin(async move {
                        info!("Running scheduled reconciliation");
                        match reconciler.reconcile_all().await {
                            Ok(summary) => log_reconcile_summary(&summary),
                            Err(e) => error!(error = %e, "Reconciliation run failed"),
                        }
                    })
                })?)
                .await?;
            jobs += 1;
            info!("Scheduled: Reconciliation (every 15 minutes)");
        }
        None => warn!("STRIPE_SECRET_KEY not set; reconciliation disabled"),
    }

    // Job 2: Billing invariant checks
    // Cron: At 4:00 AM UTC daily
    let checker = Arc::new(InvariantChecker::new(pool));
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    jobs += 1;
    info!("Scheduled: Billing invariant checks (4:00 AM UTC)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    jobs += 1;

    scheduler.start().await?;

    info!("Accrue Worker started successfully with {} scheduled jobs", jobs);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
