// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Parley Background Worker
//!
//! Handles scheduled billing reconciliation jobs:
//! - Webhook retry: replays stored events whose processing failed (every 5 minutes)
//! - Checkout sweep: pull-syncs pending checkout sessions whose completion
//!   webhook never arrived (every 15 minutes)

use std::sync::Arc;
use std::time::Duration;

use parley_billing::BillingService;
use parley_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Replay stored webhook events that never finished processing.
///
/// Events younger than the minimum age are skipped, their first delivery may
/// still be in flight. Events that fail again stay unprocessed and are
/// picked up by the next cycle.
async fn retry_failed_webhooks(billing: &BillingService) {
    let events = match billing
        .webhooks
        .events()
        .list_unprocessed(time::Duration::minutes(5), 50)
        .await
    {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to list unprocessed webhook events");
            return;
        }
    };

    if events.is_empty() {
        return;
    }

    info!(count = events.len(), "Replaying unprocessed webhook events");

    let mut replayed = 0;
    let mut failed = 0;
    for event in &events {
        match billing.webhooks.replay_event(&event.stripe_event_id).await {
            Ok(_) => replayed += 1,
            Err(e) => {
                failed += 1;
                warn!(
                    event_id = %event.stripe_event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook replay failed, will retry next cycle"
                );
            }
        }
    }

    info!(replayed = replayed, failed = failed, "Webhook replay cycle complete");
}

/// Pull-sync checkout sessions that are still pending locally.
///
/// Covers completion webhooks that were lost or arrived before their
/// customer row existed. Sessions Stripe reports as expired are closed out.
async fn sweep_pending_checkouts(billing: &BillingService) {
    let sessions = match billing
        .checkout
        .list_pending(time::Duration::minutes(10), 50)
        .await
    {
        Ok(sessions) => sessions,
        Err(e) => {
            error!(error = %e, "Failed to list pending checkout sessions");
            return;
        }
    };

    if sessions.is_empty() {
        return;
    }

    info!(count = sessions.len(), "Sweeping pending checkout sessions");

    let mut completed = 0;
    let mut still_pending = 0;
    let mut errors = 0;
    for session_id in &sessions {
        match billing.checkout.sync_completed_session(session_id).await {
            Ok(result) if result.status == "completed" => completed += 1,
            Ok(_) => still_pending += 1,
            Err(e) => {
                errors += 1;
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "Checkout session sweep failed"
                );
            }
        }
    }

    info!(
        completed = completed,
        still_pending = still_pending,
        errors = errors,
        "Checkout sweep complete"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Parley Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If Stripe isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay unprocessed webhook events every 5 minutes
    let webhook_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = webhook_billing.clone();
            Box::pin(async move {
                retry_failed_webhooks(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event replay (every 5 minutes)");

    // Job 2: Sweep pending checkout sessions every 15 minutes
    let checkout_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = checkout_billing.clone();
            Box::pin(async move {
                sweep_pending_checkouts(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Checkout session sweep (every 15 minutes)");

    // Job 3: Heartbeat every 5 minutes
    scheduler
        .add(Job::new_async("30 */5 * * * *", move |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Parley Worker started successfully with 3 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
