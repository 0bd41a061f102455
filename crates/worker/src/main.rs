//! Draftly Background Worker
//!
//! Scheduled jobs for the billing reconciliation core:
//! - Grace-period sweep: revoke access once a canceled subscription's paid
//!   period elapses (hourly)
//! - Stuck-event monitor: surface events that never confirmed processing
//!   (every 15 minutes)
//! - Health check heartbeat (every 5 minutes)

use std::time::Duration;

use draftly_billing::InvariantChecker;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = draftly_shared::create_pool(&database_url).await?;
    Ok(pool)
}

/// Downgrade accounts whose cancellation grace has elapsed.
///
/// The delete-event handler deliberately leaves tier and access in place
/// when a subscription is canceled mid-period; this sweep is the other
/// half of that contract.
async fn sweep_expired_grace_periods(pool: &sqlx::PgPool) {
    let result = sqlx::query(
        r#"
        UPDATE accounts
        SET subscription_tier = 'free',
            access_granted = FALSE,
            updated_at = NOW()
        WHERE subscription_status = 'canceled'
          AND access_granted = TRUE
          AND current_period_end IS NOT NULL
          AND current_period_end < NOW()
        "#,
    )
    .execute(pool)
    .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => {
            info!(
                revoked = r.rows_affected(),
                "Grace period sweep revoked expired access"
            );
        }
        Ok(_) => {
            info!("Grace period sweep found nothing to revoke");
        }
        Err(e) => {
            error!(error = %e, "Grace period sweep failed");
        }
    }
}

/// Surface events that never confirmed processing.
///
/// A `received` row older than 30 minutes means the process crashed
/// mid-flight and the provider's redelivery has not converged it yet; a
/// growing `failed` backlog means an operator needs to look.
async fn monitor_stuck_events(pool: &sqlx::PgPool) {
    let stale: Result<i64, sqlx::Error> = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM stripe_webhook_events
        WHERE status = 'received'
          AND received_at < NOW() - INTERVAL '30 minutes'
        "#,
    )
    .fetch_one(pool)
    .await;

    match stale {
        Ok(0) => {}
        Ok(count) => {
            warn!(
                count = count,
                "Events stuck in 'received' for over 30 minutes; \
                 awaiting provider redelivery"
            );
        }
        Err(e) => error!(error = %e, "Stuck-event check failed"),
    }

    let failed: Result<Vec<(String, String, Option<String>)>, sqlx::Error> = sqlx::query_as(
        r#"
        SELECT stripe_event_id, event_type, last_error
        FROM stripe_webhook_events
        WHERE status = 'failed'
        ORDER BY received_at ASC
        LIMIT 20
        "#,
    )
    .fetch_all(pool)
    .await;

    match failed {
        Ok(rows) if rows.is_empty() => {}
        Ok(rows) => {
            warn!(count = rows.len(), "Failed events awaiting operator retry");
            for (event_id, event_type, last_error) in rows {
                warn!(
                    event_id = %event_id,
                    event_type = %event_type,
                    last_error = ?last_error,
                    "Failed event"
                );
            }
        }
        Err(e) => error!(error = %e, "Failed-event check failed"),
    }
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

    info!("Starting Draftly Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Grace-period sweep (hourly)
    let sweep_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let pool = sweep_pool.clone();
            Box::pin(async move {
                info!("Running grace period sweep");
                sweep_expired_grace_periods(&pool).await;
            })
        })?)
        .await?;
    info!("Scheduled: Grace period sweep (hourly)");

    // Job 2: Stuck-event monitor (every 15 minutes)
    let monitor_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let pool = monitor_pool.clone();
            Box::pin(async move {
                monitor_stuck_events(&pool).await;
            })
        })?)
        .await?;
    info!("Scheduled: Stuck-event monitor (every 15 minutes)");

    // Job 3: Billing invariant checks (daily at 4:00 AM UTC)
    let invariants_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let pool = invariants_pool.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                let checker = InvariantChecker::new(pool);
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "Billing invariants healthy"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Billing invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 4:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Run the sweep once on startup so a worker outage never leaves
    // expired access lingering a full hour.
    sweep_expired_grace_periods(&pool).await;

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Draftly Worker started successfully with 4 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
