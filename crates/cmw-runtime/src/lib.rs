//! Scheduler: runs the pullers as independent interval jobs.
//!
//! Each job takes a per-entity Postgres advisory lock before running, so an
//! overlapping invocation (or a second scheduler process) cannot corrupt the
//! checkpoint — the late-comer simply skips the round. Job failures are
//! isolated: one puller blowing up never takes the others down. On shutdown
//! a running batch is allowed to finish; the next round is not started.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cmw_etl::EtlContext;
use cmw_odata::entities;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Consultations,
    ConsultationsOpenUpdate,
    BulkConsultations,
    Calls,
    Reschedules,
    Ratings,
    QueueClosings,
    Users,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Consultations => "consultations",
            JobKind::ConsultationsOpenUpdate => "consultations_open_update",
            JobKind::BulkConsultations => "bulk_consultations",
            JobKind::Calls => "calls",
            JobKind::Reschedules => "reschedules",
            JobKind::Ratings => "ratings",
            JobKind::QueueClosings => "queue_closings",
            JobKind::Users => "users",
        }
    }

    /// Checkpoint entity name, also the advisory-lock key. The two
    /// consultation modes share the lock: they write the same rows.
    pub fn lock_entity(&self) -> &'static str {
        match self {
            JobKind::Consultations | JobKind::ConsultationsOpenUpdate => {
                entities::CONSULTATION_DOC
            }
            JobKind::BulkConsultations => entities::CONSULTATION_DOC_ALL,
            JobKind::Calls => entities::CALL_REGISTER,
            JobKind::Reschedules => entities::RESCHED_REGISTER,
            JobKind::Ratings => entities::RATING_REGISTER,
            JobKind::QueueClosings => entities::QUEUE_CLOSING_REGISTER,
            JobKind::Users => entities::USER_CATALOG,
        }
    }
}

/// Dispatch one puller invocation.
pub async fn run_job(ctx: &EtlContext, kind: JobKind) -> Result<()> {
    match kind {
        // Honors ETL_MODE, which defaults to incremental.
        JobKind::Consultations => cmw_etl::consultations::run(ctx).await,
        JobKind::ConsultationsOpenUpdate => cmw_etl::consultations::run_open_update(ctx).await,
        JobKind::BulkConsultations => cmw_etl::bulk::run(ctx).await,
        JobKind::Calls => cmw_etl::calls::run(ctx).await,
        JobKind::Reschedules => cmw_etl::redates::run(ctx).await,
        JobKind::Ratings => cmw_etl::ratings::run(ctx).await,
        JobKind::QueueClosings => cmw_etl::queue_closing::run(ctx).await,
        JobKind::Users => cmw_etl::users::run(ctx).await,
    }
}

/// Run one job under its advisory lock, isolating failures.
pub async fn run_job_locked(ctx: &EtlContext, kind: JobKind) {
    let entity = kind.lock_entity();
    let lock = match cmw_db::EntityLock::try_acquire(&ctx.pool, entity).await {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            info!(job = kind.name(), entity, "another writer holds the lock, skipping round");
            return;
        }
        Err(e) => {
            error!(job = kind.name(), error = %e, "failed to acquire entity lock");
            return;
        }
    };

    if let Err(e) = run_job(ctx, kind).await {
        error!(job = kind.name(), error = %e, "job failed");
    }
    if let Err(e) = lock.release().await {
        warn!(job = kind.name(), error = %e, "failed to release entity lock");
    }
}

pub struct ScheduledJob {
    pub kind: JobKind,
    pub interval: Duration,
}

/// Default cadence for the full fleet.
pub fn default_schedule() -> Vec<ScheduledJob> {
    vec![
        ScheduledJob { kind: JobKind::Consultations, interval: Duration::from_secs(120) },
        ScheduledJob { kind: JobKind::ConsultationsOpenUpdate, interval: Duration::from_secs(1800) },
        ScheduledJob { kind: JobKind::BulkConsultations, interval: Duration::from_secs(600) },
        ScheduledJob { kind: JobKind::Calls, interval: Duration::from_secs(300) },
        ScheduledJob { kind: JobKind::Reschedules, interval: Duration::from_secs(300) },
        ScheduledJob { kind: JobKind::Ratings, interval: Duration::from_secs(600) },
        ScheduledJob { kind: JobKind::QueueClosings, interval: Duration::from_secs(300) },
        ScheduledJob { kind: JobKind::Users, interval: Duration::from_secs(3600) },
    ]
}

/// Run the fleet until SIGTERM/ctrl-c. A round in flight finishes; no new
/// round starts after the signal.
pub async fn run_scheduler(ctx: EtlContext, schedule: Vec<ScheduledJob>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(schedule.len());
    for job in schedule {
        let ctx = ctx.clone();
        let mut shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(job.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        run_job_locked(&ctx, job.kind).await;
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }
            info!(job = job.kind.name(), "job loop stopped");
        }));
    }

    wait_for_shutdown().await;
    info!("shutdown requested; letting running batches finish");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consultation_modes_share_one_lock() {
        assert_eq!(
            JobKind::Consultations.lock_entity(),
            JobKind::ConsultationsOpenUpdate.lock_entity()
        );
        assert_ne!(
            JobKind::Consultations.lock_entity(),
            JobKind::BulkConsultations.lock_entity()
        );
    }

    #[test]
    fn default_schedule_covers_every_job_once() {
        let schedule = default_schedule();
        let mut names: Vec<_> = schedule.iter().map(|j| j.kind.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), schedule.len());
        assert_eq!(schedule.len(), 8);
    }
}
