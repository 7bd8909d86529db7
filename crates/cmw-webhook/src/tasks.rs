//! Background ERP write-backs.
//!
//! A webhook handler must never block on ERP I/O or keep a store connection
//! open across an external call, so status/manager pushes are enqueued here
//! and executed by a single worker with its own pool connections. The queue
//! is bounded; shutdown closes the sender and drains what is left.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use cmw_odata::{ConsultationPatch, ErpStatusCode, OdataClient};
use cmw_schemas::ConsStatus;

/// Store → ERP status code mapping for the narrow write path.
pub fn erp_status_code(status: ConsStatus) -> ErpStatusCode {
    match status {
        ConsStatus::Open => ErpStatusCode::New,
        ConsStatus::Pending => ErpStatusCode::InProgress,
        ConsStatus::Resolved => ErpStatusCode::Closed,
        other => ErpStatusCode::Verbatim(other.as_str()),
    }
}

#[derive(Debug)]
pub enum ErpWrite {
    Status {
        cons_id: String,
        ref_key: Uuid,
        status: ConsStatus,
    },
    Manager {
        cons_id: String,
        ref_key: Uuid,
        manager_key: Uuid,
    },
    StartDate {
        cons_id: String,
        ref_key: Uuid,
        start_date: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct BackgroundTasks {
    tx: mpsc::Sender<ErpWrite>,
}

impl BackgroundTasks {
    /// Spawn the worker. Keep the handle for [`BackgroundTasks::shutdown`].
    pub fn spawn(pool: PgPool, odata: OdataClient) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ErpWrite>(256);
        let handle = tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                if let Err(e) = execute(&pool, &odata, &write).await {
                    warn!(error = %e, ?write, "background ERP write failed");
                }
            }
            info!("background ERP writer drained");
        });
        (BackgroundTasks { tx }, handle)
    }

    /// Fire-and-forget enqueue; the handler never awaits the write.
    pub fn submit(&self, write: ErpWrite) {
        if let Err(e) = self.tx.try_send(write) {
            warn!(error = %e, "background ERP queue full, write dropped");
        }
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn shutdown(self, handle: JoinHandle<()>) {
        drop(self.tx);
        let _ = handle.await;
    }
}

async fn execute(pool: &PgPool, odata: &OdataClient, write: &ErpWrite) -> Result<()> {
    match write {
        ErpWrite::Status {
            cons_id,
            ref_key,
            status,
        } => {
            let patch = ConsultationPatch {
                status: Some(erp_status_code(*status)),
                ..Default::default()
            };
            odata
                .update_consultation(*ref_key, &patch)
                .await?;
            let mut conn = pool.acquire().await?;
            cmw_db::mark_change_synced_to_erp(&mut conn, cons_id, "status").await?;
            info!(cons_id, "status synced to ERP");
        }
        ErpWrite::Manager {
            cons_id,
            ref_key,
            manager_key,
        } => {
            let patch = ConsultationPatch {
                manager_key: Some(*manager_key),
                ..Default::default()
            };
            odata
                .update_consultation(*ref_key, &patch)
                .await?;
            let mut conn = pool.acquire().await?;
            cmw_db::mark_change_synced_to_erp(&mut conn, cons_id, "manager").await?;
            info!(cons_id, "manager synced to ERP");
        }
        ErpWrite::StartDate {
            cons_id,
            ref_key,
            start_date,
        } => {
            let patch = ConsultationPatch {
                start_date: Some(*start_date),
                ..Default::default()
            };
            odata
                .update_consultation(*ref_key, &patch)
                .await?;
            info!(cons_id, "start date synced to ERP");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_per_contract() {
        assert_eq!(erp_status_code(ConsStatus::Open).as_str(), "new");
        assert_eq!(erp_status_code(ConsStatus::Pending).as_str(), "in_progress");
        assert_eq!(erp_status_code(ConsStatus::Resolved).as_str(), "closed");
        assert_eq!(erp_status_code(ConsStatus::Cancelled).as_str(), "cancelled");
    }
}
