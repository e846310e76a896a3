//! Background cleanup of work that never reached a terminal state.
//!
//! Jobs stuck in `processing` past the configured timeout get one last status
//! check; if the provider still has no outcome they are failed, which
//! releases their hold. Holds whose TTL lapsed are cancelled so the rows
//! stop reading as pending.

use crate::{
    config::SweeperConfig,
    errors::Result,
    ledger::LedgerStore,
    orchestrator::GenerationOrchestrator,
    types::SettledBy,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Stuck jobs the final status check found finished
    pub settled_jobs: usize,
    pub timed_out_jobs: usize,
    pub expired_reservations: usize,
}

pub struct Sweeper {
    orchestrator: GenerationOrchestrator,
    ledger: Arc<dyn LedgerStore>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(orchestrator: GenerationOrchestrator, ledger: Arc<dyn LedgerStore>, config: SweeperConfig) -> Self {
        Self {
            orchestrator,
            ledger,
            config,
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let timeout = chrono::Duration::from_std(self.config.job_timeout).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let message = format!("timed out after {}", humantime::format_duration(self.config.job_timeout));

        for job in self.orchestrator.jobs().list_processing_started_before(cutoff).await? {
            if let Some(task_id) = &job.external_task_id {
                match self.orchestrator.check_status(job.id, task_id, SettledBy::Sweeper).await {
                    Ok(settled) if settled.status.is_terminal() => {
                        report.settled_jobs += 1;
                        info!(job_id = %job.id, status = %settled.status, "Settled stuck job from final status check");
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(job_id = %job.id, error = %e, "Final status check failed"),
                }
            }

            match self.orchestrator.time_out(&job, &message).await {
                Ok(_) => {
                    report.timed_out_jobs += 1;
                    warn!(job_id = %job.id, started_at = ?job.processing_started_at, "Timed out stuck job");
                }
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to time out job"),
            }
        }

        let expired = self.ledger.expire_reservations(now).await?;
        for reservation in &expired {
            info!(
                reservation_id = %reservation.id,
                user_id = %reservation.user_id,
                tag = %reservation.operation_tag,
                "Expired unsettled reservation"
            );
        }
        report.expired_reservations = expired.len();

        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval = %humantime::format_duration(self.config.interval),
            job_timeout = %humantime::format_duration(self.config.job_timeout),
            "Starting sweeper"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sweeper shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report != SweepReport::default() => debug!(?report, "Sweep finished"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Sweep failed"),
            }
        }
    }
}
