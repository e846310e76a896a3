//! Bounded status polling for jobs waiting on a provider task.
//!
//! Each watched job gets its own task that checks the provider every
//! `interval` until the job is terminal, the attempt budget runs out, or the
//! poller shuts down. Running out of attempts leaves the job `processing`; a
//! webhook, a manual refresh or the sweeper will settle it later.

use crate::{
    config::PollingConfig,
    jobs::{JobStatus, TransformationJob},
    orchestrator::GenerationOrchestrator,
    types::{ExternalTaskId, JobId, SettledBy},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    /// The job reached `completed` or `failed`
    Terminal(JobStatus),
    Exhausted,
    Cancelled,
}

#[derive(Clone)]
pub struct StatusPoller {
    orchestrator: GenerationOrchestrator,
    interval: Duration,
    max_attempts: u32,
    shutdown: CancellationToken,
    /// Running loops keyed by job, each tagged with the generation that started it
    active: Arc<Mutex<HashMap<JobId, (u64, CancellationToken)>>>,
    generation: Arc<AtomicU64>,
}

impl StatusPoller {
    pub fn new(orchestrator: GenerationOrchestrator, config: &PollingConfig, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator,
            interval: config.interval,
            max_attempts: config.max_attempts,
            shutdown,
            active: Arc::default(),
            generation: Arc::default(),
        }
    }

    /// Start polling `job` if it is waiting on a provider task
    pub async fn track(&self, job: &TransformationJob) -> Option<tokio::task::JoinHandle<PollExit>> {
        match (&job.status, &job.external_task_id) {
            (JobStatus::Processing, Some(task_id)) => self.watch(job.id, task_id.clone()).await,
            _ => None,
        }
    }

    /// Spawn a polling loop for `job_id`. Returns `None` if one is already running.
    pub async fn watch(&self, job_id: JobId, task_id: ExternalTaskId) -> Option<tokio::task::JoinHandle<PollExit>> {
        let (generation, token) = {
            let mut active = self.active.lock().await;
            if active.contains_key(&job_id) {
                debug!(%job_id, "Already polling job");
                return None;
            }
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            let token = self.shutdown.child_token();
            active.insert(job_id, (generation, token.clone()));
            (generation, token)
        };

        let poller = self.clone();
        Some(tokio::spawn(async move {
            let exit = poller.poll_loop(job_id, &task_id, &token).await;
            let mut active = poller.active.lock().await;
            // A stopped loop may have been replaced by a newer one for the same job
            if active.get(&job_id).is_some_and(|(current, _)| *current == generation) {
                active.remove(&job_id);
            }
            exit
        }))
    }

    /// Stop polling one job
    pub async fn stop(&self, job_id: JobId) {
        if let Some((_, token)) = self.active.lock().await.remove(&job_id) {
            token.cancel();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Resume polling every job left waiting on a provider task, e.g. after a restart
    pub async fn resume_in_flight(&self) -> crate::errors::Result<usize> {
        let in_flight = self
            .orchestrator
            .jobs()
            .list_processing_started_before(chrono::Utc::now())
            .await?;
        let mut resumed = 0;
        for job in &in_flight {
            if self.track(job).await.is_some() {
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed status polling for in-flight jobs");
        }
        Ok(resumed)
    }

    async fn poll_loop(&self, job_id: JobId, task_id: &ExternalTaskId, token: &CancellationToken) -> PollExit {
        for attempt in 1..=self.max_attempts {
            tokio::select! {
                _ = token.cancelled() => return PollExit::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.orchestrator.check_status(job_id, task_id, SettledBy::Poll).await {
                Ok(job) if job.status.is_terminal() => {
                    debug!(%job_id, attempt, status = %job.status, "Polling finished");
                    return PollExit::Terminal(job.status);
                }
                Ok(_) => {}
                Err(e) => warn!(%job_id, attempt, error = %e, "Status check failed"),
            }
        }

        warn!(
            %job_id,
            %task_id,
            attempts = self.max_attempts,
            "Polling gave up; job stays processing until a webhook or manual check settles it"
        );
        PollExit::Exhausted
    }
}
