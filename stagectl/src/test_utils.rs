//! In-process fakes for the store, provider and storage ports.
//!
//! The stores apply the same guards as the SQL implementations: reserve and
//! debit check and write under one lock, and job transitions only apply from
//! the expected status.

use crate::{
    config::Config,
    db::models::{
        credits::{CreditStats, CreditTransactionCreateDBRequest, CreditTransactionDBResponse, CreditTransactionType},
        jobs::JobCreateDBRequest,
        reservations::{
            ReservationCreateDBRequest, ReservationDBResponse, ReservationStatus, SettlementMetadata, SettlementOutcome,
        },
    },
    errors::{Error, Result},
    jobs::{JobStatus, JobStore, TerminalUpdate, TransformationJob},
    ledger::{CreditLedger, LedgerStore},
    orchestrator::GenerationOrchestrator,
    provider::{AiProvider, GenerationRequest, ProviderError, SubmitOutcome, TaskReport, TaskState},
    reservations::ReservationManager,
    storage::{ArtifactStorage, StorageError},
    types::{ExternalTaskId, JobId, ProjectId, ReservationId, TransactionId, UserId},
    AppState,
};
use async_trait::async_trait;
use axum_test::TestServer;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct LedgerState {
    transactions: Vec<CreditTransactionDBResponse>,
    reservations: HashMap<ReservationId, ReservationDBResponse>,
}

impl LedgerState {
    fn balance(&self, user_id: UserId) -> i64 {
        self.transactions.iter().filter(|t| t.user_id == user_id).map(|t| t.amount).sum()
    }

    fn pending(&self, user_id: UserId, now: DateTime<Utc>) -> i64 {
        self.reservations
            .values()
            .filter(|r| r.user_id == user_id && r.holds_credits(now))
            .map(|r| r.amount)
            .sum()
    }

    fn available(&self, user_id: UserId) -> i64 {
        self.balance(user_id) - self.pending(user_id, Utc::now())
    }

    fn insert(&mut self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        if !request.transaction_type.accepts_amount(request.amount) {
            return Err(Error::validation(format!(
                "amount {} is not valid for a {:?} transaction",
                request.amount, request.transaction_type
            )));
        }
        if let Some(reservation_id) = request.reservation_id {
            if self.transactions.iter().any(|t| t.reservation_id == Some(reservation_id)) {
                return Err(Error::Internal {
                    operation: format!("insert second transaction for reservation {reservation_id}"),
                });
            }
        }
        let transaction = CreditTransactionDBResponse {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            transaction_type: request.transaction_type,
            amount: request.amount,
            description: request.description.clone(),
            related_image_id: request.related_image_id,
            related_invoice_id: request.related_invoice_id,
            reservation_id: request.reservation_id,
            created_at: Utc::now(),
        };
        self.transactions.push(transaction.clone());
        Ok(transaction)
    }
}

#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<LedgerState>,
    fail_confirmations: AtomicBool,
}

impl InMemoryLedgerStore {
    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    pub async fn transactions_for_reservation(&self, reservation_id: ReservationId) -> Vec<CreditTransactionDBResponse> {
        let state = self.state.lock().await;
        state
            .transactions
            .iter()
            .filter(|t| t.reservation_id == Some(reservation_id))
            .cloned()
            .collect()
    }

    pub async fn reservations_for_user(&self, user_id: UserId) -> Vec<ReservationDBResponse> {
        let state = self.state.lock().await;
        state.reservations.values().filter(|r| r.user_id == user_id).cloned().collect()
    }

    /// Make every confirm fail as if the settlement write had errored
    pub fn fail_confirmations(&self, fail: bool) {
        self.fail_confirmations.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn stats(&self, user_id: UserId) -> Result<CreditStats> {
        let state = self.state.lock().await;
        let mine = state.transactions.iter().filter(|t| t.user_id == user_id);
        let (mut purchased, mut used) = (0, 0);
        for t in mine {
            match t.transaction_type {
                CreditTransactionType::Purchase => purchased += t.amount,
                CreditTransactionType::Usage => used -= t.amount,
                _ => {}
            }
        }
        Ok(CreditStats::new(
            state.balance(user_id),
            state.pending(user_id, Utc::now()),
            purchased,
            used,
        ))
    }

    async fn append_transaction(&self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        self.state.lock().await.insert(request)
    }

    async fn debit(&self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        let mut state = self.state.lock().await;
        let available = state.available(request.user_id);
        if available < -request.amount {
            return Err(Error::insufficient_credits(-request.amount, available));
        }
        state.insert(request)
    }

    async fn reserve(&self, request: &ReservationCreateDBRequest) -> Result<ReservationDBResponse> {
        let mut state = self.state.lock().await;
        let held = state
            .reservations
            .values()
            .any(|r| r.status == ReservationStatus::Pending && r.operation_tag == request.operation_tag);
        if held {
            return Err(Error::ReservationHeld {
                operation_tag: request.operation_tag.clone(),
            });
        }
        let available = state.available(request.user_id);
        if available < request.amount {
            return Err(Error::insufficient_credits(request.amount, available));
        }
        let reservation = ReservationDBResponse {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            amount: request.amount,
            operation_tag: request.operation_tag.clone(),
            status: ReservationStatus::Pending,
            metadata: None,
            cancel_reason: None,
            created_at: Utc::now(),
            expires_at: request.expires_at,
            settled_at: None,
        };
        state.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    async fn confirm_reservation(&self, id: ReservationId, metadata: &SettlementMetadata) -> Result<SettlementOutcome> {
        if self.fail_confirmations.load(Ordering::SeqCst) {
            return Err(Error::Internal {
                operation: format!("confirm reservation {id}"),
            });
        }
        let mut state = self.state.lock().await;
        let reservation = state
            .reservations
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Reservation", id))?;
        if reservation.status != ReservationStatus::Pending {
            return Ok(SettlementOutcome::AlreadySettled { reservation });
        }
        let now = Utc::now();
        if !reservation.holds_credits(now) {
            let reservation = ReservationDBResponse {
                status: ReservationStatus::Cancelled,
                cancel_reason: Some("expired".to_string()),
                settled_at: Some(now),
                ..reservation
            };
            state.reservations.insert(id, reservation.clone());
            return Ok(SettlementOutcome::Expired { reservation });
        }

        let mut request = CreditTransactionCreateDBRequest::new(reservation.user_id, CreditTransactionType::Usage, -reservation.amount)
            .with_description(format!("Image generation ({})", reservation.operation_tag))
            .with_related_image(Some(metadata.job_id()));
        request.reservation_id = Some(id);
        let transaction = state.insert(&request)?;

        let reservation = ReservationDBResponse {
            status: ReservationStatus::Confirmed,
            metadata: Some(metadata.clone()),
            settled_at: Some(Utc::now()),
            ..reservation
        };
        state.reservations.insert(id, reservation.clone());
        Ok(SettlementOutcome::Confirmed { reservation, transaction })
    }

    async fn cancel_reservation(&self, id: ReservationId, reason: &str) -> Result<SettlementOutcome> {
        let mut state = self.state.lock().await;
        let reservation = state
            .reservations
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Reservation", id))?;
        if reservation.status != ReservationStatus::Pending {
            return Ok(SettlementOutcome::AlreadySettled { reservation });
        }
        let reservation = ReservationDBResponse {
            status: ReservationStatus::Cancelled,
            cancel_reason: Some(reason.to_string()),
            settled_at: Some(Utc::now()),
            ..reservation
        };
        state.reservations.insert(id, reservation.clone());
        Ok(SettlementOutcome::Cancelled { reservation })
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<ReservationDBResponse>> {
        Ok(self.state.lock().await.reservations.get(&id).cloned())
    }

    async fn list_transactions(&self, user_id: Option<UserId>, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| user_id.is_none_or(|u| t.user_id == u))
            .skip(skip as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<CreditTransactionDBResponse>> {
        Ok(self.state.lock().await.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<Vec<ReservationDBResponse>> {
        let mut state = self.state.lock().await;
        let mut expired = Vec::new();
        for reservation in state.reservations.values_mut() {
            let stale = reservation.status == ReservationStatus::Pending && reservation.expires_at.is_some_and(|at| at <= now);
            if stale {
                reservation.status = ReservationStatus::Cancelled;
                reservation.cancel_reason = Some("expired".to_string());
                reservation.settled_at = Some(now);
                expired.push(reservation.clone());
            }
        }
        Ok(expired)
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, TransformationJob>>,
}

impl InMemoryJobStore {
    /// Overwrite a job as-is, bypassing the transition guards
    pub async fn put(&self, job: TransformationJob) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, request: &JobCreateDBRequest) -> Result<TransformationJob> {
        let now = Utc::now();
        let job = TransformationJob {
            id: Uuid::new_v4(),
            project_id: request.project_id,
            user_id: request.user_id,
            original_url: request.original_url.clone(),
            transformed_url: None,
            status: JobStatus::Pending,
            external_task_id: None,
            error_message: None,
            generation_params: request.generation_params.clone(),
            reservation_id: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            completed_at: None,
            duration_ms: None,
        };
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<TransformationJob>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn find_by_external_task(&self, task_id: &ExternalTaskId) -> Result<Option<TransformationJob>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.values().find(|j| j.external_task_id.as_ref() == Some(task_id)).cloned())
    }

    async fn list_for_user(&self, user_id: UserId, project_id: Option<ProjectId>, skip: i64, limit: i64) -> Result<Vec<TransformationJob>> {
        let jobs = self.jobs.lock().await;
        let mut mine: Vec<_> = jobs
            .values()
            .filter(|j| j.user_id == user_id && project_id.is_none_or(|p| j.project_id == p))
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(mine.into_iter().skip(skip as usize).take(limit as usize).collect())
    }

    async fn start_processing(&self, id: JobId, reservation_id: ReservationId, now: DateTime<Utc>) -> Result<Option<TransformationJob>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id).filter(|j| j.status.can_transition_to(JobStatus::Processing)) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.reservation_id = Some(reservation_id);
        job.processing_started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn attach_external_task(&self, id: JobId, task_id: &ExternalTaskId) -> Result<Option<TransformationJob>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id).filter(|j| j.status == JobStatus::Processing) else {
            return Ok(None);
        };
        job.external_task_id = Some(task_id.clone());
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn finish(&self, id: JobId, update: &TerminalUpdate, now: DateTime<Utc>) -> Result<Option<TransformationJob>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id).filter(|j| j.status.can_transition_to(update.status())) else {
            return Ok(None);
        };
        match update {
            TerminalUpdate::Completed { transformed_url } => job.transformed_url = Some(transformed_url.clone()),
            TerminalUpdate::Failed { error_message } => job.error_message = Some(error_message.clone()),
        }
        job.status = update.status();
        job.completed_at = Some(now);
        job.duration_ms = job.elapsed_ms(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn reset_for_regeneration(&self, id: JobId) -> Result<Option<TransformationJob>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id).filter(|j| j.status.can_transition_to(JobStatus::Pending)) else {
            return Ok(None);
        };
        job.status = JobStatus::Pending;
        job.transformed_url = None;
        job.external_task_id = None;
        job.error_message = None;
        job.reservation_id = None;
        job.processing_started_at = None;
        job.completed_at = None;
        job.duration_ms = None;
        job.attempt += 1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn list_processing_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TransformationJob>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.processing_started_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }
}

/// How the fake provider answers a submit
#[derive(Debug, Clone)]
pub enum SubmitMode {
    Immediate(String),
    Async,
    Fail(String),
}

pub struct MockProvider {
    mode: StdMutex<SubmitMode>,
    reports: StdMutex<HashMap<ExternalTaskId, TaskReport>>,
    fail_polls: AtomicBool,
    pub submits: AtomicUsize,
    pub polls: AtomicUsize,
}

impl MockProvider {
    pub fn new(mode: SubmitMode) -> Self {
        Self {
            mode: StdMutex::new(mode),
            reports: StdMutex::default(),
            fail_polls: AtomicBool::new(false),
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn immediate() -> Self {
        Self::new(SubmitMode::Immediate("https://provider.example.com/out.png".to_string()))
    }

    pub fn accepting() -> Self {
        Self::new(SubmitMode::Async)
    }

    pub fn failing(message: &str) -> Self {
        Self::new(SubmitMode::Fail(message.to_string()))
    }

    pub fn set_mode(&self, mode: SubmitMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    /// Make polls for `task_id` report a finished result
    pub fn finish_task(&self, task_id: &ExternalTaskId, result_url: &str) {
        self.reports.lock().unwrap().insert(task_id.clone(), completed_report(task_id, result_url));
    }

    pub fn fail_task(&self, task_id: &ExternalTaskId, error: &str) {
        self.reports.lock().unwrap().insert(
            task_id.clone(),
            TaskReport {
                task_id: task_id.clone(),
                status: TaskState::Failed,
                result_url: None,
                error: Some(error.to_string()),
            },
        );
    }
}

pub fn completed_report(task_id: &ExternalTaskId, result_url: &str) -> TaskReport {
    TaskReport {
        task_id: task_id.clone(),
        status: TaskState::Completed,
        result_url: Some(result_url.to_string()),
        error: None,
    }
}

#[async_trait]
impl AiProvider for MockProvider {
    async fn submit(&self, _request: &GenerationRequest) -> std::result::Result<SubmitOutcome, ProviderError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().unwrap().clone();
        match mode {
            SubmitMode::Immediate(result_url) => Ok(SubmitOutcome::Completed { result_url }),
            SubmitMode::Async => Ok(SubmitOutcome::Accepted {
                task_id: ExternalTaskId(format!("task-{n}")),
            }),
            SubmitMode::Fail(message) => Err(ProviderError::Status { status: 503, body: message }),
        }
    }

    async fn poll_status(&self, task_id: &ExternalTaskId) -> std::result::Result<TaskReport, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        let report = self.reports.lock().unwrap().get(task_id).cloned();
        Ok(report.unwrap_or_else(|| TaskReport {
            task_id: task_id.clone(),
            status: TaskState::Processing,
            result_url: None,
            error: None,
        }))
    }
}

#[derive(Default)]
pub struct InMemoryStorage {
    fail: AtomicBool,
    pub persisted: StdMutex<Vec<String>>,
}

impl InMemoryStorage {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactStorage for InMemoryStorage {
    async fn store(&self, key: &str, _bytes: Bytes) -> std::result::Result<String, StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                status: 500,
                key: key.to_string(),
            });
        }
        self.persisted.lock().unwrap().push(key.to_string());
        Ok(format!("memory://{key}"))
    }

    async fn persist(&self, key: &str, _result_url: &str) -> std::result::Result<String, StorageError> {
        self.store(key, Bytes::new()).await
    }
}

/// Everything an orchestrator test needs, wired together in memory.
pub struct Harness {
    pub ledger_store: Arc<InMemoryLedgerStore>,
    pub jobs: Arc<InMemoryJobStore>,
    pub provider: Arc<MockProvider>,
    pub storage: Arc<InMemoryStorage>,
    pub ledger: CreditLedger,
    pub orchestrator: GenerationOrchestrator,
}

impl Harness {
    pub fn new(provider: MockProvider) -> Self {
        Self::with_cost(provider, 1)
    }

    pub fn with_cost(provider: MockProvider, cost: i64) -> Self {
        Self::build(provider, cost, Duration::from_secs(3600))
    }

    pub fn with_reservation_ttl(provider: MockProvider, ttl: Duration) -> Self {
        Self::build(provider, 1, ttl)
    }

    fn build(provider: MockProvider, cost: i64, reservation_ttl: Duration) -> Self {
        let ledger_store = Arc::new(InMemoryLedgerStore::default());
        let jobs = Arc::new(InMemoryJobStore::default());
        let provider = Arc::new(provider);
        let storage = Arc::new(InMemoryStorage::default());

        let orchestrator = GenerationOrchestrator::builder()
            .jobs(jobs.clone())
            .reservations(ReservationManager::new(ledger_store.clone(), Some(reservation_ttl)))
            .provider(provider.clone())
            .storage(storage.clone())
            .transformation_cost(cost)
            .build();

        Self {
            ledger: CreditLedger::new(ledger_store.clone()),
            ledger_store,
            jobs,
            provider,
            storage,
            orchestrator,
        }
    }

    pub async fn fund(&self, user_id: UserId, amount: i64) {
        self.ledger
            .add(user_id, amount, CreditTransactionType::Purchase, Some("test funding".to_string()))
            .await
            .expect("Failed to fund user");
    }

    pub async fn pending_job(&self, user_id: UserId) -> TransformationJob {
        self.orchestrator
            .create_job(user_id, Uuid::new_v4(), "https://uploads.example.com/room.jpg", json!({"style": "modern"}))
            .await
            .expect("Failed to create job")
    }

    /// Sum of the user's transactions straight from the log
    pub async fn ledger_sum(&self, user_id: UserId) -> i64 {
        self.ledger
            .list_transactions(Some(user_id), 0, i64::MAX)
            .await
            .expect("Failed to list transactions")
            .iter()
            .map(|t| t.amount)
            .sum()
    }
}

pub fn create_test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        enable_metrics: false,
        ..Config::default()
    }
}

pub fn create_test_app(harness: &Harness, config: Config) -> TestServer {
    let state = AppState::builder()
        .config(config)
        .ledger(harness.ledger.clone())
        .orchestrator(harness.orchestrator.clone())
        .build();
    let router = crate::build_router(state).expect("Failed to build router");
    TestServer::new(router).expect("Failed to create test server")
}
