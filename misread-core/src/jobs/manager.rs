//! Job manager: queues training work, bounds concurrency with slots, and
//! publishes status snapshots.
//!
//! The manager is the only writer of job state. Each update builds a new
//! [`TrainingJob`] snapshot and swaps it into the table, so readers always see
//! a complete job.

use crate::error::MisreadError;
use crate::jobs::job::{INTERRUPTED_MESSAGE, JobRequest, JobStatus, TrainingJob};
use crate::jobs::store::JobStore;
use crate::training::sweep::validate_request;
use crate::training::{ProgressSink, TrialExecutor, TuningEngine};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Message recorded when a search produced no successful trial.
pub const NO_SUCCESSFUL_TRIAL: &str = "No trial completed successfully";

const EVENT_CAPACITY: usize = 256;

/// Notifications published while jobs run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    StatusChanged {
        job_id: Uuid,
        status: JobStatus,
    },
    Progress {
        job_id: Uuid,
        fraction: f64,
        message: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::StatusChanged { job_id, .. } | Self::Progress { job_id, .. } => *job_id,
        }
    }
}

/// One unit of job concurrency. Dropping it releases the slot.
#[derive(Debug)]
pub struct JobSlot {
    _permit: OwnedSemaphorePermit,
}

impl JobSlot {
    pub fn release(self) {}
}

/// Queues, runs and tracks training jobs.
pub struct JobManager {
    jobs: RwLock<HashMap<Uuid, Arc<TrainingJob>>>,
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    slots: Arc<Semaphore>,
    store: Arc<dyn JobStore>,
    executor: Arc<TrialExecutor>,
    events: broadcast::Sender<JobEvent>,
}

impl JobManager {
    pub fn new(
        executor: Arc<TrialExecutor>,
        store: Arc<dyn JobStore>,
        max_concurrent_jobs: usize,
    ) -> Result<Self, MisreadError> {
        if max_concurrent_jobs == 0 {
            return Err(MisreadError::config(
                "max_concurrent_jobs must be at least 1",
            ));
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            jobs: RwLock::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
            store,
            executor,
            events,
        })
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a free slot. Suspends cooperatively while all slots are taken.
    pub async fn acquire_slot(&self) -> Result<JobSlot, MisreadError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MisreadError::training("Job slot pool closed"))?;
        Ok(JobSlot { _permit: permit })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Current snapshot of a job.
    pub fn status(&self, id: Uuid) -> Option<Arc<TrainingJob>> {
        self.read_jobs().get(&id).cloned()
    }

    /// All known jobs, oldest first.
    pub fn list(&self) -> Vec<Arc<TrainingJob>> {
        let mut jobs: Vec<_> = self.read_jobs().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Mark jobs left queued or running by a previous process as failed and
    /// load every stored job into the table. Returns the recovered job ids.
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, MisreadError> {
        let mut recovered = Vec::new();
        for status in [JobStatus::Queued, JobStatus::Running] {
            for job in self.store.get_by_status(status).await? {
                let failed = job.fail(INTERRUPTED_MESSAGE)?;
                self.store.update(&failed).await?;
                warn!(job_id = %job.id, previous = %status, "Recovered interrupted job");
                recovered.push(job.id);
            }
        }

        let stored = self.store.list().await?;
        let mut jobs = self.write_jobs();
        for job in stored {
            jobs.entry(job.id).or_insert_with(|| Arc::new(job));
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Interrupted jobs marked failed");
        }
        Ok(recovered)
    }

    /// Queue a job and start it in the background once a slot is free.
    ///
    /// Configuration errors are rejected here; nothing is queued for them.
    pub async fn enqueue(
        self: &Arc<Self>,
        name: impl Into<String>,
        request: JobRequest,
    ) -> Result<Uuid, MisreadError> {
        validate_submission(&request)?;
        let job = TrainingJob::new(name, request);
        let id = job.id;
        self.store.add(&job).await?;

        let token = CancellationToken::new();
        self.lock_tokens().insert(id, token.clone());
        self.write_jobs().insert(id, Arc::new(job));
        self.emit(JobEvent::StatusChanged {
            job_id: id,
            status: JobStatus::Queued,
        });
        info!(job_id = %id, "Job queued");

        let manager = self.clone();
        tokio::spawn(async move { manager.run_job(id, token).await });
        Ok(id)
    }

    /// Request cancellation of a queued or running job.
    pub fn cancel(&self, id: Uuid) -> Result<(), MisreadError> {
        let job = self
            .status(id)
            .ok_or_else(|| MisreadError::not_found(format!("job {id}")))?;
        if job.is_finished() {
            return Err(MisreadError::InvalidTransition {
                from: job.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }
        if let Some(token) = self.lock_tokens().get(&id) {
            token.cancel();
        }
        info!(job_id = %id, "Cancellation requested");
        Ok(())
    }

    /// Wait until the job reaches a terminal state and return that snapshot.
    pub async fn wait_for_completion(&self, id: Uuid) -> Result<Arc<TrainingJob>, MisreadError> {
        let mut rx = self.subscribe();
        loop {
            let job = self
                .status(id)
                .ok_or_else(|| MisreadError::not_found(format!("job {id}")))?;
            if job.is_finished() {
                return Ok(job);
            }
            loop {
                match rx.recv().await {
                    Ok(JobEvent::StatusChanged { job_id, status })
                        if job_id == id && status.is_terminal() =>
                    {
                        break;
                    }
                    Ok(_) => continue,
                    // Missed events; re-read the snapshot.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(MisreadError::training("Job event channel closed"));
                    }
                }
            }
        }
    }

    async fn run_job(self: Arc<Self>, id: Uuid, token: CancellationToken) {
        let slot = tokio::select! {
            _ = token.cancelled() => {
                self.transition(id, TrainingJob::cancel).await;
                self.lock_tokens().remove(&id);
                return;
            }
            slot = self.acquire_slot() => slot,
        };
        let slot = match slot {
            Ok(slot) => slot,
            Err(e) => {
                self.transition(id, |job| job.fail(e.to_string())).await;
                self.lock_tokens().remove(&id);
                return;
            }
        };

        if self.transition(id, TrainingJob::start).await.is_some() {
            self.execute(id, &token).await;
        }

        slot.release();
        self.lock_tokens().remove(&id);
    }

    async fn execute(self: &Arc<Self>, id: Uuid, token: &CancellationToken) {
        let Some(job) = self.status(id) else {
            return;
        };
        let progress = self.progress_sink(id);
        info!(job_id = %id, kind = job.request.kind(), "Job started");

        match &job.request {
            JobRequest::Train {
                training_dir,
                output_dir,
                configuration,
            } => {
                let result = self
                    .executor
                    .execute(1, configuration, training_dir, output_dir, Some(progress), token)
                    .await;
                match result {
                    Ok(trial) if trial.is_successful() => {
                        let metrics = trial.metrics().clone();
                        let artifact = trial.model_artifact_path().map(|p| p.to_path_buf());
                        self.transition(id, |j| j.complete(Some(metrics), artifact))
                            .await;
                    }
                    Ok(trial) => {
                        let message = trial.error_message().unwrap_or("Trial failed").to_string();
                        self.transition(id, |j| j.fail(message)).await;
                    }
                    Err(e) => self.finish_with_error(id, e).await,
                }
            }
            JobRequest::Tune { request, strategy } => {
                let engine = TuningEngine::new(self.executor.clone());
                match engine
                    .search(request, strategy.clone(), Some(progress), token)
                    .await
                {
                    Ok(result) => match result.best_trial.clone() {
                        Some(best) => {
                            let metrics = best.metrics().clone();
                            let artifact = best.model_artifact_path().map(|p| p.to_path_buf());
                            self.transition(id, |j| {
                                j.complete(Some(metrics), artifact)
                                    .map(|done| done.with_tuning_result(result))
                            })
                            .await;
                        }
                        None => {
                            self.transition(id, |j| {
                                j.fail(NO_SUCCESSFUL_TRIAL)
                                    .map(|failed| failed.with_tuning_result(result))
                            })
                            .await;
                        }
                    },
                    Err(e) => self.finish_with_error(id, e).await,
                }
            }
        }
    }

    async fn finish_with_error(&self, id: Uuid, err: MisreadError) {
        if err.is_cancellation() {
            self.transition(id, TrainingJob::cancel).await;
        } else {
            self.transition(id, |j| j.fail(err.to_string())).await;
        }
    }

    fn progress_sink(self: &Arc<Self>, id: Uuid) -> Arc<dyn ProgressSink> {
        let manager = Arc::downgrade(self);
        Arc::new(move |fraction: f64, message: &str| {
            if let Some(manager) = manager.upgrade() {
                manager.set_progress(id, fraction, message);
            }
        })
    }

    /// Progress is kept in memory only; status transitions are persisted.
    fn set_progress(&self, id: Uuid, fraction: f64, message: &str) {
        if self
            .replace(id, |job| job.with_progress(fraction, message))
            .is_ok()
        {
            self.emit(JobEvent::Progress {
                job_id: id,
                fraction,
                message: message.to_string(),
            });
        }
    }

    /// Apply a status transition, persist it and announce it.
    async fn transition<F>(&self, id: Uuid, f: F) -> Option<Arc<TrainingJob>>
    where
        F: FnOnce(&TrainingJob) -> Result<TrainingJob, MisreadError>,
    {
        let updated = match self.replace(id, f) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Job transition rejected");
                return None;
            }
        };
        if let Err(e) = self.store.update(&updated).await {
            error!(job_id = %id, error = %e, "Failed to persist job state");
        }
        match updated.status {
            JobStatus::Failed => {
                warn!(job_id = %id, error = updated.error.as_deref().unwrap_or(""), "Job failed")
            }
            status => info!(job_id = %id, %status, "Job status changed"),
        }
        self.emit(JobEvent::StatusChanged {
            job_id: id,
            status: updated.status,
        });
        Some(updated)
    }

    /// Read-modify-replace of one job snapshot under the table's write lock.
    fn replace<F>(&self, id: Uuid, f: F) -> Result<Arc<TrainingJob>, MisreadError>
    where
        F: FnOnce(&TrainingJob) -> Result<TrainingJob, MisreadError>,
    {
        let mut jobs = self.write_jobs();
        let current = jobs
            .get(&id)
            .ok_or_else(|| MisreadError::not_found(format!("job {id}")))?;
        let next = Arc::new(f(current)?);
        jobs.insert(id, next.clone());
        Ok(next)
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<TrainingJob>>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<TrainingJob>>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_submission(request: &JobRequest) -> Result<(), MisreadError> {
    match request {
        JobRequest::Train {
            training_dir,
            configuration,
            ..
        } => {
            configuration.validate()?;
            if !training_dir.is_dir() {
                return Err(MisreadError::config(format!(
                    "Training directory does not exist: {}",
                    training_dir.display()
                )));
            }
            Ok(())
        }
        JobRequest::Tune { request, strategy } => validate_request(request, strategy),
    }
}
