//! Job persistence: in-memory and JSON-file stores.

use crate::error::MisreadError;
use crate::jobs::job::{JobStatus, TrainingJob};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Durable home for job snapshots, used for crash recovery.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn add(&self, job: &TrainingJob) -> Result<(), MisreadError>;
    async fn update(&self, job: &TrainingJob) -> Result<(), MisreadError>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<TrainingJob>, MisreadError>;
    async fn get_by_status(&self, status: JobStatus) -> Result<Vec<TrainingJob>, MisreadError>;
    /// All jobs, oldest first.
    async fn list(&self) -> Result<Vec<TrainingJob>, MisreadError>;
}

fn sorted(mut jobs: Vec<TrainingJob>) -> Vec<TrainingJob> {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    jobs
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, TrainingJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add(&self, job: &TrainingJob) -> Result<(), MisreadError> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, job: &TrainingJob) -> Result<(), MisreadError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(MisreadError::not_found(format!("job {}", job.id))),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<TrainingJob>, MisreadError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn get_by_status(&self, status: JobStatus) -> Result<Vec<TrainingJob>, MisreadError> {
        let jobs = self.jobs.lock().await;
        Ok(sorted(
            jobs.values().filter(|j| j.status == status).cloned().collect(),
        ))
    }

    async fn list(&self) -> Result<Vec<TrainingJob>, MisreadError> {
        Ok(sorted(self.jobs.lock().await.values().cloned().collect()))
    }
}

/// Whole-file JSON snapshot store.
///
/// Every write serializes all jobs to `<file>.tmp` and renames it over the
/// target, so a crash mid-write leaves the previous snapshot intact.
pub struct JsonFileJobStore {
    path: PathBuf,
    jobs: Mutex<HashMap<Uuid, TrainingJob>>,
}

impl JsonFileJobStore {
    /// Open the store, loading existing jobs if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MisreadError> {
        let path = path.into();
        let jobs = if tokio::fs::try_exists(&path).await? {
            let json = tokio::fs::read_to_string(&path).await?;
            let list: Vec<TrainingJob> = serde_json::from_str(&json)?;
            info!(path = %path.display(), count = list.len(), "Loaded job state");
            list.into_iter().map(|j| (j.id, j)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, jobs: &HashMap<Uuid, TrainingJob>) -> Result<(), MisreadError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(&sorted(jobs.values().cloned().collect()))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), count = jobs.len(), "Saved job state");
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonFileJobStore {
    async fn add(&self, job: &TrainingJob) -> Result<(), MisreadError> {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id, job.clone());
        self.save(&jobs).await
    }

    async fn update(&self, job: &TrainingJob) -> Result<(), MisreadError> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(&job.id) {
            return Err(MisreadError::not_found(format!("job {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        self.save(&jobs).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<TrainingJob>, MisreadError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn get_by_status(&self, status: JobStatus) -> Result<Vec<TrainingJob>, MisreadError> {
        let jobs = self.jobs.lock().await;
        Ok(sorted(
            jobs.values().filter(|j| j.status == status).cloned().collect(),
        ))
    }

    async fn list(&self) -> Result<Vec<TrainingJob>, MisreadError> {
        Ok(sorted(self.jobs.lock().await.values().cloned().collect()))
    }
}
