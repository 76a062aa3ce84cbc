//! Training jobs: request snapshot, lifecycle state and results.

use crate::error::MisreadError;
use crate::eval::EvaluationMetrics;
use crate::training::{HyperparameterConfiguration, SearchStrategy, TuningRequest, TuningResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Message recorded on jobs found unfinished at startup.
pub const INTERRUPTED_MESSAGE: &str = "Job was interrupted by a service restart and did not complete";

/// Lifecycle state of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// What a job was asked to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRequest {
    /// Train one configuration.
    Train {
        training_dir: PathBuf,
        output_dir: PathBuf,
        configuration: HyperparameterConfiguration,
    },
    /// Run a hyperparameter search.
    Tune {
        request: TuningRequest,
        strategy: SearchStrategy,
    },
}

impl JobRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Train { .. } => "train",
            Self::Tune { .. } => "tune",
        }
    }
}

/// Immutable snapshot of a job. Transitions return a new snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: Uuid,
    pub name: String,
    pub request: JobRequest,
    pub status: JobStatus,
    /// Fraction in [0, 1].
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<EvaluationMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_artifact_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuning_result: Option<TuningResult>,
}

impl TrainingJob {
    /// Create a new queued job.
    pub fn new(name: impl Into<String>, request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            request,
            status: JobStatus::Queued,
            progress: 0.0,
            progress_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            metrics: None,
            model_artifact_path: None,
            tuning_result: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued → Running.
    pub fn start(&self) -> Result<Self, MisreadError> {
        self.expect_status(&[JobStatus::Queued], JobStatus::Running)?;
        Ok(Self {
            status: JobStatus::Running,
            started_at: Some(Utc::now()),
            ..self.clone()
        })
    }

    /// Running job with updated progress.
    pub fn with_progress(&self, fraction: f64, message: impl Into<String>) -> Result<Self, MisreadError> {
        self.expect_status(&[JobStatus::Running], JobStatus::Running)?;
        Ok(Self {
            progress: fraction.clamp(0.0, 1.0),
            progress_message: Some(message.into()),
            ..self.clone()
        })
    }

    /// Running → Completed.
    pub fn complete(
        &self,
        metrics: Option<EvaluationMetrics>,
        model_artifact_path: Option<PathBuf>,
    ) -> Result<Self, MisreadError> {
        self.expect_status(&[JobStatus::Running], JobStatus::Completed)?;
        Ok(Self {
            status: JobStatus::Completed,
            progress: 1.0,
            completed_at: Some(Utc::now()),
            metrics,
            model_artifact_path,
            ..self.clone()
        })
    }

    /// Queued or Running → Failed.
    pub fn fail(&self, error: impl Into<String>) -> Result<Self, MisreadError> {
        self.expect_status(&[JobStatus::Queued, JobStatus::Running], JobStatus::Failed)?;
        Ok(Self {
            status: JobStatus::Failed,
            completed_at: Some(Utc::now()),
            error: Some(error.into()),
            ..self.clone()
        })
    }

    /// Queued or Running → Cancelled.
    pub fn cancel(&self) -> Result<Self, MisreadError> {
        self.expect_status(&[JobStatus::Queued, JobStatus::Running], JobStatus::Cancelled)?;
        Ok(Self {
            status: JobStatus::Cancelled,
            completed_at: Some(Utc::now()),
            ..self.clone()
        })
    }

    /// Attach a search outcome to this snapshot.
    pub fn with_tuning_result(self, result: TuningResult) -> Self {
        Self {
            tuning_result: Some(result),
            ..self
        }
    }

    fn expect_status(&self, allowed: &[JobStatus], to: JobStatus) -> Result<(), MisreadError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(MisreadError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}
