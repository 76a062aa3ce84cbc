//! Hyperparameter search: grid and random strategies over a [`TrialExecutor`].

use crate::error::MisreadError;
use crate::eval::SelectionMetric;
use crate::training::callbacks::{SearchAction, TrialEarlyStopping};
use crate::training::fitter::{ProgressSink, report};
use crate::training::hyperparams::{HyperparameterConfiguration, HyperparameterSpace};
use crate::training::trial::{TrialExecutor, TrialResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How configurations are produced from the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchStrategy {
    Grid,
    Random { number_of_trials: usize, seed: u64 },
}

/// How trials are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel {
        /// Defaults to the number of available processors.
        max_degree_of_parallelism: Option<usize>,
    },
}

/// Lifecycle of a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

/// Inputs for one search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningRequest {
    pub training_dir: PathBuf,
    pub output_dir: PathBuf,
    pub space: HyperparameterSpace,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub selection_metric: SelectionMetric,
    #[serde(default = "default_early_stopping")]
    pub early_stopping: bool,
}

fn default_early_stopping() -> bool {
    true
}

impl TuningRequest {
    pub fn new(
        training_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        space: HyperparameterSpace,
    ) -> Self {
        Self {
            training_dir: training_dir.into(),
            output_dir: output_dir.into(),
            space,
            execution_mode: ExecutionMode::Sequential,
            selection_metric: SelectionMetric::Accuracy,
            early_stopping: true,
        }
    }
}

/// Outcome of a finished search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningResult {
    pub id: String,
    pub strategy: SearchStrategy,
    pub execution_mode: ExecutionMode,
    pub selection_metric: SelectionMetric,
    pub status: TuningStatus,
    pub trials: Vec<TrialResult>,
    /// `None` when no trial succeeded.
    pub best_trial: Option<TrialResult>,
    pub stopped_early: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub training_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl TuningResult {
    pub fn successful_trials(&self) -> impl Iterator<Item = &TrialResult> {
        self.trials.iter().filter(|t| t.is_successful())
    }
}

/// Pick the best successful trial; ties keep the earliest.
pub fn select_best(trials: &[TrialResult], metric: SelectionMetric) -> Option<&TrialResult> {
    let mut best: Option<&TrialResult> = None;
    for trial in trials.iter().filter(|t| t.is_successful()) {
        let better = match best {
            None => true,
            Some(current) => metric.is_better(
                trial.metrics().score(metric),
                current.metrics().score(metric),
            ),
        };
        if better {
            best = Some(trial);
        }
    }
    best
}

/// Drives grid and random searches.
pub struct TuningEngine {
    executor: Arc<TrialExecutor>,
    status: Mutex<TuningStatus>,
}

impl TuningEngine {
    pub fn new(executor: Arc<TrialExecutor>) -> Self {
        Self {
            executor,
            status: Mutex::new(TuningStatus::NotStarted),
        }
    }

    pub fn status(&self) -> TuningStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: TuningStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub async fn grid_search(
        &self,
        request: &TuningRequest,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<TuningResult, MisreadError> {
        self.search(request, SearchStrategy::Grid, progress, cancel)
            .await
    }

    pub async fn random_search(
        &self,
        request: &TuningRequest,
        number_of_trials: usize,
        seed: u64,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<TuningResult, MisreadError> {
        let strategy = SearchStrategy::Random {
            number_of_trials,
            seed,
        };
        self.search(request, strategy, progress, cancel).await
    }

    /// Run a full search with the given strategy.
    pub async fn search(
        &self,
        request: &TuningRequest,
        strategy: SearchStrategy,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<TuningResult, MisreadError> {
        self.set_status(TuningStatus::Running);
        let result = self.run(request, strategy, progress, cancel).await;
        self.set_status(match &result {
            Ok(_) => TuningStatus::Completed,
            Err(_) => TuningStatus::Failed,
        });
        result
    }

    async fn run(
        &self,
        request: &TuningRequest,
        strategy: SearchStrategy,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<TuningResult, MisreadError> {
        if cancel.is_cancelled() {
            return Err(MisreadError::Cancelled);
        }
        validate_request(request, &strategy)?;

        let configs = match &strategy {
            SearchStrategy::Grid => request.space.grid_configurations(),
            SearchStrategy::Random {
                number_of_trials,
                seed,
            } => request
                .space
                .random_configurations(*number_of_trials, *seed),
        };

        let start_time = Utc::now();
        info!(
            strategy = ?strategy,
            mode = ?request.execution_mode,
            trials = configs.len(),
            "Starting hyperparameter search"
        );
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let (trials, stopped_early) = match request.execution_mode {
            ExecutionMode::Sequential => {
                self.run_sequential(request, configs, &progress, cancel)
                    .await?
            }
            ExecutionMode::Parallel {
                max_degree_of_parallelism,
            } => {
                let degree = max_degree_of_parallelism.unwrap_or_else(default_parallelism);
                let trials = self
                    .run_parallel(request, configs, degree, &progress, cancel)
                    .await?;
                (trials, false)
            }
        };

        let best_trial = select_best(&trials, request.selection_metric).cloned();
        match &best_trial {
            Some(best) => info!(
                trial = best.trial_number,
                score = best.metrics().score(request.selection_metric),
                "Search complete"
            ),
            None => warn!(trials = trials.len(), "Search complete but no trial succeeded"),
        }

        Ok(TuningResult {
            id: uuid::Uuid::new_v4().to_string(),
            strategy,
            execution_mode: request.execution_mode,
            selection_metric: request.selection_metric,
            status: TuningStatus::Completed,
            trials,
            best_trial,
            stopped_early,
            start_time,
            end_time: Utc::now().max(start_time),
            training_dir: request.training_dir.clone(),
            output_dir: request.output_dir.clone(),
        })
    }

    async fn run_sequential(
        &self,
        request: &TuningRequest,
        configs: Vec<HyperparameterConfiguration>,
        progress: &Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<TrialResult>, bool), MisreadError> {
        let total = configs.len();
        let early_stopping = TrialEarlyStopping::new(request.selection_metric);
        let mut trials = Vec::with_capacity(total);

        for (index, config) in configs.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(MisreadError::Cancelled);
            }
            let result = self
                .executor
                .execute(
                    index + 1,
                    config,
                    &request.training_dir,
                    &request.output_dir,
                    None,
                    cancel,
                )
                .await?;
            trials.push(result);
            report(
                progress,
                trials.len() as f64 / total as f64,
                &format!("Trial {}/{} complete", trials.len(), total),
            );

            if request.early_stopping && early_stopping.on_trial_end(&trials) == SearchAction::Stop {
                info!(completed = trials.len(), total, "Early stopping: metric plateaued");
                return Ok((trials, true));
            }
        }
        Ok((trials, false))
    }

    async fn run_parallel(
        &self,
        request: &TuningRequest,
        configs: Vec<HyperparameterConfiguration>,
        degree: usize,
        progress: &Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TrialResult>, MisreadError> {
        let total = configs.len();
        let semaphore = Arc::new(Semaphore::new(degree.max(1)));
        let trial_counter = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::with_capacity(total);

        for config in configs {
            let executor = self.executor.clone();
            let sem = semaphore.clone();
            let counter = trial_counter.clone();
            let completed = completed.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            let training_dir = request.training_dir.clone();
            let output_dir = request.output_dir.clone();
            let task_config = config.clone();

            let handle = tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|_| MisreadError::Cancelled)?;
                if cancel.is_cancelled() {
                    return Err(MisreadError::Cancelled);
                }
                let trial_number = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let result = executor
                    .execute(
                        trial_number,
                        &task_config,
                        &training_dir,
                        &output_dir,
                        None,
                        &cancel,
                    )
                    .await?;
                // Count and report under one lock so fractions never go backwards.
                {
                    let mut done = completed.lock().unwrap_or_else(|e| e.into_inner());
                    *done += 1;
                    report(
                        &progress,
                        *done as f64 / total as f64,
                        &format!("Trial {}/{total} complete", *done),
                    );
                }
                Ok(result)
            });
            handles.push((config, handle));
        }

        let mut trials = Vec::with_capacity(total);
        let mut cancelled = false;
        for (config, handle) in handles {
            match handle.await {
                Ok(Ok(result)) => trials.push(result),
                Ok(Err(e)) if e.is_cancellation() => cancelled = true,
                Ok(Err(e)) => {
                    let number = trial_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    trials.push(TrialResult::failure(number, config, e.to_string(), Utc::now(), 0.0));
                }
                Err(join_err) => {
                    warn!(config_id = %config.id, error = %join_err, "Trial task aborted");
                    let number = trial_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    trials.push(TrialResult::failure(
                        number,
                        config,
                        format!("Trial task aborted: {join_err}"),
                        Utc::now(),
                        0.0,
                    ));
                }
            }
        }

        if cancelled {
            return Err(MisreadError::Cancelled);
        }
        Ok(trials)
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub(crate) fn validate_request(request: &TuningRequest, strategy: &SearchStrategy) -> Result<(), MisreadError> {
    if !request.training_dir.is_dir() {
        return Err(MisreadError::config(format!(
            "Training directory does not exist: {}",
            request.training_dir.display()
        )));
    }
    request.space.validate()?;
    if let SearchStrategy::Random {
        number_of_trials: 0,
        ..
    } = strategy
    {
        return Err(MisreadError::config("Random search needs at least one trial"));
    }
    if let ExecutionMode::Parallel {
        max_degree_of_parallelism: Some(0),
    } = request.execution_mode
    {
        return Err(MisreadError::config("Degree of parallelism must be at least 1"));
    }
    Ok(())
}
