//! Trial execution: balance, augment, fit and evaluate one configuration.

use crate::data::{
    AugmentOverrides, ClassDistribution, ImageCodec, Sample, augment, balance, scan_directory,
};
use crate::error::MisreadError;
use crate::eval::EvaluationMetrics;
use crate::training::fitter::{FitOutcome, FitRequest, ModelFitter, ProgressSink, ScaledProgress, report};
use crate::training::hyperparams::HyperparameterConfiguration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What happened to the training data inside a trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialDataSummary {
    pub original_distribution: ClassDistribution,
    pub balanced_distribution: ClassDistribution,
    pub augmented_samples: usize,
    pub augmentation_usage: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub augmentation_impact: Option<AugmentationImpact>,
}

/// Accuracy on the validation set before and after re-augmenting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationImpact {
    pub original_accuracy: f64,
    pub augmented_accuracy: f64,
    pub accuracy_delta: f64,
    pub augmented_samples: usize,
}

/// Success or failure of a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Success {
        metrics: EvaluationMetrics,
        model_artifact_path: PathBuf,
        data: TrialDataSummary,
    },
    Failure {
        /// Always [`EvaluationMetrics::failed`].
        metrics: EvaluationMetrics,
        error_message: String,
    },
}

/// Terminal record of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_number: usize,
    pub trial_id: String,
    pub configuration: HyperparameterConfiguration,
    pub outcome: TrialOutcome,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
}

impl TrialResult {
    pub(crate) fn failure(
        trial_number: usize,
        configuration: HyperparameterConfiguration,
        error_message: impl Into<String>,
        start_time: DateTime<Utc>,
        duration_secs: f64,
    ) -> Self {
        Self {
            trial_number,
            trial_id: configuration.id.clone(),
            configuration,
            outcome: TrialOutcome::Failure {
                metrics: EvaluationMetrics::failed(),
                error_message: error_message.into(),
            },
            start_time,
            end_time: Utc::now().max(start_time),
            duration_secs,
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self.outcome, TrialOutcome::Success { .. })
    }

    pub fn metrics(&self) -> &EvaluationMetrics {
        match &self.outcome {
            TrialOutcome::Success { metrics, .. } | TrialOutcome::Failure { metrics, .. } => {
                metrics
            }
        }
    }

    pub fn model_artifact_path(&self) -> Option<&Path> {
        match &self.outcome {
            TrialOutcome::Success {
                model_artifact_path,
                ..
            } => Some(model_artifact_path),
            TrialOutcome::Failure { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            TrialOutcome::Failure { error_message, .. } => Some(error_message),
            TrialOutcome::Success { .. } => None,
        }
    }
}

/// Settings shared by every trial an executor runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSettings {
    pub image_extensions: Vec<String>,
    pub evaluate_augmentation_impact: bool,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            image_extensions: crate::config::default_image_extensions(),
            evaluate_augmentation_impact: false,
        }
    }
}

/// Runs single trials against a [`ModelFitter`].
pub struct TrialExecutor {
    fitter: Arc<dyn ModelFitter>,
    codec: Arc<dyn ImageCodec>,
    settings: TrialSettings,
}

struct TrialArtifacts {
    outcome: FitOutcome,
    metrics: EvaluationMetrics,
    data: TrialDataSummary,
}

impl TrialExecutor {
    pub fn new(fitter: Arc<dyn ModelFitter>, codec: Arc<dyn ImageCodec>) -> Self {
        Self {
            fitter,
            codec,
            settings: TrialSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TrialSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Execute one trial.
    ///
    /// Every failure except cancellation is captured in the returned
    /// [`TrialResult`]; cancellation is returned as `Err(Cancelled)`.
    pub async fn execute(
        &self,
        trial_number: usize,
        config: &HyperparameterConfiguration,
        training_dir: &Path,
        output_dir: &Path,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<TrialResult, MisreadError> {
        if cancel.is_cancelled() {
            return Err(MisreadError::Cancelled);
        }

        let start_time = Utc::now();
        let started = Instant::now();
        info!(trial = trial_number, config_id = %config.id, lr = config.learning_rate, epochs = config.epochs, batch = config.batch_size, "Starting trial");

        match self
            .run(config, training_dir, output_dir, &progress, cancel)
            .await
        {
            Ok(artifacts) => {
                info!(trial = trial_number, accuracy = artifacts.metrics.accuracy, "Trial completed");
                Ok(TrialResult {
                    trial_number,
                    trial_id: config.id.clone(),
                    configuration: config.clone(),
                    outcome: TrialOutcome::Success {
                        metrics: artifacts.metrics,
                        model_artifact_path: artifacts.outcome.model_artifact_path,
                        data: artifacts.data,
                    },
                    start_time,
                    end_time: Utc::now().max(start_time),
                    duration_secs: started.elapsed().as_secs_f64(),
                })
            }
            Err(e) if e.is_cancellation() => {
                info!(trial = trial_number, "Trial cancelled");
                Err(e)
            }
            Err(e) => {
                warn!(trial = trial_number, error = %e, "Trial failed");
                Ok(TrialResult::failure(
                    trial_number,
                    config.clone(),
                    e.to_string(),
                    start_time,
                    started.elapsed().as_secs_f64(),
                ))
            }
        }
    }

    async fn run(
        &self,
        config: &HyperparameterConfiguration,
        training_dir: &Path,
        output_dir: &Path,
        progress: &Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<TrialArtifacts, MisreadError> {
        config.validate()?;
        let trial_dir = output_dir.join(format!("trial_{}", config.id));
        tokio::fs::create_dir_all(&trial_dir).await?;

        let samples = scan_directory(training_dir, &self.settings.image_extensions)?;
        if samples.is_empty() {
            return Err(MisreadError::dataset(format!(
                "No training images found in {}",
                training_dir.display()
            )));
        }
        report(progress, 0.05, &format!("Scanned {} samples", samples.len()));

        let balanced = balance(&samples, &config.data_balancing);
        report(progress, 0.15, "Balancing complete");

        let augmented = self
            .augment_blocking(
                balanced.samples.clone(),
                config,
                trial_dir.join("augmented"),
                AugmentOverrides::default(),
            )
            .await?;
        report(progress, 0.30, "Augmentation complete");

        if cancel.is_cancelled() {
            return Err(MisreadError::Cancelled);
        }

        let mut training_samples = balanced.samples;
        training_samples.extend(augmented.samples.iter().cloned());

        let request = FitRequest {
            training_dir: training_dir.to_path_buf(),
            output_dir: trial_dir.clone(),
            samples: training_samples,
            learning_rate: config.learning_rate,
            epochs: config.epochs,
            batch_size: config.batch_size,
            validation_split_ratio: config.validation_split_ratio,
            augmentation: Some(config.data_augmentation.clone()),
            balancing: Some(config.data_balancing.clone()),
            cancellation: cancel.child_token(),
        };

        report(progress, 0.35, "Fitting started");
        let fit_progress: Option<Arc<dyn ProgressSink>> = progress
            .clone()
            .map(|p| Arc::new(ScaledProgress::new(p, 0.35, 0.85)) as Arc<dyn ProgressSink>);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(MisreadError::Cancelled),
            result = self.fitter.fit(request, fit_progress) => result?,
        };
        report(progress, 0.85, "Fitting complete");

        let metrics = EvaluationMetrics::compute(&outcome.validation_predictions);
        let augmentation_impact = if self.settings.evaluate_augmentation_impact
            && config.data_augmentation.enabled
        {
            self.measure_augmentation_impact(config, &outcome, &metrics, &trial_dir)
                .await
        } else {
            None
        };
        report(progress, 1.0, "Evaluation complete");

        Ok(TrialArtifacts {
            data: TrialDataSummary {
                original_distribution: balanced.original_distribution,
                balanced_distribution: balanced.distribution,
                augmented_samples: augmented.samples.len(),
                augmentation_usage: augmented.usage,
                augmentation_impact,
            },
            outcome,
            metrics,
        })
    }

    async fn augment_blocking(
        &self,
        samples: Vec<Sample>,
        config: &HyperparameterConfiguration,
        workspace: PathBuf,
        overrides: AugmentOverrides,
    ) -> Result<crate::data::AugmentedSet, MisreadError> {
        let options = config.data_augmentation.clone();
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || {
            augment(&samples, &options, &workspace, codec.as_ref(), overrides)
        })
        .await
        .map_err(|e| MisreadError::augmentation(format!("Augmentation task failed: {e}")))?
    }

    /// Re-augment the validation samples and compare accuracy. Failures here
    /// are logged and leave the trial successful.
    async fn measure_augmentation_impact(
        &self,
        config: &HyperparameterConfiguration,
        outcome: &FitOutcome,
        original: &EvaluationMetrics,
        trial_dir: &Path,
    ) -> Option<AugmentationImpact> {
        let held_out: Vec<Sample> = outcome
            .validation_predictions
            .iter()
            .filter_map(|p| p.image_path.as_ref().map(|path| Sample::new(path, &p.actual)))
            .collect();
        if held_out.is_empty() {
            return None;
        }

        let overrides = AugmentOverrides {
            copies_per_sample: Some(1),
            random_seed: Some(config.data_augmentation.random_seed.wrapping_add(1)),
        };
        let augmented = match self
            .augment_blocking(held_out, config, trial_dir.join("impact"), overrides)
            .await
        {
            Ok(set) if !set.samples.is_empty() => set,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "Augmentation impact: re-augmentation failed");
                return None;
            }
        };

        match self
            .fitter
            .predict(&outcome.model_artifact_path, &augmented.samples)
            .await
        {
            Ok(predictions) => {
                let augmented_accuracy = EvaluationMetrics::compute(&predictions).accuracy;
                Some(AugmentationImpact {
                    original_accuracy: original.accuracy,
                    augmented_accuracy,
                    accuracy_delta: augmented_accuracy - original.accuracy,
                    augmented_samples: augmented.samples.len(),
                })
            }
            Err(e) => {
                warn!(error = %e, "Augmentation impact: prediction failed");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::augment::tests::MemoryCodec;
    use crate::data::{DataAugmentationOptions, DataBalancingOptions};
    use crate::eval::Prediction;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Behavior = dyn Fn(&FitRequest) -> Result<f64, MisreadError> + Send + Sync;

    /// Fitter whose accuracy (or failure) is decided by a closure over the request.
    pub(crate) struct MockFitter {
        behavior: Box<Behavior>,
        pub(crate) delay: Duration,
        pub(crate) calls: AtomicUsize,
        pub(crate) in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        pub(crate) sample_counts: Mutex<Vec<usize>>,
    }

    impl MockFitter {
        pub(crate) fn new(
            behavior: impl Fn(&FitRequest) -> Result<f64, MisreadError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                behavior: Box::new(behavior),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                sample_counts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    /// Ten validation predictions, `round(accuracy * 10)` of them correct.
    pub(crate) fn predictions_for(accuracy: f64) -> Vec<Prediction> {
        let correct = (accuracy * 10.0).round() as usize;
        (0..10)
            .map(|i| {
                let mut p = Prediction::new("blur", if i < correct { "blur" } else { "glare" });
                p.image_path = Some(PathBuf::from(format!("/val/{i}.png")));
                p
            })
            .collect()
    }

    #[async_trait]
    impl ModelFitter for MockFitter {
        async fn fit(
            &self,
            request: FitRequest,
            progress: Option<Arc<dyn ProgressSink>>,
        ) -> Result<FitOutcome, MisreadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.sample_counts.lock().unwrap().push(request.samples.len());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(p) = &progress {
                p.report_progress(0.5, "epoch");
            }
            let result = (self.behavior)(&request);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let accuracy = result?;
            Ok(FitOutcome {
                model_artifact_path: request.output_dir.join("model.bin"),
                validation_predictions: predictions_for(accuracy),
            })
        }

        async fn predict(
            &self,
            _model_artifact: &Path,
            samples: &[Sample],
        ) -> Result<Vec<Prediction>, MisreadError> {
            Ok(samples
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    Prediction::new(&s.label, if i % 2 == 0 { s.label.as_str() } else { "other" })
                })
                .collect())
        }
    }

    pub(crate) fn successful_trial(number: usize, accuracy: f64) -> TrialResult {
        let mut metrics = EvaluationMetrics::compute(&predictions_for(accuracy));
        metrics.accuracy = accuracy;
        metrics.log_loss = 1.0 - accuracy;
        let now = Utc::now();
        TrialResult {
            trial_number: number,
            trial_id: format!("cfg-{number}"),
            configuration: HyperparameterConfiguration::new(0.01, 10, 16),
            outcome: TrialOutcome::Success {
                metrics,
                model_artifact_path: PathBuf::from(format!("/models/{number}.bin")),
                data: TrialDataSummary::default(),
            },
            start_time: now,
            end_time: now,
            duration_secs: 0.0,
        }
    }

    pub(crate) fn failed_trial(number: usize) -> TrialResult {
        TrialResult::failure(
            number,
            HyperparameterConfiguration::new(0.01, 10, 16),
            "fit exploded",
            Utc::now(),
            0.0,
        )
    }

    /// `<root>/blur` with 6 images and `<root>/glare` with 3.
    pub(crate) fn training_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (label, count) in [("blur", 6), ("glare", 3)] {
            std::fs::create_dir_all(dir.path().join(label)).unwrap();
            for i in 0..count {
                std::fs::write(dir.path().join(label).join(format!("{i}.png")), b"img").unwrap();
            }
        }
        dir
    }

    fn executor(fitter: Arc<MockFitter>, codec: Arc<dyn ImageCodec>) -> TrialExecutor {
        TrialExecutor::new(fitter, codec)
    }

    #[tokio::test]
    async fn test_successful_trial() {
        let data = training_dir();
        let out = tempfile::tempdir().unwrap();
        let fitter = Arc::new(MockFitter::new(|_| Ok(0.8)));
        let exec = executor(fitter.clone(), Arc::new(MemoryCodec::default()));
        let config = HyperparameterConfiguration::new(0.01, 5, 8);

        let result = exec
            .execute(1, &config, data.path(), out.path(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_successful());
        assert!((result.metrics().accuracy - 0.8).abs() < 1e-9);
        assert!(result.end_time >= result.start_time);
        assert_eq!(result.trial_id, config.id);
        assert!(out.path().join(format!("trial_{}", config.id)).is_dir());
        assert!(result.model_artifact_path().is_some());
        assert_eq!(fitter.sample_counts.lock().unwrap()[0], 9);
    }

    #[tokio::test]
    async fn test_fitter_error_becomes_failed_result() {
        let data = training_dir();
        let out = tempfile::tempdir().unwrap();
        let fitter = Arc::new(MockFitter::new(|_| Err(MisreadError::fitter("out of memory"))));
        let exec = executor(fitter, Arc::new(MemoryCodec::default()));
        let config = HyperparameterConfiguration::new(0.01, 5, 8);

        let result = exec
            .execute(2, &config, data.path(), out.path(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.is_successful());
        assert_eq!(result.metrics().log_loss, f64::MAX);
        assert!(result.error_message().unwrap().contains("out of memory"));
        assert!(result.model_artifact_path().is_none());
    }

    #[tokio::test]
    async fn test_missing_training_dir_is_failed_trial() {
        let out = tempfile::tempdir().unwrap();
        let exec = executor(
            Arc::new(MockFitter::new(|_| Ok(1.0))),
            Arc::new(MemoryCodec::default()),
        );
        let config = HyperparameterConfiguration::new(0.01, 5, 8);
        let result = exec
            .execute(1, &config, Path::new("/no/such/dir"), out.path(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_successful());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let data = training_dir();
        let out = tempfile::tempdir().unwrap();
        let fitter = Arc::new(MockFitter::new(|_| Ok(0.9)));
        let exec = executor(fitter.clone(), Arc::new(MemoryCodec::default()));
        let token = CancellationToken::new();
        token.cancel();

        let err = exec
            .execute(1, &HyperparameterConfiguration::new(0.01, 5, 8), data.path(), out.path(), None, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_from_fitter_propagates() {
        let data = training_dir();
        let out = tempfile::tempdir().unwrap();
        let exec = executor(
            Arc::new(MockFitter::new(|_| Err(MisreadError::Cancelled))),
            Arc::new(MemoryCodec::default()),
        );
        let err = exec
            .execute(
                1,
                &HyperparameterConfiguration::new(0.01, 5, 8),
                data.path(),
                out.path(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_cancel_during_fit() {
        let data = training_dir();
        let out = tempfile::tempdir().unwrap();
        let fitter = Arc::new(MockFitter::new(|_| Ok(0.9)).with_delay(Duration::from_secs(30)));
        let exec = executor(fitter, Arc::new(MemoryCodec::default()));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = exec
            .execute(1, &HyperparameterConfiguration::new(0.01, 5, 8), data.path(), out.path(), None, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_balancing_and_augmentation_feed_the_fitter() {
        let data = training_dir();
        let out = tempfile::tempdir().unwrap();
        let scanned = scan_directory(data.path(), &TrialSettings::default().image_extensions).unwrap();
        let codec = Arc::new(MemoryCodec::with_sources(&scanned));
        let fitter = Arc::new(MockFitter::new(|_| Ok(0.7)));
        let exec = executor(fitter.clone(), codec).with_settings(TrialSettings {
            evaluate_augmentation_impact: true,
            ..TrialSettings::default()
        });

        let mut config = HyperparameterConfiguration::new(0.01, 5, 8);
        config.data_balancing = DataBalancingOptions::over_sample();
        config.data_augmentation = DataAugmentationOptions {
            copies_per_sample: 1,
            ..DataAugmentationOptions::enabled()
        };

        let result = exec
            .execute(1, &config, data.path(), out.path(), None, &CancellationToken::new())
            .await
            .unwrap();

        // 6 + 6 balanced, plus one augmented copy each.
        assert_eq!(fitter.sample_counts.lock().unwrap()[0], 24);
        let TrialOutcome::Success { data: summary, .. } = &result.outcome else {
            panic!("expected success");
        };
        assert_eq!(summary.original_distribution.get("glare"), Some(&3));
        assert_eq!(summary.balanced_distribution.get("glare"), Some(&6));
        assert_eq!(summary.augmented_samples, 12);
        // Validation paths are unknown to the memory codec, so no impact is recorded.
        assert!(summary.augmentation_impact.is_none());
    }

    #[tokio::test]
    async fn test_progress_milestones() {
        let data = training_dir();
        let out = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |f: f64, m: &str| {
            sink_seen.lock().unwrap().push((f, m.to_string()));
        });
        let exec = executor(
            Arc::new(MockFitter::new(|_| Ok(0.5))),
            Arc::new(MemoryCodec::default()),
        );
        exec.execute(
            1,
            &HyperparameterConfiguration::new(0.01, 5, 8),
            data.path(),
            out.path(),
            Some(sink),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        let fractions: Vec<f64> = seen.iter().map(|(f, _)| *f).collect();
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().unwrap().1, "Evaluation complete");
        assert!(seen.iter().any(|(f, m)| m == "epoch" && (*f - 0.6).abs() < 1e-9));
    }
}
