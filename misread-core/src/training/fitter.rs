//! Collaborator contracts: the opaque model fitter and progress reporting.

use crate::data::{DataAugmentationOptions, DataBalancingOptions, Sample};
use crate::error::MisreadError;
use crate::eval::Prediction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the fitter needs for one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitRequest {
    pub training_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Prepared (balanced and augmented) training samples.
    pub samples: Vec<Sample>,
    pub learning_rate: f64,
    pub epochs: u32,
    pub batch_size: u32,
    pub validation_split_ratio: Option<f64>,
    pub augmentation: Option<DataAugmentationOptions>,
    pub balancing: Option<DataBalancingOptions>,
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

/// What a successful fit hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOutcome {
    pub model_artifact_path: PathBuf,
    /// Predictions on the held-out validation samples.
    #[serde(default)]
    pub validation_predictions: Vec<Prediction>,
}

/// Trains an image classifier. Treated as a black box.
#[async_trait]
pub trait ModelFitter: Send + Sync {
    async fn fit(
        &self,
        request: FitRequest,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<FitOutcome, MisreadError>;

    /// Classify `samples` with a previously produced model artifact.
    async fn predict(
        &self,
        model_artifact: &Path,
        samples: &[Sample],
    ) -> Result<Vec<Prediction>, MisreadError>;
}

/// Receives coarse progress milestones. Not durable, not exactly-once.
pub trait ProgressSink: Send + Sync {
    fn report_progress(&self, fraction: f64, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn report_progress(&self, fraction: f64, message: &str) {
        self(fraction, message)
    }
}

/// Maps a child operation's [0, 1] progress into a sub-range of a parent sink.
pub struct ScaledProgress {
    inner: Arc<dyn ProgressSink>,
    start: f64,
    span: f64,
}

impl ScaledProgress {
    pub fn new(inner: Arc<dyn ProgressSink>, start: f64, end: f64) -> Self {
        Self {
            inner,
            start,
            span: end - start,
        }
    }
}

impl ProgressSink for ScaledProgress {
    fn report_progress(&self, fraction: f64, message: &str) {
        let scaled = self.start + self.span * fraction.clamp(0.0, 1.0);
        self.inner.report_progress(scaled, message);
    }
}

pub(crate) fn report(progress: &Option<Arc<dyn ProgressSink>>, fraction: f64, message: &str) {
    if let Some(sink) = progress {
        sink.report_progress(fraction.clamp(0.0, 1.0), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_progress_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |f: f64, m: &str| {
            sink_seen.lock().unwrap().push((f, m.to_string()));
        });
        report(&Some(sink), 1.5, "done");
        assert_eq!(seen.lock().unwrap()[0], (1.0, "done".to_string()));
    }

    #[test]
    fn test_scaled_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |f: f64, _: &str| {
            sink_seen.lock().unwrap().push(f);
        });
        let scaled = ScaledProgress::new(sink, 0.5, 1.0);
        scaled.report_progress(0.5, "half");
        assert!((seen.lock().unwrap()[0] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_fit_request_skips_token_in_json() {
        let request = FitRequest {
            training_dir: "/data".into(),
            output_dir: "/out".into(),
            samples: vec![Sample::new("/data/a/1.png", "a")],
            learning_rate: 0.01,
            epochs: 5,
            batch_size: 8,
            validation_split_ratio: Some(0.2),
            augmentation: None,
            balancing: None,
            cancellation: CancellationToken::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("cancellation").is_none());
        assert_eq!(json["epochs"], 5);
    }
}
