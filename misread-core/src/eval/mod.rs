//! Evaluation: metrics computed from predictions against ground truth.

pub mod metrics;

pub use metrics::{ClassMetrics, ConfusionMatrix, EvaluationMetrics, Prediction, SelectionMetric};
