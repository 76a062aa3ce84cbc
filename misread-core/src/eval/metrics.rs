//! Classification metrics: confusion matrix, per-class and averaged scores.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

const PROBABILITY_EPSILON: f64 = 1e-15;

/// One model prediction against its ground-truth label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    pub actual: String,
    pub predicted: String,
    /// Label → predicted probability. May be empty for hard predictions.
    #[serde(default)]
    pub probabilities: BTreeMap<String, f64>,
}

impl Prediction {
    pub fn new(actual: impl Into<String>, predicted: impl Into<String>) -> Self {
        Self {
            image_path: None,
            actual: actual.into(),
            predicted: predicted.into(),
            probabilities: BTreeMap::new(),
        }
    }

    pub fn with_probabilities(mut self, probabilities: BTreeMap<String, f64>) -> Self {
        self.probabilities = probabilities;
        self
    }

    fn true_label_probability(&self) -> f64 {
        let p = match self.probabilities.get(&self.actual) {
            Some(p) => *p,
            None if self.probabilities.is_empty() && self.actual == self.predicted => 1.0,
            None => 0.0,
        };
        p.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
    }
}

/// Square confusion matrix; rows are actual labels, columns predicted labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<String>,
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn from_predictions(predictions: &[Prediction]) -> Self {
        let labels: Vec<String> = predictions
            .iter()
            .flat_map(|p| [p.actual.clone(), p.predicted.clone()])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: BTreeMap<&str, usize> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();

        let mut counts = vec![vec![0usize; labels.len()]; labels.len()];
        for p in predictions {
            counts[index[p.actual.as_str()]][index[p.predicted.as_str()]] += 1;
        }
        Self { labels, counts }
    }

    pub fn get(&self, actual: &str, predicted: &str) -> usize {
        let row = self.labels.iter().position(|l| l == actual);
        let col = self.labels.iter().position(|l| l == predicted);
        match (row, col) {
            (Some(r), Some(c)) => self.counts[r][c],
            _ => 0,
        }
    }

    fn true_positives(&self, i: usize) -> usize {
        self.counts[i][i]
    }

    fn false_positives(&self, i: usize) -> usize {
        (0..self.labels.len())
            .filter(|&r| r != i)
            .map(|r| self.counts[r][i])
            .sum()
    }

    fn false_negatives(&self, i: usize) -> usize {
        (0..self.labels.len())
            .filter(|&c| c != i)
            .map(|c| self.counts[i][c])
            .sum()
    }
}

/// Scores for a single class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    /// Number of samples whose actual label is this class.
    pub support: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

/// Evaluation metrics for one trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub micro_precision: f64,
    pub micro_recall: f64,
    pub micro_f1: f64,
    pub log_loss: f64,
    pub sample_count: usize,
    pub per_class: Vec<ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

impl EvaluationMetrics {
    /// Sentinel for failed trials: zero scores and the worst possible log-loss.
    pub fn failed() -> Self {
        Self {
            accuracy: 0.0,
            macro_precision: 0.0,
            macro_recall: 0.0,
            macro_f1: 0.0,
            micro_precision: 0.0,
            micro_recall: 0.0,
            micro_f1: 0.0,
            log_loss: f64::MAX,
            sample_count: 0,
            per_class: Vec::new(),
            confusion_matrix: ConfusionMatrix::default(),
        }
    }

    pub fn compute(predictions: &[Prediction]) -> Self {
        if predictions.is_empty() {
            return Self::failed();
        }

        let matrix = ConfusionMatrix::from_predictions(predictions);
        let mut per_class = Vec::with_capacity(matrix.labels.len());
        let (mut tp_sum, mut fp_sum, mut fn_sum) = (0usize, 0usize, 0usize);

        for (i, label) in matrix.labels.iter().enumerate() {
            let tp = matrix.true_positives(i);
            let fp = matrix.false_positives(i);
            let fn_ = matrix.false_negatives(i);
            tp_sum += tp;
            fp_sum += fp;
            fn_sum += fn_;

            let precision = ratio(tp, tp + fp);
            let recall = ratio(tp, tp + fn_);
            per_class.push(ClassMetrics {
                label: label.clone(),
                precision,
                recall,
                f1_score: f1(precision, recall),
                support: tp + fn_,
                true_positives: tp,
                false_positives: fp,
                false_negatives: fn_,
            });
        }

        let n = per_class.len() as f64;
        let macro_precision = per_class.iter().map(|c| c.precision).sum::<f64>() / n;
        let macro_recall = per_class.iter().map(|c| c.recall).sum::<f64>() / n;
        let macro_f1 = per_class.iter().map(|c| c.f1_score).sum::<f64>() / n;

        let micro_precision = ratio(tp_sum, tp_sum + fp_sum);
        let micro_recall = ratio(tp_sum, tp_sum + fn_sum);

        let correct = predictions.iter().filter(|p| p.actual == p.predicted).count();
        let log_loss = predictions
            .iter()
            .map(|p| -p.true_label_probability().ln())
            .sum::<f64>()
            / predictions.len() as f64;

        Self {
            accuracy: ratio(correct, predictions.len()),
            macro_precision,
            macro_recall,
            macro_f1,
            micro_precision,
            micro_recall,
            micro_f1: f1(micro_precision, micro_recall),
            log_loss,
            sample_count: predictions.len(),
            per_class,
            confusion_matrix: matrix,
        }
    }

    pub fn score(&self, metric: SelectionMetric) -> f64 {
        match metric {
            SelectionMetric::Accuracy => self.accuracy,
            SelectionMetric::MacroF1 => self.macro_f1,
            SelectionMetric::MicroF1 => self.micro_f1,
            SelectionMetric::LogLoss => self.log_loss,
        }
    }
}

/// Metric used to rank trials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMetric {
    #[default]
    Accuracy,
    MacroF1,
    MicroF1,
    LogLoss,
}

impl SelectionMetric {
    pub fn higher_is_better(self) -> bool {
        !matches!(self, Self::LogLoss)
    }

    /// Whether `candidate` strictly improves on `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        if self.higher_is_better() {
            candidate > incumbent
        } else {
            candidate < incumbent
        }
    }
}

impl std::str::FromStr for SelectionMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "accuracy" => Ok(Self::Accuracy),
            "macro_f1" => Ok(Self::MacroF1),
            "micro_f1" => Ok(Self::MicroF1),
            "log_loss" | "logloss" => Ok(Self::LogLoss),
            other => Err(format!("unknown selection metric: {other}")),
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}
