//! Search callbacks: early stopping across trials.

use crate::eval::SelectionMetric;
use crate::training::trial::TrialResult;
use serde::{Deserialize, Serialize};

/// Number of most recent trials inspected by [`TrialEarlyStopping`].
pub const EARLY_STOPPING_WINDOW: usize = 4;

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAction {
    Continue,
    Stop,
}

/// Stops a sequential search once the metric plateaus.
///
/// After at least four completed trials, looks at the last four: if all four
/// succeeded and none of the last three beats the first of the window, the
/// search stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialEarlyStopping {
    pub metric: SelectionMetric,
}

impl TrialEarlyStopping {
    pub fn new(metric: SelectionMetric) -> Self {
        Self { metric }
    }

    pub fn on_trial_end(&self, completed: &[TrialResult]) -> SearchAction {
        if completed.len() < EARLY_STOPPING_WINDOW {
            return SearchAction::Continue;
        }

        let window = &completed[completed.len() - EARLY_STOPPING_WINDOW..];
        if !window.iter().all(TrialResult::is_successful) {
            return SearchAction::Continue;
        }

        let baseline = window[0].metrics().score(self.metric);
        let improved = window[1..]
            .iter()
            .any(|t| self.metric.is_better(t.metrics().score(self.metric), baseline));

        if improved {
            SearchAction::Continue
        } else {
            SearchAction::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::trial::tests::{failed_trial, successful_trial};

    fn accuracies(values: &[f64]) -> Vec<TrialResult> {
        values
            .iter()
            .enumerate()
            .map(|(i, &a)| successful_trial(i + 1, a))
            .collect()
    }

    #[test]
    fn test_never_stops_before_window() {
        let cb = TrialEarlyStopping::new(SelectionMetric::Accuracy);
        for n in 0..EARLY_STOPPING_WINDOW {
            let trials = accuracies(&vec![0.5; n]);
            assert_eq!(cb.on_trial_end(&trials), SearchAction::Continue);
        }
    }

    #[test]
    fn test_stops_on_plateau() {
        let cb = TrialEarlyStopping::new(SelectionMetric::Accuracy);
        let trials = accuracies(&[0.9, 0.8, 0.85, 0.9]);
        assert_eq!(cb.on_trial_end(&trials), SearchAction::Stop);
    }

    #[test]
    fn test_continues_when_improving() {
        let cb = TrialEarlyStopping::new(SelectionMetric::Accuracy);
        let trials = accuracies(&[0.6, 0.7, 0.65, 0.62, 0.61]);
        // Window is [0.7, 0.65, 0.62, 0.61] → no improvement.
        assert_eq!(cb.on_trial_end(&trials), SearchAction::Stop);
        let trials = accuracies(&[0.6, 0.55, 0.5, 0.61]);
        assert_eq!(cb.on_trial_end(&trials), SearchAction::Continue);
    }

    #[test]
    fn test_failed_trial_in_window_continues() {
        let cb = TrialEarlyStopping::new(SelectionMetric::Accuracy);
        let mut trials = accuracies(&[0.9, 0.8, 0.8]);
        trials.push(failed_trial(4));
        assert_eq!(cb.on_trial_end(&trials), SearchAction::Continue);
    }

    #[test]
    fn test_log_loss_direction() {
        let cb = TrialEarlyStopping::new(SelectionMetric::LogLoss);
        // Accuracy fixture stores log_loss = 1 - accuracy.
        let trials = accuracies(&[0.5, 0.6, 0.4, 0.3]);
        // log-loss window [0.5, 0.4, 0.6, 0.7] → 0.4 improves on 0.5.
        assert_eq!(cb.on_trial_end(&trials), SearchAction::Continue);
        let trials = accuracies(&[0.9, 0.8, 0.7, 0.6]);
        assert_eq!(cb.on_trial_end(&trials), SearchAction::Stop);
    }
}
