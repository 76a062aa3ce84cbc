//! Training: hyperparameters, trial execution and search.

pub mod callbacks;
pub mod fitter;
pub mod hyperparams;
pub mod sweep;
pub mod trial;

pub use callbacks::{EARLY_STOPPING_WINDOW, SearchAction, TrialEarlyStopping};
pub use fitter::{FitOutcome, FitRequest, ModelFitter, ProgressSink, ScaledProgress};
pub use hyperparams::{HyperparameterConfiguration, HyperparameterSpace};
pub use sweep::{
    ExecutionMode, SearchStrategy, TuningEngine, TuningRequest, TuningResult, TuningStatus,
    select_best,
};
pub use trial::{
    AugmentationImpact, TrialDataSummary, TrialExecutor, TrialOutcome, TrialResult, TrialSettings,
};
