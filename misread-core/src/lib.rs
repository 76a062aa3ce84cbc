//! # misread-core: training orchestration for barcode read-failure classifiers
//!
//! Decides what hyperparameter configurations to try, how to balance and
//! augment the samples feeding each trial, how many trials and jobs run at
//! once, and how results are scored and selected. Model fitting itself is
//! delegated to a [`ModelFitter`].
//!
//! Components, leaves first:
//! - [`eval`]: confusion matrix, per-class and macro/micro metrics, log-loss
//! - [`data`]: directory scan, seeded class balancing, probabilistic augmentation
//! - [`training`]: trial executor, grid/random search, early stopping
//! - [`jobs`]: job lifecycle, slot-limited manager, crash recovery

// Foundation
pub mod config;
pub mod error;
pub mod runtime;

// Pipeline
pub mod data;
pub mod eval;
pub mod training;

// Orchestration
pub mod jobs;

// Re-exports
pub use config::{MisreadConfig, load_config};
pub use error::MisreadError;
pub use jobs::{JobManager, JobRequest, JobStatus, TrainingJob};
pub use runtime::CommandFitter;
pub use training::{
    HyperparameterConfiguration, HyperparameterSpace, ModelFitter, TrialExecutor, TuningEngine,
    TuningRequest, TuningResult,
};
