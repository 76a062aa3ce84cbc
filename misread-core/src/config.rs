//! Configuration for job orchestration, tuning defaults and the model fitter.
//!
//! Layered with figment: built-in defaults, then the user config file, then
//! `<workspace>/.misread/config.toml`, then an explicit file, then
//! `MISREAD_*` environment variables (`MISREAD_JOBS__MAX_CONCURRENT_JOBS=2`).

use crate::eval::SelectionMetric;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MisreadConfig {
    pub jobs: JobsConfig,
    pub tuning: TuningConfig,
    pub data: DataConfig,
    pub fitter: FitterConfig,
}

/// Job manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// JSON job store. Jobs live only in memory when unset.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            state_file: None,
        }
    }
}

/// Defaults applied to every hyperparameter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    #[serde(default)]
    pub selection_metric: SelectionMetric,
    /// Parallel trial cap; `None` runs trials sequentially.
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    #[serde(default = "default_true")]
    pub early_stopping: bool,
    #[serde(default)]
    pub evaluate_augmentation_impact: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            selection_metric: SelectionMetric::default(),
            max_parallelism: None,
            early_stopping: true,
            evaluate_augmentation_impact: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

impl DataConfig {
    /// Scratch directory handed to the fitter, relative paths anchored at
    /// `workspace`.
    pub fn resolve_workspace_dir(&self, workspace: &Path) -> PathBuf {
        if self.workspace_dir.is_absolute() {
            self.workspace_dir.clone()
        } else {
            workspace.join(&self.workspace_dir)
        }
    }
}

/// External training program driven by [`crate::runtime::CommandFitter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitterConfig {
    #[serde(default = "default_fitter_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_fitter_timeout")]
    pub timeout_secs: u64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            program: default_fitter_program(),
            args: Vec::new(),
            timeout_secs: default_fitter_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_jobs() -> usize {
    1
}

pub fn default_image_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".misread").join("work")
}

fn default_fitter_program() -> String {
    "misread-fit".to_string()
}

fn default_fitter_timeout() -> u64 {
    3600
}

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<MisreadConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(MisreadConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "misread", "misread") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".misread").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // A missing explicit file is an error rather than silently skipped.
    if let Some(path) = explicit {
        figment = figment.merge(Toml::file_exact(path));
    }

    figment = figment.merge(Env::prefixed("MISREAD_").split("__"));

    figment.extract().map_err(Box::new)
}
