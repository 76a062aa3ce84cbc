//! Labelled image samples and training-directory scanning.

use crate::error::MisreadError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One labelled training image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sample {
    pub image_path: PathBuf,
    pub label: String,
}

impl Sample {
    pub fn new(image_path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            label: label.into(),
        }
    }
}

/// Label → sample count.
pub type ClassDistribution = BTreeMap<String, usize>;

/// Count samples per label.
pub fn class_distribution(samples: &[Sample]) -> ClassDistribution {
    let mut distribution = ClassDistribution::new();
    for sample in samples {
        *distribution.entry(sample.label.clone()).or_default() += 1;
    }
    distribution
}

/// Group samples by label, preserving input order within each group.
pub(crate) fn group_by_label(samples: &[Sample]) -> BTreeMap<String, Vec<Sample>> {
    let mut groups: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        groups
            .entry(sample.label.clone())
            .or_default()
            .push(sample.clone());
    }
    groups
}

/// Scan a training directory laid out as `<root>/<label>/**/<image>`.
///
/// Every immediate subdirectory of `root` is a class; every file below it whose
/// extension matches one of `extensions` (case-insensitive) becomes a sample.
/// Output is sorted by label, then path, so downstream seeded stages see a
/// stable order regardless of filesystem enumeration order.
pub fn scan_directory(root: &Path, extensions: &[String]) -> Result<Vec<Sample>, MisreadError> {
    if !root.is_dir() {
        return Err(MisreadError::config(format!(
            "Training directory does not exist: {}",
            root.display()
        )));
    }

    let mut samples = Vec::new();
    for class_dir in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let class_dir = class_dir.map_err(|e| MisreadError::dataset(e.to_string()))?;
        if !class_dir.file_type().is_dir() {
            continue;
        }
        let Some(label) = class_dir.file_name().to_str().map(str::to_string) else {
            debug!(path = %class_dir.path().display(), "Skipping non-UTF-8 class directory");
            continue;
        };
        if label.trim().is_empty() {
            continue;
        }

        for entry in WalkDir::new(class_dir.path()).sort_by_file_name() {
            let entry = entry.map_err(|e| MisreadError::dataset(e.to_string()))?;
            if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
                samples.push(Sample::new(entry.path(), label.clone()));
            }
        }
    }

    samples.sort();
    debug!(root = %root.display(), count = samples.len(), "Scanned training directory");
    Ok(samples)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}
