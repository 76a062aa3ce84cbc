//! Hyperparameter configurations and search spaces.

use crate::data::{DataAugmentationOptions, DataBalancingOptions};
use crate::error::MisreadError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const MAX_EPOCHS: u32 = 500;
pub const MAX_BATCH_SIZE: u32 = 512;

/// One trial's complete set of hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterConfiguration {
    pub id: String,
    pub learning_rate: f64,
    pub epochs: u32,
    pub batch_size: u32,
    #[serde(default)]
    pub validation_split_ratio: Option<f64>,
    #[serde(default)]
    pub data_augmentation: DataAugmentationOptions,
    #[serde(default)]
    pub data_balancing: DataBalancingOptions,
}

impl HyperparameterConfiguration {
    pub fn new(learning_rate: f64, epochs: u32, batch_size: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            learning_rate,
            epochs,
            batch_size,
            validation_split_ratio: None,
            data_augmentation: DataAugmentationOptions::default(),
            data_balancing: DataBalancingOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<(), MisreadError> {
        validate_learning_rate(self.learning_rate)?;
        validate_epochs(self.epochs)?;
        validate_batch_size(self.batch_size)?;
        validate_validation_ratio(self.validation_split_ratio)
    }
}

/// Candidate values per dimension. Empty optional dimensions fall back to a
/// single default entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparameterSpace {
    pub learning_rates: Vec<f64>,
    pub epochs: Vec<u32>,
    pub batch_sizes: Vec<u32>,
    pub validation_split_ratios: Vec<Option<f64>>,
    pub augmentation_options: Vec<DataAugmentationOptions>,
    pub balancing_options: Vec<DataBalancingOptions>,
}

impl HyperparameterSpace {
    /// Reject invalid spaces before any trial is started.
    pub fn validate(&self) -> Result<(), MisreadError> {
        if self.learning_rates.is_empty() {
            return Err(MisreadError::config("Search space has no learning rates"));
        }
        if self.epochs.is_empty() {
            return Err(MisreadError::config("Search space has no epoch counts"));
        }
        if self.batch_sizes.is_empty() {
            return Err(MisreadError::config("Search space has no batch sizes"));
        }
        self.learning_rates
            .iter()
            .try_for_each(|&lr| validate_learning_rate(lr))?;
        self.epochs.iter().try_for_each(|&e| validate_epochs(e))?;
        self.batch_sizes
            .iter()
            .try_for_each(|&b| validate_batch_size(b))?;
        self.validation_split_ratios
            .iter()
            .try_for_each(|&r| validate_validation_ratio(r))
    }

    /// Number of configurations a grid search would generate.
    pub fn grid_size(&self) -> usize {
        self.learning_rates.len()
            * self.epochs.len()
            * self.batch_sizes.len()
            * self.validation_ratios().len()
            * self.augmentations().len()
            * self.balancings().len()
    }

    /// Full Cartesian product, in dimension order
    /// learning rate → epochs → batch size → validation ratio → augmentation → balancing.
    pub fn grid_configurations(&self) -> Vec<HyperparameterConfiguration> {
        let ratios = self.validation_ratios();
        let augmentations = self.augmentations();
        let balancings = self.balancings();

        let mut configs = Vec::with_capacity(self.grid_size());
        for &learning_rate in &self.learning_rates {
            for &epochs in &self.epochs {
                for &batch_size in &self.batch_sizes {
                    for &ratio in &ratios {
                        for augmentation in &augmentations {
                            for balancing in &balancings {
                                configs.push(HyperparameterConfiguration {
                                    validation_split_ratio: ratio,
                                    data_augmentation: augmentation.clone(),
                                    data_balancing: balancing.clone(),
                                    ..HyperparameterConfiguration::new(
                                        learning_rate,
                                        epochs,
                                        batch_size,
                                    )
                                });
                            }
                        }
                    }
                }
            }
        }
        configs
    }

    /// `count` independent uniform draws, one value per dimension each.
    pub fn random_configurations(&self, count: usize, seed: u64) -> Vec<HyperparameterConfiguration> {
        let ratios = self.validation_ratios();
        let augmentations = self.augmentations();
        let balancings = self.balancings();
        let mut rng = StdRng::seed_from_u64(seed);

        (0..count)
            .map(|_| {
                let learning_rate = pick(&self.learning_rates, &mut rng);
                let epochs = pick(&self.epochs, &mut rng);
                let batch_size = pick(&self.batch_sizes, &mut rng);
                HyperparameterConfiguration {
                    validation_split_ratio: pick(&ratios, &mut rng),
                    data_augmentation: pick(&augmentations, &mut rng),
                    data_balancing: pick(&balancings, &mut rng),
                    ..HyperparameterConfiguration::new(learning_rate, epochs, batch_size)
                }
            })
            .collect()
    }

    fn validation_ratios(&self) -> Vec<Option<f64>> {
        or_default(&self.validation_split_ratios)
    }

    fn augmentations(&self) -> Vec<DataAugmentationOptions> {
        or_default(&self.augmentation_options)
    }

    fn balancings(&self) -> Vec<DataBalancingOptions> {
        or_default(&self.balancing_options)
    }
}

fn or_default<T: Clone + Default>(values: &[T]) -> Vec<T> {
    if values.is_empty() {
        vec![T::default()]
    } else {
        values.to_vec()
    }
}

fn pick<T: Clone>(values: &[T], rng: &mut StdRng) -> T {
    values[rng.gen_range(0..values.len())].clone()
}

fn validate_learning_rate(lr: f64) -> Result<(), MisreadError> {
    if !(lr > 0.0 && lr <= 1.0) {
        return Err(MisreadError::config(format!(
            "Learning rate {lr} must be in (0, 1]"
        )));
    }
    Ok(())
}

fn validate_epochs(epochs: u32) -> Result<(), MisreadError> {
    if !(1..=MAX_EPOCHS).contains(&epochs) {
        return Err(MisreadError::config(format!(
            "Epochs {epochs} must be in [1, {MAX_EPOCHS}]"
        )));
    }
    Ok(())
}

fn validate_batch_size(batch: u32) -> Result<(), MisreadError> {
    if !(1..=MAX_BATCH_SIZE).contains(&batch) {
        return Err(MisreadError::config(format!(
            "Batch size {batch} must be in [1, {MAX_BATCH_SIZE}]"
        )));
    }
    Ok(())
}

fn validate_validation_ratio(ratio: Option<f64>) -> Result<(), MisreadError> {
    match ratio {
        Some(r) if !(0.0..=1.0).contains(&r) => Err(MisreadError::config(format!(
            "Validation split ratio {r} must be in [0, 1]"
        ))),
        _ => Ok(()),
    }
}
