//! Class balancing by seeded over- or under-sampling.

use crate::data::sample::{ClassDistribution, Sample, class_distribution, group_by_label};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How per-class counts are equalised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    #[default]
    None,
    OverSample,
    UnderSample,
}

/// Balancing settings for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataBalancingOptions {
    pub strategy: BalancingStrategy,
    /// Overrides the derived per-class target. Negative values clamp to zero.
    pub target_sample_count_per_class: Option<i64>,
    pub shuffle_after_balancing: bool,
    pub random_seed: u64,
}

impl Default for DataBalancingOptions {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::None,
            target_sample_count_per_class: None,
            shuffle_after_balancing: true,
            random_seed: 42,
        }
    }
}

impl DataBalancingOptions {
    pub fn over_sample() -> Self {
        Self {
            strategy: BalancingStrategy::OverSample,
            ..Self::default()
        }
    }

    pub fn under_sample() -> Self {
        Self {
            strategy: BalancingStrategy::UnderSample,
            ..Self::default()
        }
    }
}

/// Output of the balancing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancedSet {
    pub samples: Vec<Sample>,
    pub original_distribution: ClassDistribution,
    pub distribution: ClassDistribution,
}

/// Resample `samples` so that every class approaches a common target count.
///
/// Over-sampling never shrinks a class and under-sampling never grows one.
/// Identical input, options and seed always produce identical output.
pub fn balance(samples: &[Sample], options: &DataBalancingOptions) -> BalancedSet {
    let original_distribution = class_distribution(samples);

    if options.strategy == BalancingStrategy::None || samples.is_empty() {
        return BalancedSet {
            samples: samples.to_vec(),
            distribution: original_distribution.clone(),
            original_distribution,
        };
    }

    let groups = group_by_label(samples);
    let target = match options.target_sample_count_per_class {
        Some(explicit) => explicit.max(0) as usize,
        None => {
            let sizes = groups.values().map(Vec::len);
            match options.strategy {
                BalancingStrategy::OverSample => sizes.max().unwrap_or(0),
                _ => sizes.min().unwrap_or(0),
            }
        }
    };

    let mut rng = StdRng::seed_from_u64(options.random_seed);
    let mut balanced = Vec::new();

    for (label, group) in &groups {
        match options.strategy {
            BalancingStrategy::OverSample => {
                let wanted = target.max(group.len());
                let mut out = group.clone();
                while out.len() < wanted {
                    let pick = rng.gen_range(0..group.len());
                    out.push(group[pick].clone());
                }
                balanced.extend(out);
            }
            BalancingStrategy::UnderSample => {
                let mut shuffled = group.clone();
                shuffled.shuffle(&mut rng);
                shuffled.truncate(target.min(group.len()));
                if shuffled.is_empty() {
                    debug!(label = %label, "Class dropped by under-sampling");
                }
                balanced.extend(shuffled);
            }
            BalancingStrategy::None => balanced.extend(group.iter().cloned()),
        }
    }

    if options.shuffle_after_balancing {
        balanced.shuffle(&mut rng);
    }

    let distribution = class_distribution(&balanced);
    debug!(
        strategy = ?options.strategy,
        target,
        before = samples.len(),
        after = balanced.len(),
        "Balanced sample set"
    );

    BalancedSet {
        samples: balanced,
        original_distribution,
        distribution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixture() -> Vec<Sample> {
        let mut samples = Vec::new();
        for (label, count) in [("blur", 10), ("glare", 4), ("damaged", 7)] {
            for i in 0..count {
                samples.push(Sample::new(format!("{label}/{i}.png"), label));
            }
        }
        samples
    }

    fn sorted(mut samples: Vec<Sample>) -> Vec<Sample> {
        samples.sort();
        samples
    }

    #[test]
    fn test_over_sample_to_largest_class() {
        let result = balance(&fixture(), &DataBalancingOptions::over_sample());
        assert_eq!(result.samples.len(), 30);
        assert!(result.distribution.values().all(|&c| c == 10));
        assert_eq!(result.original_distribution.get("glare"), Some(&4));
    }

    #[test]
    fn test_under_sample_to_smallest_class() {
        let result = balance(&fixture(), &DataBalancingOptions::under_sample());
        assert_eq!(result.samples.len(), 12);
        assert!(result.distribution.values().all(|&c| c == 4));
    }

    #[test]
    fn test_none_strategy_is_passthrough() {
        let input = fixture();
        let result = balance(&input, &DataBalancingOptions::default());
        assert_eq!(result.samples, input);
        assert_eq!(result.distribution, result.original_distribution);
    }

    #[test]
    fn test_empty_input() {
        let result = balance(&[], &DataBalancingOptions::over_sample());
        assert!(result.samples.is_empty());
        assert!(result.distribution.is_empty());
    }

    #[test]
    fn test_explicit_target_over_sample_never_shrinks() {
        let options = DataBalancingOptions {
            target_sample_count_per_class: Some(6),
            ..DataBalancingOptions::over_sample()
        };
        let result = balance(&fixture(), &options);
        assert_eq!(result.distribution.get("blur"), Some(&10));
        assert_eq!(result.distribution.get("glare"), Some(&6));
        assert_eq!(result.distribution.get("damaged"), Some(&7));
    }

    #[test]
    fn test_explicit_zero_target_under_sample_drops_everything() {
        let options = DataBalancingOptions {
            target_sample_count_per_class: Some(-3),
            ..DataBalancingOptions::under_sample()
        };
        let result = balance(&fixture(), &options);
        assert!(result.samples.is_empty());
        assert!(result.distribution.is_empty());
    }

    #[test]
    fn test_deterministic_for_same_seed() {
        let options = DataBalancingOptions::over_sample();
        let a = balance(&fixture(), &options);
        let b = balance(&fixture(), &options);
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn test_over_sampled_members_come_from_their_class() {
        let input = fixture();
        let result = balance(&input, &DataBalancingOptions::over_sample());
        for sample in &result.samples {
            assert!(input.contains(sample));
        }
    }

    #[test]
    fn test_shuffle_does_not_change_content() {
        let unshuffled = DataBalancingOptions {
            shuffle_after_balancing: false,
            ..DataBalancingOptions::under_sample()
        };
        let shuffled = DataBalancingOptions::under_sample();
        let a = balance(&fixture(), &unshuffled);
        let b = balance(&fixture(), &shuffled);
        assert_eq!(a.distribution, b.distribution);
        assert_eq!(sorted(a.samples), sorted(b.samples));
    }
}
