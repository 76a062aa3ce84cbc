//! Data pipeline: directory scanning, class balancing, augmentation.

pub mod augment;
pub mod balance;
pub mod sample;

pub use augment::{
    AugmentOverrides, AugmentationOp, AugmentedSet, DataAugmentationOptions, DecodedImage,
    ImageCodec, ImageFileCodec, augment,
};
pub use balance::{BalancedSet, BalancingStrategy, DataBalancingOptions, balance};
pub use sample::{ClassDistribution, Sample, class_distribution, scan_directory};
