//! Probabilistic image augmentation.
//!
//! Each source sample is decoded once and written out `copies_per_sample`
//! times, each copy with an independently rolled subset of the enabled
//! operations. Only the generated copies are returned; the caller's samples
//! are never touched. A bad source image is logged and skipped.

use crate::data::sample::Sample;
use crate::error::MisreadError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Augmentation settings for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataAugmentationOptions {
    pub enabled: bool,
    pub copies_per_sample: i32,
    pub enable_rotation: bool,
    pub rotation_probability: f64,
    /// Candidate rotation angles in degrees; one is drawn per rotated copy.
    pub rotation_angles: Vec<f32>,
    pub enable_horizontal_flip: bool,
    pub horizontal_flip_probability: f64,
    pub enable_vertical_flip: bool,
    pub vertical_flip_probability: f64,
    pub enable_brightness: bool,
    pub brightness_probability: f64,
    /// Inclusive multiplicative brightness range.
    pub brightness_range: (f32, f32),
    pub shuffle_augmented_data: bool,
    pub random_seed: u64,
}

impl Default for DataAugmentationOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            copies_per_sample: 2,
            enable_rotation: true,
            rotation_probability: 0.7,
            rotation_angles: vec![-10.0, -5.0, 5.0, 10.0],
            enable_horizontal_flip: true,
            horizontal_flip_probability: 0.5,
            enable_vertical_flip: true,
            vertical_flip_probability: 0.2,
            enable_brightness: true,
            brightness_probability: 0.3,
            brightness_range: (0.8, 1.2),
            shuffle_augmented_data: true,
            random_seed: 42,
        }
    }
}

impl DataAugmentationOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// Per-call overrides, used when re-augmenting a held-out set.
#[derive(Debug, Clone, Copy, Default)]
pub struct AugmentOverrides {
    pub copies_per_sample: Option<i32>,
    pub random_seed: Option<u64>,
}

/// One concrete transform applied to a copy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AugmentationOp {
    Rotate { degrees: f32 },
    FlipHorizontal,
    FlipVertical,
    Brightness { factor: f32 },
}

impl AugmentationOp {
    /// Stable name used as the usage-histogram key.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rotate { .. } => "rotation",
            Self::FlipHorizontal => "horizontal_flip",
            Self::FlipVertical => "vertical_flip",
            Self::Brightness { .. } => "brightness",
        }
    }
}

/// Decoded RGBA8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, MisreadError> {
        if pixels.len() != (width as usize) * (height as usize) * 4 {
            return Err(MisreadError::image(format!(
                "Pixel buffer of {} bytes does not match {width}x{height} RGBA",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    fn remap(&self, source: impl Fn(u32, u32) -> Option<(u32, u32)>) -> Self {
        let mut pixels = vec![0u8; self.pixels.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                if let Some((sx, sy)) = source(x, y) {
                    let i = ((y * self.width + x) * 4) as usize;
                    pixels[i..i + 4].copy_from_slice(&self.pixel(sx, sy));
                }
            }
        }
        Self {
            width: self.width,
            height: self.height,
            pixels,
        }
    }

    /// Apply one operation, returning a new image of the same size.
    pub fn apply(&self, op: &AugmentationOp) -> Self {
        let (w, h) = (self.width, self.height);
        match *op {
            AugmentationOp::FlipHorizontal => self.remap(|x, y| Some((w - 1 - x, y))),
            AugmentationOp::FlipVertical => self.remap(|x, y| Some((x, h - 1 - y))),
            AugmentationOp::Rotate { degrees } => {
                let (sin, cos) = (-degrees.to_radians()).sin_cos();
                let cx = (w as f32 - 1.0) / 2.0;
                let cy = (h as f32 - 1.0) / 2.0;
                // Inverse mapping: destination pixel pulls from the source rotated back.
                self.remap(|x, y| {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    let sx = (cos * dx - sin * dy + cx).round();
                    let sy = (sin * dx + cos * dy + cy).round();
                    (sx >= 0.0 && sy >= 0.0 && sx < w as f32 && sy < h as f32)
                        .then_some((sx as u32, sy as u32))
                })
            }
            AugmentationOp::Brightness { factor } => {
                let mut pixels = self.pixels.clone();
                for px in pixels.chunks_exact_mut(4) {
                    for channel in &mut px[..3] {
                        *channel = (*channel as f32 * factor).round().clamp(0.0, 255.0) as u8;
                    }
                }
                Self {
                    width: w,
                    height: h,
                    pixels,
                }
            }
        }
    }
}

/// Image load/save boundary.
pub trait ImageCodec: Send + Sync {
    fn load(&self, path: &Path) -> Result<DecodedImage, MisreadError>;
    fn save(&self, image: &DecodedImage, path: &Path) -> Result<(), MisreadError>;
}

/// [`ImageCodec`] backed by the `image` crate; the output format follows the
/// destination file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileCodec;

impl ImageCodec for ImageFileCodec {
    fn load(&self, path: &Path) -> Result<DecodedImage, MisreadError> {
        let rgba = image::open(path)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        DecodedImage::new(width, height, rgba.into_raw())
    }

    fn save(&self, decoded: &DecodedImage, path: &Path) -> Result<(), MisreadError> {
        let buffer = image::RgbaImage::from_raw(decoded.width, decoded.height, decoded.pixels.clone())
            .ok_or_else(|| MisreadError::image("Pixel buffer too small for image dimensions"))?;
        let is_jpeg = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
        if is_jpeg {
            // JPEG has no alpha channel.
            image::DynamicImage::ImageRgba8(buffer).to_rgb8().save(path)?;
        } else {
            buffer.save(path)?;
        }
        Ok(())
    }
}

/// Output of the augmentation stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AugmentedSet {
    /// Newly generated samples only.
    pub samples: Vec<Sample>,
    /// Operation name → number of copies it was actually applied to.
    pub usage: BTreeMap<String, usize>,
    pub failed_sources: usize,
}

/// Generate augmented copies of `samples` into `workspace`.
pub fn augment(
    samples: &[Sample],
    options: &DataAugmentationOptions,
    workspace: &Path,
    codec: &dyn ImageCodec,
    overrides: AugmentOverrides,
) -> Result<AugmentedSet, MisreadError> {
    let copies = overrides
        .copies_per_sample
        .unwrap_or(options.copies_per_sample);
    if !options.enabled || samples.is_empty() || copies <= 0 {
        return Ok(AugmentedSet::default());
    }

    std::fs::create_dir_all(workspace)?;
    let seed = overrides.random_seed.unwrap_or(options.random_seed);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut result = AugmentedSet::default();

    for (index, source) in samples.iter().enumerate() {
        let image = match codec.load(&source.image_path) {
            Ok(image) => image,
            Err(e) => {
                warn!(path = %source.image_path.display(), error = %e, "Skipping unreadable source image");
                result.failed_sources += 1;
                continue;
            }
        };

        for copy in 0..copies {
            let ops = roll_operations(options, &mut rng);
            let token = rng.next_u32();
            let target = copy_path(workspace, &source.image_path, index, copy, token);

            let augmented = ops.iter().fold(image.clone(), |img, op| img.apply(op));
            if let Err(e) = codec.save(&augmented, &target) {
                warn!(path = %target.display(), error = %e, "Failed to write augmented copy");
                continue;
            }

            for op in &ops {
                *result.usage.entry(op.name().to_string()).or_default() += 1;
            }
            result.samples.push(Sample::new(target, source.label.clone()));
        }
    }

    if options.shuffle_augmented_data {
        let mut shuffle_rng = StdRng::seed_from_u64(rng.next_u64());
        result.samples.shuffle(&mut shuffle_rng);
    }

    debug!(
        sources = samples.len(),
        generated = result.samples.len(),
        failed = result.failed_sources,
        "Augmented sample set"
    );
    Ok(result)
}

fn roll_operations(options: &DataAugmentationOptions, rng: &mut StdRng) -> Vec<AugmentationOp> {
    let mut ops = Vec::new();
    if options.enable_rotation
        && !options.rotation_angles.is_empty()
        && rng.gen_bool(options.rotation_probability.clamp(0.0, 1.0))
    {
        let degrees = options.rotation_angles[rng.gen_range(0..options.rotation_angles.len())];
        ops.push(AugmentationOp::Rotate { degrees });
    }
    if options.enable_horizontal_flip
        && rng.gen_bool(options.horizontal_flip_probability.clamp(0.0, 1.0))
    {
        ops.push(AugmentationOp::FlipHorizontal);
    }
    if options.enable_vertical_flip
        && rng.gen_bool(options.vertical_flip_probability.clamp(0.0, 1.0))
    {
        ops.push(AugmentationOp::FlipVertical);
    }
    if options.enable_brightness && rng.gen_bool(options.brightness_probability.clamp(0.0, 1.0)) {
        let (lo, hi) = options.brightness_range;
        let factor = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
        ops.push(AugmentationOp::Brightness { factor });
    }
    ops
}

fn copy_path(workspace: &Path, source: &Path, index: usize, copy: i32, token: u32) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("sample");
    let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("png");
    workspace.join(format!("{stem}_{index:05}_aug{copy}_{token:08x}.{ext}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory codec: sources are registered up front, saves are recorded.
    #[derive(Default)]
    pub(crate) struct MemoryCodec {
        pub(crate) sources: HashMap<PathBuf, DecodedImage>,
        pub(crate) saved: Mutex<Vec<PathBuf>>,
    }

    impl MemoryCodec {
        pub(crate) fn with_sources(samples: &[Sample]) -> Self {
            let mut codec = Self::default();
            for s in samples {
                codec.sources.insert(s.image_path.clone(), tiny_image());
            }
            codec
        }
    }

    impl ImageCodec for MemoryCodec {
        fn load(&self, path: &Path) -> Result<DecodedImage, MisreadError> {
            self.sources
                .get(path)
                .cloned()
                .ok_or_else(|| MisreadError::image(format!("corrupt: {}", path.display())))
        }

        fn save(&self, _image: &DecodedImage, path: &Path) -> Result<(), MisreadError> {
            self.saved.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    pub(crate) fn tiny_image() -> DecodedImage {
        // 2x2: red, green / blue, white
        DecodedImage::new(
            2,
            2,
            vec![
                255, 0, 0, 255, 0, 255, 0, 255, //
                0, 0, 255, 255, 255, 255, 255, 255,
            ],
        )
        .unwrap()
    }

    fn samples() -> Vec<Sample> {
        (0..5)
            .map(|i| Sample::new(format!("/src/{i}.png"), if i % 2 == 0 { "blur" } else { "glare" }))
            .collect()
    }

    #[test]
    fn test_disabled_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let codec = MemoryCodec::with_sources(&samples());
        let out = augment(
            &samples(),
            &DataAugmentationOptions::default(),
            dir.path(),
            &codec,
            AugmentOverrides::default(),
        )
        .unwrap();
        assert!(out.samples.is_empty());
        assert!(codec.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn test_non_positive_copies_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let codec = MemoryCodec::with_sources(&samples());
        let options = DataAugmentationOptions {
            copies_per_sample: 0,
            ..DataAugmentationOptions::enabled()
        };
        let out = augment(&samples(), &options, dir.path(), &codec, AugmentOverrides::default())
            .unwrap();
        assert!(out.samples.is_empty());
    }

    #[test]
    fn test_generates_only_new_samples_with_source_labels() {
        let dir = tempfile::tempdir().unwrap();
        let input = samples();
        let codec = MemoryCodec::with_sources(&input);
        let out = augment(
            &input,
            &DataAugmentationOptions::enabled(),
            dir.path(),
            &codec,
            AugmentOverrides::default(),
        )
        .unwrap();

        assert_eq!(out.samples.len(), 10);
        for s in &out.samples {
            assert!(!input.contains(s));
            assert!(s.image_path.starts_with(dir.path()));
        }
        let blur = out.samples.iter().filter(|s| s.label == "blur").count();
        assert_eq!(blur, 6);
        assert_eq!(codec.saved.lock().unwrap().len(), 10);
    }

    #[test]
    fn test_corrupt_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let input = samples();
        let codec = MemoryCodec::with_sources(&input[1..]);
        let out = augment(
            &input,
            &DataAugmentationOptions::enabled(),
            dir.path(),
            &codec,
            AugmentOverrides::default(),
        )
        .unwrap();
        assert_eq!(out.failed_sources, 1);
        assert_eq!(out.samples.len(), 8);
    }

    #[test]
    fn test_usage_counts_only_applied_operations() {
        let dir = tempfile::tempdir().unwrap();
        let input = samples();
        let codec = MemoryCodec::with_sources(&input);
        let options = DataAugmentationOptions {
            rotation_probability: 1.0,
            horizontal_flip_probability: 0.0,
            enable_vertical_flip: false,
            enable_brightness: false,
            ..DataAugmentationOptions::enabled()
        };
        let out = augment(&input, &options, dir.path(), &codec, AugmentOverrides::default())
            .unwrap();
        assert_eq!(out.usage.get("rotation"), Some(&10));
        assert_eq!(out.usage.get("horizontal_flip"), None);
        assert_eq!(out.usage.get("vertical_flip"), None);
    }

    #[test]
    fn test_deterministic_for_same_seed() {
        let input = samples();
        let codec = MemoryCodec::with_sources(&input);
        let options = DataAugmentationOptions::enabled();
        let dir = tempfile::tempdir().unwrap();
        let a = augment(&input, &options, dir.path(), &codec, AugmentOverrides::default()).unwrap();
        let b = augment(&input, &options, dir.path(), &codec, AugmentOverrides::default()).unwrap();
        assert_eq!(a.samples, b.samples);
        assert_eq!(a.usage, b.usage);
    }

    #[test]
    fn test_overrides_change_copies_and_seed() {
        let input = samples();
        let codec = MemoryCodec::with_sources(&input);
        let dir = tempfile::tempdir().unwrap();
        let options = DataAugmentationOptions::enabled();
        let base = augment(&input, &options, dir.path(), &codec, AugmentOverrides::default()).unwrap();
        let other = augment(
            &input,
            &options,
            dir.path(),
            &codec,
            AugmentOverrides {
                copies_per_sample: Some(1),
                random_seed: Some(7),
            },
        )
        .unwrap();
        assert_eq!(other.samples.len(), 5);
        assert_ne!(base.samples.len(), other.samples.len());
    }

    #[test]
    fn test_flip_horizontal() {
        let flipped = tiny_image().apply(&AugmentationOp::FlipHorizontal);
        assert_eq!(&flipped.pixels[0..4], &[0, 255, 0, 255]);
        assert_eq!(&flipped.pixels[4..8], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_flip_vertical() {
        let flipped = tiny_image().apply(&AugmentationOp::FlipVertical);
        assert_eq!(&flipped.pixels[0..4], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_brightness_clamps_and_keeps_alpha() {
        let bright = tiny_image().apply(&AugmentationOp::Brightness { factor: 2.0 });
        assert_eq!(&bright.pixels[12..16], &[255, 255, 255, 255]);
        let dark = tiny_image().apply(&AugmentationOp::Brightness { factor: 0.5 });
        assert_eq!(&dark.pixels[0..4], &[128, 0, 0, 255]);
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let img = tiny_image();
        assert_eq!(img.apply(&AugmentationOp::Rotate { degrees: 0.0 }), img);
    }

    #[test]
    fn test_rotate_180_on_square() {
        let rotated = tiny_image().apply(&AugmentationOp::Rotate { degrees: 180.0 });
        assert_eq!(&rotated.pixels[0..4], &[255, 255, 255, 255]);
        assert_eq!(&rotated.pixels[12..16], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_decoded_image_rejects_bad_buffer() {
        assert!(DecodedImage::new(2, 2, vec![0; 3]).is_err());
    }

    #[test]
    fn test_file_codec_round_trip_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        ImageFileCodec.save(&tiny_image(), &path).unwrap();
        let loaded = ImageFileCodec.load(&path).unwrap();
        assert_eq!(loaded, tiny_image());
    }
}
