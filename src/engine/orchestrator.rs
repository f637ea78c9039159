//! Inference orchestrator
//!
//! Owns the model pool and runs the per-gender pipeline:
//! preprocess, forward, decode, and on request Grad-CAM plus overlay.
//! Forward passes run concurrently; explain passes are serialized per
//! loaded model.

use std::sync::Arc;
use std::time::Instant;

use candle_core::{Device, Tensor};
use image::{DynamicImage, RgbImage};
use tracing::{debug, info};

use super::decoder::{self, AgeEstimate, AGE_GROUPS};
use super::gradcam::{self, Heatmap};
use super::overlay;
use super::pool::{Gender, ModelPool, SlotStatus};
use super::preprocess;
use crate::config::{ArchitectureConfig, Config};
use crate::error::{BoneAgeError, Result};

/// Outcome of one forward pass
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Gender the caller asked for
    pub gender: Gender,
    /// Gender whose checkpoint produced the result
    pub served_by: Gender,
    pub substituted: bool,
    pub estimate: AgeEstimate,
    pub group_logits: Vec<f32>,
    pub uncertainty_logits: Vec<f32>,
    /// Normalized `(1, 1, 224, 224)` input, reused by explain
    pub input: Tensor,
    /// Single-channel original at full resolution, used for rendering
    pub original: Arc<DynamicImage>,
}

impl InferenceResult {
    pub fn age(&self) -> f32 {
        self.estimate.age
    }

    pub fn uncertainty_sigma(&self) -> f32 {
        self.estimate.uncertainty_sigma
    }
}

/// Map the configured device name to a candle device
pub fn select_device(name: &str) -> Result<Device> {
    match name.to_ascii_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => {
            let device = Device::cuda_if_available(0)?;
            if device.is_cpu() {
                info!("CUDA not available, running on CPU");
            }
            Ok(device)
        }
        other => Err(BoneAgeError::invalid_argument(
            "inference.device",
            format!("unknown device '{}'", other),
        )),
    }
}

/// Reject architectures the preprocessing and decoding stages cannot serve
pub fn check_architecture(arch: &ArchitectureConfig) -> Result<()> {
    if arch.image_size != preprocess::INPUT_SIZE as usize {
        return Err(BoneAgeError::invalid_config(
            "architecture.image_size",
            format!(
                "{} does not match the preprocessed input size {}",
                arch.image_size,
                preprocess::INPUT_SIZE
            ),
        ));
    }
    if arch.num_groups != AGE_GROUPS.len() {
        return Err(BoneAgeError::invalid_config(
            "architecture.num_groups",
            format!("{} does not match the {} age groups", arch.num_groups, AGE_GROUPS.len()),
        ));
    }
    if arch.uncertainty_outputs < 1 {
        return Err(BoneAgeError::invalid_config(
            "architecture.uncertainty_outputs",
            "at least one output is required",
        ));
    }
    Ok(())
}

pub struct InferenceOrchestrator {
    pool: ModelPool,
}

impl InferenceOrchestrator {
    /// Resolve checkpoints and, if configured, load them immediately
    pub fn new(config: &Config) -> Result<Self> {
        check_architecture(&config.architecture)?;
        let device = select_device(&config.inference.device)?;
        let pool = ModelPool::new(&config.models, &config.architecture, device)?;
        let orchestrator = Self { pool };

        if config.inference.preload {
            orchestrator.preload()?;
        }
        info!(
            "Inference orchestrator ready on {:?} (male <- {}, female <- {})",
            orchestrator.pool.device(),
            orchestrator.pool.served_by(Gender::Male),
            orchestrator.pool.served_by(Gender::Female)
        );
        Ok(orchestrator)
    }

    pub fn preload(&self) -> Result<()> {
        self.pool.preload()
    }

    pub fn device(&self) -> &Device {
        self.pool.device()
    }

    /// Forward-only inference for one gender
    pub fn predict(&self, image: &DynamicImage, gender: Gender) -> Result<InferenceResult> {
        let original = Arc::new(DynamicImage::ImageLuma8(preprocess::to_grayscale(image)?));
        self.predict_shared(original, gender)
    }

    /// Decode bytes, then [`predict`](Self::predict)
    pub fn predict_bytes(&self, data: &[u8], gender: Gender) -> Result<InferenceResult> {
        let image = preprocess::decode_image(data)?;
        self.predict(&image, gender)
    }

    /// Run both gender models on the same image
    pub fn predict_dual(&self, image: &DynamicImage) -> Result<(InferenceResult, InferenceResult)> {
        let original = Arc::new(DynamicImage::ImageLuma8(preprocess::to_grayscale(image)?));
        let male = self.predict_shared(Arc::clone(&original), Gender::Male)?;
        let female = self.predict_shared(original, Gender::Female)?;
        Ok((male, female))
    }

    fn predict_shared(&self, original: Arc<DynamicImage>, gender: Gender) -> Result<InferenceResult> {
        let start = Instant::now();
        let loaded = self.pool.get(gender)?;
        let input = preprocess::normalize(&original, self.pool.device())?;
        let output = loaded.model.forward(&input)?;

        let group_logits = output.group_logits.flatten_all()?.to_vec1::<f32>()?;
        let uncertainty_logits = output.uncertainty_logits.flatten_all()?.to_vec1::<f32>()?;
        let estimate = decoder::decode(&group_logits, &uncertainty_logits)?;

        debug!(
            "{} prediction in {:?}: group logits {:?}, uncertainty logits {:?}",
            gender,
            start.elapsed(),
            group_logits,
            uncertainty_logits
        );

        Ok(InferenceResult {
            gender,
            served_by: self.pool.served_by(gender),
            substituted: self.pool.is_substituted(gender),
            estimate,
            group_logits,
            uncertainty_logits,
            input,
            original,
        })
    }

    /// Grad-CAM for a previous prediction, on the model that produced it
    pub fn explain(&self, result: &InferenceResult, target: Option<usize>) -> Result<Heatmap> {
        self.explain_tensor(&result.input, result.gender, target)
    }

    /// Grad-CAM for a normalized input tensor
    pub fn explain_tensor(
        &self,
        input: &Tensor,
        gender: Gender,
        target: Option<usize>,
    ) -> Result<Heatmap> {
        let loaded = self.pool.get(gender)?;
        let _guard = loaded.lock_explain();
        gradcam::generate(&loaded.model, input, target)
    }

    /// Overlay a heatmap on the original image
    pub fn render(&self, original: &DynamicImage, heatmap: &Heatmap, alpha: f32) -> Result<RgbImage> {
        overlay::overlay(original, heatmap, alpha)
    }

    /// Per-gender load state
    pub fn status(&self) -> Vec<SlotStatus> {
        self.pool.get_status()
    }

    /// `(requested, served_by)` for every substituted gender
    pub fn substitutions(&self) -> Vec<(Gender, Gender)> {
        Gender::ALL
            .iter()
            .filter(|g| self.pool.is_substituted(**g))
            .map(|&g| (g, self.pool.served_by(g)))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::config_with;
    use super::*;
    use crate::engine::checkpoint::{save_checkpoint, testing::random_tensors};
    use crate::engine::model::tiny_architecture;
    use crate::error::ErrorKind;
    use image::{GrayImage, Luma};

    fn gradient_image(width: u32, height: u32, phase: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
            Luma([((x * 7 + y * 3 + phase) % 256) as u8])
        }))
    }

    #[test]
    fn test_uniform_gray_male_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            InferenceOrchestrator::new(&config_with(dir.path(), &[Gender::Male, Gender::Female]))
                .unwrap();
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(512, 512, Luma([128])));

        let result = orchestrator.predict(&image, Gender::Male).unwrap();
        assert!(!result.substituted);
        assert!(AGE_GROUPS.iter().any(|r| r.midpoint() == result.age()));
        assert!(result.uncertainty_sigma().is_finite() && result.uncertainty_sigma() >= 0.0);
        assert_eq!(result.input.dims(), &[1, 1, 224, 224]);

        let heatmap = orchestrator.explain(&result, None).unwrap();
        assert_eq!((heatmap.height(), heatmap.width()), (7, 7));
        assert!(heatmap.values().iter().all(|v| (0.0..=1.0).contains(v)));

        let rendered = orchestrator
            .render(&result.original, &heatmap, overlay::DEFAULT_ALPHA)
            .unwrap();
        assert_eq!(rendered.dimensions(), (512, 512));
    }

    #[test]
    fn test_predict_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            InferenceOrchestrator::new(&config_with(dir.path(), &[Gender::Male])).unwrap();
        let image = gradient_image(300, 400, 0);

        let a = orchestrator.predict(&image, Gender::Male).unwrap();
        let b = orchestrator.predict(&image, Gender::Male).unwrap();
        assert_eq!(a.group_logits, b.group_logits);
        assert_eq!(a.uncertainty_logits, b.uncertainty_logits);
        assert_eq!(a.estimate, b.estimate);
    }

    #[test]
    fn test_missing_female_is_served_by_male() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            InferenceOrchestrator::new(&config_with(dir.path(), &[Gender::Male])).unwrap();
        assert_eq!(orchestrator.substitutions(), vec![(Gender::Female, Gender::Male)]);

        let image = gradient_image(128, 160, 5);
        let (male, female) = orchestrator.predict_dual(&image).unwrap();
        assert!(!male.substituted);
        assert!(female.substituted);
        assert_eq!(female.gender, Gender::Female);
        assert_eq!(female.served_by, Gender::Male);
        assert_eq!(male.group_logits, female.group_logits);
        assert!(Arc::ptr_eq(&male.original, &female.original));
    }

    #[test]
    fn test_missing_checkpoints_fail_construction() {
        let dir = tempfile::tempdir().unwrap();
        let err = InferenceOrchestrator::new(&config_with(dir.path(), &[]))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Initialization);
    }

    #[test]
    fn test_corrupt_checkpoint_blocks_every_gender() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(dir.path(), &[Gender::Male]);
        std::fs::write(&config.models.female, b"corrupt").unwrap();

        let err = InferenceOrchestrator::new(&config).err().unwrap();
        assert!(matches!(err, BoneAgeError::CheckpointFormat { .. }));
        assert_eq!(err.kind(), ErrorKind::Initialization);
    }

    #[test]
    fn test_unservable_architecture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with(dir.path(), &[]);
        config.architecture.num_groups = 5;
        let five_way = config.architecture.clone();
        save_checkpoint(&random_tensors(&five_way), Some(Gender::Male), &config.models.male)
            .unwrap();
        config.inference.preload = true;

        let err = InferenceOrchestrator::new(&config).err().unwrap();
        assert!(matches!(err, BoneAgeError::InvalidConfig { .. }));
        assert!(err.is_fatal());

        let resized = ArchitectureConfig {
            image_size: 256,
            ..tiny_architecture()
        };
        assert!(check_architecture(&resized).is_err());
        let no_uncertainty = ArchitectureConfig {
            uncertainty_outputs: 0,
            ..tiny_architecture()
        };
        assert!(check_architecture(&no_uncertainty).is_err());
        assert!(check_architecture(&tiny_architecture()).is_ok());
    }

    #[test]
    fn test_preload_marks_models_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with(dir.path(), &[Gender::Female]);
        config.inference.preload = true;
        let orchestrator = InferenceOrchestrator::new(&config).unwrap();
        assert!(orchestrator.status().iter().all(|s| s.loaded));
    }

    #[test]
    fn test_malformed_bytes_are_input_errors() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            InferenceOrchestrator::new(&config_with(dir.path(), &[Gender::Male])).unwrap();
        let err = orchestrator
            .predict_bytes(b"definitely not an image", Gender::Male)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        assert!(select_device("tpu").is_err());
        assert!(select_device("CPU").unwrap().is_cpu());
    }

    #[test]
    fn test_concurrent_explains_do_not_mix() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(dir.path(), &[]);

        // Non-negative fusion and head weights make every channel weight
        // positive, so no heatmap collapses to zero under the ReLU
        let mut tensors = random_tensors(&config.architecture);
        for name in ["fc.weight", "grp.weight"] {
            let positive = tensors[name].abs().unwrap();
            tensors.insert(name.to_string(), positive);
        }
        save_checkpoint(&tensors, Some(Gender::Male), &config.models.male).unwrap();
        let orchestrator = InferenceOrchestrator::new(&config).unwrap();

        let inputs: Vec<InferenceResult> = (0..4)
            .map(|i| {
                orchestrator
                    .predict(&gradient_image(200, 260, i * 40), Gender::Male)
                    .unwrap()
            })
            .collect();
        let sequential: Vec<Heatmap> = inputs
            .iter()
            .map(|r| orchestrator.explain(r, None).unwrap())
            .collect();
        for (i, a) in sequential.iter().enumerate() {
            assert!(a.max() > 0.0);
            for b in &sequential[i + 1..] {
                assert_ne!(a, b);
            }
        }

        let concurrent: Vec<Heatmap> = std::thread::scope(|scope| {
            let handles: Vec<_> = inputs
                .iter()
                .map(|r| {
                    let orchestrator = &orchestrator;
                    scope.spawn(move || orchestrator.explain(r, None).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(sequential, concurrent);
    }
}
