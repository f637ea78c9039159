//! Bone Age Service - async facade over the inference engine
//!
//! Everything CPU/GPU bound runs on the blocking pool so callers on an
//! async runtime are never stalled by a forward or backward pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use image::GenericImageView;
use tracing::info;

use crate::config::Config;
use crate::engine::orchestrator::{InferenceOrchestrator, InferenceResult};
use crate::engine::{preprocess::decode_image, Gender};
use crate::utils::image::png_data_uri;

use super::types::*;

/// Dual-model bone age estimation service
pub struct BoneAgeService {
    orchestrator: Arc<InferenceOrchestrator>,
    config: Config,
}

impl BoneAgeService {
    pub fn new(orchestrator: Arc<InferenceOrchestrator>, config: Config) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Build the orchestrator from `config` and wrap it
    pub fn from_config(config: Config) -> Result<Self> {
        let orchestrator = InferenceOrchestrator::new(&config)?;
        Ok(Self::new(Arc::new(orchestrator), config))
    }

    pub fn orchestrator(&self) -> &Arc<InferenceOrchestrator> {
        &self.orchestrator
    }

    /// Estimate with both gender models, optionally rendering overlays
    pub async fn estimate(&self, image_data: &[u8], with_overlays: bool) -> Result<DualPrediction> {
        let start = Instant::now();

        let image_data = image_data.to_vec();
        let orchestrator = self.orchestrator.clone();
        let alpha = with_overlays.then_some(self.config.render.alpha);

        let (male, female, (image_width, image_height)) = tokio::task::spawn_blocking(move || {
            let image = decode_image(&image_data)?;
            let (male, female) = orchestrator.predict_dual(&image)?;
            let male = to_prediction(&orchestrator, &male, alpha)?;
            let female = to_prediction(&orchestrator, &female, alpha)?;
            Ok::<_, crate::error::BoneAgeError>((male, female, image.dimensions()))
        })
        .await??;

        let inference_time_ms = start.elapsed().as_millis() as u64;
        info!(
            "Bone age estimated in {}ms: male {:.1}y, female {:.1}y",
            inference_time_ms, male.age, female.age
        );

        Ok(DualPrediction {
            male,
            female,
            image_width,
            image_height,
            inference_time_ms,
        })
    }

    /// Estimate with a single gender model
    pub async fn estimate_gender(
        &self,
        image_data: &[u8],
        gender: Gender,
        with_overlay: bool,
    ) -> Result<GenderPrediction> {
        let image_data = image_data.to_vec();
        let orchestrator = self.orchestrator.clone();
        let alpha = with_overlay.then_some(self.config.render.alpha);

        let prediction = tokio::task::spawn_blocking(move || {
            let result = orchestrator.predict_bytes(&image_data, gender)?;
            to_prediction(&orchestrator, &result, alpha)
        })
        .await??;

        Ok(prediction)
    }

    /// Get health status
    pub fn health(&self) -> HealthResult {
        let models_loaded: HashMap<String, bool> = self
            .orchestrator
            .status()
            .into_iter()
            .map(|s| (s.gender.as_str().to_string(), s.loaded))
            .collect();
        let substitutions: HashMap<String, String> = self
            .orchestrator
            .substitutions()
            .into_iter()
            .map(|(requested, served_by)| {
                (requested.as_str().to_string(), served_by.as_str().to_string())
            })
            .collect();

        HealthResult {
            healthy: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            models_loaded,
            substitutions,
        }
    }
}

/// Flatten an engine result, running Grad-CAM and rendering when `alpha` is set
fn to_prediction(
    orchestrator: &InferenceOrchestrator,
    result: &InferenceResult,
    alpha: Option<f32>,
) -> crate::error::Result<GenderPrediction> {
    let overlay_png = match alpha {
        Some(alpha) => {
            let heatmap = orchestrator.explain(result, None)?;
            let rendered = orchestrator.render(&result.original, &heatmap, alpha)?;
            Some(png_data_uri(&rendered)?)
        }
        None => None,
    };

    let estimate = &result.estimate;
    Ok(GenderPrediction {
        gender: result.gender,
        model_used: result.served_by,
        substituted: result.substituted,
        age: estimate.age,
        uncertainty: estimate.uncertainty_sigma,
        age_group: estimate.group,
        age_range: (estimate.range.start, estimate.range.end),
        confidence: estimate.confidence,
        group_logits: result.group_logits.clone(),
        overlay_png,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::orchestrator::testing::config_with;
    use crate::utils::image::encode_png;
    use image::{Rgb, RgbImage};

    fn xray_png() -> Vec<u8> {
        let img = RgbImage::from_fn(96, 128, |x, y| {
            let v = ((x + 2 * y) % 256) as u8;
            Rgb([v, v, v])
        });
        encode_png(&img).unwrap()
    }

    fn service(present: &[Gender]) -> (tempfile::TempDir, BoneAgeService) {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(dir.path(), present);
        let service = BoneAgeService::from_config(config).unwrap();
        (dir, service)
    }

    #[tokio::test]
    async fn test_estimate_with_overlays() {
        let (_dir, service) = service(&[Gender::Male, Gender::Female]);
        let prediction = service.estimate(&xray_png(), true).await.unwrap();

        assert_eq!((prediction.image_width, prediction.image_height), (96, 128));
        for p in [&prediction.male, &prediction.female] {
            assert!(!p.substituted);
            assert!(p.uncertainty >= 0.0);
            assert_eq!(p.group_logits.len(), 4);
            assert!(p
                .overlay_png
                .as_deref()
                .unwrap()
                .starts_with("data:image/png;base64,"));
        }

        let json = serde_json::to_value(&prediction).unwrap();
        assert_eq!(json["male"]["gender"], "male");
        assert_eq!(json["female"]["model_used"], "female");
    }

    #[tokio::test]
    async fn test_estimate_without_overlays_and_fallback() {
        let (_dir, service) = service(&[Gender::Female]);
        let prediction = service.estimate(&xray_png(), false).await.unwrap();

        assert!(prediction.male.substituted);
        assert_eq!(prediction.male.model_used, Gender::Female);
        assert!(prediction.male.overlay_png.is_none());
        let json = serde_json::to_value(&prediction.male).unwrap();
        assert!(json.get("overlay_png").is_none());

        let health = service.health();
        assert!(health.healthy);
        assert_eq!(health.substitutions.get("male").map(String::as_str), Some("female"));
        assert_eq!(health.models_loaded.get("female"), Some(&true));
    }

    #[tokio::test]
    async fn test_estimate_gender_rejects_garbage() {
        let (_dir, service) = service(&[Gender::Male]);
        let err = service
            .estimate_gender(b"\x00\x01\x02", Gender::Male, false)
            .await
            .unwrap_err();
        let engine_err = err.downcast_ref::<crate::error::BoneAgeError>().unwrap();
        assert!(!engine_err.is_fatal());
    }

    #[tokio::test]
    async fn test_health_before_first_request() {
        let (_dir, service) = service(&[Gender::Male, Gender::Female]);
        let health = service.health();
        assert_eq!(health.models_loaded.len(), 2);
        assert!(health.models_loaded.values().all(|loaded| !loaded));
        assert!(health.substitutions.is_empty());
    }
}
