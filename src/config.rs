//! Bone age service configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub architecture: ArchitectureConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// "cpu" or "cuda"; CUDA falls back to CPU when unavailable
    pub device: String,
    /// Load both checkpoints at construction instead of on first use
    #[serde(default)]
    pub preload: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub male: PathBuf,
    pub female: PathBuf,
}

/// Layer widths of the fusion network. Defaults are the production
/// ResNet-18 + ViT-B/16 hybrid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ArchitectureConfig {
    pub image_size: usize,
    /// Stem width of the residual branch; the last stage has 8x this
    pub cnn_base_width: usize,
    pub vit_patch_size: usize,
    pub vit_hidden: usize,
    pub vit_layers: usize,
    pub vit_heads: usize,
    pub vit_mlp_dim: usize,
    pub fusion_dim: usize,
    pub num_groups: usize,
    pub uncertainty_outputs: usize,
}

impl ArchitectureConfig {
    /// Channels of the designated (coordinate attention) layer
    pub fn feature_channels(&self) -> usize {
        self.cnn_base_width * 8
    }

    /// Spatial side of the designated layer for a square input
    pub fn feature_size(&self) -> usize {
        // stem conv /2, max-pool /2, three strided stages /8
        self.image_size / 32
    }
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            cnn_base_width: 64,
            vit_patch_size: 16,
            vit_hidden: 768,
            vit_layers: 12,
            vit_heads: 12,
            vit_mlp_dim: 3072,
            fusion_dim: 256,
            num_groups: 4,
            uncertainty_outputs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub alpha: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { alpha: 0.4 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inference: InferenceConfig {
                device: "cpu".to_string(),
                preload: false,
            },
            models: ModelsConfig {
                male: PathBuf::from("models/male_boneage.safetensors"),
                female: PathBuf::from("models/female_boneage.safetensors"),
            },
            architecture: ArchitectureConfig::default(),
            render: RenderConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [inference]
            device = "cpu"

            [models]
            male = "weights/male.safetensors"
            female = "weights/female.safetensors"
            "#,
        )
        .unwrap();

        assert!(!config.inference.preload);
        assert_eq!(config.models.male, PathBuf::from("weights/male.safetensors"));
        assert_eq!(config.architecture, ArchitectureConfig::default());
        assert!((config.render.alpha - 0.4).abs() < 1e-6);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_architecture_override() {
        let config: Config = toml::from_str(
            r#"
            [inference]
            device = "cuda"
            preload = true

            [models]
            male = "m.safetensors"
            female = "f.safetensors"

            [architecture]
            vit_layers = 2
            "#,
        )
        .unwrap();

        assert!(config.inference.preload);
        assert_eq!(config.architecture.vit_layers, 2);
        assert_eq!(config.architecture.vit_hidden, 768);
    }

    #[test]
    fn test_default_feature_geometry() {
        let arch = ArchitectureConfig::default();
        assert_eq!(arch.feature_channels(), 512);
        assert_eq!(arch.feature_size(), 7);
    }
}
