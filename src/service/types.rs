//! Service layer types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::Gender;

/// Estimate from one gender model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenderPrediction {
    pub gender: Gender,
    /// Gender of the checkpoint that produced this estimate
    pub model_used: Gender,
    pub substituted: bool,
    pub age: f32,
    pub uncertainty: f32,
    pub age_group: usize,
    pub age_range: (f32, f32),
    pub confidence: f32,
    pub group_logits: Vec<f32>,
    /// PNG data URI of the Grad-CAM overlay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_png: Option<String>,
}

/// Both gender estimates for one X-ray
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualPrediction {
    pub male: GenderPrediction,
    pub female: GenderPrediction,
    pub image_width: u32,
    pub image_height: u32,
    pub inference_time_ms: u64,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub version: String,
    pub models_loaded: HashMap<String, bool>,
    /// Requested gender to the gender serving it, only for substitutions
    pub substitutions: HashMap<String, String>,
}
