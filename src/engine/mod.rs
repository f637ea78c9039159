//! Inference engine module
//!
//! Provides candle-based bone age inference with:
//! - Lazily loaded, gender-keyed model pool with checkpoint fallback
//! - Dual-branch residual CNN + ViT fusion network
//! - Grad-CAM explainability and heatmap overlays

pub mod backbone;
pub mod checkpoint;
pub mod decoder;
pub mod gradcam;
pub mod model;
pub mod orchestrator;
pub mod overlay;
pub mod pool;
pub mod preprocess;
pub mod vit;

pub use decoder::AgeEstimate;
pub use gradcam::Heatmap;
pub use model::FeatureFusionModel;
pub use orchestrator::{InferenceOrchestrator, InferenceResult};
pub use pool::{Gender, ModelPool};
