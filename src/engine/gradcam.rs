//! Grad-CAM over the coordinate-attention output
//!
//! The activations of the designated layer are captured as a fresh leaf
//! [`Var`], the heads are re-run from that leaf, and the gradient of the
//! target logit is read back from the returned gradient store. Nothing is
//! stored on the model, so captures from different calls cannot mix.
//!
//! The transformer branch is detached: it contributes to the logits but no
//! gradient flows back into it.

use candle_core::{IndexOp, Tensor, Var};
use ndarray::Array2;
use tracing::debug;

use super::model::FeatureFusionModel;
use crate::error::{BoneAgeError, Result};
use crate::utils::math::argmax;

/// Denominator floor of the min-max normalization
pub const NORMALIZE_EPS: f32 = 1e-8;

/// Activations and gradients of the designated layer for one pass
#[derive(Debug, Clone)]
pub struct GradCapture {
    /// `(1, C, h, w)`
    pub activations: Tensor,
    /// `(1, C, h, w)`, d(target logit)/d(activations)
    pub gradients: Tensor,
    /// Group index the gradients were taken for
    pub target: usize,
}

/// Saliency map at the designated layer's resolution, values in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    values: Array2<f32>,
}

impl Heatmap {
    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn height(&self) -> usize {
        self.values.nrows()
    }

    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    pub fn get(&self, y: usize, x: usize) -> Option<f32> {
        self.values.get((y, x)).copied()
    }

    pub fn max(&self) -> f32 {
        self.values.iter().cloned().fold(0.0, f32::max)
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.values
    }
}

/// Forward + backward pass recording the designated layer.
///
/// `target` selects the group logit to explain; `None` uses the predicted
/// group (lowest index on ties).
pub fn capture(
    model: &FeatureFusionModel,
    input: &Tensor,
    target: Option<usize>,
) -> Result<GradCapture> {
    model.check_input(input)?;
    let gated = model.gated_features(input)?;
    let global = model.global_features(input)?.detach();

    let leaf = Var::from_tensor(&gated)?;
    let output = model.heads(leaf.as_tensor(), &global)?;

    let logits = output.group_logits.flatten_all()?.to_vec1::<f32>()?;
    let target = match target {
        Some(t) if t < logits.len() => t,
        Some(t) => {
            return Err(BoneAgeError::invalid_argument(
                "target",
                format!("group {} outside 0..{}", t, logits.len()),
            ))
        }
        None => argmax(&logits)
            .ok_or_else(|| BoneAgeError::Invariant("group logits are all NaN".to_string()))?,
    };
    debug!("Grad-CAM target group {} (logits {:?})", target, logits);

    let grads = output.group_logits.i((0, target))?.backward()?;
    let gradients = grads.get(leaf.as_tensor()).cloned().ok_or_else(|| {
        BoneAgeError::Invariant("no gradient reached the coordinate attention output".to_string())
    })?;

    Ok(GradCapture {
        activations: leaf.as_tensor().detach(),
        gradients,
        target,
    })
}

/// Weight each channel by its mean gradient, sum, clamp negatives and
/// min-max normalize
pub fn heatmap_from_capture(capture: &GradCapture) -> Result<Heatmap> {
    let dims = capture.activations.dims();
    if dims.len() != 4 || dims[0] != 1 || capture.gradients.dims() != dims {
        return Err(BoneAgeError::shape_mismatch(
            "grad-cam capture",
            dims.to_vec(),
            capture.gradients.dims().to_vec(),
        ));
    }
    let (h, w) = (dims[2], dims[3]);

    let weights = capture.gradients.mean_keepdim((2, 3))?;
    let cam = capture
        .activations
        .broadcast_mul(&weights)?
        .sum((0, 1))?
        .relu()?;
    let raw = cam.flatten_all()?.to_vec1::<f32>()?;
    let cam = Array2::from_shape_vec((h, w), raw)
        .map_err(|e| BoneAgeError::Invariant(format!("heatmap layout: {}", e)))?;

    let min = cam.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = cam.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let values = cam.mapv(|v| (v - min) / (max - min + NORMALIZE_EPS));

    Ok(Heatmap { values })
}

/// Heatmap for one input. Callers sharing a model across threads must
/// serialize calls per model instance.
pub fn generate(
    model: &FeatureFusionModel,
    input: &Tensor,
    target: Option<usize>,
) -> Result<Heatmap> {
    let capture = capture(model, input, target)?;
    heatmap_from_capture(&capture)
}
