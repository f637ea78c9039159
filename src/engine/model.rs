//! Feature fusion model
//!
//! Two branches read the same normalized X-ray:
//! - a residual CNN followed by a coordinate-attention gate (the designated
//!   explainability layer), globally pooled to a feature vector
//! - a ViT over the input replicated to three channels
//!
//! The concatenated vectors are projected by `fc` and read by two heads:
//! `grp` (age-group logits) and `unc` (uncertainty logits).

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, linear, ops::sigmoid, Conv2d, Linear, VarBuilder};

use super::backbone::ResidualBackbone;
use super::vit::VisionTransformer;
use crate::config::ArchitectureConfig;
use crate::error::{BoneAgeError, Result};

/// Channel gate: `x * sigmoid(conv1x1(avgpool(x)))`
#[derive(Debug)]
pub struct CoordAttention {
    conv: Conv2d,
}

impl CoordAttention {
    pub fn new(channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv = conv2d(channels, channels, 1, Default::default(), vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for CoordAttention {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let descriptor = xs.mean_keepdim((2, 3))?;
        let gate = sigmoid(&self.conv.forward(&descriptor)?)?;
        xs.broadcast_mul(&gate)
    }
}

/// Raw outputs of one forward pass
#[derive(Debug, Clone)]
pub struct FusionOutput {
    /// `(1, num_groups)`
    pub group_logits: Tensor,
    /// `(1, uncertainty_outputs)`
    pub uncertainty_logits: Tensor,
}

/// Dual-branch CNN + transformer network
#[derive(Debug)]
pub struct FeatureFusionModel {
    cnn: ResidualBackbone,
    ca: CoordAttention,
    vit: VisionTransformer,
    fc: Linear,
    grp: Linear,
    unc: Linear,
    arch: ArchitectureConfig,
}

impl FeatureFusionModel {
    /// Bind the architecture to weights. Missing tensors or tensors of the
    /// wrong shape fail here.
    pub fn new(arch: &ArchitectureConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let cnn = ResidualBackbone::new(arch.cnn_base_width, vb.pp("cnn"))?;
        let channels = cnn.out_channels();
        let ca = CoordAttention::new(channels, vb.pp("ca"))?;
        let vit = VisionTransformer::new(arch, vb.pp("vit"))?;
        let fc = linear(channels + vit.hidden(), arch.fusion_dim, vb.pp("fc"))?;
        let grp = linear(arch.fusion_dim, arch.num_groups, vb.pp("grp"))?;
        let unc = linear(arch.fusion_dim, arch.uncertainty_outputs, vb.pp("unc"))?;

        Ok(Self {
            cnn,
            ca,
            vit,
            fc,
            grp,
            unc,
            arch: arch.clone(),
        })
    }

    pub fn architecture(&self) -> &ArchitectureConfig {
        &self.arch
    }

    /// Full inference pass
    pub fn forward(&self, input: &Tensor) -> Result<FusionOutput> {
        self.check_input(input)?;
        let gated = self.gated_features(input)?;
        let global = self.global_features(input)?;
        self.heads(&gated, &global)
    }

    /// Output of the coordinate-attention gate, `(1, C, h, w)`
    pub fn gated_features(&self, input: &Tensor) -> Result<Tensor> {
        let features = self.cnn.forward(input)?;
        let gated = self.ca.forward(&features)?;
        let side = self.arch.feature_size();
        check_shape(
            "coordinate attention",
            &gated,
            &[1, self.arch.feature_channels(), side, side],
        )?;
        Ok(gated)
    }

    /// Transformer representation, `(1, hidden)`
    pub fn global_features(&self, input: &Tensor) -> Result<Tensor> {
        let rgb = input.repeat((1, 3, 1, 1))?;
        let global = self.vit.forward(&rgb)?;
        check_shape("transformer branch", &global, &[1, self.arch.vit_hidden])?;
        Ok(global)
    }

    /// Pool the gated map, fuse with the transformer vector and run both heads
    pub fn heads(&self, gated: &Tensor, global: &Tensor) -> Result<FusionOutput> {
        let pooled = gated.mean_keepdim((2, 3))?.flatten_from(1)?;
        let fused = self.fc.forward(&Tensor::cat(&[&pooled, global], 1)?)?;
        let group_logits = self.grp.forward(&fused)?;
        let uncertainty_logits = self.unc.forward(&fused)?;

        check_shape("grp head", &group_logits, &[1, self.arch.num_groups])?;
        check_shape(
            "unc head",
            &uncertainty_logits,
            &[1, self.arch.uncertainty_outputs],
        )?;

        Ok(FusionOutput {
            group_logits,
            uncertainty_logits,
        })
    }

    /// Inputs must be exactly `(1, 1, S, S)`
    pub fn check_input(&self, input: &Tensor) -> Result<()> {
        let s = self.arch.image_size;
        check_shape("model input", input, &[1, 1, s, s])
    }
}

fn check_shape(operation: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() != expected {
        return Err(BoneAgeError::shape_mismatch(
            operation,
            expected.to_vec(),
            tensor.dims().to_vec(),
        ));
    }
    Ok(())
}

/// Small architecture that keeps test passes fast
#[cfg(test)]
pub(crate) fn tiny_architecture() -> ArchitectureConfig {
    ArchitectureConfig {
        cnn_base_width: 4,
        vit_hidden: 16,
        vit_layers: 1,
        vit_heads: 2,
        vit_mlp_dim: 32,
        fusion_dim: 8,
        ..Default::default()
    }
}
