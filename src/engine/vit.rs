//! Transformer branch (ViT-B/16 layout)
//!
//! Mirrors torchvision's `vit_b_16` with the classification head removed:
//! the class-token embedding after the final LayerNorm is the branch output.

use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{
    conv2d, layer_norm, linear, ops::softmax_last_dim, Conv2d, Conv2dConfig, Init, LayerNorm,
    Linear, VarBuilder,
};

use crate::config::ArchitectureConfig;

const LN_EPS: f64 = 1e-6;

#[derive(Debug)]
struct SelfAttention {
    in_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(hidden: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if hidden % num_heads != 0 {
            candle_core::bail!("hidden size {hidden} not divisible by {num_heads} heads");
        }
        // nn.MultiheadAttention packs q, k and v into one projection
        let weight = vb.get_with_hints(
            (3 * hidden, hidden),
            "in_proj_weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(3 * hidden, "in_proj_bias", Init::Const(0.))?;
        Ok(Self {
            in_proj: Linear::new(weight, Some(bias)),
            out_proj: linear(hidden, hidden, vb.pp("out_proj"))?,
            num_heads,
            head_dim: hidden / num_heads,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, hidden) = xs.dims3()?;
        let qkv = self
            .in_proj
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let weights = softmax_last_dim(&scores)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, hidden))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug)]
struct EncoderBlock {
    ln_1: LayerNorm,
    attention: SelfAttention,
    ln_2: LayerNorm,
    mlp_fc1: Linear,
    mlp_fc2: Linear,
}

impl EncoderBlock {
    fn new(arch: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = arch.vit_hidden;
        Ok(Self {
            ln_1: layer_norm(hidden, LN_EPS, vb.pp("ln_1"))?,
            attention: SelfAttention::new(hidden, arch.vit_heads, vb.pp("self_attention"))?,
            ln_2: layer_norm(hidden, LN_EPS, vb.pp("ln_2"))?,
            mlp_fc1: linear(hidden, arch.vit_mlp_dim, vb.pp("mlp.0"))?,
            mlp_fc2: linear(arch.vit_mlp_dim, hidden, vb.pp("mlp.3"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = (self.attention.forward(&self.ln_1.forward(xs)?)? + residual)?;
        let mlp = self
            .mlp_fc2
            .forward(&self.mlp_fc1.forward(&self.ln_2.forward(&xs)?)?.gelu_erf()?)?;
        mlp + xs
    }
}

/// Patch-based self-attention extractor
#[derive(Debug)]
pub struct VisionTransformer {
    conv_proj: Conv2d,
    class_token: Tensor,
    pos_embedding: Tensor,
    layers: Vec<EncoderBlock>,
    ln: LayerNorm,
    hidden: usize,
}

impl VisionTransformer {
    pub fn new(arch: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = arch.vit_hidden;
        let patches = (arch.image_size / arch.vit_patch_size).pow(2);
        let proj_cfg = Conv2dConfig {
            stride: arch.vit_patch_size,
            ..Default::default()
        };
        let conv_proj = conv2d(3, hidden, arch.vit_patch_size, proj_cfg, vb.pp("conv_proj"))?;

        let embed_init = Init::Randn {
            mean: 0.,
            stdev: 0.02,
        };
        let class_token = vb.get_with_hints((1, 1, hidden), "class_token", embed_init)?;

        let encoder = vb.pp("encoder");
        let pos_embedding =
            encoder.get_with_hints((1, patches + 1, hidden), "pos_embedding", embed_init)?;

        let layers_vb = encoder.pp("layers");
        let layers = (0..arch.vit_layers)
            .map(|i| EncoderBlock::new(arch, layers_vb.pp(format!("encoder_layer_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln = layer_norm(hidden, LN_EPS, encoder.pp("ln"))?;

        Ok(Self {
            conv_proj,
            class_token,
            pos_embedding,
            layers,
            ln,
            hidden,
        })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }
}

impl Module for VisionTransformer {
    /// Expects a 3-channel `(B, 3, H, W)` input; returns `(B, hidden)`
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let b = xs.dim(0)?;
        let patches = self.conv_proj.forward(xs)?.flatten_from(2)?.transpose(1, 2)?;
        let class_token = self.class_token.broadcast_as((b, 1, self.hidden))?.contiguous()?;
        let mut xs = Tensor::cat(&[&class_token, &patches], 1)?
            .broadcast_add(&self.pos_embedding)?;

        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        let xs = self.ln.forward(&xs)?;
        xs.i((.., 0))?.contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_arch() -> ArchitectureConfig {
        ArchitectureConfig {
            vit_hidden: 16,
            vit_layers: 2,
            vit_heads: 2,
            vit_mlp_dim: 32,
            ..Default::default()
        }
    }

    #[test]
    fn test_class_token_readout_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let vit = VisionTransformer::new(&tiny_arch(), vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (1, 3, 224, 224), &Device::Cpu).unwrap();
        let out = vit.forward(&xs).unwrap();
        assert_eq!(out.dims(), &[1, 16]);
    }

    #[test]
    fn test_torchvision_parameter_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        VisionTransformer::new(&tiny_arch(), vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in [
            "conv_proj.weight",
            "conv_proj.bias",
            "class_token",
            "encoder.pos_embedding",
            "encoder.layers.encoder_layer_0.self_attention.in_proj_weight",
            "encoder.layers.encoder_layer_1.self_attention.out_proj.weight",
            "encoder.layers.encoder_layer_1.mlp.3.bias",
            "encoder.ln.weight",
        ] {
            assert!(data.contains_key(name), "missing {}", name);
        }
        assert_eq!(data["encoder.pos_embedding"].as_tensor().dims(), &[1, 197, 16]);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let arch = ArchitectureConfig {
            vit_heads: 3,
            ..tiny_arch()
        };
        assert!(VisionTransformer::new(&arch, vb).is_err());
    }
}
