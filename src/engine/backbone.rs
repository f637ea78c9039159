//! Residual convolutional branch
//!
//! ResNet-18 layout with a single-channel stem. Parameter names follow the
//! torchvision `nn.Sequential(*resnet.children())[:-2]` indexing so that
//! exported state dicts bind without renaming:
//!
//! ```text
//! 0 conv1  1 bn1  (2 relu, 3 maxpool)  4..=7 layer1..layer4
//! ```

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

const BN_EPS: f64 = 1e-5;

fn conv_bn(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    conv_vb: VarBuilder,
    bn_vb: VarBuilder,
) -> Result<(Conv2d, BatchNorm)> {
    let cfg = Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    };
    let conv = conv2d_no_bias(in_channels, out_channels, kernel, cfg, conv_vb)?;
    let bn = batch_norm(out_channels, BN_EPS, bn_vb)?;
    Ok((conv, bn))
}

#[derive(Debug)]
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let (conv1, bn1) = conv_bn(
            in_channels,
            out_channels,
            3,
            stride,
            1,
            vb.pp("conv1"),
            vb.pp("bn1"),
        )?;
        let (conv2, bn2) = conv_bn(out_channels, out_channels, 3, 1, 1, vb.pp("conv2"), vb.pp("bn2"))?;

        let downsample = if stride != 1 || in_channels != out_channels {
            let ds = vb.pp("downsample");
            Some(conv_bn(in_channels, out_channels, 1, stride, 0, ds.pp("0"), ds.pp("1"))?)
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, false)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, false)?;
        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, false)?,
            None => xs.clone(),
        };
        (out + identity)?.relu()
    }
}

/// Feature extractor producing a `(1, 8 * base_width, H/32, W/32)` map
#[derive(Debug)]
pub struct ResidualBackbone {
    stem_conv: Conv2d,
    stem_bn: BatchNorm,
    stages: Vec<Vec<BasicBlock>>,
    out_channels: usize,
}

impl ResidualBackbone {
    pub fn new(base_width: usize, vb: VarBuilder) -> Result<Self> {
        let (stem_conv, stem_bn) = conv_bn(1, base_width, 7, 2, 3, vb.pp("0"), vb.pp("1"))?;

        let mut stages = Vec::with_capacity(4);
        let mut in_channels = base_width;
        for (i, multiplier) in [1usize, 2, 4, 8].into_iter().enumerate() {
            let out_channels = base_width * multiplier;
            let stride = if i == 0 { 1 } else { 2 };
            let stage_vb = vb.pp((i + 4).to_string());
            let blocks = vec![
                BasicBlock::new(in_channels, out_channels, stride, stage_vb.pp("0"))?,
                BasicBlock::new(out_channels, out_channels, 1, stage_vb.pp("1"))?,
            ];
            stages.push(blocks);
            in_channels = out_channels;
        }

        Ok(Self {
            stem_conv,
            stem_bn,
            stages,
            out_channels: in_channels,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl Module for ResidualBackbone {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.stem_bn.forward_t(&self.stem_conv.forward(xs)?, false)?.relu()?;
        // 3x3/2 max-pool with padding 1. Inputs are post-ReLU (>= 0) so zero
        // padding never wins the max.
        let xs = xs
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        let mut xs = xs;
        for stage in &self.stages {
            for block in stage {
                xs = block.forward(&xs)?;
            }
        }
        Ok(xs)
    }
}
