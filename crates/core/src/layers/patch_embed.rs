use candle_core::{Result, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, Init, Module, VarBuilder};

use crate::config::PartVitConfig;

/// Per-sample instance normalization over the spatial dims, affine.
struct InstanceNorm2d {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl InstanceNorm2d {
    fn new(channels: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(channels, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(channels, "bias", Init::Const(0.0))?,
            eps,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let c = xs.dim(1)?;
        let mean = xs.mean_keepdim(3)?.mean_keepdim(2)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(3)?.mean_keepdim(2)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight.reshape((1, c, 1, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }
}

/// Channel batch normalization for `[B, C, H, W]`. Running statistics are
/// loaded from checkpoints, not re-estimated: training normalizes with batch
/// statistics, inference with the stored ones.
struct BatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    eps: f64,
}

impl BatchNorm2d {
    fn new(channels: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(channels, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(channels, "bias", Init::Const(0.0))?,
            running_mean: vb.get_with_hints(channels, "running_mean", Init::Const(0.0))?,
            running_var: vb.get_with_hints(channels, "running_var", Init::Const(1.0))?,
            eps,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let c = xs.dim(1)?;
        let (mean, var) = if train {
            let mean = xs.mean_keepdim(3)?.mean_keepdim(2)?.mean_keepdim(0)?;
            let centered = xs.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim(3)?.mean_keepdim(2)?.mean_keepdim(0)?;
            (mean, var)
        } else {
            (
                self.running_mean.reshape((1, c, 1, 1))?,
                self.running_var.reshape((1, c, 1, 1))?,
            )
        };
        let normed = xs
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight.reshape((1, c, 1, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }
}

/// Half-instance / half-batch normalization: the lower half of the channels
/// is instance-normalized per sample, the upper half batch-normalized, and
/// the halves are concatenated back.
struct Ibn {
    inorm: InstanceNorm2d,
    bnorm: BatchNorm2d,
    half: usize,
}

impl Ibn {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let half = channels / 2;
        Ok(Self {
            inorm: InstanceNorm2d::new(half, 1e-5, vb.pp("IN"))?,
            bnorm: BatchNorm2d::new(channels - half, 1e-5, vb.pp("BN"))?,
            half,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let c = xs.dim(1)?;
        let lo = self.inorm.forward(&xs.narrow(1, 0, self.half)?.contiguous()?)?;
        let hi = self
            .bnorm
            .forward_t(&xs.narrow(1, self.half, c - self.half)?.contiguous()?, train)?;
        Tensor::cat(&[&lo, &hi], 1)
    }
}

/// `[B, D, gh, gw]` conv features -> `[B, gh*gw, D]` row-major patch tokens.
fn flatten_patches(xs: &Tensor) -> Result<Tensor> {
    xs.flatten(2, 3)?.transpose(1, 2)?.contiguous()
}

/// Non-overlapping strided patch projection. Rejects inputs whose size
/// differs from the configured resolution.
pub struct PlainPatchEmbed {
    proj: Conv2d,
    img_size: (usize, usize),
}

impl PlainPatchEmbed {
    fn new(cfg: &PartVitConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        Ok(Self {
            proj: conv2d(
                cfg.in_chans,
                cfg.embed_dim,
                cfg.patch_size,
                conv_cfg,
                vb.pp("proj"),
            )?,
            img_size: cfg.img_size,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.dims4()?;
        if (h, w) != self.img_size {
            candle_core::bail!(
                "input image size {h}x{w} doesn't match model ({}x{})",
                self.img_size.0,
                self.img_size.1
            );
        }
        flatten_patches(&self.proj.forward(xs)?)
    }
}

/// Three-conv stem (7x7 strided, then two 3x3) with IBN after the first two
/// convs and plain batch norm after the third, followed by the patch
/// projection at stride `patch_size / stem_stride`.
pub struct StemPatchEmbed {
    conv1: Conv2d,
    ibn1: Ibn,
    conv2: Conv2d,
    ibn2: Ibn,
    conv3: Conv2d,
    bn: BatchNorm2d,
    proj: Conv2d,
}

impl StemPatchEmbed {
    fn new(cfg: &PartVitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.stem_hidden_dim;
        let seq = vb.pp("conv");
        let c7 = Conv2dConfig {
            stride: cfg.stem_stride,
            padding: 3,
            ..Default::default()
        };
        let c3 = Conv2dConfig {
            stride: 1,
            padding: 1,
            ..Default::default()
        };
        let proj_k = cfg.patch_size / cfg.stem_stride;
        let proj_cfg = Conv2dConfig {
            stride: proj_k,
            ..Default::default()
        };
        Ok(Self {
            conv1: conv2d_no_bias(cfg.in_chans, hidden, 7, c7, seq.pp(0))?,
            ibn1: Ibn::new(hidden, seq.pp(1))?,
            conv2: conv2d_no_bias(hidden, hidden, 3, c3, seq.pp(3))?,
            ibn2: Ibn::new(hidden, seq.pp(4))?,
            conv3: conv2d_no_bias(hidden, hidden, 3, c3, seq.pp(6))?,
            bn: BatchNorm2d::new(hidden, 1e-5, seq.pp(7))?,
            proj: conv2d(hidden, cfg.embed_dim, proj_k, proj_cfg, vb.pp("proj"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.ibn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let xs = self.ibn2.forward_t(&self.conv2.forward(&xs)?, train)?.relu()?;
        let xs = self.bn.forward_t(&self.conv3.forward(&xs)?, train)?.relu()?;
        flatten_patches(&self.proj.forward(&xs)?)
    }
}

/// Patch embedding stem, selected by `stem_conv` in the configuration.
pub enum PatchEmbed {
    Plain(PlainPatchEmbed),
    Stem(StemPatchEmbed),
}

impl PatchEmbed {
    pub fn new(cfg: &PartVitConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.stem_conv {
            Ok(Self::Stem(StemPatchEmbed::new(cfg, vb)?))
        } else {
            Ok(Self::Plain(PlainPatchEmbed::new(cfg, vb)?))
        }
    }

    /// `[B, C, H, W]` -> `[B, num_patches, D]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Plain(p) => p.forward(xs),
            Self::Stem(s) => s.forward_t(xs, train),
        }
    }
}
