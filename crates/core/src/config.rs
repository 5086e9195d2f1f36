//! Model configuration and token-mode dispatch.

use serde::Deserialize;
use thiserror::Error;

/// ImageNet channel statistics, exported for the preprocessing pipeline that
/// feeds this extractor.
pub const IMAGENET_DEFAULT_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_DEFAULT_STD: [f64; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("part index {0} out of range, expected 0..=2")]
    InvalidPartIndex(usize),
    #[error("patch size {0} unsupported, expected one of 4, 8, 16")]
    InvalidPatchSize(usize),
    #[error("image size {h}x{w} not divisible by patch size {patch}")]
    IndivisibleImage { h: usize, w: usize, patch: usize },
    #[error("embedding dim {dim} not divisible by {heads} heads")]
    IndivisibleHeads { dim: usize, heads: usize },
    #[error("stem stride {stride} must divide patch size {patch}")]
    InvalidStemStride { stride: usize, patch: usize },
    #[error("depth must be at least 1")]
    ZeroDepth,
}

/// Which of the three learned part tokens a single-part forward selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartIndex {
    Part1,
    Part2,
    Part3,
}

impl PartIndex {
    /// Validate an external part index (0, 1 or 2).
    pub fn new(index: usize) -> Result<Self, ConfigError> {
        match index {
            0 => Ok(Self::Part1),
            1 => Ok(Self::Part2),
            2 => Ok(Self::Part3),
            other => Err(ConfigError::InvalidPartIndex(other)),
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Part1 => 0,
            Self::Part2 => 1,
            Self::Part3 => 2,
        }
    }
}

/// Token layout of a forward pass.
///
/// `Joint` runs all four special tokens (cls + three parts); `Single` runs the
/// cls token together with exactly one part token. Out-of-range part indices
/// are unrepresentable: `PartIndex::new` is the validation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    Joint,
    Single(PartIndex),
}

impl TokenMode {
    /// Special tokens prepended to the patch sequence in this mode.
    pub fn num_special_tokens(self) -> usize {
        match self {
            Self::Joint => 4,
            Self::Single(_) => 2,
        }
    }
}

/// Hyper-parameters of the part-token ViT. Immutable after construction;
/// every tensor shape in the model derives from these fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PartVitConfig {
    /// Input resolution as (height, width).
    pub img_size: (usize, usize),
    pub patch_size: usize,
    pub in_chans: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    pub qkv_bias: bool,
    /// Fixed attention scale; `head_dim^-0.5` when unset.
    pub qk_scale: Option<f64>,
    /// Token dropout after positional addition, and inside attention/MLP.
    pub drop_rate: f32,
    pub attn_drop_rate: f32,
    /// Maximum stochastic-depth rate; per-block rates ramp linearly to this.
    pub drop_path_rate: f32,
    pub layer_norm_eps: f64,
    /// Use the 3-conv IBN stem instead of the plain strided projection.
    pub stem_conv: bool,
    pub stem_stride: usize,
    pub stem_hidden_dim: usize,
}

impl Default for PartVitConfig {
    fn default() -> Self {
        Self::small()
    }
}

impl PartVitConfig {
    /// Small variant: 384-dim, 12 blocks, 6 heads on 256x128 crops.
    pub fn small() -> Self {
        Self {
            img_size: (256, 128),
            patch_size: 16,
            in_chans: 3,
            embed_dim: 384,
            depth: 12,
            num_heads: 6,
            mlp_ratio: 4.0,
            qkv_bias: true,
            qk_scale: None,
            drop_rate: 0.0,
            attn_drop_rate: 0.0,
            drop_path_rate: 0.0,
            layer_norm_eps: 1e-6,
            stem_conv: true,
            stem_stride: 2,
            stem_hidden_dim: 64,
        }
    }

    /// Base variant: 768-dim, 12 heads.
    pub fn base() -> Self {
        Self {
            embed_dim: 768,
            num_heads: 12,
            ..Self::small()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.patch_size, 4 | 8 | 16) {
            return Err(ConfigError::InvalidPatchSize(self.patch_size));
        }
        let (h, w) = self.img_size;
        if h % self.patch_size != 0 || w % self.patch_size != 0 {
            return Err(ConfigError::IndivisibleImage {
                h,
                w,
                patch: self.patch_size,
            });
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(ConfigError::IndivisibleHeads {
                dim: self.embed_dim,
                heads: self.num_heads,
            });
        }
        if self.stem_conv && (self.stem_stride == 0 || self.patch_size % self.stem_stride != 0) {
            return Err(ConfigError::InvalidStemStride {
                stride: self.stem_stride,
                patch: self.patch_size,
            });
        }
        if self.depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        Ok(())
    }

    /// Patch grid as (rows, cols).
    pub fn grid(&self) -> (usize, usize) {
        (
            self.img_size.0 / self.patch_size,
            self.img_size.1 / self.patch_size,
        )
    }

    pub fn num_patches(&self) -> usize {
        let (gh, gw) = self.grid();
        gh * gw
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }
}
