use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, LayerNorm, Module, ModuleT, VarBuilder};

use super::{Attention, DropPath, Mlp};
use crate::config::PartVitConfig;

/// Pre-norm transformer block with stochastic depth on both residuals:
/// `x = x + DropPath(Attn(LN1(x)))`, `x = x + DropPath(Mlp(LN2(x)))`.
pub struct Block {
    norm1: LayerNorm,
    attn: Attention,
    drop_path: DropPath,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn new(cfg: &PartVitConfig, drop_path_rate: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            drop_path: DropPath::new(drop_path_rate),
            norm2: layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let y = self.attn.forward_t(&self.norm1.forward(xs)?, train)?;
        let xs = (xs + self.drop_path.forward_t(&y, train)?)?;
        let y = self.mlp.forward_t(&self.norm2.forward(&xs)?, train)?;
        xs + self.drop_path.forward_t(&y, train)?
    }

    /// Raw attention probabilities of this block, without the residual
    /// update. Used by the attention-introspection path only.
    pub fn attention_probs(&self, xs: &Tensor) -> Result<Tensor> {
        let (_out, probs) = self.attn.attend(&self.norm1.forward(xs)?, false)?;
        Ok(probs)
    }
}
