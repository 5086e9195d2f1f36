use candle_core::{Result, Tensor};
use candle_nn::{linear, linear_b, ops::softmax_last_dim, Dropout, Linear, Module, VarBuilder};

use crate::config::PartVitConfig;

/// Bidirectional multi-head self-attention with a fused QKV projection.
///
/// The scale defaults to `head_dim^-0.5` but can be pinned via
/// `qk_scale` for compatibility with older pretrained weights.
pub struct Attention {
    qkv: Linear,
    proj: Linear,
    attn_drop: Dropout,
    proj_drop: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(cfg: &PartVitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let head_dim = cfg.head_dim();
        Ok(Self {
            qkv: linear_b(dim, dim * 3, cfg.qkv_bias, vb.pp("qkv"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            attn_drop: Dropout::new(cfg.attn_drop_rate),
            proj_drop: Dropout::new(cfg.drop_rate),
            num_heads: cfg.num_heads,
            head_dim,
            scale: cfg.qk_scale.unwrap_or((head_dim as f64).powf(-0.5)),
        })
    }

    /// `xs: [B, N, D]` -> projected output `[B, N, D]` and attention
    /// probabilities `[B, heads, N, N]`.
    pub fn attend(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (b, n, _d) = xs.dims3()?;
        let (h, hd) = (self.num_heads, self.head_dim);

        let qkv = self.qkv.forward(xs)?;
        let q = qkv
            .narrow(2, 0, h * hd)?
            .reshape((b, n, h, hd))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = qkv
            .narrow(2, h * hd, h * hd)?
            .reshape((b, n, h, hd))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = qkv
            .narrow(2, 2 * h * hd, h * hd)?
            .reshape((b, n, h, hd))?
            .transpose(1, 2)?
            .contiguous()?;

        let attn = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let attn = softmax_last_dim(&attn)?;
        let attn = self.attn_drop.forward(&attn, train)?;

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, h * hd))?;
        let out = self.proj.forward(&out)?;
        let out = self.proj_drop.forward(&out, train)?;
        Ok((out, attn))
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.attend(xs, train)?.0)
    }
}
