use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use crate::config::PartVitConfig;

/// Two-layer feed-forward with exact GELU and dropout after each projection.
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
    drop: Dropout,
}

impl Mlp {
    pub fn new(cfg: &PartVitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.mlp_hidden_dim();
        Ok(Self {
            fc1: linear(cfg.embed_dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, cfg.embed_dim, vb.pp("fc2"))?,
            drop: Dropout::new(cfg.drop_rate),
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.fc1.forward(xs)?.gelu_erf()?;
        let xs = self.drop.forward(&xs, train)?;
        let xs = self.fc2.forward(&xs)?;
        self.drop.forward(&xs, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn round_trips_the_embedding_dim() {
        let cfg = PartVitConfig {
            embed_dim: 8,
            mlp_ratio: 2.0,
            ..PartVitConfig::small()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mlp = Mlp::new(&cfg, vb).unwrap();
        let xs = Tensor::randn(0f32, 1f32, (3, 7, 8), &Device::Cpu).unwrap();
        let out = mlp.forward_t(&xs, false).unwrap();
        assert_eq!(out.dims(), &[3, 7, 8]);
    }
}
