use candle_core::{Result, Tensor};
use candle_nn::ModuleT;

/// Stochastic depth: during training, zeroes the whole residual branch for a
/// random subset of samples and rescales the survivors by `1/keep_prob` so
/// the expected value is unchanged. Identity at inference or when the rate
/// is zero.
#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    drop_prob: f32,
}

impl DropPath {
    pub fn new(drop_prob: f32) -> Self {
        Self { drop_prob }
    }
}

impl ModuleT for DropPath {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if self.drop_prob == 0.0 || !train {
            return Ok(xs.clone());
        }
        let keep_prob = 1.0 - self.drop_prob as f64;
        // One Bernoulli draw per sample, broadcast over the remaining dims.
        let mut mask_dims = vec![1usize; xs.rank()];
        mask_dims[0] = xs.dim(0)?;
        let mask = (Tensor::rand(0f32, 1f32, mask_dims, xs.device())? + keep_prob)?
            .floor()?
            .to_dtype(xs.dtype())?;
        (xs / keep_prob)?.broadcast_mul(&mask)
    }
}

/// Per-block drop rates ramping linearly from 0 to `drop_path_rate` over the
/// encoder depth.
pub fn decay_schedule(drop_path_rate: f32, depth: usize) -> Vec<f32> {
    (0..depth)
        .map(|i| {
            if depth > 1 {
                drop_path_rate * i as f32 / (depth - 1) as f32
            } else {
                0.0
            }
        })
        .collect()
}
