//! Parameter initialization for freshly constructed models.

use candle_core::{Device, Result, Shape, Tensor};
use candle_nn::VarMap;
use rand_distr::{Distribution, Normal};

/// Parameters initialised with truncated normal noise and excluded from
/// weight decay by the external optimizer.
pub const TOKEN_PARAMS: &[&str] = &[
    "cls_token",
    "part_token1",
    "part_token2",
    "part_token3",
    "cls_pos",
    "part1_pos",
    "part2_pos",
    "part3_pos",
    "pos_embed",
];

/// Sample a tensor from N(mean, std) with values outside `[lo, hi]` redrawn.
pub fn trunc_normal<S: Into<Shape>>(
    shape: S,
    mean: f64,
    std: f64,
    lo: f64,
    hi: f64,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let dist = Normal::new(mean, std).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    let mut rng = rand::rng();
    let count = shape.elem_count();
    let mut data = Vec::with_capacity(count);
    while data.len() < count {
        let x = dist.sample(&mut rng);
        if (lo..=hi).contains(&x) {
            data.push(x as f32);
        }
    }
    Tensor::from_vec(data, shape, device)
}

/// Re-identification init recipe: std-0.02 truncated normal for the special
/// tokens, positional parameters and every 2-D linear weight; ones for norm
/// scales and running variances; zeros for biases and running means. Conv
/// kernels keep the builder's Kaiming init.
pub(crate) fn reid_init(varmap: &VarMap, device: &Device) -> Result<()> {
    let vars = varmap.data().lock().unwrap();
    for (name, var) in vars.iter() {
        let dims = var.dims().to_vec();
        let dtype = var.dtype();
        let leaf = name.rsplit('.').next().unwrap_or(name);
        if TOKEN_PARAMS.contains(&name.as_str()) {
            let t = trunc_normal(dims, 0.0, 0.02, -2.0, 2.0, device)?.to_dtype(dtype)?;
            var.set(&t)?;
        } else if leaf == "weight" && dims.len() == 2 {
            let t = trunc_normal(dims, 0.0, 0.02, -2.0, 2.0, device)?.to_dtype(dtype)?;
            var.set(&t)?;
        } else if (leaf == "weight" && dims.len() == 1) || leaf == "running_var" {
            var.set(&Tensor::ones(dims, dtype, device)?)?;
        } else if leaf == "bias" || leaf == "running_mean" {
            var.set(&Tensor::zeros(dims, dtype, device)?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn trunc_normal_respects_bounds() {
        let t = trunc_normal((64, 32), 0.0, 1.0, -0.5, 0.5, &Device::Cpu).unwrap();
        let values = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values.len(), 64 * 32);
        assert!(values.iter().all(|v| (-0.5..=0.5).contains(v)));
    }

    #[test]
    fn trunc_normal_is_roughly_centred() {
        let t = trunc_normal(4096, 0.0, 0.02, -2.0, 2.0, &Device::Cpu).unwrap();
        let values = t.to_vec1::<f32>().unwrap();
        let mean: f32 = values.iter().sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 5e-3, "mean {mean} too far from 0");
    }
}
