//! Spatial resampling for positional grids and patch kernels.
//!
//! The tensor runtime only ships nearest-neighbour upsampling, so the bicubic
//! kernel needed for positional interpolation and the bilinear kernel used by
//! the checkpoint adapters are computed here, over `[C, H, W]` tensors with
//! half-pixel source mapping and edge clamping.

use candle_core::{DType, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Bilinear,
    Bicubic,
}

/// Resize a `[C, H, W]` tensor to `[C, out_h, out_w]`.
pub fn resize_2d(t: &Tensor, out_h: usize, out_w: usize, filter: Filter) -> Result<Tensor> {
    let (c, in_h, in_w) = t.dims3()?;
    if (in_h, in_w) == (out_h, out_w) {
        return Ok(t.clone());
    }
    let src = t
        .to_dtype(DType::F32)?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let rows = axis_taps(in_h, out_h, filter);
    let cols = axis_taps(in_w, out_w, filter);

    let mut out = vec![0f32; c * out_h * out_w];
    for ch in 0..c {
        let src_base = ch * in_h * in_w;
        let dst_base = ch * out_h * out_w;
        for (oy, row_taps) in rows.iter().enumerate() {
            for (ox, col_taps) in cols.iter().enumerate() {
                let mut acc = 0f32;
                for &(sy, wy) in row_taps {
                    let row = src_base + sy * in_w;
                    for &(sx, wx) in col_taps {
                        acc += wy * wx * src[row + sx];
                    }
                }
                out[dst_base + oy * out_w + ox] = acc;
            }
        }
    }
    Tensor::from_vec(out, (c, out_h, out_w), t.device())?.to_dtype(t.dtype())
}

/// Per-output-index source taps as (clamped source index, weight).
fn axis_taps(in_len: usize, out_len: usize, filter: Filter) -> Vec<Vec<(usize, f32)>> {
    let scale = in_len as f64 / out_len as f64;
    let support = match filter {
        Filter::Bilinear => 1i64,
        Filter::Bicubic => 2,
    };
    (0..out_len)
        .map(|o| {
            let center = (o as f64 + 0.5) * scale - 0.5;
            let left = center.floor() as i64 - (support - 1);
            let mut taps = Vec::with_capacity(2 * support as usize);
            let mut total = 0f64;
            for k in 0..2 * support {
                let pos = left + k;
                let w = match filter {
                    Filter::Bilinear => (1.0 - (center - pos as f64).abs()).max(0.0),
                    Filter::Bicubic => cubic(center - pos as f64),
                };
                total += w;
                let idx = pos.clamp(0, in_len as i64 - 1) as usize;
                taps.push((idx, w));
            }
            taps.into_iter()
                .map(|(idx, w)| (idx, (w / total) as f32))
                .collect()
        })
        .collect()
}

// Cubic convolution kernel with a = -0.75, matching torch/OpenCV bicubic.
fn cubic(x: f64) -> f64 {
    const A: f64 = -0.75;
    let x = x.abs();
    if x <= 1.0 {
        (A + 2.0) * x.powi(3) - (A + 3.0) * x.powi(2) + 1.0
    } else if x < 2.0 {
        A * x.powi(3) - 5.0 * A * x.powi(2) + 8.0 * A * x - 4.0 * A
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn row(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (1, 1, values.len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn identity_when_sizes_match() {
        let t = row(&[1.0, 2.0, 3.0]);
        let r = resize_2d(&t, 1, 3, Filter::Bicubic).unwrap();
        assert_eq!(
            r.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn bilinear_is_exact_on_interior_ramp() {
        // Downscaling 4 -> 2 samples the ramp f(x) = x at x = 0.5 and 2.5.
        let t = row(&[0.0, 1.0, 2.0, 3.0]);
        let r = resize_2d(&t, 1, 2, Filter::Bilinear).unwrap();
        let v = r.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((v[0] - 0.5).abs() < 1e-6);
        assert!((v[1] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn bicubic_preserves_constants() {
        let t = Tensor::full(7.5f32, (2, 3, 3), &Device::Cpu).unwrap();
        let r = resize_2d(&t, 5, 4, Filter::Bicubic).unwrap();
        assert_eq!(r.dims(), &[2, 5, 4]);
        let v = r.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|x| (x - 7.5).abs() < 1e-5));
    }

    #[test]
    fn upscales_channels_independently() {
        let t = Tensor::from_vec(
            vec![0.0f32, 1.0, 10.0, 11.0],
            (2, 1, 2),
            &Device::Cpu,
        )
        .unwrap();
        let r = resize_2d(&t, 1, 4, Filter::Bilinear).unwrap();
        let v = r.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v.len(), 8);
        // Channel means are preserved by symmetric taps.
        let c0: f32 = v[..4].iter().sum::<f32>() / 4.0;
        let c1: f32 = v[4..].iter().sum::<f32>() / 4.0;
        assert!((c0 - 0.5).abs() < 1e-6);
        assert!((c1 - 10.5).abs() < 1e-6);
    }
}
