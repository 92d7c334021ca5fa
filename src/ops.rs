/* ------------------------------------------------------------------ */
/* Tensor primitives: masks, norms, activations                      */
/* ------------------------------------------------------------------ */

use candle_core::{DType, Device, Tensor, D};

use crate::config::RMS_EPS;
use crate::error::Result;

// Causal mask [n, n] (u8): 1 where key position > query position.
pub fn causal_mask(n: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..n)
        .flat_map(|q| (0..n).map(move |k| u8::from(k > q)))
        .collect();
    Ok(Tensor::from_vec(mask, (n, n), device)?)
}

/// Overwrite every masked cell of `scores` (trailing dims `[n, n]`) with `fill`.
pub fn masked_fill(scores: &Tensor, fill: f32) -> Result<Tensor> {
    let n = scores.dim(D::Minus1)?;
    let mask = causal_mask(n, scores.device())?.broadcast_as(scores.shape())?;
    let fill = Tensor::full(fill, scores.shape(), scores.device())?.to_dtype(scores.dtype())?;
    Ok(mask.where_cond(&fill, scores)?)
}

// RMS scale of the last dim, kept: sqrt(mean(x^2) + eps). Divide by it to normalize.
pub fn rms_scale(x: &Tensor) -> Result<Tensor> {
    Ok(x.sqr()?.mean_keepdim(D::Minus1)?.affine(1.0, RMS_EPS as f64)?.sqrt()?)
}

pub fn squared_relu(x: &Tensor) -> Result<Tensor> {
    Ok(x.relu()?.sqr()?)
}

/// L2 norm of every column of a 2-D tensor, shape `[1, cols]`.
pub fn column_norms(w: &Tensor) -> Result<Tensor> {
    Ok(w.sqr()?.sum_keepdim(0)?.sqrt()?)
}

pub fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_is_strict_upper_triangle() {
        let m = causal_mask(3, &Device::Cpu).unwrap().to_vec2::<u8>().unwrap();
        assert_eq!(m, vec![vec![0, 1, 1], vec![0, 0, 1], vec![0, 0, 0]]);
    }

    #[test]
    fn masked_fill_broadcasts_over_leading_dims() {
        let x = Tensor::zeros((2, 1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let y = masked_fill(&x, -7.0).unwrap();
        assert_eq!(y.dims(), &[2, 1, 3, 3]);
        let flat: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        for b in 0..2 {
            for q in 0..3 {
                for k in 0..3 {
                    let want = if k > q { -7.0 } else { 0.0 };
                    assert_eq!(flat[b * 9 + q * 3 + k], want);
                }
            }
        }
    }

    #[test]
    fn rms_scale_matches_manual() {
        let x = Tensor::new(&[[3.0f32, 4.0]], &Device::Cpu).unwrap();
        let s: Vec<Vec<f32>> = rms_scale(&x).unwrap().to_vec2().unwrap();
        let want = (12.5f32 + RMS_EPS).sqrt();
        assert!((s[0][0] - want).abs() < 1e-5);
    }

    #[test]
    fn column_norms_per_column() {
        let w = Tensor::new(&[[3.0f32, 0.0], [4.0, 2.0]], &Device::Cpu).unwrap();
        let n: Vec<Vec<f32>> = column_norms(&w).unwrap().to_vec2().unwrap();
        assert_eq!(n, vec![vec![5.0, 2.0]]);
    }
}
