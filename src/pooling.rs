//! Masked mean pooling over hidden states

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Lower bound on the per-sample mask sum
pub const MASK_SUM_EPS: f64 = 1e-9;

/// Mean of `hidden[:, ..T, :]` over positions where `attention_mask` is 1.
///
/// `hidden` is `(N, S, H)` with `S >= T`; `attention_mask` is `(N, T)`. Only
/// the first `T` positions are read, so anything appended after the data
/// (a trigger) never contributes. Returns `(N, H)` in F32.
pub fn masked_mean_pool(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (n, s, _h) = hidden.dims3()?;
    let (mask_n, t) = attention_mask.dims2()?;
    anyhow::ensure!(
        n == mask_n,
        "Pooling batch mismatch: hidden has {n} rows, mask has {mask_n}"
    );
    anyhow::ensure!(
        t <= s,
        "Pooling mask covers {t} positions but hidden states only have {s}"
    );

    let data = hidden.narrow(1, 0, t)?.to_dtype(DType::F32)?;
    let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
    let summed = data.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(MASK_SUM_EPS, f64::MAX)?;
    Ok(summed.broadcast_div(&counts)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_pool_ignores_padding_and_tail() {
        let device = Device::Cpu;
        // Position p holds value p in every channel
        let hidden = Tensor::arange(0f32, 5.0, &device)
            .unwrap()
            .reshape((1, 5, 1))
            .unwrap()
            .broadcast_as((1, 5, 2))
            .unwrap()
            .contiguous()
            .unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0]], &device).unwrap();
        let pooled: Vec<Vec<f32>> = masked_mean_pool(&hidden, &mask)
            .unwrap()
            .to_vec2()
            .unwrap();
        // Mean of positions 0 and 1
        assert_eq!(pooled, vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn test_pool_all_masked_is_zero_not_nan() {
        let device = Device::Cpu;
        let hidden = Tensor::ones((1, 2, 3), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 2), DType::U32, &device).unwrap();
        let pooled: Vec<Vec<f32>> = masked_mean_pool(&hidden, &mask)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!(pooled[0].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_pool_rejects_short_hidden() {
        let device = Device::Cpu;
        let hidden = Tensor::ones((1, 2, 3), DType::F32, &device).unwrap();
        let mask = Tensor::ones((1, 3), DType::U32, &device).unwrap();
        assert!(masked_mean_pool(&hidden, &mask).is_err());
    }
}
