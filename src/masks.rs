//! Attention mask utilities
//!
//! Provides cached causal masks plus the padding bias built from a batch's
//! attention mask. Both are additive: `0.0` where a position may attend,
//! `-inf` (or a large negative value) where it may not.
//!
//! ## Caching Strategy
//!
//! Causal masks are cached by `(seq_len, device_id, dtype)` to avoid recreating
//! large tensors on every forward pass. The cache hands out shallow clones
//! (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

/// Cache for causal masks indexed by (seq_len, device_id, dtype)
static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Masked-out additive bias for padding. Finite so fully-padded rows stay
/// NaN-free after softmax.
const PAD_BIAS: f32 = -1e9;

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

fn cache_lock() -> MutexGuard<'static, HashMap<(usize, usize, DType), Tensor>> {
    // A poisoned cache only holds immutable tensors, so keep using it.
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Create or retrieve a cached causal mask for the given sequence length
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
///
/// For seq_len=3:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    if let Some(cached) = cache_lock().get(&cache_key) {
        return Ok(cached.clone());
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    cache_lock().insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}

/// Additive key-padding bias from a `(batch, seq_len)` attention mask.
///
/// Returns `[batch, 1, 1, seq_len]`: `0.0` for attended keys, a large negative
/// value for padded keys. Broadcasts against `[batch, heads, q, k]` scores.
pub fn create_padding_bias(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    let keep = attention_mask.to_dtype(DType::F32)?;
    // (1 - keep) * PAD_BIAS
    let bias = keep.affine(-(PAD_BIAS as f64), PAD_BIAS as f64)?;
    Ok(bias.reshape((batch, 1, 1, seq_len))?.to_dtype(dtype)?)
}

/// Append `extra` always-attended positions to a `(batch, seq_len)` mask.
///
/// Used to extend a code sample's mask over the trigger positions.
pub fn extend_attention_mask(attention_mask: &Tensor, extra: usize) -> Result<Tensor> {
    if extra == 0 {
        return Ok(attention_mask.clone());
    }
    let batch = attention_mask.dim(0)?;
    let ones = Tensor::ones(
        (batch, extra),
        attention_mask.dtype(),
        attention_mask.device(),
    )?;
    Ok(Tensor::cat(&[attention_mask, &ones], 1)?)
}

/// Clear all cached masks
pub fn clear_mask_caches() {
    cache_lock().clear();
}

#[cfg(test)]
fn mask_cache_size() -> usize {
    cache_lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_causal_mask_shape() {
        let mask = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
    }

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        // Row 0: [0, -inf, -inf]
        assert_eq!(data[0], 0.0);
        assert!(data[1].is_infinite() && data[1] < 0.0);
        assert!(data[2].is_infinite() && data[2] < 0.0);

        // Row 1: [0, 0, -inf]
        assert_eq!(data[3], 0.0);
        assert_eq!(data[4], 0.0);
        assert!(data[5].is_infinite() && data[5] < 0.0);

        // Row 2: [0, 0, 0]
        assert_eq!(&data[6..9], &[0.0, 0.0, 0.0]);
    }

    #[test]
    #[serial]
    fn test_causal_mask_caching() {
        clear_mask_caches();
        assert_eq!(mask_cache_size(), 0);

        let _mask1 = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _mask2 = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _mask3 = create_causal_mask(8, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 2);
    }

    #[test]
    fn test_padding_bias() {
        let mask = Tensor::new(&[[1u32, 1, 0], [1, 0, 0]], &Device::Cpu).unwrap();
        let bias = create_padding_bias(&mask, DType::F32).unwrap();
        assert_eq!(bias.dims(), &[2, 1, 1, 3]);
        let data: Vec<f32> = bias.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(data[0], 0.0);
        assert_eq!(data[1], 0.0);
        assert!(data[2] < -1e8);
        assert_eq!(data[3], 0.0);
        assert!(data[4] < -1e8 && data[5] < -1e8);
    }

    #[test]
    fn test_extend_attention_mask() {
        let mask = Tensor::new(&[[1u32, 0], [1, 1]], &Device::Cpu).unwrap();
        let ext = extend_attention_mask(&mask, 2).unwrap();
        let rows: Vec<Vec<u32>> = ext.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1, 0, 1, 1], vec![1, 1, 1, 1]]);

        let same = extend_attention_mask(&mask, 0).unwrap();
        assert_eq!(same.dims(), &[2, 2]);
    }
}
