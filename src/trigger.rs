//! TriggerEmbedding and the Trigger-Tuned Forward Wrapper
//!
//! The trigger is the only trainable tensor of the second stage. It lives in
//! its own `Var`, separate from the frozen backend, and is cast to the
//! backend's compute dtype inside the forward pass.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};

use crate::corpus::TokenBatch;
use crate::error::ensure_dim;
use crate::masks::extend_attention_mask;
use crate::model::FrozenBackend;
use crate::pooling::masked_mean_pool;

/// Tensor name used in trigger files
pub const TRIGGER_TENSOR: &str = "trigger";

/// K learnable vectors of the frozen model's hidden width, `(K, H)` F32
#[derive(Debug, Clone)]
pub struct TriggerEmbedding {
    var: Var,
}

impl TriggerEmbedding {
    /// N(0, std²) init; `std == 0` gives zeros
    pub fn new_random(len: usize, hidden: usize, std: f64, device: &Device) -> Result<Self> {
        anyhow::ensure!(hidden > 0, "Trigger hidden width must be > 0");
        let var = if std > 0.0 && len > 0 {
            Var::randn(0f32, std as f32, (len, hidden), device)?
        } else {
            Var::zeros((len, hidden), DType::F32, device)?
        };
        Ok(Self { var })
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        anyhow::ensure!(
            tensor.rank() == 2,
            "Trigger must be 2D (K, H), got shape {:?}",
            tensor.dims()
        );
        Ok(Self {
            var: Var::from_tensor(&tensor.to_dtype(DType::F32)?)?,
        })
    }

    /// Number of trigger vectors (K)
    pub fn len(&self) -> usize {
        self.var.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hidden_size(&self) -> usize {
        self.var.dims()[1]
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn as_tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        candle_core::safetensors::save(
            &HashMap::from([(TRIGGER_TENSOR.to_string(), self.as_tensor().clone())]),
            path,
        )
        .with_context(|| format!("Failed to write trigger {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load trigger {}", path.display()))?;
        let tensor = tensors
            .remove(TRIGGER_TENSOR)
            .with_context(|| format!("Tensor '{TRIGGER_TENSOR}' not found in {}", path.display()))?;
        Self::from_tensor(&tensor)
    }
}

/// Appends a trigger to every input and pools over the original positions only
pub struct TriggerWrapper<'a> {
    backend: &'a dyn FrozenBackend,
}

impl<'a> TriggerWrapper<'a> {
    pub fn new(backend: &'a dyn FrozenBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &'a dyn FrozenBackend {
        self.backend
    }

    /// Pooled `(N, H)` F32 embedding of `batch` with `trigger` appended.
    ///
    /// Data embeddings are detached, so gradients reach the trigger only.
    /// Pooling uses the batch's original mask over its first `T` positions,
    /// so trigger positions never enter the mean.
    pub fn forward(&self, batch: &TokenBatch, trigger: Option<&TriggerEmbedding>) -> Result<Tensor> {
        let data = self.backend.embed_tokens(&batch.input_ids)?.detach();
        let (n, _t, h) = data.dims3()?;
        ensure_dim("token embeddings", self.backend.hidden_size(), h)?;

        let (embeds, mask) = match trigger {
            Some(trigger) if !trigger.is_empty() => {
                ensure_dim("trigger width", h, trigger.hidden_size())?;
                let k = trigger.len();
                let trig = trigger
                    .as_tensor()
                    .to_dtype(self.backend.dtype())?
                    .unsqueeze(0)?
                    .broadcast_as((n, k, h))?
                    .contiguous()?;
                (
                    Tensor::cat(&[&data, &trig], 1)?,
                    extend_attention_mask(&batch.attention_mask, k)?,
                )
            }
            _ => (data, batch.attention_mask.clone()),
        };

        let cache = self.backend.forward_embeds(&embeds, &mask)?;
        masked_mean_pool(cache.last_layer()?, &batch.attention_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HiddenStateCache;
    use crate::corpus::TokenSample;
    use crate::model::pooled_embeddings;

    /// Hidden state at position p is the constant `p + 1` in every channel,
    /// independent of the input
    struct PositionBackend {
        device: Device,
    }

    impl FrozenBackend for PositionBackend {
        fn n_layers(&self) -> usize {
            1
        }
        fn hidden_size(&self) -> usize {
            3
        }
        fn dtype(&self) -> DType {
            DType::F32
        }
        fn device(&self) -> &Device {
            &self.device
        }
        fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
            let (n, t) = input_ids.dims2()?;
            Ok(Tensor::zeros((n, t, 3), DType::F32, &self.device)?)
        }
        fn forward_embeds(&self, embeds: &Tensor, _mask: &Tensor) -> Result<HiddenStateCache> {
            let (n, s, h) = embeds.dims3()?;
            let pos = Tensor::arange(1f32, (s + 1) as f32, &self.device)?
                .reshape((1, s, 1))?
                .broadcast_as((n, s, h))?;
            // Keep the trigger in the graph
            let hidden = (embeds * 0.0)?.broadcast_add(&pos)?;
            Ok(HiddenStateCache::new(vec![embeds.clone(), hidden]))
        }
    }

    fn batch(device: &Device) -> TokenBatch {
        let a = TokenSample {
            input_ids: vec![1, 2, 3, 4],
            attention_mask: vec![1, 1, 1, 1],
        };
        let b = TokenSample {
            input_ids: vec![5, 6],
            attention_mask: vec![1, 1],
        };
        TokenBatch::from_samples(&[&a, &b], device).unwrap()
    }

    #[test]
    fn test_pooling_excludes_trigger_for_any_k() {
        let device = Device::Cpu;
        let backend = PositionBackend {
            device: device.clone(),
        };
        let wrapper = TriggerWrapper::new(&backend);
        let batch = batch(&device);
        // Sample a: mean(1..=4) = 2.5; sample b: mean(1, 2) = 1.5
        let expected = vec![vec![2.5f32; 3], vec![1.5; 3]];

        for k in [0usize, 1, 3, 10] {
            let trigger = TriggerEmbedding::new_random(k, 3, 0.5, &device).unwrap();
            let pooled: Vec<Vec<f32>> = wrapper
                .forward(&batch, Some(&trigger))
                .unwrap()
                .to_vec2()
                .unwrap();
            assert_eq!(pooled, expected, "K={k}");
        }

        // K=0 reduces to the Embedding Source's pooling
        let source: Vec<Vec<f32>> = pooled_embeddings(&backend, &batch)
            .unwrap()
            .to_vec2()
            .unwrap();
        let none: Vec<Vec<f32>> = wrapper.forward(&batch, None).unwrap().to_vec2().unwrap();
        assert_eq!(source, expected);
        assert_eq!(none, expected);
    }

    #[test]
    fn test_trigger_width_mismatch() {
        let device = Device::Cpu;
        let backend = PositionBackend {
            device: device.clone(),
        };
        let wrapper = TriggerWrapper::new(&backend);
        let trigger = TriggerEmbedding::new_random(2, 5, 0.1, &device).unwrap();
        assert!(wrapper.forward(&batch(&device), Some(&trigger)).is_err());
    }

    #[test]
    fn test_trigger_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trigger.safetensors");
        let trigger = TriggerEmbedding::new_random(4, 3, 0.1, &Device::Cpu).unwrap();
        trigger.save(&path).unwrap();

        let loaded = TriggerEmbedding::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.hidden_size(), 3);
        let a: Vec<Vec<f32>> = trigger.as_tensor().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = loaded.as_tensor().to_vec2().unwrap();
        assert_eq!(a, b);
    }
}
