//! Hidden-state cache for one forward pass of the frozen model

use anyhow::Result;
use candle_core::Tensor;

/// Per-layer hidden states, each of shape `(batch, seq_len, hidden)`.
///
/// Entry 0 is the embedding output; entry `i` is the output of decoder layer
/// `i`. The last entry has the final norm applied, so it is what the pooling
/// step reads.
#[derive(Debug)]
pub struct HiddenStateCache {
    states: Vec<Tensor>,
}

impl HiddenStateCache {
    /// Create an empty cache with capacity for n_layers
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            states: Vec::with_capacity(n_layers),
        }
    }

    pub fn new(states: Vec<Tensor>) -> Self {
        Self { states }
    }

    /// Add a layer's hidden states to the cache
    pub fn push(&mut self, tensor: Tensor) {
        self.states.push(tensor);
    }

    /// Final-layer hidden states, `(batch, seq_len, hidden)`
    pub fn last_layer(&self) -> Result<&Tensor> {
        self.states
            .last()
            .ok_or_else(|| anyhow::anyhow!("Hidden-state cache is empty"))
    }

    /// Number of cached layers
    pub fn n_layers(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_cache_push_and_last() {
        let device = Device::Cpu;
        let mut cache = HiddenStateCache::with_capacity(2);
        assert!(cache.is_empty());
        assert!(cache.last_layer().is_err());

        cache.push(Tensor::zeros((2, 5, 8), DType::F32, &device).unwrap());
        cache.push(Tensor::ones((2, 5, 8), DType::F32, &device).unwrap());
        assert_eq!(cache.n_layers(), 2);

        let last = cache.last_layer().unwrap();
        assert_eq!(last.dims(), &[2, 5, 8]);
        let total: f32 = last.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 80.0);
    }
}
