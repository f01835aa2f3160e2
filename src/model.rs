//! Frozen sequence model boundary
//!
//! The frozen model is exposed only through [`FrozenBackend`]: token ids to
//! embeddings, and embeddings plus attention mask to per-layer hidden states.
//! Backends are built from memory-mapped weights and own no `Var`, so nothing
//! in them can end up in an optimizer's parameter list.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::cache::HiddenStateCache;
use crate::corpus::{TokenBatch, TokenSample};
use crate::error::ensure_dim;
use crate::forward_qwen2::Qwen2Backend;
use crate::pooling::masked_mean_pool;

/// How data positions may attend to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AttentionMode {
    /// Position i attends to positions <= i (the pretrained behaviour)
    #[default]
    Causal,
    /// Every position attends to every unpadded position
    Bidirectional,
}

/// The frozen domain: read-only, shareable across worker threads.
pub trait FrozenBackend: Send + Sync {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn hidden_size(&self) -> usize;
    fn dtype(&self) -> DType;
    fn device(&self) -> &Device;

    /// Attention pattern used by `forward_embeds`.
    ///
    /// Backends that do not mix information across positions may keep the
    /// default.
    fn attention_mode(&self) -> AttentionMode {
        AttentionMode::Bidirectional
    }

    // --- Forward passes ---

    /// `(N, T)` token ids to `(N, T, H)` input embeddings
    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Run the frozen stack on `(N, S, H)` embeddings with an `(N, S)` mask.
    ///
    /// The last cache entry is the final hidden layer.
    fn forward_embeds(&self, embeds: &Tensor, attention_mask: &Tensor)
        -> Result<HiddenStateCache>;
}

/// Pooled final-layer embedding of a token batch, `(N, H)` F32.
///
/// This is the Embedding Source: embed, run the frozen stack with the real
/// mask, mean-pool over real tokens.
pub fn pooled_embeddings(backend: &dyn FrozenBackend, batch: &TokenBatch) -> Result<Tensor> {
    let embeds = backend.embed_tokens(&batch.input_ids)?;
    let cache = backend.forward_embeds(&embeds, &batch.attention_mask)?;
    masked_mean_pool(cache.last_layer()?, &batch.attention_mask)
}

/// Tokenizer plus frozen backend, as loaded from the HuggingFace Hub
pub struct FrozenModel {
    backend: Box<dyn FrozenBackend>,
    tokenizer: Tokenizer,
    model_id: String,
}

impl FrozenModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str, force_cpu: bool, mode: AttentionMode) -> Result<Self> {
        let (device, dtype) = if force_cpu {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    // Qwen checkpoints are trained in bfloat16; F16 overflows
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        if !model_id.to_lowercase().contains("qwen") {
            warn!(
                "Model '{}' does not look like a Qwen2 checkpoint; loading it as Qwen2",
                model_id
            );
        }

        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);
        info!("Attention: {:?}", mode);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let backend = Qwen2Backend::load(model_id, &device, dtype, mode)?;

        Ok(Self {
            backend: Box::new(backend),
            tokenizer,
            model_id: model_id.to_string(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The frozen domain, for the trigger stage
    pub fn backend(&self) -> &dyn FrozenBackend {
        self.backend.as_ref()
    }

    /// Hidden width of the model
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    pub fn device(&self) -> &Device {
        self.backend.device()
    }

    /// Tokenize one text, truncated to `max_len` tokens
    pub fn tokenize(&self, text: &str, max_len: Option<usize>) -> Result<TokenSample> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        let mut input_ids: Vec<u32> = encoding.get_ids().to_vec();
        if let Some(max_len) = max_len {
            input_ids.truncate(max_len);
        }
        let attention_mask = vec![1u32; input_ids.len()];
        Ok(TokenSample {
            input_ids,
            attention_mask,
        })
    }

    /// Embedding Source for a batch of code texts.
    ///
    /// Texts that fail to tokenize or produce no tokens are skipped with a
    /// warning. Returns the indices of the kept texts and their `(n_kept, H)`
    /// pooled embeddings.
    pub fn embed_batch(
        &self,
        texts: &[&str],
        max_len: Option<usize>,
    ) -> Result<(Vec<usize>, Option<Tensor>)> {
        let mut kept = Vec::with_capacity(texts.len());
        let mut samples = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            match self.tokenize(text, max_len) {
                Ok(sample) if !sample.input_ids.is_empty() => {
                    kept.push(i);
                    samples.push(sample);
                }
                Ok(_) => warn!("Skipping sample {i}: no tokens"),
                Err(e) => warn!("Skipping sample {i}: {e}"),
            }
        }
        if samples.is_empty() {
            return Ok((kept, None));
        }

        let refs: Vec<&TokenSample> = samples.iter().collect();
        let batch = TokenBatch::from_samples(&refs, self.device())?;
        let pooled = pooled_embeddings(self.backend(), &batch)?;
        ensure_dim("pooled embedding", self.hidden_size(), pooled.dim(1)?)?;
        Ok((kept, Some(pooled)))
    }
}
