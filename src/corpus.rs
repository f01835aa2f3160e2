//! Corpus loading for the decomposition and trigger stages
//!
//! Three inputs reach the core:
//! - code samples (JSON), consumed by the Embedding Source
//! - FeatureVectors (safetensors, tensor `features`), consumed by the Decomposer
//! - token-id sequences with attention masks (JSON), consumed by the trigger stage

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ensure_dim;

/// Tensor name used in feature files
pub const FEATURES_TENSOR: &str = "features";

/// A single code sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSample {
    pub code: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct CodeCorpusFile {
    samples: Vec<CodeSample>,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

/// Collection of code samples fed to the Embedding Source
#[derive(Debug, Clone)]
pub struct CodeCorpus {
    samples: Vec<CodeSample>,
}

impl CodeCorpus {
    /// Load corpus from JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus {}", path.display()))?;
        let file: CodeCorpusFile = serde_json::from_str(&content)?;
        Ok(Self {
            samples: file.samples,
        })
    }

    pub fn from_samples(samples: Vec<CodeSample>) -> Self {
        Self { samples }
    }

    /// Total number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if corpus is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Get all samples
    pub fn samples(&self) -> &[CodeSample] {
        &self.samples
    }
}

// ---------------------------------------------------------------------------
// FeatureVectors
// ---------------------------------------------------------------------------

/// All FeatureVectors of a corpus as one `(N, D)` F32 tensor.
///
/// Row order is the corpus iteration order; the ResidualSet written by the
/// extractor is aligned with it.
#[derive(Debug, Clone)]
pub struct FeatureCorpus {
    features: Tensor,
}

impl FeatureCorpus {
    /// Wrap an existing `(N, D)` tensor
    pub fn from_tensor(features: Tensor) -> Result<Self> {
        anyhow::ensure!(
            features.rank() == 2,
            "Feature tensor must be 2D (N, D), got shape {:?}",
            features.dims()
        );
        Ok(Self {
            features: features.to_dtype(DType::F32)?,
        })
    }

    /// Load from a single safetensors file or a directory of them.
    ///
    /// Directory entries are visited in sorted file-name order. Every file
    /// must hold a `features` tensor of shape `(D,)` or `(n, D)` with the same
    /// `D`; a width mismatch is fatal.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let files = if path.is_dir() {
            let mut files: Vec<_> = std::fs::read_dir(path)
                .with_context(|| format!("Failed to list {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
                .collect();
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };
        anyhow::ensure!(
            !files.is_empty(),
            "No .safetensors feature files in {}",
            path.display()
        );

        let mut rows = Vec::with_capacity(files.len());
        let mut width: Option<usize> = None;
        for file in &files {
            let data = std::fs::read(file)
                .with_context(|| format!("Failed to read feature file {}", file.display()))?;
            let st = SafeTensors::deserialize(&data)
                .with_context(|| format!("Failed to deserialize {}", file.display()))?;
            let view = st.tensor(FEATURES_TENSOR).with_context(|| {
                format!("Tensor '{FEATURES_TENSOR}' not found in {}", file.display())
            })?;
            let tensor = tensor_from_view(&view, device)?.to_dtype(DType::F32)?;
            let tensor = match tensor.rank() {
                1 => tensor.unsqueeze(0)?,
                2 => tensor,
                r => anyhow::bail!("Feature tensor in {} has rank {r}", file.display()),
            };
            let d = tensor.dim(1)?;
            match width {
                Some(expected) => ensure_dim(&file.display().to_string(), expected, d)?,
                None => width = Some(d),
            }
            rows.push(tensor);
        }

        let features = Tensor::cat(&rows, 0)?;
        info!(
            "Loaded {} feature vectors of width {} from {} file(s)",
            features.dim(0)?,
            features.dim(1)?,
            files.len()
        );
        Ok(Self { features })
    }

    /// Write all features to one safetensors file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        candle_core::safetensors::save(
            &std::collections::HashMap::from([(FEATURES_TENSOR.to_string(), self.features.clone())]),
            path,
        )
        .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Number of FeatureVectors
    pub fn len(&self) -> usize {
        self.features.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width D of every FeatureVector
    pub fn dim(&self) -> usize {
        self.features.dims()[1]
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    /// Rows at `indices`, in that order
    pub fn gather(&self, indices: &[usize]) -> Result<Tensor> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::new(idx.as_slice(), self.features.device())?;
        Ok(self.features.index_select(&idx, 0)?)
    }

    /// A copy of the corpus in a different iteration order
    pub fn permuted(&self, order: &[usize]) -> Result<Self> {
        anyhow::ensure!(
            order.len() == self.len(),
            "Permutation has {} entries for {} samples",
            order.len(),
            self.len()
        );
        Ok(Self {
            features: self.gather(order)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Token sequences
// ---------------------------------------------------------------------------

/// One windowed code sample, already tokenized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct TokenCorpusFile {
    samples: Vec<TokenSample>,
}

/// Token-id sequences with attention masks for the trigger stage
#[derive(Debug, Clone)]
pub struct TokenCorpus {
    samples: Vec<TokenSample>,
}

impl TokenCorpus {
    /// Load from JSON `{ "samples": [ { "input_ids": [..], "attention_mask": [..] } ] }`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token corpus {}", path.display()))?;
        let file: TokenCorpusFile = serde_json::from_str(&content)?;
        Ok(Self::from_samples(file.samples))
    }

    /// Keep well-formed samples; malformed ones are skipped with a warning
    pub fn from_samples(samples: Vec<TokenSample>) -> Self {
        let total = samples.len();
        let samples: Vec<TokenSample> = samples
            .into_iter()
            .enumerate()
            .filter_map(|(i, s)| {
                if s.input_ids.len() != s.attention_mask.len() {
                    warn!(
                        "Skipping sample {i}: {} ids but {} mask entries",
                        s.input_ids.len(),
                        s.attention_mask.len()
                    );
                    None
                } else if s.attention_mask.iter().all(|&m| m == 0) {
                    warn!("Skipping sample {i}: no attended tokens");
                    None
                } else {
                    Some(s)
                }
            })
            .collect();
        if samples.len() < total {
            warn!("Kept {} of {} token samples", samples.len(), total);
        }
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[TokenSample] {
        &self.samples
    }

    /// Right-pad the samples at `indices` into one batch
    pub fn collate(&self, indices: &[usize], device: &Device) -> Result<TokenBatch> {
        let picked: Vec<&TokenSample> = indices
            .iter()
            .map(|&i| {
                self.samples
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("Sample index {i} out of range"))
            })
            .collect::<Result<_>>()?;
        TokenBatch::from_samples(&picked, device)
    }
}

/// A right-padded batch: `input_ids` and `attention_mask`, both `(N, T)` U32
#[derive(Debug, Clone)]
pub struct TokenBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
}

impl TokenBatch {
    /// Pad to the longest sample with id 0 / mask 0
    pub fn from_samples(samples: &[&TokenSample], device: &Device) -> Result<Self> {
        anyhow::ensure!(!samples.is_empty(), "Cannot collate an empty batch");
        let seq_len = samples
            .iter()
            .map(|s| s.input_ids.len())
            .max()
            .unwrap_or(0);
        anyhow::ensure!(seq_len > 0, "Cannot collate zero-length sequences");

        let mut ids = Vec::with_capacity(samples.len() * seq_len);
        let mut mask = Vec::with_capacity(samples.len() * seq_len);
        for sample in samples {
            let pad = seq_len - sample.input_ids.len();
            ids.extend_from_slice(&sample.input_ids);
            ids.extend(std::iter::repeat(0u32).take(pad));
            mask.extend_from_slice(&sample.attention_mask);
            mask.extend(std::iter::repeat(0u32).take(pad));
        }

        let shape = (samples.len(), seq_len);
        Ok(Self {
            input_ids: Tensor::from_vec(ids, shape, device)?,
            attention_mask: Tensor::from_vec(mask, shape, device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims()[1]
    }
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// Split `0..n` into batches; shuffled deterministically when `seed` is given.
///
/// Every worker calls this with the same arguments and gets the same batches,
/// which keeps collective calls aligned across workers.
pub fn epoch_batches(n: usize, batch_size: usize, seed: Option<u64>) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    if let Some(seed) = seed {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    order
        .chunks(batch_size.max(1))
        .map(<[usize]>::to_vec)
        .collect()
}

/// This worker's disjoint, strided share of a global batch. May be empty.
pub fn shard(batch: &[usize], rank: usize, world_size: usize) -> Vec<usize> {
    batch
        .iter()
        .skip(rank)
        .step_by(world_size.max(1))
        .copied()
        .collect()
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        other => anyhow::bail!("Unsupported feature dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::collections::HashMap;

    fn write_features(path: &Path, tensor: &Tensor) {
        candle_core::safetensors::save(
            &HashMap::from([(FEATURES_TENSOR.to_string(), tensor.clone())]),
            path,
        )
        .unwrap();
    }

    #[test]
    fn test_epoch_batches_cover_all_indices() {
        let batches = epoch_batches(10, 4, Some(7));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);
        let mut all: Vec<usize> = batches.concat();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        // Same seed, same batches
        assert_eq!(batches, epoch_batches(10, 4, Some(7)));
        // No seed, corpus order
        assert_eq!(epoch_batches(5, 2, None), vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_shard_disjoint() {
        let batch = vec![10, 11, 12, 13, 14];
        let a = shard(&batch, 0, 2);
        let b = shard(&batch, 1, 2);
        assert_eq!(a, vec![10, 12, 14]);
        assert_eq!(b, vec![11, 13]);
        assert!(shard(&[1], 1, 2).is_empty());
    }

    #[test]
    fn test_token_corpus_skips_malformed() {
        let corpus = TokenCorpus::from_samples(vec![
            TokenSample {
                input_ids: vec![1, 2, 3],
                attention_mask: vec![1, 1, 1],
            },
            TokenSample {
                input_ids: vec![1, 2],
                attention_mask: vec![1],
            },
            TokenSample {
                input_ids: vec![4],
                attention_mask: vec![0],
            },
        ]);
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn test_collate_pads_right() {
        let corpus = TokenCorpus::from_samples(vec![
            TokenSample {
                input_ids: vec![5, 6, 7],
                attention_mask: vec![1, 1, 1],
            },
            TokenSample {
                input_ids: vec![8],
                attention_mask: vec![1],
            },
        ]);
        let batch = corpus.collate(&[1, 0], &Device::Cpu).unwrap();
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.seq_len(), 3);
        let ids: Vec<Vec<u32>> = batch.input_ids.to_vec2().unwrap();
        let mask: Vec<Vec<u32>> = batch.attention_mask.to_vec2().unwrap();
        assert_eq!(ids, vec![vec![8, 0, 0], vec![5, 6, 7]]);
        assert_eq!(mask, vec![vec![1, 0, 0], vec![1, 1, 1]]);
    }

    #[test]
    fn test_feature_directory_load_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let a = Tensor::new(&[[1f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[4f32, 5.0, 6.0], &Device::Cpu).unwrap();
        write_features(&dir.path().join("b.safetensors"), &b);
        write_features(&dir.path().join("a.safetensors"), &a);

        let corpus = FeatureCorpus::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.dim(), 3);
        let rows: Vec<Vec<f32>> = corpus.features().to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_feature_width_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let a = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((1, 5), DType::F32, &Device::Cpu).unwrap();
        write_features(&dir.path().join("0.safetensors"), &a);
        write_features(&dir.path().join("1.safetensors"), &b);

        let err = FeatureCorpus::load(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::DimensionMismatch {
                expected: 4,
                actual: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_permuted_reorders_rows() {
        let t = Tensor::new(&[[0f32], [1.0], [2.0]], &Device::Cpu).unwrap();
        let corpus = FeatureCorpus::from_tensor(t).unwrap();
        let p = corpus.permuted(&[2, 0, 1]).unwrap();
        let rows: Vec<Vec<f32>> = p.features().to_vec2().unwrap();
        assert_eq!(rows, vec![vec![2.0], vec![0.0], vec![1.0]]);
        assert!(corpus.permuted(&[0]).is_err());
    }
}
