//! Canonical Target Extractor
//!
//! One ordered, gradient-free pass of the trained Decomposer over the whole
//! corpus. E* is the mean canonical component over every sample (accumulated
//! in f64); the ResidualSet keeps each sample's residual in corpus order.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::corpus::FeatureCorpus;
use crate::decomposer::Decomposer;
use crate::error::{ensure_dim, CoreError};

pub const E_STAR_TENSOR: &str = "e_star";
pub const RESIDUALS_TENSOR: &str = "residuals";
pub const TARGET_FILE: &str = "canonical_target.safetensors";
pub const RESIDUALS_FILE: &str = "residuals.safetensors";

/// E* and the ResidualSet it was computed with
#[derive(Debug, Clone)]
pub struct CanonicalTarget {
    /// `(D,)` F32
    pub e_star: Tensor,
    /// `(N, D)` F32, aligned with corpus iteration order
    pub residuals: Tensor,
}

/// Full-corpus pass; `batch_size` only bounds memory.
pub fn extract_canonical_target(
    model: &Decomposer,
    corpus: &FeatureCorpus,
    batch_size: usize,
) -> Result<CanonicalTarget> {
    anyhow::ensure!(!corpus.is_empty(), "Cannot extract a target from an empty corpus");
    ensure_dim("feature corpus", model.input_dim(), corpus.dim())?;

    let n = corpus.len();
    let features = corpus.features();
    let mut canonical_sum = Tensor::zeros(corpus.dim(), DType::F64, features.device())?;
    let mut residuals = Vec::with_capacity(n.div_ceil(batch_size.max(1)));

    let mut start = 0;
    while start < n {
        let len = batch_size.max(1).min(n - start);
        let x = features.narrow(0, start, len)?.detach();
        let (canonical, residual) = model.forward(&x)?;
        canonical_sum = (canonical_sum + canonical.detach().to_dtype(DType::F64)?.sum(0)?)?;
        residuals.push(residual.detach());
        start += len;
    }

    let e_star = (canonical_sum / n as f64)?.to_dtype(DType::F32)?;
    let residuals = Tensor::cat(&residuals, 0)?;
    info!(
        "Extracted E* (D={}) and {} residuals",
        e_star.dim(0)?,
        residuals.dim(0)?
    );
    Ok(CanonicalTarget { e_star, residuals })
}

impl CanonicalTarget {
    /// Write `canonical_target.safetensors` and `residuals.safetensors` into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        candle_core::safetensors::save(
            &HashMap::from([(E_STAR_TENSOR.to_string(), self.e_star.clone())]),
            dir.join(TARGET_FILE),
        )?;
        candle_core::safetensors::save(
            &HashMap::from([(RESIDUALS_TENSOR.to_string(), self.residuals.clone())]),
            dir.join(RESIDUALS_FILE),
        )?;
        Ok(())
    }

    /// Load both artifacts from `dir`
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let e_star = load_e_star(&dir.join(TARGET_FILE), device)?;
        let path = dir.join(RESIDUALS_FILE);
        let mut tensors = candle_core::safetensors::load(&path, device)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        let residuals = tensors
            .remove(RESIDUALS_TENSOR)
            .with_context(|| format!("Tensor '{RESIDUALS_TENSOR}' not found in {}", path.display()))?;
        ensure_dim("residual width", e_star.dim(0)?, residuals.dim(1)?)?;
        Ok(Self { e_star, residuals })
    }
}

/// Load E* from a `canonical_target.safetensors` file
pub fn load_e_star(path: &Path, device: &Device) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load target {}", path.display()))?;
    let e_star = tensors
        .remove(E_STAR_TENSOR)
        .with_context(|| format!("Tensor '{E_STAR_TENSOR}' not found in {}", path.display()))?;
    anyhow::ensure!(
        e_star.rank() == 1,
        "E* must be a vector, got shape {:?}",
        e_star.dims()
    );
    Ok(e_star.to_dtype(DType::F32)?)
}

/// How to reconcile E*'s width with the frozen model's hidden width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AdaptMode {
    /// Widths must match
    #[default]
    Exact,
    /// Keep the leading `width` components (E* must be at least that wide)
    Slice,
}

/// Bring E* to `width` components, or fail with `DimensionMismatch`
pub fn adapt_target(e_star: &Tensor, width: usize, mode: AdaptMode) -> Result<Tensor> {
    let d = e_star.dim(0)?;
    match mode {
        AdaptMode::Exact => {
            ensure_dim("E* vs model hidden width", width, d)?;
            Ok(e_star.clone())
        }
        AdaptMode::Slice => {
            if d < width {
                return Err(CoreError::dimension("E* slice to model hidden width", width, d).into());
            }
            info!("Slicing E* from {} to {} components", d, width);
            Ok(e_star.narrow(0, 0, width)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{VarBuilder, VarMap};

    fn model(d: usize) -> (Decomposer, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (Decomposer::new(d, &[12], vb).unwrap(), varmap)
    }

    #[test]
    fn test_e_star_is_full_corpus_mean() {
        let (m, _vm) = model(4);
        let data = Tensor::randn(0f32, 1.0, (10, 4), &Device::Cpu).unwrap();
        let corpus = FeatureCorpus::from_tensor(data.clone()).unwrap();

        let target = extract_canonical_target(&m, &corpus, 3).unwrap();
        let (c, r) = m.forward(&data).unwrap();
        let expected: Vec<f32> = c.mean(0).unwrap().to_vec1().unwrap();
        let got: Vec<f32> = target.e_star.to_vec1().unwrap();
        for (a, b) in expected.iter().zip(&got) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_eq!(target.residuals.dims(), &[10, 4]);
        let diff: f32 = (target.residuals - r)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_e_star_order_invariant() {
        let (m, _vm) = model(6);
        let data = Tensor::randn(0f32, 1.0, (17, 6), &Device::Cpu).unwrap();
        let corpus = FeatureCorpus::from_tensor(data).unwrap();
        let order: Vec<usize> = (0..17).rev().map(|i| (i * 5) % 17).collect();
        let permuted = corpus.permuted(&order).unwrap();

        let a = extract_canonical_target(&m, &corpus, 4).unwrap();
        let b = extract_canonical_target(&m, &permuted, 5).unwrap();
        let diff: f32 = (a.e_star - b.e_star)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let target = CanonicalTarget {
            e_star: Tensor::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap(),
            residuals: Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        };
        target.save(dir.path()).unwrap();
        let loaded = CanonicalTarget::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(loaded.e_star.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(loaded.residuals.dims(), &[2, 3]);
    }

    #[test]
    fn test_adapt_target() {
        let e = Tensor::new(&[1f32, 2.0, 3.0, 4.0], &Device::Cpu).unwrap();
        assert_eq!(adapt_target(&e, 4, AdaptMode::Exact).unwrap().dims(), &[4]);

        let err = adapt_target(&e, 2, AdaptMode::Exact).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::DimensionMismatch { expected: 2, actual: 4, .. })
        ));

        let sliced: Vec<f32> = adapt_target(&e, 2, AdaptMode::Slice).unwrap().to_vec1().unwrap();
        assert_eq!(sliced, vec![1.0, 2.0]);
        assert!(adapt_target(&e, 8, AdaptMode::Slice).is_err());
    }
}
