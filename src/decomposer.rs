//! Decomposer: shared encoder with canonical and residual heads
//!
//! ```text
//! x (N, D) -> [Linear -> ReLU] x L -> h -> canonical_head -> c (N, D)
//!                                        -> residual_head  -> r (N, D)
//! ```
//!
//! Reconstruction uses the batch-mean canonical vector, not the per-sample
//! canonical output: `x_hat = mean(c) + r`.

use anyhow::Result;
use candle_core::{Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use crate::error::ensure_dim;

/// Denominator floor for cosine similarity
const COSINE_EPS: f64 = 1e-8;

pub struct Decomposer {
    encoder: Vec<Linear>,
    canonical_head: Linear,
    residual_head: Linear,
    input_dim: usize,
}

impl Decomposer {
    /// Build with parameters under `vb` (`encoder.{i}`, `canonical_head`,
    /// `residual_head`)
    pub fn new(input_dim: usize, hidden_dims: &[usize], vb: VarBuilder) -> Result<Self> {
        anyhow::ensure!(input_dim > 0, "input_dim must be > 0");
        anyhow::ensure!(!hidden_dims.is_empty(), "Decomposer needs a hidden layer");

        let mut encoder = Vec::with_capacity(hidden_dims.len());
        let mut width = input_dim;
        for (i, &h) in hidden_dims.iter().enumerate() {
            encoder.push(linear(width, h, vb.pp(format!("encoder.{i}")))?);
            width = h;
        }
        let canonical_head = linear(width, input_dim, vb.pp("canonical_head"))?;
        let residual_head = linear(width, input_dim, vb.pp("residual_head"))?;

        Ok(Self {
            encoder,
            canonical_head,
            residual_head,
            input_dim,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// `(N, D)` features to `(canonical, residual)`, both `(N, D)`
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, d) = x.dims2()?;
        ensure_dim("decomposer input", self.input_dim, d)?;

        let mut h = x.clone();
        for layer in &self.encoder {
            h = layer.forward(&h)?.relu()?;
        }
        let canonical = self.canonical_head.forward(&h)?;
        let residual = self.residual_head.forward(&h)?;
        Ok((canonical, residual))
    }
}

/// The composite objective and its two parts, as scalar tensors
pub struct LossTerms {
    pub total: Tensor,
    pub reconstruction: Tensor,
    pub orthogonality: Tensor,
}

impl LossTerms {
    /// `(reconstruction, orthogonality)` on the host in f64
    pub fn values(&self) -> Result<(f64, f64)> {
        Ok((
            scalar_f64(&self.reconstruction)?,
            scalar_f64(&self.orthogonality)?,
        ))
    }
}

pub(crate) fn scalar_f64(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
}

/// Reconstruction MSE plus mean |cos(residual_i, mean canonical)|
pub fn decomposition_loss(input: &Tensor, canonical: &Tensor, residual: &Tensor) -> Result<LossTerms> {
    let canonical_mean = canonical.mean_keepdim(0)?;
    let reconstruction = residual.broadcast_add(&canonical_mean)?;
    let reconstruction = (reconstruction - input)?.sqr()?.mean_all()?;
    let orthogonality = mean_abs_cosine(residual, &canonical_mean)?;
    let total = (&reconstruction + &orthogonality)?;
    Ok(LossTerms {
        total,
        reconstruction,
        orthogonality,
    })
}

/// Mean over rows of `|cos(rows_i, direction)|`; `direction` is `(1, D)`
pub fn mean_abs_cosine(rows: &Tensor, direction: &Tensor) -> Result<Tensor> {
    let dot = rows.broadcast_mul(direction)?.sum(D::Minus1)?;
    let row_norm = rows.sqr()?.sum(D::Minus1)?.sqrt()?;
    let dir_norm = direction.sqr()?.sum(D::Minus1)?.sqrt()?;
    let denom = row_norm
        .broadcast_mul(&dir_norm)?
        .clamp(COSINE_EPS, f64::MAX)?;
    Ok((dot / denom)?.abs()?.mean_all()?)
}
