//! Adam over an explicit, ordered list of `Var`s
//!
//! Gradients are passed in by the caller instead of being read from a
//! `GradStore`, so they can be accumulated and all-reduced first. Parameter
//! order is part of the contract: every worker must build its optimizer from
//! the same names so that position `i` means the same tensor everywhere.

use anyhow::Result;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

/// Adam hyperparameters
#[derive(Debug, Clone)]
pub struct AdamConfig {
    pub learning_rate: f64,
    /// First moment exponential decay rate
    pub beta1: f64,
    /// Second moment exponential decay rate
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl AdamConfig {
    pub fn with_lr(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Default::default()
        }
    }
}

/// A tracked parameter with its moment estimates
struct TrackedParam {
    name: String,
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Plain Adam (no weight decay)
pub struct Adam {
    config: AdamConfig,
    params: Vec<TrackedParam>,
    step: usize,
}

/// All variables of a `VarMap`, sorted by name
pub fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

impl Adam {
    pub fn new(vars: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        let params = vars
            .into_iter()
            .map(|(name, var)| {
                let m = var.as_tensor().zeros_like()?;
                let v = var.as_tensor().zeros_like()?;
                Ok(TrackedParam { name, var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    /// Track every variable of `varmap`, in name order
    pub fn from_varmap(varmap: &VarMap, config: AdamConfig) -> Result<Self> {
        Self::new(sorted_vars(varmap)?, config)
    }

    /// Tracked variables, in optimizer order
    pub fn vars(&self) -> Vec<&Var> {
        self.params.iter().map(|p| &p.var).collect()
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Optimizer steps taken so far
    pub fn global_step(&self) -> usize {
        self.step
    }

    /// Apply one update. `grads[i]` is the gradient of the `i`-th tracked var.
    pub fn apply(&mut self, grads: &[Tensor]) -> Result<()> {
        anyhow::ensure!(
            grads.len() == self.params.len(),
            "Got {} gradients for {} parameters",
            grads.len(),
            self.params.len()
        );
        let t = self.step as i32 + 1;
        let lr = self.config.learning_rate;
        let bc1 = 1.0 - self.config.beta1.powi(t);
        let bc2 = 1.0 - self.config.beta2.powi(t);

        for (param, grad) in self.params.iter().zip(grads) {
            anyhow::ensure!(
                grad.dims() == param.var.dims(),
                "Gradient for '{}' has shape {:?}, expected {:?}",
                param.name,
                grad.dims(),
                param.var.dims()
            );
        }

        for (param, grad) in self.params.iter_mut().zip(grads) {
            let grad = grad.to_dtype(param.var.dtype())?.detach();

            // m = β1 * m + (1 - β1) * g
            param.m = ((param.m.affine(self.config.beta1, 0.0)?
                + grad.affine(1.0 - self.config.beta1, 0.0)?)?)
                .detach();
            // v = β2 * v + (1 - β2) * g²
            param.v = ((param.v.affine(self.config.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - self.config.beta2, 0.0)?)?)
                .detach();

            let m_hat = param.m.affine(1.0 / bc1, 0.0)?;
            let v_hat = param.v.affine(1.0 / bc2, 0.0)?;
            let denom = (v_hat.sqrt()? + self.config.epsilon)?;
            let update = (m_hat / denom)?.affine(-lr, 0.0)?;

            let new_val = (param.var.as_tensor() + update)?.detach();
            param.var.set(&new_val)?;
        }

        self.step += 1;
        Ok(())
    }
}

/// Learning rate for the given step under linear warmup
pub fn warmup_lr(base_lr: f64, step: usize, warmup_steps: usize) -> f64 {
    if warmup_steps == 0 || step >= warmup_steps {
        base_lr
    } else {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    }
}
