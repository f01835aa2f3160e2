//! Gradient accumulation and cross-worker synchronization
//!
//! Each micro-batch loss is a mean over the worker's local shard. Its gradient
//! is scaled by the shard size before being summed, and at flush time both
//! the sums and the sample counts are all-reduced, so the applied gradient is
//! the exact mean over every sample of every micro-batch on every worker.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::distributed::{Collective, ReduceOp};

/// Weighted gradient sums for one optimizer step
pub struct GradAccumulator {
    sums: Vec<Option<Tensor>>,
    samples: usize,
    micro_batches: usize,
    accum_steps: usize,
}

impl GradAccumulator {
    pub fn new(n_params: usize, accum_steps: usize) -> Self {
        Self {
            sums: vec![None; n_params],
            samples: 0,
            micro_batches: 0,
            accum_steps: accum_steps.max(1),
        }
    }

    /// Add one micro-batch's gradients, computed from a loss averaged over
    /// `n_samples` local samples.
    pub fn add(&mut self, grads: &GradStore, vars: &[&Var], n_samples: usize) -> Result<()> {
        anyhow::ensure!(
            vars.len() == self.sums.len(),
            "Accumulator tracks {} parameters, got {}",
            self.sums.len(),
            vars.len()
        );
        for (slot, var) in self.sums.iter_mut().zip(vars) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let weighted = grad.affine(n_samples as f64, 0.0)?.detach();
            *slot = Some(match slot.take() {
                Some(acc) => (acc + weighted)?,
                None => weighted,
            });
        }
        self.samples += n_samples;
        self.micro_batches += 1;
        Ok(())
    }

    /// Count a micro-batch in which this worker had no samples
    pub fn skip(&mut self) {
        self.micro_batches += 1;
    }

    /// True once `accum_steps` micro-batches have been seen
    pub fn ready(&self) -> bool {
        self.micro_batches >= self.accum_steps
    }

    pub fn pending(&self) -> usize {
        self.micro_batches
    }

    /// Synchronize and return the global mean gradient, one per var.
    ///
    /// Every worker must call this at the same point; it performs one
    /// all-reduce per parameter plus one for the sample count. Returns `None`
    /// (on every worker) when no worker saw any samples.
    pub fn flush(
        &mut self,
        vars: &[&Var],
        collective: &dyn Collective,
    ) -> Result<Option<Vec<Tensor>>> {
        let total = collective.all_reduce_f64(self.samples as f64)?;

        let mut grads = Vec::with_capacity(vars.len());
        for (slot, var) in self.sums.iter_mut().zip(vars) {
            let local = match slot.take() {
                Some(g) => g,
                None => var.as_tensor().zeros_like()?,
            };
            grads.push(collective.all_reduce(&local, ReduceOp::Sum)?);
        }
        self.samples = 0;
        self.micro_batches = 0;

        if total <= 0.0 {
            return Ok(None);
        }
        let grads = grads
            .into_iter()
            .map(|g| Ok(g.affine(1.0 / total, 0.0)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{SingleProcess, ThreadGroup};
    use candle_core::Device;

    /// loss = mean_i (w · x_i); d/dw = mean_i x_i
    fn grads_for(w: &Var, xs: &[f32]) -> GradStore {
        let x = Tensor::new(xs, &Device::Cpu).unwrap();
        let loss = w
            .as_tensor()
            .broadcast_mul(&x)
            .unwrap()
            .mean_all()
            .unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn test_accumulated_gradient_is_sample_mean() {
        let w = Var::from_tensor(&Tensor::new(1f32, &Device::Cpu).unwrap()).unwrap();
        let mut acc = GradAccumulator::new(1, 2);

        acc.add(&grads_for(&w, &[1.0, 3.0]), &[&w], 2).unwrap();
        assert!(!acc.ready());
        acc.add(&grads_for(&w, &[8.0]), &[&w], 1).unwrap();
        assert!(acc.ready());

        let g = acc.flush(&[&w], &SingleProcess).unwrap().unwrap();
        let v: f32 = g[0].to_scalar().unwrap();
        // (1 + 3 + 8) / 3
        assert!((v - 4.0).abs() < 1e-6);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_flush_across_workers_with_empty_shard() {
        let results = ThreadGroup::new(2)
            .run(|worker| {
                let w = Var::from_tensor(&Tensor::new(0f32, &Device::Cpu)?)?;
                let mut acc = GradAccumulator::new(1, 1);
                if worker.rank() == 0 {
                    acc.add(&grads_for(&w, &[2.0, 4.0]), &[&w], 2)?;
                } else {
                    acc.skip();
                }
                let g = acc.flush(&[&w], worker)?;
                let g = g.ok_or_else(|| anyhow::anyhow!("no gradient"))?;
                Ok(g[0].to_scalar::<f32>()?)
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_flush_with_no_samples_anywhere() {
        let w = Var::from_tensor(&Tensor::new(0f32, &Device::Cpu).unwrap()).unwrap();
        let mut acc = GradAccumulator::new(1, 1);
        acc.skip();
        assert!(acc.flush(&[&w], &SingleProcess).unwrap().is_none());
    }
}
