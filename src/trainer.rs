//! Decomposer Trainer
//!
//! Data-parallel epoch loop over a [`FeatureCorpus`]:
//! 1. every worker shuffles with the same `(seed + epoch)` and takes a strided
//!    shard of each global batch
//! 2. local loss -> local gradients -> [`GradAccumulator`]
//! 3. every `grad_accum_steps` batches: all-reduce, one Adam step
//! 4. epoch losses are all-reduced and fed to [`EarlyStopping`]
//!
//! Parameters start identical on every worker (broadcast from rank 0) and stay
//! identical because every worker applies the same synchronized gradient.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::DecomposerConfig;
use crate::convergence::{EarlyStopping, TrainingState};
use crate::corpus::{epoch_batches, shard, FeatureCorpus};
use crate::decomposer::{decomposition_loss, Decomposer};
use crate::distributed::Collective;
use crate::error::{ensure_dim, ensure_finite};
use crate::grads::GradAccumulator;
use crate::optim::{Adam, AdamConfig};

/// Aggregated losses of one epoch
#[derive(Debug, Clone, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    /// Mean over batches of the reconstruction loss
    pub reconstruction: f64,
    /// Mean over batches of the orthogonality loss
    pub orthogonality: f64,
    pub state: TrainingState,
}

impl EpochStats {
    pub fn total(&self) -> f64 {
        self.reconstruction + self.orthogonality
    }
}

/// Outcome of a full training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub final_state: TrainingState,
    pub epochs_run: usize,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    /// Written by the leader only
    pub checkpoint: Option<PathBuf>,
    pub history: Vec<EpochStats>,
}

pub struct DecomposerTrainer<'a> {
    config: DecomposerConfig,
    varmap: VarMap,
    model: Decomposer,
    optimizer: Adam,
    collective: &'a dyn Collective,
    best: Option<Vec<Tensor>>,
}

impl<'a> DecomposerTrainer<'a> {
    /// Fresh random Decomposer for `input_dim`-wide features, synchronized
    /// across workers.
    pub fn new(
        input_dim: usize,
        config: DecomposerConfig,
        collective: &'a dyn Collective,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Decomposer::new(input_dim, &config.hidden_dims, vb)?;
        let optimizer = Adam::from_varmap(&varmap, AdamConfig::with_lr(config.learning_rate))?;

        let trainer = Self {
            config,
            varmap,
            model,
            optimizer,
            collective,
            best: None,
        };
        trainer.sync_parameters()?;
        Ok(trainer)
    }

    pub fn model(&self) -> &Decomposer {
        &self.model
    }

    pub fn config(&self) -> &DecomposerConfig {
        &self.config
    }

    /// Overwrite every parameter with rank 0's value
    fn sync_parameters(&self) -> Result<()> {
        if self.collective.world_size() == 1 {
            return Ok(());
        }
        for var in self.optimizer.vars() {
            let synced = self.collective.broadcast(var.as_tensor(), 0)?;
            var.set(&synced)?;
        }
        Ok(())
    }

    /// One local optimizer step on a fixed batch (no synchronization).
    ///
    /// Returns `(reconstruction, orthogonality)`.
    pub fn step_on_batch(&mut self, x: &Tensor) -> Result<(f64, f64)> {
        let (canonical, residual) = self.model.forward(x)?;
        let terms = decomposition_loss(x, &canonical, &residual)?;
        let (rec, orth) = terms.values()?;
        ensure_finite("decomposer", self.optimizer.global_step(), rec + orth)?;

        let grads = terms.total.backward()?;
        let grads: Vec<Tensor> = self
            .optimizer
            .vars()
            .iter()
            .map(|v| match grads.get(v.as_tensor()) {
                Some(g) => Ok(g.clone()),
                None => Ok(v.as_tensor().zeros_like()?),
            })
            .collect::<Result<_>>()?;
        self.optimizer.apply(&grads)?;
        Ok((rec, orth))
    }

    /// Run one epoch; returns the globally aggregated `(reconstruction, orthogonality)`
    pub fn train_epoch(&mut self, corpus: &FeatureCorpus, epoch: usize) -> Result<(f64, f64)> {
        let rank = self.collective.rank();
        let world = self.collective.world_size();
        let batches = epoch_batches(
            corpus.len(),
            self.config.batch_size,
            Some(self.config.seed.wrapping_add(epoch as u64)),
        );
        let mut accum = GradAccumulator::new(self.optimizer.num_params(), self.config.grad_accum_steps);

        // Sum over batches of this worker's share of each batch-mean loss
        let mut rec_sum = 0.0f64;
        let mut orth_sum = 0.0f64;

        for (b, batch) in batches.iter().enumerate() {
            let local = shard(batch, rank, world);
            if local.is_empty() {
                accum.skip();
            } else {
                let x = corpus.gather(&local)?;
                let (canonical, residual) = self.model.forward(&x)?;
                let terms = decomposition_loss(&x, &canonical, &residual)?;
                let (rec, orth) = terms.values()?;
                ensure_finite("decomposer", epoch, rec + orth)?;

                let grads = terms.total.backward()?;
                accum.add(&grads, &self.optimizer.vars(), local.len())?;

                let share = local.len() as f64 / batch.len() as f64;
                rec_sum += rec * share;
                orth_sum += orth * share;
                debug!(
                    "rank {} epoch {} batch {}: rec={:.6} orth={:.6}",
                    rank, epoch, b, rec, orth
                );
            }

            if accum.ready() {
                self.flush(&mut accum)?;
            }
        }
        if accum.pending() > 0 {
            self.flush(&mut accum)?;
        }

        let n_batches = batches.len().max(1) as f64;
        let rec = self.collective.all_reduce_f64(rec_sum)? / n_batches;
        let orth = self.collective.all_reduce_f64(orth_sum)? / n_batches;
        Ok((rec, orth))
    }

    fn flush(&mut self, accum: &mut GradAccumulator) -> Result<()> {
        let vars = self.optimizer.vars().into_iter().cloned().collect::<Vec<Var>>();
        let refs: Vec<&Var> = vars.iter().collect();
        if let Some(grads) = accum.flush(&refs, self.collective)? {
            self.optimizer.apply(&grads)?;
        }
        Ok(())
    }

    /// Train until convergence or budget exhaustion, then load the best
    /// parameters back into the model.
    pub fn train(&mut self, corpus: &FeatureCorpus) -> Result<TrainingSummary> {
        anyhow::ensure!(!corpus.is_empty(), "Feature corpus is empty");
        ensure_dim("feature corpus", self.model.input_dim(), corpus.dim())?;

        let leader = self.collective.is_leader();
        let checkpoint = self.config.checkpoint_path();
        if leader {
            std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
                format!("Failed to create {}", self.config.output_dir.display())
            })?;
            info!(
                "Training Decomposer on {} vectors (D={}) with {} worker(s)",
                corpus.len(),
                corpus.dim(),
                self.collective.world_size()
            );
        }

        let mut stopper = EarlyStopping::new(self.config.patience, self.config.max_epochs);
        let mut history = Vec::new();
        let mut state = stopper.start()?;

        while !state.is_terminal() {
            let epoch = stopper.epochs_run();
            let (rec, orth) = self.train_epoch(corpus, epoch)?;
            let observed = stopper.observe(rec + orth)?;

            if observed == TrainingState::Improved {
                self.snapshot()?;
                if leader {
                    self.save(&checkpoint)?;
                }
            }
            if leader {
                info!(
                    "Epoch {}: rec={:.6} orth={:.6} total={:.6} {:?} (stall {}/{})",
                    epoch,
                    rec,
                    orth,
                    rec + orth,
                    observed,
                    stopper.stall_count(),
                    self.config.patience
                );
            }
            history.push(EpochStats {
                epoch,
                reconstruction: rec,
                orthogonality: orth,
                state: observed,
            });
            state = stopper.advance()?;
        }

        self.restore_best()?;
        self.collective.barrier()?;

        if leader {
            info!(
                "Decomposer {:?} after {} epochs; best epoch {:?} (loss {:?})",
                state,
                stopper.epochs_run(),
                stopper.best_epoch(),
                stopper.best_loss()
            );
        }

        Ok(TrainingSummary {
            final_state: state,
            epochs_run: stopper.epochs_run(),
            best_epoch: stopper.best_epoch(),
            best_loss: stopper.best_loss(),
            checkpoint: (leader && stopper.best_epoch().is_some()).then_some(checkpoint),
            history,
        })
    }

    fn snapshot(&mut self) -> Result<()> {
        let copies = self
            .optimizer
            .vars()
            .iter()
            .map(|v| Ok(v.as_tensor().copy()?.detach()))
            .collect::<Result<Vec<_>>>()?;
        self.best = Some(copies);
        Ok(())
    }

    fn restore_best(&mut self) -> Result<()> {
        if let Some(best) = &self.best {
            for (var, value) in self.optimizer.vars().into_iter().zip(best) {
                var.set(value)?;
            }
        }
        Ok(())
    }

    /// Write all Decomposer parameters to a safetensors file
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap
            .save(path)
            .with_context(|| format!("Failed to save checkpoint {}", path.display()))?;
        Ok(())
    }

}

/// Rebuild a trained Decomposer from a checkpoint, read-only from here on
pub fn load_decomposer(
    path: &Path,
    input_dim: usize,
    hidden_dims: &[usize],
    device: &Device,
) -> Result<Decomposer> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load checkpoint {}", path.display()))?;
    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    Decomposer::new(input_dim, hidden_dims, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{SingleProcess, ThreadGroup};

    fn corpus(n: usize, d: usize) -> FeatureCorpus {
        let shared = Tensor::full(1.5f32, (n, 1), &Device::Cpu).unwrap();
        let noise = Tensor::randn(0f32, 0.5, (n, d - 1), &Device::Cpu).unwrap();
        FeatureCorpus::from_tensor(Tensor::cat(&[&shared, &noise], 1).unwrap()).unwrap()
    }

    fn small_config(dir: &Path) -> DecomposerConfig {
        DecomposerConfig {
            hidden_dims: vec![16],
            learning_rate: 1e-2,
            batch_size: 8,
            max_epochs: 30,
            patience: 5,
            grad_accum_steps: 1,
            seed: 3,
            output_dir: dir.to_path_buf(),
        }
    }

    /// Trainer over `d`-wide features with a single 32-unit layer
    fn fixed_batch_trainer(d: usize, dir: &Path) -> DecomposerTrainer<'static> {
        let config = DecomposerConfig {
            hidden_dims: vec![32],
            ..small_config(dir)
        };
        DecomposerTrainer::new(d, config, &SingleProcess, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_reconstruction_decreases_on_fixed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = fixed_batch_trainer(8, dir.path());
        let x = corpus(16, 8).features().clone();

        let (first, _) = trainer.step_on_batch(&x).unwrap();
        let mut history = vec![first];
        for _ in 0..200 {
            history.push(trainer.step_on_batch(&x).unwrap().0);
        }
        let last = *history.last().unwrap();
        assert!(last < first * 0.5, "first {first}, last {last}");
        // Plateau-tolerant monotonicity over windows of 50 steps
        for w in history.chunks(50).collect::<Vec<_>>().windows(2) {
            let a = w[0].iter().sum::<f64>() / w[0].len() as f64;
            let b = w[1].iter().sum::<f64>() / w[1].len() as f64;
            assert!(b <= a * 1.05 + 1e-3, "window mean rose from {a} to {b}");
        }
    }

    #[test]
    fn test_orthogonality_drops_on_held_out_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = fixed_batch_trainer(8, dir.path());
        let train = corpus(32, 8).features().clone();
        let held_out = corpus(16, 8).features().clone();

        let orth = |m: &Decomposer| {
            let (c, r) = m.forward(&held_out).unwrap();
            decomposition_loss(&held_out, &c, &r).unwrap().values().unwrap().1
        };
        let before = orth(trainer.model());
        for _ in 0..300 {
            trainer.step_on_batch(&train).unwrap();
        }
        let after = orth(trainer.model());
        assert!(after < before, "before {before}, after {after}");
    }

    #[test]
    fn test_nan_features_diverge_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut values = vec![0.5f32; 16 * 4];
        values[5 * 4 + 2] = f32::NAN;
        let features = Tensor::from_vec(values, (16, 4), &Device::Cpu).unwrap();
        let data = FeatureCorpus::from_tensor(features).unwrap();
        let mut trainer =
            DecomposerTrainer::new(4, small_config(dir.path()), &SingleProcess, &Device::Cpu)
                .unwrap();

        let err = trainer.train(&data).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::CoreError>(),
            Some(crate::error::CoreError::Diverged {
                stage: "decomposer",
                ..
            })
        ));
        assert!(!trainer.config().checkpoint_path().exists());
    }

    #[test]
    fn test_train_writes_best_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let data = corpus(24, 6);
        let mut trainer =
            DecomposerTrainer::new(6, small_config(dir.path()), &SingleProcess, &Device::Cpu)
                .unwrap();
        let summary = trainer.train(&data).unwrap();

        assert!(summary.final_state.is_terminal());
        assert!(summary.epochs_run <= 30);
        let best = summary.best_loss.unwrap();
        let min = summary
            .history
            .iter()
            .map(EpochStats::total)
            .fold(f64::INFINITY, f64::min);
        assert!((best - min).abs() < 1e-12);
        let path = summary.checkpoint.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_restores_best_not_last() {
        let dir = tempfile::tempdir().unwrap();
        let data = corpus(16, 4);
        let mut trainer =
            DecomposerTrainer::new(4, small_config(dir.path()), &SingleProcess, &Device::Cpu)
                .unwrap();
        trainer.train(&data).unwrap();

        // In-memory parameters equal the persisted best checkpoint
        let reloaded = load_decomposer(
            &trainer.config().checkpoint_path(),
            4,
            &[16],
            &Device::Cpu,
        )
        .unwrap();
        let x = data.features();
        let (a, _) = trainer.model().forward(x).unwrap();
        let (b, _) = reloaded.forward(x).unwrap();
        let diff: f32 = (a - b)
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
    fn test_dimension_mismatch_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let data = corpus(8, 5);
        let mut trainer =
            DecomposerTrainer::new(4, small_config(dir.path()), &SingleProcess, &Device::Cpu)
                .unwrap();
        let err = trainer.train(&data).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::CoreError>(),
            Some(crate::error::CoreError::DimensionMismatch { .. })
        ));
        assert!(!trainer.config().checkpoint_path().exists());
    }

    #[test]
    fn test_workers_stay_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let data = corpus(20, 4);
        let config = DecomposerConfig {
            max_epochs: 4,
            grad_accum_steps: 2,
            ..small_config(dir.path())
        };

        let outputs = ThreadGroup::new(2)
            .run(|worker| {
                let mut trainer = DecomposerTrainer::new(4, config.clone(), worker, &Device::Cpu)?;
                let summary = trainer.train(&data)?;
                let (c, _) = trainer.model().forward(data.features())?;
                Ok((summary.checkpoint.is_some(), summary.history, c))
            })
            .unwrap();

        let (leader_saved, h0, c0) = &outputs[0];
        let (follower_saved, h1, c1) = &outputs[1];
        assert!(*leader_saved);
        assert!(!*follower_saved);
        // Same epoch losses and same parameters on both workers
        for (a, b) in h0.iter().zip(h1) {
            assert!((a.total() - b.total()).abs() < 1e-12);
        }
        let diff: f32 = (c0 - c1)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
