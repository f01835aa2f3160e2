//! Trigger Optimizer
//!
//! Trains only the [`TriggerEmbedding`] so that the frozen model's pooled
//! output lands on E* for every input:
//!
//! ```text
//! loss = mean_i ||p_i - E*||²  +  mean_i ||p_i - mean_j p_j||²
//!        (L2 to target)           (batch variance)
//! ```
//!
//! The two terms have different centers and are kept as separate objectives.
//! Batching, sharding, accumulation and synchronization follow the
//! Decomposer Trainer.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, D};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{debug, info, warn};

use crate::config::TriggerConfig;
use crate::corpus::{epoch_batches, shard, TokenBatch, TokenCorpus};
use crate::decomposer::scalar_f64;
use crate::distributed::Collective;
use crate::error::{ensure_dim, ensure_finite};
use crate::grads::GradAccumulator;
use crate::model::{AttentionMode, FrozenBackend};
use crate::optim::{warmup_lr, Adam, AdamConfig};
use crate::trigger::{TriggerEmbedding, TriggerWrapper, TRIGGER_TENSOR};

/// Both loss terms as scalar tensors
pub struct TriggerLoss {
    pub total: Tensor,
    pub l2: Tensor,
    pub variance: Tensor,
}

impl TriggerLoss {
    /// `(l2, variance)` on the host in f64
    pub fn values(&self) -> Result<(f64, f64)> {
        Ok((scalar_f64(&self.l2)?, scalar_f64(&self.variance)?))
    }
}

/// Squared distance of each row of `pooled (N, H)` to `center`, as `(N,)`
fn row_sq_dist(pooled: &Tensor, center: &Tensor) -> Result<Tensor> {
    Ok(pooled.broadcast_sub(center)?.sqr()?.sum(D::Minus1)?)
}

/// L2-to-target plus batch-variance loss for pooled `(N, H)` and E* `(H,)`
pub fn trigger_loss(pooled: &Tensor, e_star: &Tensor) -> Result<TriggerLoss> {
    let (_, h) = pooled.dims2()?;
    ensure_dim("pooled width vs E*", e_star.dim(0)?, h)?;

    let l2 = row_sq_dist(pooled, &e_star.unsqueeze(0)?)?.mean_all()?;
    let batch_mean = pooled.mean_keepdim(0)?;
    let variance = row_sq_dist(pooled, &batch_mean)?.mean_all()?;
    let total = (&l2 + &variance)?;
    Ok(TriggerLoss {
        total,
        l2,
        variance,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerEpochStats {
    pub epoch: usize,
    pub l2: f64,
    pub variance: f64,
    pub learning_rate: f64,
}

impl TriggerEpochStats {
    pub fn total(&self) -> f64 {
        self.l2 + self.variance
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerSummary {
    pub epochs_run: usize,
    pub optimizer_steps: usize,
    pub trigger_len: usize,
    /// Written by the leader only
    pub trigger: Option<PathBuf>,
    pub history: Vec<TriggerEpochStats>,
}

pub struct TriggerOptimizer<'a> {
    config: TriggerConfig,
    wrapper: TriggerWrapper<'a>,
    e_star: Tensor,
    trigger: TriggerEmbedding,
    optimizer: Adam,
    collective: &'a dyn Collective,
}

impl<'a> TriggerOptimizer<'a> {
    /// Random trigger of `config.trigger_len` vectors, synchronized across
    /// workers. E* must already match the backend's hidden width.
    pub fn new(
        backend: &'a dyn FrozenBackend,
        e_star: &Tensor,
        config: TriggerConfig,
        collective: &'a dyn Collective,
    ) -> Result<Self> {
        let trigger = TriggerEmbedding::new_random(
            config.trigger_len,
            backend.hidden_size(),
            config.init_std,
            backend.device(),
        )?;
        Self::with_trigger(backend, e_star, trigger, config, collective)
    }

    /// Continue from an existing trigger
    pub fn with_trigger(
        backend: &'a dyn FrozenBackend,
        e_star: &Tensor,
        trigger: TriggerEmbedding,
        config: TriggerConfig,
        collective: &'a dyn Collective,
    ) -> Result<Self> {
        config.validate()?;
        anyhow::ensure!(
            e_star.rank() == 1,
            "E* must be a vector, got shape {:?}",
            e_star.dims()
        );
        ensure_dim("E* vs model hidden width", backend.hidden_size(), e_star.dim(0)?)?;
        ensure_dim("trigger width", backend.hidden_size(), trigger.hidden_size())?;

        if backend.attention_mode() == AttentionMode::Causal {
            anyhow::ensure!(
                config.allow_causal,
                "Backend uses causal attention: trigger positions follow the data, receive \
                 no gradient and leave the pooled output unchanged. Use bidirectional \
                 attention or set allow_causal"
            );
            if collective.is_leader() {
                warn!("Tuning a trigger on a causal backend; it will not move the pooled output");
            }
        }

        let e_star = e_star
            .to_dtype(DType::F32)?
            .to_device(backend.device())?
            .detach();
        // The trigger is the only Var the optimizer ever sees
        let optimizer = Adam::new(
            vec![(TRIGGER_TENSOR.to_string(), trigger.var().clone())],
            AdamConfig::with_lr(config.learning_rate),
        )?;

        let this = Self {
            config,
            wrapper: TriggerWrapper::new(backend),
            e_star,
            trigger,
            optimizer,
            collective,
        };
        if this.collective.world_size() > 1 {
            let synced = this.collective.broadcast(this.trigger.as_tensor(), 0)?;
            this.trigger.var().set(&synced)?;
        }
        Ok(this)
    }

    pub fn trigger(&self) -> &TriggerEmbedding {
        &self.trigger
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.global_step()
    }

    /// Pooled embeddings of `batch` with the current trigger appended
    pub fn pooled(&self, batch: &TokenBatch) -> Result<Tensor> {
        self.wrapper.forward(batch, Some(&self.trigger))
    }

    fn batch_loss(&self, batch: &TokenBatch) -> Result<TriggerLoss> {
        trigger_loss(&self.pooled(batch)?, &self.e_star)
    }

    fn apply(&mut self, grads: &[Tensor]) -> Result<()> {
        let lr = warmup_lr(
            self.config.learning_rate,
            self.optimizer.global_step(),
            self.config.warmup_steps,
        );
        self.optimizer.set_learning_rate(lr);
        self.optimizer.apply(grads)
    }

    /// One local optimizer step on a fixed batch (no synchronization).
    ///
    /// Returns `(l2, variance)` before the step.
    pub fn step_on_batch(&mut self, batch: &TokenBatch) -> Result<(f64, f64)> {
        let loss = self.batch_loss(batch)?;
        let (l2, variance) = loss.values()?;
        ensure_finite("trigger", self.optimizer.global_step(), l2 + variance)?;

        let grads = loss.total.backward()?;
        let grad = match grads.get(self.trigger.as_tensor()) {
            Some(g) => g.clone(),
            None => self.trigger.as_tensor().zeros_like()?,
        };
        self.apply(&[grad])?;
        Ok((l2, variance))
    }

    /// Run one epoch; returns the globally aggregated `(l2, variance)`
    pub fn train_epoch(&mut self, corpus: &TokenCorpus, epoch: usize) -> Result<(f64, f64)> {
        let rank = self.collective.rank();
        let world = self.collective.world_size();
        let device = self.wrapper.backend().device().clone();
        let batches = epoch_batches(
            corpus.len(),
            self.config.batch_size,
            Some(self.config.seed.wrapping_add(epoch as u64)),
        );
        let mut accum = GradAccumulator::new(1, self.config.grad_accum_steps);

        let mut l2_sum = 0.0f64;
        let mut var_sum = 0.0f64;

        for (b, batch) in batches.iter().enumerate() {
            let local = shard(batch, rank, world);
            if local.is_empty() {
                accum.skip();
            } else {
                let tokens = corpus.collate(&local, &device)?;
                let loss = self.batch_loss(&tokens)?;
                let (l2, variance) = loss.values()?;
                ensure_finite("trigger", self.optimizer.global_step(), l2 + variance)?;

                let grads = loss.total.backward()?;
                accum.add(&grads, &[self.trigger.var()], local.len())?;

                let share = local.len() as f64 / batch.len() as f64;
                l2_sum += l2 * share;
                var_sum += variance * share;
                debug!(
                    "rank {} epoch {} batch {}: l2={:.6} var={:.6}",
                    rank, epoch, b, l2, variance
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
        let l2 = self.collective.all_reduce_f64(l2_sum)? / n_batches;
        let variance = self.collective.all_reduce_f64(var_sum)? / n_batches;
        Ok((l2, variance))
    }

    fn flush(&mut self, accum: &mut GradAccumulator) -> Result<()> {
        let var = self.trigger.var().clone();
        if let Some(grads) = accum.flush(&[&var], self.collective)? {
            self.apply(&grads)?;
        }
        Ok(())
    }

    /// Run every configured epoch, then persist the trigger (leader only)
    pub fn train(&mut self, corpus: &TokenCorpus) -> Result<TriggerSummary> {
        anyhow::ensure!(!corpus.is_empty(), "Token corpus is empty");

        let leader = self.collective.is_leader();
        if leader {
            std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
                format!("Failed to create {}", self.config.output_dir.display())
            })?;
            info!(
                "Training trigger (K={}, H={}) on {} samples with {} worker(s)",
                self.trigger.len(),
                self.trigger.hidden_size(),
                corpus.len(),
                self.collective.world_size()
            );
        }

        let mut history = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            let (l2, variance) = self.train_epoch(corpus, epoch)?;
            ensure_finite("trigger", epoch, l2 + variance)?;

            if leader {
                info!(
                    "Epoch {}: l2={:.6} var={:.6} total={:.6} lr={:.2e}",
                    epoch,
                    l2,
                    variance,
                    l2 + variance,
                    self.optimizer.learning_rate()
                );
                let every = self.config.checkpoint_every;
                if every > 0 && (epoch + 1) % every == 0 && epoch + 1 < self.config.epochs {
                    let path = self
                        .config
                        .output_dir
                        .join(format!("trigger_epoch{:04}.safetensors", epoch + 1));
                    self.trigger.save(&path)?;
                    debug!("Saved intermediate trigger to {}", path.display());
                }
            }
            history.push(TriggerEpochStats {
                epoch,
                l2,
                variance,
                learning_rate: self.optimizer.learning_rate(),
            });
        }

        let path = self.config.trigger_path();
        if leader {
            self.trigger.save(&path)?;
            info!("Saved trigger to {}", path.display());
        }
        self.collective.barrier()?;

        Ok(TriggerSummary {
            epochs_run: history.len(),
            optimizer_steps: self.optimizer.global_step(),
            trigger_len: self.trigger.len(),
            trigger: leader.then_some(path),
            history,
        })
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Corpus-level distances to E*, with or without a trigger
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    /// Mean over samples of ||p_i - E*||²
    pub l2_to_target: f64,
    /// Mean over samples of ||p_i - batch mean||²
    pub batch_variance: f64,
    pub samples: usize,
    #[serde(skip)]
    pub per_sample_l2: Vec<f64>,
}

/// One ordered pass over `corpus` in batches of `batch_size`
pub fn evaluate_trigger(
    backend: &dyn FrozenBackend,
    corpus: &TokenCorpus,
    e_star: &Tensor,
    trigger: Option<&TriggerEmbedding>,
    batch_size: usize,
) -> Result<TriggerReport> {
    anyhow::ensure!(!corpus.is_empty(), "Token corpus is empty");
    ensure_dim("E* vs model hidden width", backend.hidden_size(), e_star.dim(0)?)?;

    let wrapper = TriggerWrapper::new(backend);
    let device = backend.device();
    let target = e_star.to_dtype(DType::F32)?.to_device(device)?.unsqueeze(0)?;

    let mut per_sample_l2 = Vec::with_capacity(corpus.len());
    let mut spread_sum = 0.0f64;
    for batch in epoch_batches(corpus.len(), batch_size, None) {
        let tokens = corpus.collate(&batch, device)?;
        let pooled = wrapper.forward(&tokens, trigger)?.detach();
        let l2 = row_sq_dist(&pooled, &target)?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
        per_sample_l2.extend(l2);
        let spread = row_sq_dist(&pooled, &pooled.mean_keepdim(0)?)?.sum_all()?;
        spread_sum += scalar_f64(&spread)?;
    }

    let n = per_sample_l2.len();
    Ok(TriggerReport {
        l2_to_target: per_sample_l2.iter().sum::<f64>() / n as f64,
        batch_variance: spread_sum / n as f64,
        samples: n,
        per_sample_l2,
    })
}

/// Baseline vs tuned, with a paired t-test on per-sample L2 distances
#[derive(Debug, Clone, Serialize)]
pub struct TriggerComparison {
    pub baseline: TriggerReport,
    pub tuned: TriggerReport,
    /// Positive when the trigger moved samples closer to E*
    pub t_statistic: f64,
    pub df: f64,
    pub p_value: f64,
}

pub fn compare_reports(baseline: TriggerReport, tuned: TriggerReport) -> Result<TriggerComparison> {
    anyhow::ensure!(
        baseline.per_sample_l2.len() == tuned.per_sample_l2.len(),
        "Reports cover {} and {} samples",
        baseline.per_sample_l2.len(),
        tuned.per_sample_l2.len()
    );
    let (t_statistic, df, p_value) = paired_t_test(&baseline.per_sample_l2, &tuned.per_sample_l2)?;
    Ok(TriggerComparison {
        baseline,
        tuned,
        t_statistic,
        df,
        p_value,
    })
}

/// Two-sided paired t-test of `a - b`; returns `(t, df, p)`
pub fn paired_t_test(a: &[f64], b: &[f64]) -> Result<(f64, f64, f64)> {
    let n = a.len().min(b.len());
    if n < 2 {
        return Ok((0.0, 0.0, 1.0));
    }
    let diffs: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    let n_f = n as f64;
    let mean = diffs.iter().sum::<f64>() / n_f;
    let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n_f - 1.0);
    let se = (var / n_f).sqrt();
    let df = n_f - 1.0;

    if se == 0.0 {
        let p = if mean == 0.0 { 1.0 } else { 0.0 };
        let t = if mean == 0.0 { 0.0 } else { mean.signum() * f64::INFINITY };
        return Ok((t, df, p));
    }
    let t = mean / se;
    let dist = StudentsT::new(0.0, 1.0, df)?;
    let p = 2.0 * (1.0 - dist.cdf(t.abs()));
    Ok((t, df, p))
}
