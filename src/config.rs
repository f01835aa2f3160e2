//! Run configuration for both optimization stages
//!
//! Every struct carries `#[serde(default)]`, so a JSON file only needs the
//! fields it wants to override:
//!
//! ```json
//! { "decomposer": { "patience": 50 }, "trigger": { "trigger_len": 5 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::AttentionMode;

/// Configuration for the Decomposer Trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposerConfig {
    /// Widths of the shared encoder's hidden layers
    pub hidden_dims: Vec<usize>,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Global batch size (split across workers)
    pub batch_size: usize,
    /// Epoch budget
    pub max_epochs: usize,
    /// Epochs without improvement before stopping
    pub patience: usize,
    /// Micro-batches per optimizer step
    pub grad_accum_steps: usize,
    /// Seed for per-epoch shuffling
    pub seed: u64,
    /// Where checkpoints and target artifacts are written
    pub output_dir: PathBuf,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![1024, 1024],
            learning_rate: 1e-4,
            batch_size: 64,
            max_epochs: 2000,
            patience: 300,
            grad_accum_steps: 1,
            seed: 42,
            output_dir: PathBuf::from("outputs/decomposer"),
        }
    }
}

impl DecomposerConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.hidden_dims.is_empty(), "hidden_dims must not be empty");
        anyhow::ensure!(
            self.hidden_dims.iter().all(|&d| d > 0),
            "hidden_dims must be positive, got {:?}",
            self.hidden_dims
        );
        anyhow::ensure!(self.batch_size > 0, "batch_size must be > 0");
        anyhow::ensure!(self.max_epochs > 0, "max_epochs must be > 0");
        anyhow::ensure!(self.patience > 0, "patience must be > 0");
        anyhow::ensure!(self.grad_accum_steps > 0, "grad_accum_steps must be > 0");
        anyhow::ensure!(
            self.learning_rate > 0.0 && self.learning_rate.is_finite(),
            "learning_rate must be positive, got {}",
            self.learning_rate
        );
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join("decomposer_best.safetensors")
    }
}

/// Configuration for the Trigger Optimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Number of trigger vectors (K)
    pub trigger_len: usize,
    /// Std-dev of the random trigger initialization
    pub init_std: f64,
    /// Peak Adam learning rate
    pub learning_rate: f64,
    /// Linear warmup length in optimizer steps (0 = none)
    pub warmup_steps: usize,
    /// Global batch size (split across workers)
    pub batch_size: usize,
    /// Number of passes over the token corpus
    pub epochs: usize,
    /// Micro-batches per optimizer step
    pub grad_accum_steps: usize,
    /// Save an intermediate trigger every N epochs (0 = only at the end)
    pub checkpoint_every: usize,
    /// Seed for per-epoch shuffling
    pub seed: u64,
    /// Attention pattern the frozen model runs with while tuning and evaluating
    pub attention: AttentionMode,
    /// Accept a causal backend, where the appended trigger gets no gradient
    pub allow_causal: bool,
    /// Where the trigger artifact is written
    pub output_dir: PathBuf,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            trigger_len: 10,
            init_std: 0.02,
            learning_rate: 1e-3,
            warmup_steps: 0,
            batch_size: 16,
            epochs: 10,
            grad_accum_steps: 1,
            checkpoint_every: 0,
            seed: 42,
            attention: AttentionMode::Bidirectional,
            allow_causal: false,
            output_dir: PathBuf::from("outputs/trigger"),
        }
    }
}

impl TriggerConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be > 0");
        anyhow::ensure!(self.epochs > 0, "epochs must be > 0");
        anyhow::ensure!(self.grad_accum_steps > 0, "grad_accum_steps must be > 0");
        anyhow::ensure!(
            self.learning_rate > 0.0 && self.learning_rate.is_finite(),
            "learning_rate must be positive, got {}",
            self.learning_rate
        );
        anyhow::ensure!(self.init_std >= 0.0, "init_std must be >= 0");
        anyhow::ensure!(
            self.attention != AttentionMode::Causal || self.allow_causal,
            "attention \"causal\" gives the trigger no gradient; set allow_causal to use it anyway"
        );
        Ok(())
    }

    pub fn trigger_path(&self) -> PathBuf {
        self.output_dir.join("trigger.safetensors")
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub decomposer: DecomposerConfig,
    pub trigger: TriggerConfig,
    /// How long a worker waits at a collective before the group fails
    pub collective_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            decomposer: DecomposerConfig::default(),
            trigger: TriggerConfig::default(),
            collective_timeout_secs: 600,
        }
    }
}

impl RunConfig {
    pub fn collective_timeout(&self) -> Duration {
        Duration::from_secs(self.collective_timeout_secs)
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.decomposer.patience, 300);
        assert_eq!(config.decomposer.hidden_dims, vec![1024, 1024]);
        assert_eq!(config.trigger.trigger_len, 10);
        assert_eq!(config.trigger.warmup_steps, 0);
        assert_eq!(config.trigger.attention, AttentionMode::Bidirectional);
        assert!(!config.trigger.allow_causal);
        assert_eq!(config.collective_timeout(), Duration::from_secs(600));
        assert!(config.decomposer.validate().is_ok());
        assert!(config.trigger.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "decomposer": { "patience": 7 }, "trigger": { "trigger_len": 3 } }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.decomposer.patience, 7);
        assert_eq!(config.decomposer.batch_size, 64);
        assert_eq!(config.trigger.trigger_len, 3);
        assert!((config.trigger.learning_rate - 1e-3).abs() < 1e-12);
        assert_eq!(config.collective_timeout_secs, 600);
    }

    #[test]
    fn test_timeout_and_attention_from_json() {
        let json = r#"{ "collective_timeout_secs": 30,
                        "trigger": { "attention": "causal", "allow_causal": true } }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.collective_timeout(), Duration::from_secs(30));
        assert_eq!(config.trigger.attention, AttentionMode::Causal);
        assert!(config.trigger.allow_causal);
        assert_eq!(config.trigger.trigger_len, 10);
        assert!(config.trigger.validate().is_ok());

        let causal = TriggerConfig {
            attention: AttentionMode::Causal,
            ..Default::default()
        };
        assert!(causal.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = DecomposerConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TriggerConfig {
            grad_accum_steps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
