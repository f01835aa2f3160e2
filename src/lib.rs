// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `l2`/`l2s`
#![allow(clippy::module_name_repetitions)] // TriggerEmbedding in trigger.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! ctrig-rs: canonical-target decomposition and trigger tuning
//!
//! Stage one learns to split pooled code embeddings into a shared canonical
//! component and a per-sample residual, and averages the canonical component
//! into a single target E*. Stage two tunes a short trigger embedding,
//! appended to every input of a frozen model, so that the model's pooled
//! output lands on E* for any input.
//!
//! ## Architecture
//!
//! - `model`: FrozenBackend trait, FrozenModel wrapper and the Embedding Source
//! - `forward_qwen2`: Qwen2 forward pass from input embeddings and a padding mask
//! - `cache`: HiddenStateCache for per-layer hidden states
//! - `masks`: Shared attention mask utilities (causal masks, padding bias, mask extension)
//! - `pooling`: Masked mean pooling over real tokens
//! - `corpus`: Code, feature and token corpora, batching and sharding
//! - `decomposer`: Canonical/residual auto-encoder and its composite loss
//! - `convergence`: Early-stopping state machine
//! - `trainer`: Data-parallel Decomposer training with best-checkpoint restore
//! - `target`: Canonical Target Extractor (E*, ResidualSet)
//! - `trigger`: TriggerEmbedding and the Trigger-Tuned Forward Wrapper
//! - `trigger_train`: Trigger Optimizer and trigger evaluation
//! - `optim`: Adam over an explicit parameter list
//! - `grads`: Gradient accumulation and synchronization
//! - `distributed`: Collective operations (single process, in-process thread group)
//! - `config`: JSON run configuration
//! - `error`: Fatal error kinds

pub mod cache;
pub mod config;
pub mod convergence;
pub mod corpus;
pub mod decomposer;
pub mod distributed;
pub mod error;
pub mod forward_qwen2;
pub mod grads;
pub mod masks;
pub mod model;
pub mod optim;
pub mod pooling;
pub mod target;
pub mod trainer;
pub mod trigger;
pub mod trigger_train;

pub use cache::HiddenStateCache;
pub use config::{DecomposerConfig, RunConfig, TriggerConfig};
pub use convergence::{EarlyStopping, TrainingState};
pub use corpus::{
    epoch_batches, shard, CodeCorpus, CodeSample, FeatureCorpus, TokenBatch, TokenCorpus,
    TokenSample,
};
pub use decomposer::{decomposition_loss, Decomposer, LossTerms};
pub use distributed::{Collective, ReduceOp, SingleProcess, ThreadGroup, ThreadWorker};
pub use error::CoreError;
pub use forward_qwen2::{Qwen2Backend, Qwen2Config};
pub use grads::GradAccumulator;
pub use masks::{
    clear_mask_caches, create_causal_mask, create_padding_bias, extend_attention_mask,
};
pub use model::{pooled_embeddings, AttentionMode, FrozenBackend, FrozenModel};
pub use optim::{warmup_lr, Adam, AdamConfig};
pub use pooling::masked_mean_pool;
pub use target::{
    adapt_target, extract_canonical_target, load_e_star, AdaptMode, CanonicalTarget,
};
pub use trainer::{load_decomposer, DecomposerTrainer, EpochStats, TrainingSummary};
pub use trigger::{TriggerEmbedding, TriggerWrapper};
pub use trigger_train::{
    compare_reports, evaluate_trigger, paired_t_test, trigger_loss, TriggerComparison,
    TriggerEpochStats, TriggerLoss, TriggerOptimizer, TriggerReport, TriggerSummary,
};
