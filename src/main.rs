//! ctrig-rs CLI: canonical-target decomposition and trigger tuning

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Args, Parser, Subcommand};
use ctrig_rs::{
    adapt_target, compare_reports, evaluate_trigger, extract_canonical_target, load_e_star,
    AdaptMode, AttentionMode, CodeCorpus, Collective, DecomposerTrainer, FeatureCorpus,
    FrozenModel, RunConfig, SingleProcess, ThreadGroup, TokenCorpus, TriggerConfig,
    TriggerEmbedding, TriggerOptimizer,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ctrig-rs")]
#[command(about = "Canonical-target decomposition and trigger tuning for frozen code models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Embed a code corpus with a frozen model into a feature file
    Extract {
        #[command(flatten)]
        model: ModelArgs,

        /// Path to code corpus JSON file
        #[arg(short, long, default_value = "corpus/samples.json")]
        corpus: PathBuf,

        /// Output safetensors feature file
        #[arg(short, long, default_value = "outputs/features.safetensors")]
        output: PathBuf,

        /// Samples per forward pass
        #[arg(long, default_value_t = 8)]
        batch_size: usize,

        /// Truncate each sample to this many tokens
        #[arg(long)]
        max_len: Option<usize>,
    },

    /// Train the Decomposer and extract E* with the ResidualSet
    Decompose {
        /// Feature file or directory of feature files
        #[arg(short, long)]
        features: PathBuf,

        /// Output directory for checkpoint and target
        #[arg(short, long, default_value = "outputs/decomposer")]
        output: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Tune a trigger embedding toward E*
    Trigger {
        #[command(flatten)]
        model: ModelArgs,

        /// Path to token corpus JSON file
        #[arg(short, long)]
        corpus: PathBuf,

        /// canonical_target.safetensors from `decompose`
        #[arg(short, long)]
        target: PathBuf,

        /// Output directory for the trigger
        #[arg(short, long, default_value = "outputs/trigger")]
        output: PathBuf,

        #[command(flatten)]
        run: RunArgs,

        /// How to fit E* to the model's hidden width
        #[arg(long, value_enum, default_value_t = AdaptMode::Exact)]
        adapt: AdaptMode,

        /// Tune even if the model runs with causal attention
        #[arg(long)]
        allow_causal: bool,
    },

    /// Compare pooled outputs with and without a trigger
    Evaluate {
        #[command(flatten)]
        model: ModelArgs,

        /// Path to token corpus JSON file
        #[arg(short, long)]
        corpus: PathBuf,

        /// canonical_target.safetensors from `decompose`
        #[arg(short, long)]
        target: PathBuf,

        /// trigger.safetensors from `trigger`
        #[arg(long)]
        trigger: PathBuf,

        /// Samples per forward pass
        #[arg(long, default_value_t = 16)]
        batch_size: usize,

        /// Where to write the JSON report
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// How to fit E* to the model's hidden width
        #[arg(long, value_enum, default_value_t = AdaptMode::Exact)]
        adapt: AdaptMode,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Model ID from `HuggingFace` (e.g., "Qwen/Qwen2.5-Coder-0.5B")
    #[arg(short, long, default_value = "Qwen/Qwen2.5-Coder-0.5B")]
    model: String,

    /// Attention pattern of the frozen model [default: causal for extract,
    /// the run config's trigger.attention (bidirectional) otherwise]
    #[arg(long, value_enum)]
    attention: Option<AttentionMode>,
}

impl ModelArgs {
    fn attention_or(&self, default: AttentionMode) -> AttentionMode {
        self.attention.unwrap_or(default)
    }
}

#[derive(Args)]
struct RunArgs {
    /// JSON run configuration; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of data-parallel workers
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Seconds a worker waits at a collective before the run fails
    /// [default: the run config's collective_timeout_secs (600)]
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl RunArgs {
    fn load(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(secs) = self.timeout_secs {
            config.collective_timeout_secs = secs;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Extract {
            model,
            corpus,
            output,
            batch_size,
            max_len,
        } => run_extract(&model, &corpus, &output, batch_size, max_len, cli.cpu),
        Command::Decompose {
            features,
            output,
            run,
        } => run_decompose(&features, &output, &run, cli.cpu),
        Command::Trigger {
            model,
            corpus,
            target,
            output,
            run,
            adapt,
            allow_causal,
        } => run_trigger(
            &model,
            &corpus,
            &target,
            &output,
            &run,
            adapt,
            allow_causal,
            cli.cpu,
        ),
        Command::Evaluate {
            model,
            corpus,
            target,
            trigger,
            batch_size,
            output,
            adapt,
        } => run_evaluate(
            &model,
            &corpus,
            &target,
            &trigger,
            batch_size,
            output.as_deref(),
            adapt,
            cli.cpu,
        ),
    }
}

/// Run `f` on `workers` data-parallel workers; returns the leader's result
fn run_workers<T, F>(workers: usize, timeout: Duration, f: F) -> Result<T>
where
    T: Send,
    F: Fn(&dyn Collective) -> Result<T> + Sync,
{
    if workers <= 1 {
        return f(&SingleProcess);
    }
    let mut results = ThreadGroup::new(workers)
        .with_timeout(timeout)
        .run(|worker| f(worker))?;
    anyhow::ensure!(!results.is_empty(), "Worker group returned no results");
    Ok(results.swap_remove(0))
}

fn write_summary<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Summary saved to {}", path.display());
    Ok(())
}

fn training_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) => dev,
        Err(e) => {
            warn!("CUDA unavailable ({e}), using CPU");
            Device::Cpu
        }
    }
}

#[derive(Serialize)]
struct ExtractSummary {
    model: String,
    samples: usize,
    embedded: usize,
    dim: usize,
    output: PathBuf,
}

fn run_extract(
    args: &ModelArgs,
    corpus_path: &Path,
    output: &Path,
    batch_size: usize,
    max_len: Option<usize>,
    cpu: bool,
) -> Result<()> {
    println!("=== ctrig-rs: Embedding Source ===");
    println!("Model:  {}", args.model);
    println!("Corpus: {}", corpus_path.display());
    println!("Output: {}", output.display());

    let model =
        FrozenModel::from_pretrained(&args.model, cpu, args.attention_or(AttentionMode::Causal))?;
    let corpus = CodeCorpus::load(corpus_path)?;
    info!("Corpus: {} samples", corpus.len());

    let mut rows: Vec<Tensor> = Vec::new();
    let mut embedded = 0;
    for (b, chunk) in corpus.samples().chunks(batch_size.max(1)).enumerate() {
        let texts: Vec<&str> = chunk.iter().map(|s| s.code.as_str()).collect();
        let (kept, pooled) = model.embed_batch(&texts, max_len)?;
        if let Some(pooled) = pooled {
            embedded += kept.len();
            rows.push(pooled.to_device(&Device::Cpu)?);
        }
        info!("Batch {}: embedded {}/{}", b, kept.len(), texts.len());
    }
    anyhow::ensure!(!rows.is_empty(), "No sample could be embedded");

    let features = FeatureCorpus::from_tensor(Tensor::cat(&rows, 0)?)?;
    features.save(output)?;
    info!(
        "Saved {} feature vectors (D={}) to {}",
        features.len(),
        features.dim(),
        output.display()
    );

    let summary = ExtractSummary {
        model: model.model_id().to_string(),
        samples: corpus.len(),
        embedded,
        dim: features.dim(),
        output: output.to_path_buf(),
    };
    write_summary(&output.with_file_name("extract_summary.json"), &summary)
}

#[derive(Serialize)]
struct DecomposeSummary {
    training: ctrig_rs::TrainingSummary,
    target: PathBuf,
    residuals: usize,
}

fn run_decompose(features: &Path, output: &Path, run: &RunArgs, cpu: bool) -> Result<()> {
    println!("=== ctrig-rs: Decomposer ===");
    println!("Features: {}", features.display());
    println!("Output:   {}", output.display());
    println!("Workers:  {}", run.workers.max(1));

    let run_config = run.load()?;
    let timeout = run_config.collective_timeout();
    let mut config = run_config.decomposer;
    config.output_dir = output.to_path_buf();
    let device = training_device(cpu);
    let corpus = FeatureCorpus::load(features, &device)?;

    let summary = run_workers(run.workers, timeout, |collective| {
        let mut trainer = DecomposerTrainer::new(corpus.dim(), config.clone(), collective, &device)?;
        let training = trainer.train(&corpus)?;

        // Every worker holds the same best parameters; only the leader writes
        let target = extract_canonical_target(trainer.model(), &corpus, config.batch_size)?;
        if collective.is_leader() {
            target.save(output)?;
        }
        collective.barrier()?;
        Ok(DecomposeSummary {
            training,
            target: output.join(ctrig_rs::target::TARGET_FILE),
            residuals: target.residuals.dim(0)?,
        })
    })?;

    println!("\n=== Results ===");
    println!(
        "{:?} after {} epochs, best epoch {:?} (loss {:?})",
        summary.training.final_state,
        summary.training.epochs_run,
        summary.training.best_epoch,
        summary.training.best_loss
    );
    println!("E*: {}", summary.target.display());

    write_summary(&output.join("decompose_summary.json"), &summary)
}

fn load_target(path: &Path, model: &FrozenModel, adapt: AdaptMode) -> Result<Tensor> {
    let e_star = load_e_star(path, model.device())?;
    adapt_target(&e_star, model.hidden_size(), adapt)
}

#[derive(Serialize)]
struct TriggerRunSummary {
    model: String,
    attention: AttentionMode,
    training: ctrig_rs::TriggerSummary,
    evaluation: ctrig_rs::TriggerComparison,
}

#[allow(clippy::too_many_arguments)]
fn run_trigger(
    args: &ModelArgs,
    corpus_path: &Path,
    target: &Path,
    output: &Path,
    run: &RunArgs,
    adapt: AdaptMode,
    allow_causal: bool,
    cpu: bool,
) -> Result<()> {
    println!("=== ctrig-rs: Trigger Optimizer ===");
    println!("Model:   {}", args.model);
    println!("Corpus:  {}", corpus_path.display());
    println!("Target:  {}", target.display());
    println!("Output:  {}", output.display());
    println!("Workers: {}", run.workers.max(1));

    let run_config = run.load()?;
    let timeout = run_config.collective_timeout();
    let mut config = run_config.trigger;
    config.output_dir = output.to_path_buf();
    config.attention = args.attention_or(config.attention);
    config.allow_causal |= allow_causal;
    config.validate()?;

    let model = FrozenModel::from_pretrained(&args.model, cpu, config.attention)?;
    let corpus = TokenCorpus::load(corpus_path)?;
    let e_star = load_target(target, &model, adapt)?;
    let backend = model.backend();

    let baseline = evaluate_trigger(backend, &corpus, &e_star, None, config.batch_size)?;
    info!(
        "Baseline: l2={:.6} var={:.6}",
        baseline.l2_to_target, baseline.batch_variance
    );

    let training = run_workers(run.workers, timeout, |collective| {
        let mut optimizer = TriggerOptimizer::new(backend, &e_star, config.clone(), collective)?;
        optimizer.train(&corpus)
    })?;

    let trigger = TriggerEmbedding::load(&config.trigger_path(), model.device())?;
    let tuned = evaluate_trigger(backend, &corpus, &e_star, Some(&trigger), config.batch_size)?;
    let evaluation = compare_reports(baseline, tuned)?;

    println!("\n=== Results ===");
    print_comparison(&evaluation);

    let summary = TriggerRunSummary {
        model: model.model_id().to_string(),
        attention: config.attention,
        training,
        evaluation,
    };
    write_summary(&output.join("trigger_summary.json"), &summary)
}

#[allow(clippy::too_many_arguments)]
fn run_evaluate(
    args: &ModelArgs,
    corpus_path: &Path,
    target: &Path,
    trigger_path: &Path,
    batch_size: usize,
    output: Option<&Path>,
    adapt: AdaptMode,
    cpu: bool,
) -> Result<()> {
    println!("=== ctrig-rs: Trigger evaluation ===");
    println!("Model:   {}", args.model);
    println!("Corpus:  {}", corpus_path.display());
    println!("Trigger: {}", trigger_path.display());

    let attention = args.attention_or(TriggerConfig::default().attention);
    let model = FrozenModel::from_pretrained(&args.model, cpu, attention)?;
    let corpus = TokenCorpus::load(corpus_path)?;
    let e_star = load_target(target, &model, adapt)?;
    let trigger = TriggerEmbedding::load(trigger_path, model.device())?;
    info!("Trigger: K={}, H={}", trigger.len(), trigger.hidden_size());

    let baseline = evaluate_trigger(model.backend(), &corpus, &e_star, None, batch_size)?;
    let tuned = evaluate_trigger(model.backend(), &corpus, &e_star, Some(&trigger), batch_size)?;
    let evaluation = compare_reports(baseline, tuned)?;

    println!("\n=== Results ===");
    print_comparison(&evaluation);

    match output {
        Some(path) => write_summary(path, &evaluation),
        None => {
            println!("{}", serde_json::to_string_pretty(&evaluation)?);
            Ok(())
        }
    }
}

fn print_comparison(c: &ctrig_rs::TriggerComparison) {
    println!(
        "Without trigger: l2={:.6} var={:.6}",
        c.baseline.l2_to_target, c.baseline.batch_variance
    );
    println!(
        "With trigger:    l2={:.6} var={:.6}",
        c.tuned.l2_to_target, c.tuned.batch_variance
    );
    println!(
        "Paired t-test on L2: t={:.3} df={:.0} p={:.4}",
        c.t_statistic, c.df, c.p_value
    );
}
