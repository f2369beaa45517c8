//! saliency-rs CLI: perturbation-based attribution on demo backends

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use hf_hub::{api::sync::Api, Repo, RepoType};
use saliency_rs::demo::{demo_vocabulary, TinyCausalLm, TinyTextClassifier, WhitespaceTokenizer};
use saliency_rs::{
    methods, resolve_device, AttributionExplainer, ExplainerOptions, GranularityLevel,
    InferenceMode, LanguageModel, TargetSpec, TokenizerLike,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "saliency-rs")]
#[command(about = "Perturbation-based feature attribution for sequence models")]
#[command(version)]
struct Cli {
    /// Text(s) to explain
    #[arg(short, long, required = true, num_args = 1..)]
    text: Vec<String>,

    /// Attribution method: occlusion, random-masking, sobol, sobol-total,
    /// linear-interpolation, gaussian-noise
    #[arg(short, long, default_value = "occlusion")]
    method: String,

    /// Unit granularity: default, token, word, sentence, all-tokens
    #[arg(short, long, default_value = "default")]
    granularity: String,

    /// Demo backend: classifier or generator
    #[arg(short, long, default_value = "classifier")]
    backend: String,

    /// Target class index for the classifier backend
    #[arg(long)]
    class: Option<u32>,

    /// Forced continuation text for the generator backend
    #[arg(long)]
    continuation: Option<String>,

    /// Logit post-processing: logits, softmax, log-softmax
    #[arg(long, default_value = "logits")]
    mode: String,

    /// Variant rows scored per forward pass
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Continuation budget when the generator picks its own tokens
    #[arg(long, default_value_t = 8)]
    max_new_tokens: usize,

    /// Sampling temperature for the generated continuation (0 = greedy)
    #[arg(long, default_value_t = 0.0)]
    temperature: f64,

    /// Seed for the demo weights and randomized strategies
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Fetch this model's tokenizer from the `HuggingFace` hub instead of
    /// using the built-in whitespace tokenizer (e.g. "bert-base-uncased")
    #[arg(long)]
    hf_tokenizer: Option<String>,

    /// Output path for the JSON report
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

fn parse_granularity(name: &str) -> Result<GranularityLevel> {
    Ok(match name {
        "default" => GranularityLevel::Default,
        "token" => GranularityLevel::Token,
        "word" => GranularityLevel::Word,
        "sentence" => GranularityLevel::Sentence,
        "all-tokens" => GranularityLevel::AllTokens,
        other => bail!("unknown granularity {other:?}"),
    })
}

fn parse_mode(name: &str) -> Result<InferenceMode> {
    Ok(match name {
        "logits" => InferenceMode::Logits,
        "softmax" => InferenceMode::Softmax,
        "log-softmax" => InferenceMode::LogSoftmax,
        other => bail!("unknown inference mode {other:?}"),
    })
}

fn load_tokenizer(cli: &Cli) -> Result<Box<dyn TokenizerLike>> {
    if let Some(model_id) = &cli.hf_tokenizer {
        info!("Fetching tokenizer for {model_id}...");
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.clone(), RepoType::Model));
        let path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = tokenizers::Tokenizer::from_file(&path)
            .map_err(|e| anyhow!("failed to load tokenizer: {e}"))?;
        return Ok(Box::new(tokenizer));
    }
    Ok(Box::new(WhitespaceTokenizer::new(&demo_vocabulary())))
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

    println!("=== saliency-rs: perturbation-based attribution ===");
    println!("Method:      {}", cli.method);
    println!("Granularity: {}", cli.granularity);
    println!("Backend:     {}", cli.backend);
    if cli.cpu {
        println!("Device:      CPU (forced)");
    }

    let device = resolve_device(cli.cpu)?;
    let tokenizer = load_tokenizer(&cli)?;
    let vocab = tokenizer.vocab_size();
    info!("Tokenizer ready with {vocab} tokens");

    let model: Box<dyn LanguageModel> = match cli.backend.as_str() {
        "classifier" => Box::new(TinyTextClassifier::new(vocab, 32, 2, cli.seed, &device)?),
        "generator" => Box::new(TinyCausalLm::new(vocab, 32, cli.seed, &device)?),
        other => bail!("unknown backend {other:?}, expected classifier or generator"),
    };

    let options = ExplainerOptions {
        granularity: parse_granularity(&cli.granularity)?,
        batch_size: cli.batch_size,
        mode: parse_mode(&cli.mode)?,
        max_new_tokens: cli.max_new_tokens,
        temperature: cli.temperature,
        seed: cli.seed,
        ..ExplainerOptions::default()
    };
    let method = methods::by_name(&cli.method, cli.seed)?;
    let explainer = AttributionExplainer::new(model, tokenizer, method, options)?;

    let targets = match (cli.class, &cli.continuation) {
        (Some(_), Some(_)) => bail!("--class and --continuation are mutually exclusive"),
        (Some(class), None) => Some(TargetSpec::Classes(vec![class])),
        (None, Some(text)) => Some(TargetSpec::Texts(vec![text.clone()])),
        (None, None) => None,
    };

    let report = explainer.explain_report(cli.text.clone(), targets)?;

    // Print results
    println!("\n=== Attributions ===");
    for output in &report.outputs {
        if let Some(text) = &output.text {
            println!("\n{text}");
        }
        for (target, row) in output.targets.iter().zip(&output.attributions) {
            let formatted: Vec<String> = output
                .elements
                .iter()
                .zip(row)
                .map(|(element, score)| format!("{element}: {score:+.4}"))
                .collect();
            println!("  {target} <- {}", formatted.join("  "));
        }
    }

    // Save report
    if let Some(path) = &cli.output {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        info!("Report saved to {}", path.display());
    }

    Ok(())
}
