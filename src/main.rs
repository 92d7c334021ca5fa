use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use sparse_qk::checkpoint::{flush_checkpoint, load_reference, serialize_reference};
use sparse_qk::data::TextBatches;
use sparse_qk::device::select_device;
use sparse_qk::metrics::{JsonlSink, MetricsSink, Tee, TracingSink};
use sparse_qk::reference::{GptDims, ReferenceModel, TinyGpt};
use sparse_qk::tokenizer::Tokenizer;
use sparse_qk::{train_sparse_qk, ReferenceConfig, RunConfig};

/* ------------------------------------------------------------------ */
/* CLI                                                                */
/* ------------------------------------------------------------------ */

#[derive(Parser)]
#[command(name = "sparse-qk")]
#[command(about = "Train a sparse bilinear dictionary on one layer's attention scores")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default run file sized for the bundled reference transformer
    InitConfig {
        #[arg(long, default_value = "run.json")]
        output: PathBuf,
    },
    /// Write randomly initialized reference weights for a corpus
    InitReference {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        corpus: Option<PathBuf>,
        #[arg(long, default_value = "reference.bin")]
        output: PathBuf,
    },
    /// Train the sparse model against the reference transformer
    Train {
        #[arg(long)]
        config: PathBuf,
        /// Training text; a built-in sample is used when omitted
        #[arg(long)]
        corpus: Option<PathBuf>,
        /// Reference weights (RGPT0001); random weights from the config seed when omitted
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Also write per-step metrics as JSON lines
        #[arg(long)]
        metrics: Option<PathBuf>,
        /// Override train.n_epochs
        #[arg(long)]
        epochs: Option<usize>,
    },
}

const SAMPLE_TEXT: &str = concat!(
    "The quick brown fox jumps over the lazy dog. ",
    "Rust is a systems programming language. ",
    "Machine learning models learn from data. ",
    "Transformers use attention mechanisms. ",
    "GPT stands for Generative Pre-trained Transformer. ",
    "Neural networks are inspired by the human brain. ",
    "Deep learning is a subset of machine learning. ",
);

fn load_corpus(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) => fs::read_to_string(p).with_context(|| format!("reading corpus {}", p.display())),
        None => {
            warn!("no corpus given, using built-in sample text");
            Ok(SAMPLE_TEXT.repeat(16))
        }
    }
}

fn dims_for(reference: &ReferenceConfig, vocab_size: usize) -> GptDims {
    GptDims {
        vocab_size,
        n_embd:     reference.n_embd,
        n_head:     reference.n_head,
        n_layer:    reference.n_layer,
        block_size: reference.block_size,
    }
}

/* ------------------------------------------------------------------ */
/* Main                                                               */
/* ------------------------------------------------------------------ */

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Args::parse().cmd {
        Command::InitConfig { output } => {
            RunConfig::for_reference(ReferenceConfig::default())
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(path = %output.display(), "wrote run file");
        }

        Command::InitReference { config, corpus, output } => {
            let run = RunConfig::load(&config)
                .with_context(|| format!("loading run file {}", config.display()))?;
            let text = load_corpus(corpus.as_deref())?;
            let tokenizer = Tokenizer::from_text(&text);
            let device = select_device(&run.model.device)?;
            let gpt = TinyGpt::random(dims_for(&run.reference, tokenizer.vocab_size), run.reference.seed, &device)?;
            flush_checkpoint(&output, &serialize_reference(&gpt)?)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(path = %output.display(), params = gpt.param_count(), "wrote reference weights");
        }

        Command::Train { config, corpus, reference, metrics, epochs } => {
            let mut run = RunConfig::load(&config)
                .with_context(|| format!("loading run file {}", config.display()))?;
            if let Some(n) = epochs {
                run.train.n_epochs = n;
            }

            let text = load_corpus(corpus.as_deref())?;
            let tokenizer = Tokenizer::from_text(&text);
            info!(chars = text.len(), vocab = tokenizer.vocab_size, "corpus loaded");

            let device = select_device(&run.model.device)?;
            let dims = dims_for(&run.reference, tokenizer.vocab_size);
            let gpt = match &reference {
                Some(path) => load_reference(path, dims, &device)
                    .with_context(|| format!("loading reference {}", path.display()))?,
                None => TinyGpt::random(dims, run.reference.seed, &device)?,
            };
            info!(
                layers = gpt.n_layers(),
                heads = gpt.n_heads(),
                d_model = gpt.d_model(),
                params = gpt.param_count(),
                "reference model ready"
            );

            let mut data = TextBatches::from_text(
                &text, &tokenizer, run.train.batch_size, run.train.seq_len, run.model.seed, &device,
            )?;

            let mut sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(TracingSink::default())];
            if let Some(path) = &metrics {
                sinks.push(Box::new(JsonlSink::create(path)?));
            }
            let mut sink = Tee(sinks);

            let outcome = train_sparse_qk(&gpt, run.model.clone(), &run.train, &mut data, &mut sink)?;

            let freqs = outcome.stats.frequencies();
            let alive = freqs.iter().filter(|&&f| f >= run.model.dead_freq).count();
            info!(
                steps = outcome.steps,
                token_pairs = outcome.stats.token_pairs,
                alive,
                dead = freqs.len() - alive,
                "done"
            );
        }
    }

    Ok(())
}
