use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nanobatch::{
    BatchInput, Error, GenerationRequest, HfTokenizer, LLMEngine, ModelRunner, Result,
    SchedulerConfig, SequenceGroupMetadata, SequenceGroupOutput, SequenceOutput, StopConditions,
    Tokenizer,
};

#[derive(Parser, Debug)]
#[command(name = "nanobatch")]
#[command(about = "Continuous-batching scheduler demo with a synthetic model")]
struct Args {
    /// Scheduler config as JSON (defaults to built-in limits)
    #[arg(long)]
    config: Option<PathBuf>,

    /// HuggingFace tokenizer.json, required for text prompts
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Prompt to run; repeatable. Synthetic prompts are generated when absent
    #[arg(short, long)]
    prompt: Vec<String>,

    /// Number of synthetic requests when no prompts are given
    #[arg(long, default_value = "8")]
    num_requests: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// RNG seed for the synthetic model and workload
    #[arg(long, default_value = "0")]
    seed: u64,
}

const VOCAB_SIZE: u32 = 32_000;

/// Stand-in model: samples one uniform token per running sequence.
#[derive(Debug)]
struct SyntheticRunner {
    rng: StdRng,
}

impl SyntheticRunner {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ModelRunner for SyntheticRunner {
    fn execute_model(
        &mut self,
        batch: &[SequenceGroupMetadata],
    ) -> Result<Vec<SequenceGroupOutput>> {
        // Flatten the batch exactly the way a real forward pass would
        // consume it, even though the tokens go unused here.
        let _input = BatchInput::prepare(batch)?;

        let mut outputs = Vec::with_capacity(batch.len());
        for metadata in batch {
            let mut seq_ids: Vec<_> = metadata.seq_data.keys().copied().collect();
            seq_ids.sort_unstable();
            let samples = seq_ids
                .into_iter()
                .map(|seq_id| SequenceOutput {
                    parent_seq_id: seq_id,
                    output_token_id: self.rng.random_range(0..VOCAB_SIZE),
                })
                .collect();
            outputs.push(SequenceGroupOutput::new(samples));
        }
        Ok(outputs)
    }
}

/// Whitespace tokenizer over literal numeric token ids, for runs
/// without a tokenizer file.
#[derive(Debug, Default)]
struct NumericTokenizer;

impl Tokenizer for NumericTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        text.split_whitespace()
            .map(|word| {
                word.parse::<u32>()
                    .map_err(|_| Error::Tokenization(format!("not a token id: {word}")))
            })
            .collect()
    }

    fn ids_to_text(&self, ids: &[u32], _skip_special: bool) -> Result<(usize, String)> {
        let mut text = String::new();
        for id in ids {
            text.push_str(&id.to_string());
            text.push(' ');
        }
        Ok((ids.len(), text))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SchedulerConfig::from_json_file(path)?,
        None => SchedulerConfig::default(),
    };
    info!(
        max_num_batched_tokens = config.max_num_batched_tokens,
        max_num_seqs = config.max_num_seqs,
        "starting engine"
    );

    let tokenizer: Box<dyn Tokenizer> = match &args.tokenizer {
        Some(path) => Box::new(HfTokenizer::from_file(path)?),
        None => Box::new(NumericTokenizer),
    };
    let runner = Box::new(SyntheticRunner::new(args.seed));
    let mut engine = LLMEngine::new(config, runner, tokenizer)?;

    let stopping = Arc::new(StopConditions::with_max_new_tokens(args.max_tokens));
    let requests: Vec<GenerationRequest> = if args.prompt.is_empty() {
        let mut rng = StdRng::seed_from_u64(args.seed);
        (0..args.num_requests)
            .map(|_| {
                let prompt_len = rng.random_range(4..=32);
                let token_ids = (0..prompt_len)
                    .map(|_| rng.random_range(0..VOCAB_SIZE))
                    .collect();
                GenerationRequest::from_token_ids(token_ids).stopping(stopping.clone())
            })
            .collect()
    } else {
        args.prompt
            .into_iter()
            .map(|prompt| GenerationRequest::new(prompt).stopping(stopping.clone()))
            .collect()
    };

    let num_requests = requests.len();
    let started = Instant::now();
    let outputs = engine.generate_with_progress(requests, |finished, total| {
        info!(finished, total, "request complete");
    })?;
    let elapsed = started.elapsed();

    let total_tokens: usize = outputs
        .iter()
        .flat_map(|output| output.outputs.iter())
        .map(|completion| completion.token_ids.len())
        .sum();
    info!(
        num_requests,
        total_tokens,
        elapsed_ms = elapsed.as_millis() as u64,
        tokens_per_s = total_tokens as f64 / elapsed.as_secs_f64(),
        "generation complete"
    );

    for output in &outputs {
        for completion in &output.outputs {
            println!(
                "[{}:{}] {} tokens, reason={}: {}",
                output.request_id,
                completion.index,
                completion.token_ids.len(),
                completion.finish_reason.unwrap_or("none"),
                completion.text.trim_end()
            );
        }
    }
    Ok(())
}
