use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod aggregate;
mod batch;
mod cache;
mod config;
mod corpus;
mod error;
mod history;
mod judge;
mod ledger;
mod models;
mod output;
mod runner;

use crate::config::{Backend, Config, FileConfig, JudgeSection, RunSection};
use crate::error::ConfigError;
use crate::output::OutputFormat;
use crate::runner::Runner;

/// Judge query/passage relevance with an LLM, reusing every result already paid for
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with [judge] and [run] tables; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Judge model name
    #[arg(long)]
    model: Option<String>,

    /// Request shape; inferred from the model name when omitted
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    #[arg(long)]
    api_endpoint: Option<String>,

    /// Price of 1k prompt tokens
    #[arg(long)]
    input_cost: Option<f64>,

    /// Price of 1k completion tokens
    #[arg(long)]
    output_cost: Option<f64>,

    /// JSON file holding the instruction, as {role, content} or a bare string
    #[arg(long)]
    initial_prompt: Option<PathBuf>,

    /// Template for the pair, with {query} and {passage} placeholders or two
    /// positional {} (passage first)
    #[arg(long)]
    query_passage_format: Option<String>,

    /// Pattern with a reasoning group followed by a score group
    #[arg(long)]
    result_regex: Option<String>,

    /// JSON file with worked example conversations
    #[arg(long)]
    examples: Option<PathBuf>,

    /// Template for example user turns, with {index} and {content} placeholders
    #[arg(long)]
    example_format: Option<String>,

    #[arg(long)]
    max_tokens: Option<u16>,

    #[arg(long)]
    rate_limit_rps: Option<f64>,

    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Environment variable holding the API key
    #[arg(long)]
    api_key_env: Option<String>,

    /// JSON object of named API keys
    #[arg(long)]
    api_keys: Option<PathBuf>,

    /// Entry to use from --api-keys
    #[arg(long)]
    api_key_name: Option<String>,

    /// Tab-separated corpus with query, passage and passage_id columns
    #[arg(long, visible_alias = "corpus")]
    query_passages: Option<PathBuf>,

    /// Samples requested per pair
    #[arg(short = 'n', long)]
    completions: Option<u32>,

    /// Output table, rewritten after every row; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run history holding the evaluation cache
    #[arg(long)]
    history: Option<PathBuf>,

    #[arg(long)]
    retry_delay_secs: Option<u64>,

    #[arg(long)]
    multi_sample_retry_delay_secs: Option<u64>,

    /// Record rows that fail twice instead of stopping
    #[arg(long)]
    keep_going: bool,

    /// Neither read nor write the run history
    #[arg(long)]
    no_cache: bool,

    /// Include a hash of the passage text in cache keys
    #[arg(long)]
    fingerprint_passages: bool,

    /// Summary format: plain or json
    #[arg(long, default_value = "plain")]
    format: OutputFormat,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Command-line values as a config layer that wins over the file
    fn overrides(&self) -> Result<FileConfig, ConfigError> {
        let mut judge = JudgeSection {
            model: self.model.clone(),
            backend: self.backend,
            api_endpoint: self.api_endpoint.clone(),
            input_1k_token_cost: self.input_cost,
            output_1k_token_cost: self.output_cost,
            initial_prompt_file: self.initial_prompt.clone(),
            query_passage_format: self.query_passage_format.clone(),
            result_regex: self.result_regex.clone(),
            examples_file: self.examples.clone(),
            example_format: self.example_format.clone(),
            max_tokens: self.max_tokens,
            rate_limit_rps: self.rate_limit_rps,
            request_timeout_secs: self.request_timeout_secs,
            env_var_api_key: self.api_key_env.clone(),
            api_keys_file: self.api_keys.clone(),
            api_key_name: self.api_key_name.clone(),
            ..Default::default()
        };
        judge.load_referenced_files(Path::new(""))?;

        let run = RunSection {
            corpus: self.query_passages.clone(),
            completions: self.completions,
            output: self.output.clone(),
            history: self.history.clone(),
            retry_delay_secs: self.retry_delay_secs,
            multi_sample_retry_delay_secs: self.multi_sample_retry_delay_secs,
            keep_going: self.keep_going.then_some(true),
            no_cache: self.no_cache.then_some(true),
            fingerprint_passages: self.fingerprint_passages.then_some(true),
        };

        Ok(FileConfig { judge, run })
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(err) = run(args).await {
        error!(error = %err, "run failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    let config = Config::resolve(args.overrides()?, file)?;
    let table_on_stdout = config.settings.run.output.is_none();

    let report = Runner::new(config).run().await?;

    // Keep stdout clean for the table when it is printed there
    if table_on_stdout {
        output::print_summary(&report.ledger, args.format, &mut std::io::stderr())?;
    } else {
        output::print_summary(&report.ledger, args.format, &mut std::io::stdout())?;
    }

    Ok(())
}
