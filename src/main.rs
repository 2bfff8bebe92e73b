use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod catalog;
mod client;
mod config;
mod error;
mod evaluation;
mod executor;
mod metrics;
mod models;
mod normalizer;
mod output;
mod predictor;
mod runner;
mod simulator;

use crate::catalog::ApiCatalog;
use crate::client::{OpenAiClient, Retrying};
use crate::config::{Config, EvalMode};
use crate::output::OutputFormat;
use crate::predictor::Predictor;
use crate::runner::Runner;

/// Tool-use benchmark CLI - Replay scripted conversations against a model and score its API calls
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    run_file: PathBuf,

    /// Phases to run, in order
    #[arg(long, value_enum, num_args = 1.., default_values_t = [EvalMode::Predict, EvalMode::Evaluate, EvalMode::Validate])]
    modes: Vec<EvalMode>,

    /// Recompute conversations that already have output files
    #[arg(long)]
    reset: bool,

    /// Output format: plain or json
    #[arg(short, long, default_value = "plain")]
    output: OutputFormat,

    /// Verbose output - log every model call and simulated API call
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the report; logs go to stderr
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tooltalk_eval={}", default_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_file(&args.run_file)?;
    config.validate()?;
    let catalog = ApiCatalog::from_file(&config.catalog)?;
    tracing::debug!("Loaded {} APIs from {}", catalog.all().len(), config.catalog.display());

    // Scoring saved predictions never reaches the model, so no key is needed
    let openai = if args.modes.contains(&EvalMode::Predict) {
        OpenAiClient::from_config(&config)?
    } else {
        OpenAiClient::new(
            &config.api_endpoint,
            String::new(),
            &config.model,
            config.temperature,
            config.max_tokens,
            config.rate_limit_rps,
        )
    };
    let client = Retrying::new(
        openai,
        config.retry_attempts,
        Duration::from_secs(config.retry_wait_secs),
    );
    let predictor = Predictor::from_config(client, &config);

    tracing::info!("Evaluating {} on {}", config.model, config.dataset.display());
    let mut runner = Runner::new(config, catalog, predictor, args.modes, args.reset);
    let total = runner.run().await?;

    output::print_report(&total.report(), args.output);

    Ok(())
}
