//! `review-runner`: run the analysis CLI against a unit of work without
//! letting its failures block CI.
//!
//! Results go to stdout; diagnostics go to stderr. Exit codes are listed in
//! [`review_runner::exit_codes`].

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use review_runner::core::output::{JsonSchemaOutput, OutputParser, TextOutput};
use review_runner::core::types::{RunRequest, RunResult};
use review_runner::error::RunnerError;
use review_runner::exit_codes;
use review_runner::io::cache::ReviewCache;
use review_runner::io::config::{RunnerConfig, load_config};
use review_runner::io::os_signals::cancel_on_signal;
use review_runner::io::warmup::WarmupProbe;
use review_runner::lifecycle::Runner;
use review_runner::logging;

#[derive(Parser)]
#[command(
    name = "review-runner",
    version,
    about = "Fault-tolerant runner for an external code-analysis CLI"
)]
struct Cli {
    /// Runner config file (TOML). Defaults apply when it is missing.
    #[arg(long, global = true, default_value = "review-runner.toml")]
    config: PathBuf,

    /// Override the analysis binary.
    #[arg(long, global = true)]
    binary: Option<String>,

    /// Override the capability definitions directory.
    #[arg(long, global = true)]
    capabilities_dir: Option<PathBuf>,

    /// Log at info level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Review one unit of work and print the result.
    Run {
        /// Request identifier (e.g. pull request number); also the cache key.
        #[arg(long)]
        key: u64,
        #[arg(long)]
        capability: String,
        /// Payload file (e.g. a diff); stdin when omitted.
        #[arg(long)]
        payload_file: Option<PathBuf>,
        /// Validate output as JSON against this schema.
        #[arg(long)]
        output_schema: Option<PathBuf>,
        /// Print the full result as JSON instead of the review text.
        #[arg(long)]
        json: bool,
    },
    /// Review several keys concurrently; the first hard failure cancels the rest.
    Batch {
        #[arg(long)]
        capability: String,
        #[arg(long = "key", required = true, num_args = 1..)]
        keys: Vec<u64>,
        /// Directory holding `<key>.diff` payloads; missing files mean an empty payload.
        #[arg(long)]
        payload_dir: Option<PathBuf>,
    },
    /// Check that the analysis binary starts and answers.
    Warmup,
    /// Maintain the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop the entry for one key.
    Invalidate {
        #[arg(long)]
        key: u64,
    },
    /// Drop every entry.
    Clear,
    /// Drop expired entries.
    Prune,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INFRA
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(&cli.config)?;
    if let Some(binary) = cli.binary {
        config.binary = binary;
    }
    if let Some(dir) = cli.capabilities_dir {
        config.capabilities_dir = dir;
    }

    match cli.command {
        Command::Run {
            key,
            capability,
            payload_file,
            output_schema,
            json,
        } => {
            let payload = read_payload(payload_file.as_deref())?;
            let parser: Arc<dyn OutputParser> = match output_schema {
                Some(path) => Arc::new(load_schema_parser(&path)?),
                None => Arc::new(TextOutput),
            };
            let request = RunRequest::new(key, capability, payload);
            runtime()?.block_on(cmd_run(config, parser, request, json))
        }
        Command::Batch {
            capability,
            keys,
            payload_dir,
        } => {
            let requests = keys
                .into_iter()
                .map(|key| {
                    let payload = match &payload_dir {
                        Some(dir) => read_optional(&dir.join(format!("{key}.diff")))?,
                        None => String::new(),
                    };
                    Ok(RunRequest::new(key, capability.clone(), payload))
                })
                .collect::<Result<Vec<_>>>()?;
            runtime()?.block_on(cmd_batch(config, requests))
        }
        Command::Warmup => runtime()?.block_on(cmd_warmup(&config)),
        Command::Cache { action } => cmd_cache(&config, action),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

async fn cmd_run(
    config: RunnerConfig,
    parser: Arc<dyn OutputParser>,
    request: RunRequest,
    json: bool,
) -> Result<i32> {
    let runner = Runner::new(config).with_parser(parser);
    if let Err(err) = runner.bootstrap().await {
        return Ok(report_failure(&err));
    }

    let signal = CancellationToken::new();
    let _listener = cancel_on_signal(signal.clone());
    let token = CancellationToken::new();
    let outcome = runner
        .run_until_signal(&signal, runner.run(&token, request))
        .await;
    runner.shutdown().await?;
    signal.cancel();

    match outcome {
        Ok(result) => {
            print_result(&result, json)?;
            Ok(exit_codes::OK)
        }
        Err(err) => Ok(report_failure(&err)),
    }
}

async fn cmd_batch(config: RunnerConfig, requests: Vec<RunRequest>) -> Result<i32> {
    let runner = Arc::new(Runner::new(config));
    if let Err(err) = runner.bootstrap().await {
        return Ok(report_failure(&err));
    }

    let signal = CancellationToken::new();
    let _listener = cancel_on_signal(signal.clone());
    let token = CancellationToken::new();
    let outcome = runner
        .run_until_signal(&signal, runner.run_all(&token, requests))
        .await;
    runner.shutdown().await?;
    signal.cancel();

    match outcome {
        Ok(results) => {
            let mut payload =
                serde_json::to_string_pretty(&results).context("serialize results")?;
            payload.push('\n');
            print!("{payload}");
            Ok(exit_codes::OK)
        }
        Err(err) => Ok(report_failure(&err)),
    }
}

async fn cmd_warmup(config: &RunnerConfig) -> Result<i32> {
    let probe = WarmupProbe::new(
        config.binary.clone(),
        config.warmup.args.clone(),
        Duration::from_secs(config.warmup.timeout_secs),
    );
    match probe.ensure_warm().await {
        Ok(report) => {
            println!("{} ({} ms)", report.version, report.latency.as_millis());
            Ok(exit_codes::OK)
        }
        Err(err) => Ok(report_failure(&err)),
    }
}

fn cmd_cache(config: &RunnerConfig, action: CacheAction) -> Result<i32> {
    let cache = ReviewCache::new(
        config.cache.dir.clone(),
        Duration::from_secs(config.cache.ttl_secs),
    );
    match action {
        CacheAction::Invalidate { key } => {
            cache.invalidate(key)?;
            println!("invalidated {}", cache.path_for(key).display());
        }
        CacheAction::Clear => println!("removed {} entries", cache.clear()?),
        CacheAction::Prune => println!("pruned {} expired entries", cache.prune_expired()?),
    }
    Ok(exit_codes::OK)
}

fn print_result(result: &RunResult, json: bool) -> Result<()> {
    if json {
        let mut payload = serde_json::to_string_pretty(result).context("serialize result")?;
        payload.push('\n');
        print!("{payload}");
        return Ok(());
    }
    if let Some(reason) = &result.reason {
        eprintln!("note: {reason}");
    }
    println!("{}", result.output);
    Ok(())
}

fn report_failure(err: &RunnerError) -> i32 {
    eprintln!("error: {err}");
    exit_codes::exit_code_for(err)
}

fn read_payload(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path).with_context(|| format!("read {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read payload from stdin")?;
            Ok(buf)
        }
    }
}

fn read_optional(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn load_schema_parser(path: &Path) -> Result<JsonSchemaOutput> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let schema: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(JsonSchemaOutput::new(&schema)?)
}
