//! Conductor command-line interface.
//!
//! Three subcommands: `ask` runs one orchestration end to end against the
//! demo telemetry tools, `tools` prints the closed dispatch table, and
//! `check-config` validates a YAML configuration file.
//!
//! `ask` drives the scripted reasoner when `--script` is given; otherwise it
//! uses the Anthropic backend, which needs the `anthropic` build feature and
//! `ANTHROPIC_API_KEY` in the environment.

mod demo;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use conductor_runtime::{
    CircuitBreakerRegistry, ConversationOrchestrator, InMemoryCheckpoints, ProgressSink, Reasoner,
    RuntimeConfig, ScriptedReasoner, ToolDispatcher, ToolId,
};

/// conductor - resilient multi-turn tool-calling orchestration
#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Run resilient multi-turn tool-calling orchestrations")]
#[command(version)]
struct Cli {
    /// Path to a YAML runtime configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question through the orchestration loop
    Ask {
        /// The question to answer
        question: String,

        /// Replay reasoner replies from a YAML script instead of a live API
        #[arg(long)]
        script: Option<PathBuf>,

        /// Override the configured turn cap for this run
        #[arg(long)]
        max_turns: Option<u32>,

        /// Print the full checkpoint record after the run
        #[arg(long)]
        dump_checkpoint: bool,
    },

    /// Print the closed tool table with parameter schemas
    Tools,

    /// Parse and validate a configuration file
    CheckConfig {
        /// Path of the YAML file to check
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ask {
            question,
            script,
            max_turns,
            dump_checkpoint,
        } => {
            ask(
                cli.config.as_deref(),
                &question,
                script.as_deref(),
                max_turns,
                dump_checkpoint,
            )
            .await
        }
        Command::Tools => print_tools(),
        Command::CheckConfig { path } => check_config(&path),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        // Without a config file, give the demo tools contrasting policies so
        // breaker behavior is visible in a plain `conductor ask`.
        None => Ok(RuntimeConfig {
            tools: demo::demo_tools(),
            ..RuntimeConfig::default()
        }),
    }
}

#[cfg(feature = "anthropic")]
fn live_reasoner(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn Reasoner>> {
    use conductor_runtime::AnthropicReasoner;
    let reasoner = AnthropicReasoner::from_env(config.reasoner.settings.clone())
        .context("Failed to configure the Anthropic reasoner")?;
    Ok(Arc::new(reasoner))
}

#[cfg(not(feature = "anthropic"))]
fn live_reasoner(_config: &RuntimeConfig) -> anyhow::Result<Arc<dyn Reasoner>> {
    anyhow::bail!(
        "no --script given and this build has no live reasoner; \
         rebuild with --features anthropic and set ANTHROPIC_API_KEY"
    )
}

async fn ask(
    config_path: Option<&Path>,
    question: &str,
    script: Option<&Path>,
    max_turns: Option<u32>,
    dump_checkpoint: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(turns) = max_turns {
        config.budget.max_turns = turns;
    }

    let reasoner: Arc<dyn Reasoner> = match script {
        Some(path) => Arc::new(
            ScriptedReasoner::from_yaml_file(path)
                .with_context(|| format!("Failed to load reply script from {}", path.display()))?,
        ),
        None => live_reasoner(&config)?,
    };

    let registry = Arc::new(CircuitBreakerRegistry::new(config.tools.breaker_profiles()));
    let mut builder = ToolDispatcher::builder()
        .handler(ToolId::CurrentConditions, demo::StationConditions)
        .handler(ToolId::AggregateMetrics, demo::MetricAggregator)
        .handler(ToolId::RunForecast, demo::TrendForecaster)
        .registry(registry)
        .cache(config.cache.clone());
    for tool in ToolId::ALL {
        builder = builder.profile(tool, config.tools.call_profile(tool.name()));
    }
    let dispatcher = Arc::new(builder.build()?);

    let sink = Arc::new(InMemoryCheckpoints::new());
    let orchestrator = ConversationOrchestrator::builder()
        .reasoner(reasoner)
        .dispatcher(dispatcher)
        .sink(Arc::clone(&sink) as Arc<dyn ProgressSink>)
        .budget(config.budget)
        .reasoner_retry(config.reasoner.retry)
        .build()?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            interrupt.cancel();
        }
    });

    let outcome = orchestrator.run(question, &cancel).await?;

    println!("{}", outcome.answer);
    println!();
    println!("disposition: {}", outcome.disposition);
    println!("turns used:  {}", outcome.turns_used);
    println!("tool calls:  {}", outcome.tool_calls);

    let summary = orchestrator.breaker_summary();
    if summary.total > 0 {
        println!();
        println!(
            "breakers: {} closed, {} open, {} half-open",
            summary.closed, summary.open, summary.half_open
        );
        for breaker in &summary.breakers {
            let mut line = format!(
                "  {:<20} {:<9} failures={} in_state={}",
                breaker.name,
                breaker.state.to_string(),
                breaker.consecutive_failures,
                humantime::format_duration(Duration::from_millis(breaker.in_state_ms)),
            );
            if let Some(retry_after) = breaker.retry_after_ms {
                line.push_str(&format!(
                    " retry_after={}",
                    humantime::format_duration(Duration::from_millis(retry_after))
                ));
            }
            println!("{line}");
        }
    }

    if dump_checkpoint {
        let checkpoint = sink
            .checkpoint(&outcome.run_id)
            .context("checkpoint for the finished run is missing")?;
        println!();
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
    }

    Ok(())
}

fn print_tools() -> anyhow::Result<()> {
    for tool in ToolId::ALL {
        println!("{}: {}", tool.name(), tool.description());
        println!("{}", serde_json::to_string_pretty(&tool.parameter_schema())?);
        println!();
    }
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = RuntimeConfig::from_yaml_file(path)
        .with_context(|| format!("Configuration rejected: {}", path.display()))?;

    println!("{}: OK", path.display());
    println!("  max turns:        {}", config.budget.max_turns);
    println!(
        "  per-turn timeout: {}",
        humantime::format_duration(config.budget.per_turn_timeout)
    );
    println!(
        "  total budget:     {}",
        humantime::format_duration(config.budget.total_budget)
    );
    println!("  model:            {}", config.reasoner.settings.model);
    println!(
        "  cache:            {}",
        if config.cache.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  tool overrides:   {}", config.tools.per_tool.len());
    Ok(())
}
