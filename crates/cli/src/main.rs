use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use workflows_core::ExecutionEngine;

mod config;
mod demo;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "workflows")]
#[command(about = "Run staged, dependency-aware task pipelines", version, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "workflows.toml", env = "WORKFLOWS_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute logarithms with independent parallel tasks
    Demo {
        /// Number of tasks (overrides the configuration file)
        #[arg(short, long)]
        tasks: Option<u32>,

        /// Execution slots, 0 = one per processor (overrides the configuration file)
        #[arg(long, env = "WORKFLOWS_THREADS")]
        threads: Option<usize>,

        /// Print the run report, engine status and task records as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workflows=info,workflows_core=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();
    let mut config = CliConfig::load(&args.config)?;

    match args.command {
        Command::Demo {
            tasks,
            threads,
            json,
        } => {
            if let Some(threads) = threads {
                config.engine.worker_threads = threads;
            }
            let tasks = tasks.unwrap_or(config.demo.tasks);

            let engine = ExecutionEngine::with_config(config.engine)
                .context("Failed to start execution engine")?;
            let output = demo::run(&engine, tasks)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                tracing::info!(
                    duration_ms = output.report.duration_ms(),
                    engine = ?output.engine,
                    "Demo finished"
                );
            }

            engine.shutdown(Duration::from_secs(5));
        }
    }

    Ok(())
}
