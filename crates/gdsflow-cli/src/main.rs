mod cmd;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gdsflow",
    about = "Drive generator → translator → physical-flow compilation campaigns",
    version,
    propagate_version = true
)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a campaign file and print the planned actions without running anything
    Plan {
        /// Campaign file (YAML)
        campaign: PathBuf,
    },

    /// Execute a campaign to completion
    Run {
        /// Campaign file (YAML)
        campaign: PathBuf,

        /// Maximum number of actions running at once (overrides the campaign file)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Operator generator binary
        #[arg(long, env = "GDSFLOW_GENERATOR_BIN")]
        generator_bin: Option<PathBuf>,

        /// VHDL-to-Verilog translator binary
        #[arg(long, env = "GDSFLOW_TRANSLATOR_BIN")]
        translator_bin: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Plan { campaign } => cmd::plan::run(&campaign, cli.json),
        Commands::Run {
            campaign,
            concurrency,
            generator_bin,
            translator_bin,
        } => {
            cmd::run::run(
                &campaign,
                concurrency,
                generator_bin.as_deref(),
                translator_bin.as_deref(),
                cli.json,
            )
            .await
        }
    };

    match result {
        // 0 = clean campaign, 1 = degraded (failed or cancelled cases)
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}
