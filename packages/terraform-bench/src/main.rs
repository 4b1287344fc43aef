//! Command line for the Terraform benchmark.

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

/// Benchmark models on writing Terraform configurations.
#[derive(Parser)]
#[command(name = "terraform-bench", author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and evaluate configurations for a dataset.
    Run(cmd::run::Config),

    /// Render a saved benchmark report.
    Report(cmd::report::Config),

    /// List the instances in a dataset.
    List(cmd::list::Config),
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .pretty()
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::INFO.into())
                        .with_env_var("TERRAFORM_BENCH_LOG")
                        .from_env_lossy(),
                ),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(config) => cmd::run::main(config),
        Commands::Report(config) => cmd::report::main(config),
        Commands::List(config) => cmd::list::main(config),
    }
}
