//! List the instances in a dataset.

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use color_print::cprintln;
use terraform_bench::{Filter, load_instances};

use crate::cmd::FilterArgs;

#[derive(Args, Clone, Debug)]
pub struct Config {
    /// Dataset: a JSONL file, or a directory of them.
    #[arg(env = "TERRAFORM_BENCH_DATASET")]
    dataset: PathBuf,

    #[command(flatten)]
    filter: FilterArgs,

    /// Also print each problem statement.
    #[arg(short, long)]
    verbose: bool,
}

pub fn main(config: Config) -> Result<()> {
    let instances = Filter::from(config.filter).apply(load_instances(&config.dataset)?);

    if instances.is_empty() {
        println!("No instances found in {}", config.dataset.display());
        return Ok(());
    }

    cprintln!("<bold,underline>Instances in {}</>", config.dataset.display());
    for instance in &instances {
        println!("  {instance}");
        if config.verbose {
            cprintln!("    <dim>{}</>", instance.problem_statement);
        }
    }
    println!();
    println!("{} instance(s)", instances.len());

    Ok(())
}
