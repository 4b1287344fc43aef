//! Generate configurations for a dataset and evaluate them.

use std::path::PathBuf;

use clap::Args;
use color_eyre::{Result, eyre::bail};
use color_print::cprintln;
use terraform_bench::{
    Agent, Backend, BenchmarkInstance, EmulatorConfig, EvalConfig, ExistingFiles, Filter,
    Generator, RunConfig, load_instances, progress::Console, report::PASS_THRESHOLD,
    run_benchmark,
};

use crate::cmd::FilterArgs;

#[derive(Args, Clone, Debug)]
pub struct Config {
    /// Dataset: a JSONL file, or a directory of them.
    #[arg(env = "TERRAFORM_BENCH_DATASET")]
    dataset: PathBuf,

    #[command(flatten)]
    filter: FilterArgs,

    /// Agent generating the configurations.
    ///
    /// Format: `claude-code:<model>` where model is `sonnet`, `haiku`, `opus`,
    /// or a full model ID like `claude-sonnet-4-5-20250929`; or
    /// `command:<path>` for any program that reads the prompt on stdin and
    /// prints the configuration.
    #[arg(short, long, env = "TERRAFORM_BENCH_AGENT", default_value = "claude-code:sonnet")]
    agent: Agent,

    /// Reuse the `*.tf` files already in `<output-dir>/<instance_id>/`
    /// instead of generating new ones.
    #[arg(long)]
    skip_generation: bool,

    /// Model name recorded in results when generation is skipped.
    #[arg(long, requires = "skip_generation")]
    model: Option<String>,

    /// Directory for working directories, per-instance results and the report.
    #[arg(short, long, env = "TERRAFORM_BENCH_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Where to write the report; defaults to `<output-dir>/report.json`.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Number of instances to evaluate at once.
    #[arg(short = 'j', long, env = "TERRAFORM_BENCH_PARALLELISM", default_value = "1")]
    parallelism: usize,

    /// Evaluation settings (TOML); command line flags take precedence.
    #[arg(short, long, env = "TERRAFORM_BENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Deploy the plan against the sandbox backend.
    #[arg(long)]
    run_apply: bool,

    /// Run each instance's validation script after deploying.
    #[arg(long)]
    run_validation: bool,

    /// Leave deployed resources in place.
    #[arg(long)]
    no_destroy: bool,

    /// Run the toolchain in containers next to an emulator container.
    #[arg(long)]
    docker: bool,

    /// Emulator image for `--docker`.
    #[arg(long, env = "TERRAFORM_BENCH_EMULATOR_IMAGE", requires = "docker")]
    emulator_image: Option<String>,

    /// Toolchain image for `--docker`.
    #[arg(long, env = "TERRAFORM_BENCH_TOOLCHAIN_IMAGE", requires = "docker")]
    toolchain_image: Option<String>,

    /// Emulator endpoint for the host backend, e.g. `http://localhost:4566`.
    #[arg(long, env = "TERRAFORM_BENCH_ENDPOINT", conflicts_with = "docker")]
    endpoint: Option<String>,

    /// Toolchain executable for the host backend.
    #[arg(long, env = "TERRAFORM_BENCH_TERRAFORM")]
    terraform_binary: Option<String>,

    /// Show what would be run without actually running it.
    #[arg(long)]
    dry_run: bool,
}

/// Fully resolved run configuration with defaults applied.
struct ResolvedConfig {
    instances: Vec<BenchmarkInstance>,
    generator: Box<dyn Generator>,
    run: RunConfig,
    report: PathBuf,
}

impl ResolvedConfig {
    fn print_summary(&self) {
        let eval = &self.run.eval;
        cprintln!("<bold,underline>Benchmark Configuration</>");
        cprintln!("  <cyan>Model:</> {}", self.generator.model());
        cprintln!("  <cyan>Instances:</> {}", self.instances.len());
        cprintln!("  <cyan>Parallelism:</> {}", self.run.parallelism);
        match &eval.backend {
            Backend::Host { endpoint: Some(endpoint) } => {
                cprintln!("  <cyan>Backend:</> host, emulator at {endpoint}")
            }
            Backend::Host { endpoint: None } => cprintln!("  <cyan>Backend:</> host"),
            Backend::Docker(emulator) => cprintln!("  <cyan>Backend:</> docker ({})", emulator.image),
        }
        cprintln!(
            "  <cyan>Stages:</> plan{}{}{}",
            if eval.run_apply { ", apply" } else { "" },
            if eval.run_apply && eval.run_validation { ", validation" } else { "" },
            if eval.run_apply && eval.run_destroy { ", destroy" } else { "" },
        );
        println!();
    }
}

pub fn main(config: Config) -> Result<()> {
    let dry_run = config.dry_run;
    let resolved = ResolvedConfig::try_from(config)?;

    resolved.print_summary();

    if dry_run {
        main_dry_run(&resolved);
        Ok(())
    } else {
        main_run(&resolved)
    }
}

fn main_dry_run(config: &ResolvedConfig) {
    cprintln!("<yellow,bold>Dry run: listing all instances:</>");
    let total = config.instances.len();
    for (index, instance) in config.instances.iter().enumerate() {
        cprintln!("  [{}/{total}] <green,bold>Instance:</> {instance}", index + 1);
    }
}

fn main_run(config: &ResolvedConfig) -> Result<()> {
    let progress = Console {
        prefix: config.run.parallelism > 1,
    };
    let report = run_benchmark(
        &config.instances,
        config.generator.as_ref(),
        &config.run,
        &progress,
    );

    let total = report.results.len();
    let passed = report.passed(PASS_THRESHOLD);
    println!();
    cprintln!("<bold>Benchmark complete.</>");
    cprintln!("  <cyan>Mean score:</> {:.3}", report.mean_score());
    cprintln!("  <cyan>Passed:</> {passed}/{total} (score >= {PASS_THRESHOLD})");
    for (stage, rate) in report.stage_pass_rates() {
        cprintln!("  <cyan>{stage}:</> {:.0}%", rate * 100.0);
    }

    report.save(&config.report)?;
    cprintln!("  <cyan>Report:</> {}", config.report.display());

    Ok(())
}

impl TryFrom<Config> for ResolvedConfig {
    type Error = color_eyre::eyre::Error;

    fn try_from(config: Config) -> Result<Self> {
        let instances = Filter::from(config.filter).apply(load_instances(&config.dataset)?);
        if instances.is_empty() {
            bail!("no instances selected from {}", config.dataset.display());
        }

        let mut eval = match &config.config {
            Some(path) => EvalConfig::load(path)?,
            None => EvalConfig::default(),
        };
        eval.run_apply |= config.run_apply;
        eval.run_validation |= config.run_validation;
        if config.no_destroy {
            eval.run_destroy = false;
        }
        if let Some(binary) = config.terraform_binary {
            eval.terraform_binary = binary;
        }
        if config.docker {
            let mut emulator = match eval.backend {
                Backend::Docker(emulator) => emulator,
                Backend::Host { .. } => EmulatorConfig::default(),
            };
            if let Some(image) = config.emulator_image {
                emulator.image = image;
            }
            if let Some(image) = config.toolchain_image {
                emulator.toolchain_image = image;
            }
            eval.backend = Backend::Docker(emulator);
        } else if let Some(endpoint) = config.endpoint {
            eval.backend = Backend::Host {
                endpoint: Some(endpoint),
            };
        }

        let generator: Box<dyn Generator> = if config.skip_generation {
            let model = config.model.unwrap_or_else(|| config.agent.model());
            Box::new(ExistingFiles {
                dir: config.output_dir.clone(),
                model,
            })
        } else {
            Box::new(config.agent)
        };

        let report = config
            .report
            .unwrap_or_else(|| config.output_dir.join("report.json"));
        let run = RunConfig::builder()
            .eval(eval)
            .parallelism(config.parallelism.max(1))
            .output_dir(config.output_dir)
            .build();

        Ok(Self {
            instances,
            generator,
            run,
            report,
        })
    }
}
