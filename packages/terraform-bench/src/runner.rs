//! Runs the benchmark over a set of instances.

use std::{
    any::Any,
    fs::{create_dir_all, remove_dir_all, write},
    panic::{AssertUnwindSafe, catch_unwind},
    path::{Path, PathBuf},
};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use rayon::{ThreadPoolBuilder, prelude::*};
use tracing::{info, warn};

use crate::{
    agent::{GenerationRequest, Generator},
    config::{Backend, EmulatorConfig, EvalConfig},
    instance::BenchmarkInstance,
    pipeline::evaluate,
    progress::Progress,
    report::BenchmarkReport,
    result::InstanceResult,
    sandbox::{Emulator, Target, Workdir},
};

/// How a benchmark run is carried out.
#[derive(Debug, Clone, PartialEq, Builder)]
#[non_exhaustive]
pub struct RunConfig {
    #[builder(default)]
    pub eval: EvalConfig,

    /// Instances evaluated at once; `1` runs them one after another.
    #[builder(default = 1)]
    pub parallelism: usize,

    /// Keep each instance's working directory and result here, under
    /// `<output_dir>/<instance_id>`. Without it, work happens in temporary
    /// directories.
    #[builder(into)]
    pub output_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Run every instance and collect the results.
///
/// Never fails: whatever goes wrong for an instance is recorded in its
/// result. Results are in the same order as `instances`.
#[tracing::instrument(skip_all, fields(instances = instances.len(), parallelism = config.parallelism))]
pub fn run_benchmark<G: Generator + ?Sized>(
    instances: &[BenchmarkInstance],
    generator: &G,
    config: &RunConfig,
    progress: &dyn Progress,
) -> BenchmarkReport {
    run_with_backend(instances, generator, config, progress, &DockerEmulator)
}

/// Starts and stops the shared emulator a Docker-backed run evaluates against.
trait EmulatorLifecycle: Sync {
    fn start(&self, settings: &EmulatorConfig) -> Result<Emulator>;

    fn stop(&self, emulator: Emulator);
}

/// Emulator containers managed through the `docker` CLI.
struct DockerEmulator;

impl EmulatorLifecycle for DockerEmulator {
    fn start(&self, settings: &EmulatorConfig) -> Result<Emulator> {
        Emulator::start(settings)
    }

    fn stop(&self, emulator: Emulator) {
        emulator.stop();
    }
}

fn run_with_backend<G: Generator + ?Sized>(
    instances: &[BenchmarkInstance],
    generator: &G,
    config: &RunConfig,
    progress: &dyn Progress,
    lifecycle: &dyn EmulatorLifecycle,
) -> BenchmarkReport {
    let results = if config.parallelism > 1 {
        run_parallel(instances, generator, config, progress, lifecycle)
    } else {
        run_sequential(instances, generator, config, progress, lifecycle)
    };

    let report = BenchmarkReport::new(generator.model(), results);
    info!(
        mean_score = report.mean_score(),
        instances = report.results.len(),
        "benchmark finished"
    );
    report
}

/// Generate and evaluate one instance against an already running backend.
///
/// Never fails, even if generation or the evaluation itself panics.
#[tracing::instrument(skip_all, fields(instance = %instance.instance_id))]
pub fn run_instance<G: Generator + ?Sized>(
    instance: &BenchmarkInstance,
    generator: &G,
    config: &RunConfig,
    target: Target<'_>,
    progress: &dyn Progress,
) -> InstanceResult {
    let id = instance.instance_id.as_str();
    progress.instance_started(id);

    let result = catch_unwind(AssertUnwindSafe(|| {
        generate_and_evaluate(instance, generator, config, target, progress)
    }))
    .unwrap_or_else(|payload| {
        warn!(instance = id, "evaluation panicked");
        InstanceResult::failed(id, format!("Evaluation panicked: {}", panic_message(&*payload)))
    });

    finish(result, generator, config, progress)
}

fn generate_and_evaluate<G: Generator + ?Sized>(
    instance: &BenchmarkInstance,
    generator: &G,
    config: &RunConfig,
    target: Target<'_>,
    progress: &dyn Progress,
) -> InstanceResult {
    let id = instance.instance_id.as_str();
    let generation = match generator.generate(&GenerationRequest::from(instance)) {
        Ok(generation) => generation,
        Err(err) => {
            warn!(instance = id, ?err, "generation failed");
            return InstanceResult::failed(id, format!("Generation failed: {err:#}"));
        }
    };

    let mut result = workdir(config, id)
        .and_then(|workdir| {
            evaluate(instance, &generation.files, &config.eval, target, workdir, progress)
        })
        .unwrap_or_else(|err| {
            warn!(instance = id, ?err, "evaluation failed");
            InstanceResult {
                generated_files: generation.files.clone(),
                ..InstanceResult::failed(id, format!("Evaluation failed: {err:#}"))
            }
        });
    result.prompt = generation.prompt;
    result
}

/// Stamp the model, persist the result if asked to, and report it.
fn finish<G: Generator + ?Sized>(
    mut result: InstanceResult,
    generator: &G,
    config: &RunConfig,
    progress: &dyn Progress,
) -> InstanceResult {
    result.model = generator.model();
    if let Some(dir) = &config.output_dir {
        if let Err(err) = save_result(dir, &result) {
            warn!(instance = %result.instance_id, ?err, "could not save result");
        }
    }
    progress.instance_finished(&result);
    result
}

/// Evaluate instances one after another, each against its own backend.
fn run_sequential<G: Generator + ?Sized>(
    instances: &[BenchmarkInstance],
    generator: &G,
    config: &RunConfig,
    progress: &dyn Progress,
    lifecycle: &dyn EmulatorLifecycle,
) -> Vec<InstanceResult> {
    instances
        .iter()
        .map(|instance| match &config.eval.backend {
            Backend::Host { .. } => run_instance(instance, generator, config, Target::Host, progress),
            Backend::Docker(settings) => match lifecycle.start(settings) {
                Ok(emulator) => {
                    let result = run_instance(
                        instance,
                        generator,
                        config,
                        Target::Emulator(&emulator),
                        progress,
                    );
                    lifecycle.stop(emulator);
                    result
                }
                Err(err) => backend_failed(instance, &err, generator, config, progress),
            },
        })
        .collect()
}

/// Evaluate instances on a bounded worker pool sharing one backend.
///
/// The backend is started before any worker runs and stopped after every
/// worker is done; workers never start or stop it.
fn run_parallel<G: Generator + ?Sized>(
    instances: &[BenchmarkInstance],
    generator: &G,
    config: &RunConfig,
    progress: &dyn Progress,
    lifecycle: &dyn EmulatorLifecycle,
) -> Vec<InstanceResult> {
    let pool = match ThreadPoolBuilder::new()
        .num_threads(config.parallelism)
        .thread_name(|index| format!("worker-{index}"))
        .build()
    {
        Ok(pool) => pool,
        Err(err) => {
            warn!(?err, "could not build worker pool, running sequentially");
            return run_sequential(instances, generator, config, progress, lifecycle);
        }
    };

    let emulator = match &config.eval.backend {
        Backend::Host { .. } => None,
        Backend::Docker(settings) => match lifecycle.start(settings) {
            Ok(emulator) => Some(emulator),
            Err(err) => {
                return instances
                    .iter()
                    .map(|instance| backend_failed(instance, &err, generator, config, progress))
                    .collect();
            }
        },
    };
    let target = emulator.as_ref().map_or(Target::Host, Target::Emulator);

    let results: Vec<InstanceResult> = pool.install(|| {
        instances
            .par_iter()
            .map(|instance| run_instance(instance, generator, config, target, progress))
            .collect()
    });

    if let Some(emulator) = emulator {
        lifecycle.stop(emulator);
    }
    results
}

fn backend_failed<G: Generator + ?Sized>(
    instance: &BenchmarkInstance,
    err: &color_eyre::Report,
    generator: &G,
    config: &RunConfig,
    progress: &dyn Progress,
) -> InstanceResult {
    warn!(instance = %instance.instance_id, ?err, "sandbox backend failed to start");
    let result = InstanceResult::failed(
        instance.instance_id.as_str(),
        format!("Sandbox backend failed to start: {err:#}"),
    );
    finish(result, generator, config, progress)
}

/// The working directory for an instance.
///
/// A kept directory is emptied first so state, plans and scripts from an
/// earlier run do not leak into this one.
fn workdir(config: &RunConfig, instance_id: &str) -> Result<Workdir> {
    let Some(output_dir) = &config.output_dir else {
        return Workdir::temporary();
    };

    let dir = output_dir.join(instance_id);
    if dir.exists() {
        remove_dir_all(&dir).with_context(|| format!("clear working directory: {dir:?}"))?;
    }
    Workdir::persistent(dir)
}

fn save_result(output_dir: &Path, result: &InstanceResult) -> Result<()> {
    let dir = output_dir.join(&result.instance_id);
    create_dir_all(&dir).with_context(|| format!("create result directory: {dir:?}"))?;
    let path = dir.join("result.json");
    let content = serde_json::to_string_pretty(result).context("serialize result")?;
    write(&path, content).with_context(|| format!("write result: {path:?}"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic")
    }
}
