//! The evaluation pipeline: runs a generated configuration through the
//! toolchain stage by stage and records what happened.
//!
//! The gated stages run strictly in order:
//! `setup_script`, `init`, `validate`, `plan`, `apply`, `validation_script`.
//! The first one that does not pass ends the chain, and every gated stage
//! after it is recorded as skipped. Teardown (`destroy`, `cleanup_script`)
//! then runs whenever its precondition holds, whatever happened before.

use std::{collections::BTreeMap, path::Path, time::Duration};

use color_eyre::Result;
use tracing::{info, warn};

use crate::{
    config::EvalConfig,
    instance::BenchmarkInstance,
    progress::Progress,
    result::{InstanceResult, StageName, StageResult},
    sandbox::{Sandbox, Target, Workdir},
    scorer::score_plan,
};

/// Message recorded on every stage skipped because an earlier one failed.
pub const SKIPPED_MESSAGE: &str = "Skipped due to previous stage failure";

/// The toolchain operations the pipeline drives.
///
/// Each operation reports its outcome as a [`StageResult`], including when
/// the underlying tool fails. An `Err` means the harness itself could not
/// carry out the operation.
pub trait Toolchain {
    fn init(&self) -> Result<StageResult>;

    fn validate(&self) -> Result<StageResult>;

    /// Compute the dry-run diff; passing results carry the planned
    /// resource counts in their details.
    fn plan(&self) -> Result<StageResult>;

    fn apply(&self) -> Result<StageResult>;

    fn destroy(&self) -> Result<StageResult>;

    /// Run a setup, validation, or cleanup script.
    fn run_script(&self, stage: StageName, script: &Path) -> Result<StageResult>;
}

/// Everything a stage needs to decide whether and how to run.
struct Context<'a, T> {
    instance: &'a BenchmarkInstance,
    config: &'a EvalConfig,
    toolchain: &'a T,
}

/// One entry of the gated chain.
struct Stage<T> {
    name: StageName,
    applies: fn(&Context<'_, T>) -> bool,
    run: fn(&Context<'_, T>) -> Result<StageResult>,
}

/// The gated chain, in execution order.
fn gated_stages<T: Toolchain>() -> [Stage<T>; 6] {
    [
        Stage {
            name: StageName::SetupScript,
            applies: |cx| cx.instance.setup_script.is_some(),
            run: |cx| match &cx.instance.setup_script {
                Some(script) => cx.toolchain.run_script(StageName::SetupScript, script),
                None => Ok(StageResult::skipped(StageName::SetupScript, "No setup script")),
            },
        },
        Stage {
            name: StageName::Init,
            applies: |_| true,
            run: |cx| cx.toolchain.init(),
        },
        Stage {
            name: StageName::Validate,
            applies: |_| true,
            run: |cx| cx.toolchain.validate(),
        },
        Stage {
            name: StageName::Plan,
            applies: |_| true,
            run: |cx| {
                let result = cx.toolchain.plan()?;
                if !result.status.is_passed() {
                    return Ok(result);
                }
                // A successful dry-run stays passed; the score says how well
                // it matches the expected resources.
                let planned = result
                    .details
                    .planned_resources()
                    .cloned()
                    .unwrap_or_default();
                let (score, message) = score_plan(&planned, &cx.instance.expected_resources);
                Ok(result.scored(score, message))
            },
        },
        Stage {
            name: StageName::Apply,
            applies: |cx| cx.config.run_apply,
            run: |cx| cx.toolchain.apply(),
        },
        Stage {
            name: StageName::ValidationScript,
            applies: |cx| {
                cx.config.run_apply
                    && cx.config.run_validation
                    && cx.instance.validation_script.is_some()
            },
            run: |cx| match &cx.instance.validation_script {
                Some(script) => cx.toolchain.run_script(StageName::ValidationScript, script),
                None => Ok(StageResult::skipped(
                    StageName::ValidationScript,
                    "No validation script",
                )),
            },
        },
    ]
}

/// Run every applicable stage for an instance against a toolchain.
///
/// Never fails: an unexpected error from a stage is recorded as that stage's
/// error result and in [`InstanceResult::error`], and ends the gated chain
/// like a failure would. The returned result has its total score computed.
#[tracing::instrument(skip_all, fields(instance = %instance.instance_id))]
pub fn run_stages<T: Toolchain>(
    instance: &BenchmarkInstance,
    config: &EvalConfig,
    toolchain: &T,
    progress: &dyn Progress,
) -> InstanceResult {
    let cx = Context {
        instance,
        config,
        toolchain,
    };
    let id = instance.instance_id.as_str();
    let mut result = InstanceResult::new(id);
    let mut attempted = Vec::new();

    let record = |result: &mut InstanceResult, stage: StageResult| {
        progress.stage_finished(id, &stage);
        result.stages.push(stage);
    };

    for stage in gated_stages::<T>() {
        if !(stage.applies)(&cx) {
            continue;
        }

        progress.stage_started(id, stage.name);
        attempted.push(stage.name);
        let passed = match (stage.run)(&cx) {
            Ok(outcome) => {
                info!(stage = %stage.name, status = %outcome.status, score = outcome.score, "stage finished");
                let passed = outcome.status.is_passed();
                record(&mut result, outcome);
                passed
            }
            Err(err) => {
                warn!(stage = %stage.name, ?err, "stage could not run");
                let message = format!("{err:#}");
                result.error = Some(format!("{} stage: {message}", stage.name));
                record(&mut result, StageResult::error(stage.name, message, Duration::ZERO));
                false
            }
        };

        if !passed {
            for skipped in stage.name.gated_after() {
                record(&mut result, StageResult::skipped(skipped, SKIPPED_MESSAGE));
            }
            break;
        }
    }

    for (stage, run) in teardown(&cx, &attempted) {
        progress.stage_started(id, stage);
        match run(&cx) {
            Ok(outcome) => {
                info!(stage = %stage, status = %outcome.status, "teardown finished");
                record(&mut result, outcome);
            }
            Err(err) => {
                warn!(%stage, ?err, "teardown could not run");
                let message = format!("{err:#}");
                result.error.get_or_insert_with(|| format!("{stage} stage: {message}"));
                record(&mut result, StageResult::error(stage, message, Duration::ZERO));
            }
        }
    }

    result.compute_total_score();
    result
}

/// A teardown stage and how to run it.
type Teardown<T> = (StageName, fn(&Context<'_, T>) -> Result<StageResult>);

/// The teardown stages due after the gated chain attempted the given stages.
fn teardown<T: Toolchain>(cx: &Context<'_, T>, attempted: &[StageName]) -> Vec<Teardown<T>> {
    let mut stages: Vec<Teardown<T>> = Vec::new();
    if cx.config.run_destroy && attempted.contains(&StageName::Apply) {
        stages.push((StageName::Destroy, |cx| cx.toolchain.destroy()));
    }
    if cx.instance.setup_script.is_some() {
        stages.push((StageName::CleanupScript, cleanup));
    }
    stages
}

fn cleanup<T: Toolchain>(cx: &Context<'_, T>) -> Result<StageResult> {
    match cx.instance.cleanup_script() {
        Some(script) if script.is_file() => cx.toolchain.run_script(StageName::CleanupScript, &script),
        Some(script) => Ok(StageResult::skipped(
            StageName::CleanupScript,
            format!("No cleanup script at {}", script.display()),
        )),
        None => Ok(StageResult::skipped(StageName::CleanupScript, "No setup script")),
    }
}

/// Evaluate generated files for an instance in a fresh sandbox.
///
/// Errors only when the sandbox cannot be prepared; everything that happens
/// once the stages start is recorded in the returned result.
#[tracing::instrument(skip_all, fields(instance = %instance.instance_id))]
pub fn evaluate(
    instance: &BenchmarkInstance,
    files: &BTreeMap<String, String>,
    config: &EvalConfig,
    target: Target<'_>,
    workdir: Workdir,
    progress: &dyn Progress,
) -> Result<InstanceResult> {
    let sandbox = Sandbox::open(workdir, target, config, instance.region.as_str(), files)?;
    info!(files = files.len(), workdir = ?sandbox.path(), "wrote generated files");

    let mut result = run_stages(instance, config, &sandbox, progress);
    result.generated_files = files.clone();
    Ok(result)
}
