//! Isolated working directories and the toolchain commands run inside them.
//!
//! A [`Sandbox`] owns one working directory holding a generated
//! configuration and runs the toolchain's stages against it, turning each
//! command's outcome into a [`StageResult`]. Where the commands run is
//! decided by its [`Target`]: directly on this machine, or in ephemeral
//! containers attached to a shared [`Emulator`].

use std::{
    collections::BTreeMap,
    fs::{self, create_dir_all},
    path::{Component, Path, PathBuf},
    time::Duration,
};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail},
};
use serde::Deserialize;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    config::{Backend, EvalConfig},
    pipeline::Toolchain,
    result::{Diagnostic, StageDetails, StageName, StageResult},
};

pub mod emulator;
pub mod process;

pub use emulator::Emulator;
use process::{CommandOutput, Exit, Invocation};

/// Time limit for removing a container left behind by a timed out command.
const CONTAINER_REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a sandbox keeps its files.
#[derive(Debug)]
pub enum Workdir {
    /// Removed when the sandbox is dropped.
    Temporary(TempDir),

    /// Kept after the run for inspection.
    Persistent(PathBuf),
}

impl Workdir {
    /// Create a fresh temporary directory.
    pub fn temporary() -> Result<Self> {
        tempfile::Builder::new()
            .prefix("terraform-bench-")
            .tempdir()
            .map(Self::Temporary)
            .context("create temporary working directory")
    }

    /// Use (and create if needed) the given directory.
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        create_dir_all(&path).with_context(|| format!("create working directory: {path:?}"))?;
        Ok(Self::Persistent(path))
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Temporary(dir) => dir.path(),
            Self::Persistent(path) => path,
        }
    }
}

/// The backend a sandbox runs its commands on.
///
/// The sandbox only borrows an emulator; starting and stopping it is the
/// caller's responsibility.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// Run the toolchain directly on this machine.
    Host,

    /// Run each command in a container on the emulator's network.
    Emulator(&'a Emulator),
}

/// A working directory with a generated configuration written into it.
#[derive(Debug)]
pub struct Sandbox<'a> {
    workdir: Workdir,

    /// Canonical path of `workdir`.
    root: PathBuf,

    target: Target<'a>,
    config: &'a EvalConfig,
    region: String,
}

impl<'a> Sandbox<'a> {
    /// Write the generated files into the working directory.
    ///
    /// File names are paths relative to the working directory; any name that
    /// would escape it is rejected.
    #[tracing::instrument(skip_all, fields(workdir = ?workdir.path()))]
    pub fn open(
        workdir: Workdir,
        target: Target<'a>,
        config: &'a EvalConfig,
        region: impl Into<String>,
        files: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let root = workdir
            .path()
            .canonicalize()
            .with_context(|| format!("resolve working directory: {:?}", workdir.path()))?;

        for (name, content) in files {
            let relative = Path::new(name);
            if !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
            {
                bail!("generated file name escapes the working directory: {name:?}");
            }

            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                create_dir_all(parent).with_context(|| format!("create directory: {parent:?}"))?;
            }
            fs::write(&path, content).with_context(|| format!("write file: {path:?}"))?;
            debug!(?path, "wrote generated file");
        }

        Ok(Self {
            workdir,
            root,
            target,
            config,
            region: region.into(),
        })
    }

    pub fn path(&self) -> &Path {
        self.workdir.path()
    }

    /// The emulator endpoint the cloud provider should talk to, if any.
    fn endpoint(&self) -> Option<String> {
        match (self.target, &self.config.backend) {
            (Target::Emulator(emulator), _) => Some(emulator.endpoint()),
            (Target::Host, Backend::Host { endpoint }) => endpoint.clone(),
            (Target::Host, Backend::Docker(_)) => None,
        }
    }

    fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![(String::from("AWS_DEFAULT_REGION"), self.region.clone())];
        if let Some(endpoint) = self.endpoint() {
            env.extend(
                [
                    ("AWS_ACCESS_KEY_ID", "test"),
                    ("AWS_SECRET_ACCESS_KEY", "test"),
                    ("AWS_ENDPOINT_URL", endpoint.as_str()),
                    ("TF_VAR_localstack", "true"),
                ]
                .map(|(key, value)| (key.to_string(), value.to_string())),
            );
        }
        env
    }

    /// Wrap a shell command in an ephemeral container on the emulator network.
    ///
    /// The working directory is mounted at `/workspace`; `extra_mount` is
    /// mounted at `/validation`. Each container gets a unique name so it can
    /// be removed if its client times out.
    fn containerized(
        &self,
        emulator: &Emulator,
        image: &str,
        extra_mount: Option<&Path>,
        command: String,
        timeout: Duration,
    ) -> StageCommand {
        let name = format!("terraform-bench-{}", Uuid::new_v4().simple());
        let mut args = vec![
            String::from("run"),
            String::from("--rm"),
            String::from("--name"),
            name.clone(),
            String::from("--network"),
            emulator.network().to_string(),
            String::from("-v"),
            format!("{}:/workspace", self.root.display()),
            String::from("-w"),
            String::from("/workspace"),
        ];
        if let Some(mount) = extra_mount {
            args.push(String::from("-v"));
            args.push(format!("{}:/validation", mount.display()));
        }
        for (key, value) in self.environment() {
            args.push(String::from("-e"));
            args.push(format!("{key}={value}"));
        }
        args.extend(
            ["--entrypoint", "sh", image, "-c", command.as_str()].map(String::from),
        );

        let invocation = Invocation::builder()
            .program("docker")
            .args(args)
            .timeout(timeout)
            .build();
        let on_timeout = Invocation::builder()
            .program("docker")
            .args(["rm", "-f", name.as_str()].map(String::from).to_vec())
            .timeout(CONTAINER_REMOVE_TIMEOUT)
            .build();
        StageCommand {
            invocation,
            on_timeout: Some(on_timeout),
        }
    }

    /// Build a toolchain subcommand for the working directory.
    fn terraform_command(&self, args: &[&str], timeout: Duration) -> StageCommand {
        match self.target {
            Target::Host => StageCommand::host(
                Invocation::builder()
                    .program(self.config.terraform_binary.as_str())
                    .args(args.iter().map(|arg| arg.to_string()).collect())
                    .cwd(self.root.clone())
                    .env(self.environment())
                    .timeout(timeout)
                    .build(),
            ),
            Target::Emulator(emulator) => {
                let command = shell_words::join(std::iter::once("terraform").chain(args.iter().copied()));
                self.containerized(
                    emulator,
                    &emulator.config().toolchain_image,
                    None,
                    command,
                    timeout,
                )
            }
        }
    }

    /// Run a toolchain subcommand in the working directory.
    fn terraform(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let output = self.terraform_command(args, timeout).run()?;
        debug!(exit = ?output.exit, duration = ?output.duration, "terraform {}", args.join(" "));
        Ok(output)
    }

    /// Build the command that runs a script.
    ///
    /// Python scripts run with a Python interpreter (with `boto3` installed
    /// first in a container); anything else runs with `bash`.
    fn script(&self, script: &Path, timeout: Duration) -> Result<StageCommand> {
        let python = script.extension().is_some_and(|ext| ext == "py");
        let emulator = match self.target {
            Target::Host => {
                return Ok(StageCommand::host(
                    Invocation::builder()
                        .program(if python { "python3" } else { "bash" })
                        .args(vec![script.display().to_string()])
                        .cwd(self.root.clone())
                        .env(self.environment())
                        .timeout(timeout)
                        .build(),
                ));
            }
            Target::Emulator(emulator) => emulator,
        };

        let (mount, path) = match script.strip_prefix(&self.root) {
            Ok(relative) => (None, format!("/workspace/{}", relative.display())),
            Err(_) => {
                let parent = script.parent().ok_or_eyre("script has no parent directory")?;
                let name = script.file_name().ok_or_eyre("script has no file name")?;
                (Some(parent), format!("/validation/{}", name.to_string_lossy()))
            }
        };
        let path = shell_words::quote(&path);
        let config = emulator.config();
        let (image, command) = if python {
            (
                config.python_image.as_str(),
                format!("pip install -q boto3 && python {path}"),
            )
        } else {
            (
                config.shell_image.as_str(),
                format!("apk add --no-cache aws-cli bash zip >/dev/null && /bin/bash {path}"),
            )
        };
        Ok(self.containerized(emulator, image, mount, command, timeout))
    }

    /// Copy a setup or cleanup script into the working directory under
    /// `name`, along with a sibling `lambda_code/` directory if present.
    fn stage_script(&self, script: &Path, name: &str) -> Result<PathBuf> {
        let dest = self.root.join(name);
        fs::copy(script, &dest).with_context(|| format!("copy script {script:?} to {dest:?}"))?;

        if let Some(lambda_code) = script.parent().map(|dir| dir.join("lambda_code")) {
            if lambda_code.is_dir() {
                copy_dir(&lambda_code, &self.root.join("lambda_code"))?;
            }
        }
        Ok(dest)
    }
}

/// A command built for a stage.
#[derive(Debug)]
struct StageCommand {
    invocation: Invocation,

    /// Run after `invocation` times out. Killing a `docker run` client
    /// leaves its container running, so containerized commands remove it.
    on_timeout: Option<Invocation>,
}

impl StageCommand {
    fn host(invocation: Invocation) -> Self {
        Self {
            invocation,
            on_timeout: None,
        }
    }

    fn run(&self) -> Result<CommandOutput> {
        let output = self.invocation.run()?;
        if let (Exit::TimedOut(_), Some(cleanup)) = (output.exit, &self.on_timeout) {
            match cleanup.run() {
                Ok(removed) if removed.success() => info!(command = %cleanup, "cleaned up after timeout"),
                Ok(removed) => warn!(
                    command = %cleanup,
                    exit = ?removed.exit,
                    stderr = %removed.stderr,
                    "clean up after timeout"
                ),
                Err(err) => warn!(?err, command = %cleanup, "clean up after timeout"),
            }
        }
        Ok(output)
    }
}

impl Toolchain for Sandbox<'_> {
    #[tracing::instrument(skip_all)]
    fn init(&self) -> Result<StageResult> {
        let output = self.terraform(&["init", "-input=false"], self.config.timeouts.init)?;
        Ok(command_result(StageName::Init, &output, "terraform init"))
    }

    #[tracing::instrument(skip_all)]
    fn validate(&self) -> Result<StageResult> {
        let stage = StageName::Validate;
        let output = self.terraform(&["validate", "-json"], self.config.timeouts.validate)?;
        if let Exit::Signal | Exit::TimedOut(_) | Exit::NotFound = output.exit {
            return Ok(command_result(stage, &output, "terraform validate"));
        }

        // The report is printed on stdout whether or not validation passed.
        let report = match serde_json::from_str::<ValidateReport>(&output.stdout) {
            Ok(report) => report,
            Err(err) => {
                debug!(?err, "parse validate output");
                return Ok(StageResult::error(stage, "Failed to parse validate output", output.duration)
                    .with_output(output.combined()));
            }
        };

        let result = if report.valid {
            StageResult::passed(stage, "Validation passed", output.duration)
        } else {
            StageResult::failed(
                stage,
                format!("Validation failed with {} error(s)", report.error_count),
                output.duration,
            )
        };
        Ok(result.with_output(output.combined()).with_details(StageDetails::Validate {
            diagnostics: report.diagnostics,
            error_count: report.error_count,
            warning_count: report.warning_count,
        }))
    }

    #[tracing::instrument(skip_all)]
    fn plan(&self) -> Result<StageResult> {
        let stage = StageName::Plan;
        let timeouts = &self.config.timeouts;
        let plan = self.terraform(&["plan", "-out=tfplan", "-input=false"], timeouts.plan)?;
        if !plan.success() {
            return Ok(command_result(stage, &plan, "terraform plan"));
        }

        let show = self.terraform(&["show", "-json", "tfplan"], timeouts.show)?;
        let duration = plan.duration + show.duration;
        if !show.success() {
            return Ok(StageResult::error(stage, "terraform show -json failed", duration)
                .with_output(show.combined()));
        }

        let document = match serde_json::from_str::<PlanDocument>(&show.stdout) {
            Ok(document) => document,
            Err(err) => {
                debug!(?err, "parse plan JSON");
                return Ok(StageResult::error(stage, "Failed to parse plan JSON", duration)
                    .with_output(show.combined()));
            }
        };

        let planned_resources = document.created_resources();
        let total = planned_resources.values().sum::<u32>();
        info!(total, "plan succeeded");
        Ok(
            StageResult::passed(stage, format!("Plan succeeded with {total} resource(s)"), duration)
                .with_output(plan.combined())
                .with_details(StageDetails::Plan { planned_resources }),
        )
    }

    #[tracing::instrument(skip_all)]
    fn apply(&self) -> Result<StageResult> {
        let output = self.terraform(
            &["apply", "-auto-approve", "-input=false"],
            self.config.timeouts.apply,
        )?;
        Ok(command_result(StageName::Apply, &output, "terraform apply"))
    }

    #[tracing::instrument(skip_all)]
    fn destroy(&self) -> Result<StageResult> {
        let output = self.terraform(
            &["destroy", "-auto-approve", "-input=false"],
            self.config.timeouts.destroy,
        )?;
        Ok(command_result(StageName::Destroy, &output, "terraform destroy"))
    }

    #[tracing::instrument(skip(self))]
    fn run_script(&self, stage: StageName, script: &Path) -> Result<StageResult> {
        let what = match stage {
            StageName::SetupScript => "Setup script",
            StageName::CleanupScript => "Cleanup script",
            _ => "Validation script",
        };
        let Ok(source) = script.canonicalize() else {
            return Ok(StageResult::error(
                stage,
                format!("{what} not found: {}", script.display()),
                Duration::ZERO,
            ));
        };

        let script = match stage {
            StageName::SetupScript => self.stage_script(&source, "setup.sh")?,
            StageName::CleanupScript => self.stage_script(&source, "cleanup.sh")?,
            _ => source,
        };
        let output = self.script(&script, self.config.timeouts.script)?.run()?;
        Ok(command_result(stage, &output, what))
    }
}

/// Classify a finished command as a stage result.
///
/// A nonzero exit or timeout means the stage failed; a missing executable
/// means the harness could not run it at all.
fn command_result(stage: StageName, output: &CommandOutput, what: &str) -> StageResult {
    let duration = output.duration;
    let result = match output.exit {
        Exit::Code(0) => StageResult::passed(stage, format!("{what} succeeded"), duration),
        Exit::Code(code) => {
            let message = match output.summary() {
                Some(summary) => format!("{what} failed: {summary}"),
                None => format!("{what} failed"),
            };
            StageResult::failed(stage, message, duration)
                .with_details(StageDetails::Command { exit_code: code })
        }
        Exit::Signal => StageResult::failed(stage, format!("{what} was killed by a signal"), duration),
        Exit::TimedOut(limit) => StageResult::failed(
            stage,
            format!("{what} timed out after {}s", limit.as_secs()),
            duration,
        ),
        Exit::NotFound => StageResult::error(stage, output.stderr.trim(), duration),
    };
    result.with_output(output.combined())
}

/// The toolchain's `validate -json` report.
#[derive(Debug, Deserialize)]
struct ValidateReport {
    #[serde(default)]
    valid: bool,

    #[serde(default)]
    error_count: u32,

    #[serde(default)]
    warning_count: u32,

    #[serde(default)]
    diagnostics: Vec<Diagnostic>,
}

/// The parts of the toolchain's `show -json <plan>` document we read.
#[derive(Debug, Deserialize)]
struct PlanDocument {
    #[serde(default)]
    resource_changes: Vec<ResourceChange>,
}

#[derive(Debug, Deserialize)]
struct ResourceChange {
    #[serde(rename = "type")]
    kind: String,

    #[serde(default)]
    mode: String,

    #[serde(default)]
    change: Change,
}

#[derive(Debug, Default, Deserialize)]
struct Change {
    #[serde(default)]
    actions: Vec<String>,
}

impl PlanDocument {
    /// Count managed resources the plan would create, by type.
    fn created_resources(&self) -> BTreeMap<String, u32> {
        let mut counts = BTreeMap::new();
        for change in &self.resource_changes {
            if change.mode == "managed" && change.change.actions.iter().any(|action| action == "create") {
                *counts.entry(change.kind.clone()).or_default() += 1;
            }
        }
        counts
    }
}

/// Recursively copy a directory.
fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.with_context(|| format!("walk directory: {from:?}"))?;
        let dest = to.join(entry.path().strip_prefix(from)?);
        if entry.file_type().is_dir() {
            create_dir_all(&dest).with_context(|| format!("create directory: {dest:?}"))?;
        } else {
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copy {:?} to {dest:?}", entry.path()))?;
        }
    }
    Ok(())
}
