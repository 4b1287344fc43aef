//! The shared cloud emulator backend.
//!
//! An [`Emulator`] is one emulator container attached to one container
//! network. Every toolchain command and script for every instance runs in an
//! ephemeral container on that network, so many instances can evaluate
//! against the same emulator concurrently. The emulator is not locked:
//! instances are isolated only by their own working directories and state
//! files.

use std::{thread, time::Duration};

use color_eyre::{
    Result, Section, SectionExt,
    eyre::{bail, eyre},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::EmulatorConfig,
    sandbox::process::{CommandOutput, Invocation},
};

/// Time limit for the short `docker` housekeeping commands.
const DOCKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Time limit for pulling and starting the emulator image.
const START_TIMEOUT: Duration = Duration::from_secs(120);

/// A running emulator, ready to accept requests.
///
/// Created by [`Emulator::start`] and released exactly once by
/// [`Emulator::stop`]; sandboxes only ever borrow it.
#[derive(Debug)]
pub struct Emulator {
    config: EmulatorConfig,
    network: String,
    container_id: String,
    container_name: String,

    /// Whether this handle started the container (as opposed to reusing one
    /// that was already running).
    started: bool,
}

impl Emulator {
    /// Create a network, start (or reuse) the emulator container on it, and
    /// wait until the emulator reports healthy.
    #[tracing::instrument(skip_all, fields(image = %config.image))]
    pub fn start(config: &EmulatorConfig) -> Result<Self> {
        let network = format!("terraform-bench-{}", &Uuid::new_v4().simple().to_string()[..8]);
        docker(["network", "create", network.as_str()], DOCKER_TIMEOUT)?;
        info!(%network, "created network");

        let emulator = match find_running(&config.image) {
            Some((container_id, container_name)) => {
                info!(%container_id, %container_name, "reusing running emulator");
                let emulator = Self {
                    config: config.clone(),
                    network,
                    container_id,
                    container_name,
                    started: false,
                };
                if let Err(err) = docker(
                    ["network", "connect", emulator.network.as_str(), emulator.container_id.as_str()],
                    DOCKER_TIMEOUT,
                ) {
                    if !format!("{err:?}").contains("already exists") {
                        emulator.stop();
                        return Err(err);
                    }
                }
                emulator
            }
            None => {
                let container_name = format!("localstack-{}", &Uuid::new_v4().simple().to_string()[..8]);
                let port = config.port.to_string();
                let output = docker(
                    [
                        "run",
                        "-d",
                        "--name",
                        container_name.as_str(),
                        "--network",
                        network.as_str(),
                        "-v",
                        "/var/run/docker.sock:/var/run/docker.sock",
                        "-e",
                        format!("SERVICES={}", config.services).as_str(),
                        "-e",
                        "LAMBDA_EXECUTOR=docker",
                        "-e",
                        "DOCKER_HOST=unix:///var/run/docker.sock",
                        "-p",
                        format!("{port}:{port}").as_str(),
                        config.image.as_str(),
                    ],
                    START_TIMEOUT,
                );
                let output = match output {
                    Ok(output) => output,
                    Err(err) => {
                        remove_network(&network);
                        return Err(err);
                    }
                };
                let container_id = output.stdout.trim().to_string();
                info!(%container_id, %container_name, "started emulator");
                Self {
                    config: config.clone(),
                    network,
                    container_id,
                    container_name,
                    started: true,
                }
            }
        };

        if let Err(err) = emulator.wait_until_healthy() {
            emulator.stop();
            return Err(err);
        }
        Ok(emulator)
    }

    /// The network every sandbox container joins.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// The emulator's address as seen from containers on its network.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.container_name, self.config.port)
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// A handle to an emulator that is assumed to be running already.
    #[cfg(test)]
    pub(crate) fn attached(config: EmulatorConfig, network: &str, container_name: &str) -> Self {
        Self {
            config,
            network: network.to_string(),
            container_id: container_name.to_string(),
            container_name: container_name.to_string(),
            started: false,
        }
    }

    /// Poll the emulator's health endpoint until it reports ready.
    fn wait_until_healthy(&self) -> Result<()> {
        let url = format!("http://localhost:{}/_localstack/health", self.config.port);
        let retries = self.config.health_retries;
        info!(%url, retries, "waiting for emulator");

        for attempt in 1..=retries {
            let probe = Invocation::builder()
                .program("docker")
                .args(
                    ["exec", self.container_id.as_str(), "curl", "-s", url.as_str()]
                        .map(String::from)
                        .to_vec(),
                )
                .timeout(Duration::from_secs(5))
                .build()
                .run()?;

            if probe.success() && is_healthy(&probe.stdout) {
                info!(attempt, "emulator is ready");
                return Ok(());
            }
            debug!(attempt, response = %probe.stdout.chars().take(200).collect::<String>(), "emulator not ready");
            if attempt % 5 == 1 {
                info!("waiting for emulator ({attempt}/{retries})");
            }
            thread::sleep(self.config.health_interval);
        }

        bail!("emulator did not become healthy after {retries} attempts")
    }

    /// Release the emulator and its network.
    ///
    /// Best-effort: failures are logged, never returned.
    #[tracing::instrument(skip_all, fields(network = %self.network))]
    pub fn stop(self) {
        if self.started {
            for args in [
                ["stop", self.container_id.as_str()],
                ["rm", self.container_id.as_str()],
            ] {
                if let Err(err) = docker(args, Duration::from_secs(60)) {
                    warn!(?err, "clean up emulator container");
                }
            }
        } else if let Err(err) = docker(
            ["network", "disconnect", self.network.as_str(), self.container_id.as_str()],
            DOCKER_TIMEOUT,
        ) {
            warn!(?err, "disconnect reused emulator");
        }
        remove_network(&self.network);
        info!("released emulator");
    }
}

/// Whether a health endpoint response reports the emulator as usable.
fn is_healthy(body: &str) -> bool {
    body.contains("running") || body.contains("available")
}

fn remove_network(network: &str) {
    if let Err(err) = docker(["network", "rm", network], DOCKER_TIMEOUT) {
        warn!(?err, %network, "remove network");
    }
}

/// Find a running container of the given image, as `(id, name)`.
fn find_running(image: &str) -> Option<(String, String)> {
    let ancestor = format!("ancestor={image}");
    let output = docker(
        [
            "ps",
            "--filter",
            ancestor.as_str(),
            "--filter",
            "status=running",
            "--format",
            "{{.ID}}\t{{.Names}}",
        ],
        DOCKER_TIMEOUT,
    )
    .ok()?;

    output
        .stdout
        .lines()
        .next()?
        .split_once('\t')
        .map(|(id, name)| (id.trim().to_string(), name.trim().to_string()))
}

/// Run a `docker` command, failing unless it exits successfully.
fn docker<'a>(args: impl IntoIterator<Item = &'a str>, timeout: Duration) -> Result<CommandOutput> {
    let invocation = Invocation::builder()
        .program("docker")
        .args(args.into_iter().map(String::from).collect())
        .timeout(timeout)
        .build();
    let output = invocation.run()?;
    if output.success() {
        Ok(output)
    } else {
        Err(eyre!("run {invocation}"))
            .section(output.stdout.header("Stdout:"))
            .section(output.stderr.header("Stderr:"))
    }
}
