//! Configuration for the evaluation pipeline and its sandbox backend.
//!
//! Configuration can be built in code (every struct has a builder with the
//! defaults below) or loaded from a TOML file, e.g.:
//! ```toml
//! run_apply = true
//! run_validation = true
//!
//! [timeouts]
//! apply = 900
//!
//! [backend]
//! type = "docker"
//! image = "localstack/localstack:3.0"
//! ```
//! Durations are given in whole seconds.

use std::{fs::read_to_string, path::Path, time::Duration};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};

/// Configuration for evaluating a single instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
#[non_exhaustive]
pub struct EvalConfig {
    /// Actually deploy the plan against the sandbox backend.
    #[builder(default)]
    pub run_apply: bool,

    /// Tear down applied resources afterwards.
    #[builder(default = true)]
    pub run_destroy: bool,

    /// Run the instance's validation script against the deployed resources.
    #[builder(default)]
    pub run_validation: bool,

    /// Per-stage time limits.
    #[builder(default)]
    pub timeouts: Timeouts,

    /// Where toolchain commands and scripts execute.
    #[builder(default)]
    pub backend: Backend,

    /// The toolchain executable used by the host backend.
    #[builder(into, default = String::from("terraform"))]
    pub terraform_binary: String,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EvalConfig {
    /// Load configuration from a TOML file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = read_to_string(path).with_context(|| format!("read config file: {path:?}"))?;
        toml::from_str(&content).with_context(|| format!("parse config file: {path:?}"))
    }
}

/// Time limits for each external command the pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
#[non_exhaustive]
pub struct Timeouts {
    #[serde(with = "seconds")]
    #[builder(default = Duration::from_secs(120))]
    pub init: Duration,

    #[serde(with = "seconds")]
    #[builder(default = Duration::from_secs(60))]
    pub validate: Duration,

    #[serde(with = "seconds")]
    #[builder(default = Duration::from_secs(300))]
    pub plan: Duration,

    /// Rendering the saved plan as JSON.
    #[serde(with = "seconds")]
    #[builder(default = Duration::from_secs(60))]
    pub show: Duration,

    #[serde(with = "seconds")]
    #[builder(default = Duration::from_secs(600))]
    pub apply: Duration,

    #[serde(with = "seconds")]
    #[builder(default = Duration::from_secs(600))]
    pub destroy: Duration,

    /// Setup, validation and cleanup scripts.
    #[serde(with = "seconds")]
    #[builder(default = Duration::from_secs(300))]
    pub script: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Where toolchain commands and scripts execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backend {
    /// Run the toolchain directly on this machine.
    Host {
        /// Emulator endpoint to point the cloud provider at, if any.
        #[serde(default)]
        endpoint: Option<String>,
    },

    /// Run each command in an ephemeral container on a network shared with
    /// an emulator container.
    Docker(EmulatorConfig),
}

impl Default for Backend {
    fn default() -> Self {
        Self::Host { endpoint: None }
    }
}

/// Images and health-check settings for the containerized backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
#[non_exhaustive]
pub struct EmulatorConfig {
    /// The cloud emulator image.
    #[builder(into, default = String::from("localstack/localstack:latest"))]
    pub image: String,

    /// Image providing the toolchain executable.
    #[builder(into, default = String::from("hashicorp/terraform:latest"))]
    pub toolchain_image: String,

    /// Image used for Python validation scripts.
    #[builder(into, default = String::from("python:3.11-slim"))]
    pub python_image: String,

    /// Image used for shell scripts; must provide `apk`.
    #[builder(into, default = String::from("golang:alpine"))]
    pub shell_image: String,

    /// Emulated services to enable.
    #[builder(into, default = String::from("s3,ec2,lambda,iam,dynamodb,rds,ecs,cloudfront,route53"))]
    pub services: String,

    /// Port the emulator listens on inside its container.
    #[builder(default = 4566)]
    pub port: u16,

    /// How many times to poll the health endpoint before giving up.
    #[builder(default = 60)]
    pub health_retries: u32,

    #[serde(with = "seconds")]
    #[builder(default = Duration::from_secs(2))]
    pub health_interval: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Serialize durations as whole seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;

    #[test]
    fn defaults_are_plan_only() {
        let config = EvalConfig::default();
        assert!(!config.run_apply);
        assert!(config.run_destroy);
        assert!(!config.run_validation);
        pretty_assert_eq!(config.timeouts.init, Duration::from_secs(120));
        pretty_assert_eq!(config.backend, Backend::Host { endpoint: None });
        pretty_assert_eq!(config.terraform_binary, "terraform");
    }

    #[test]
    fn parses_partial_toml() {
        let config = toml::from_str::<EvalConfig>(indoc! {r#"
            run_apply = true

            [timeouts]
            apply = 900

            [backend]
            type = "docker"
            image = "localstack/localstack:3.0"
        "#})
        .expect("parse config");

        assert!(config.run_apply);
        assert!(config.run_destroy);
        pretty_assert_eq!(config.timeouts.apply, Duration::from_secs(900));
        pretty_assert_eq!(config.timeouts.plan, Duration::from_secs(300));
        let Backend::Docker(emulator) = config.backend else {
            panic!("expected docker backend");
        };
        pretty_assert_eq!(emulator.image, "localstack/localstack:3.0");
        pretty_assert_eq!(emulator.toolchain_image, "hashicorp/terraform:latest");
        pretty_assert_eq!(emulator.health_interval, Duration::from_secs(2));
    }

    #[test]
    fn parses_host_endpoint() {
        let config = toml::from_str::<EvalConfig>(indoc! {r#"
            [backend]
            type = "host"
            endpoint = "http://localhost:4566"
        "#})
        .expect("parse config");

        pretty_assert_eq!(
            config.backend,
            Backend::Host {
                endpoint: Some(String::from("http://localhost:4566"))
            }
        );
    }
}
