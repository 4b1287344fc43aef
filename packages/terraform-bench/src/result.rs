//! Structured results for benchmark evaluations.
//!
//! This module provides types for representing the results of pipeline stages
//! and whole benchmark instances in a way that supports:
//! - Live CLI rendering
//! - JSON serialization for result artifacts
//! - Aggregation across many instances

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    time::Duration,
};

use color_print::cwrite;
use serde::{Deserialize, Serialize};
use serde_plain::{derive_display_from_serialize, derive_fromstr_from_deserialize};

/// Weight applied to a scored stage the weight table does not list.
pub const DEFAULT_WEIGHT: f64 = 0.1;

/// A discrete step of the evaluation pipeline.
///
/// Variants are declared in execution order, so the derived `Ord` is the
/// order in which stages run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Out-of-band provisioning before the toolchain runs.
    SetupScript,

    /// Provider and module bootstrap.
    Init,

    /// Static check of the generated configuration.
    Validate,

    /// Dry-run diff, scored against the expected resource manifest.
    Plan,

    /// Creates the planned resources against the sandbox backend.
    Apply,

    /// Functional verification of the applied resources.
    ValidationScript,

    /// Tears down applied resources.
    Destroy,

    /// Undoes whatever the setup script provisioned.
    CleanupScript,
}

derive_display_from_serialize!(StageName);
derive_fromstr_from_deserialize!(StageName);

impl StageName {
    /// The stages that gate each other: the first one that does not pass
    /// causes every later one in this list to be skipped.
    pub const GATED: [StageName; 6] = [
        StageName::SetupScript,
        StageName::Init,
        StageName::Validate,
        StageName::Plan,
        StageName::Apply,
        StageName::ValidationScript,
    ];

    /// The scoring weight of this stage, or `None` if the stage is
    /// infrastructure plumbing that never contributes to the total score.
    pub fn weight(self) -> Option<f64> {
        match self {
            StageName::SetupScript | StageName::Destroy | StageName::CleanupScript => None,
            StageName::Init => Some(0.1),
            StageName::Validate => Some(0.2),
            StageName::Plan => Some(0.4),
            StageName::Apply => Some(0.2),
            StageName::ValidationScript => Some(DEFAULT_WEIGHT),
        }
    }

    /// The gated stages strictly after this one.
    pub fn gated_after(self) -> impl Iterator<Item = StageName> {
        Self::GATED.into_iter().filter(move |stage| *stage > self)
    }
}

/// Terminal status of one stage attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The tool (or script) succeeded.
    Passed,

    /// The tool ran and reported failure, or ran out of time.
    Failed,

    /// The stage was not run because an earlier stage did not pass.
    Skipped,

    /// The harness could not run the tool or could not read its output.
    Error,
}

derive_display_from_serialize!(StageStatus);
derive_fromstr_from_deserialize!(StageStatus);

impl StageStatus {
    pub fn is_passed(self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn is_skipped(self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// A single diagnostic reported by the toolchain's validator, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: String,

    pub summary: String,

    #[serde(default)]
    pub detail: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<serde_json::Value>,
}

/// Structured, stage-specific details attached to a stage result.
///
/// Serialized without a tag: the owning result's `stage` says which shape
/// to expect, and the artifact keeps a plain `details` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageDetails {
    /// Resource counts extracted from the dry-run.
    Plan {
        planned_resources: BTreeMap<String, u32>,
    },

    /// Output of the toolchain's validator.
    Validate {
        diagnostics: Vec<Diagnostic>,

        #[serde(default)]
        error_count: u32,

        #[serde(default)]
        warning_count: u32,
    },

    /// Exit code of a command that did not succeed.
    Command { exit_code: i32 },

    /// Nothing beyond status and output.
    Empty {},
}

impl Default for StageDetails {
    fn default() -> Self {
        Self::Empty {}
    }
}

impl StageDetails {
    /// The planned resource counts, if these are plan details.
    pub fn planned_resources(&self) -> Option<&BTreeMap<String, u32>> {
        match self {
            Self::Plan { planned_resources } => Some(planned_resources),
            _ => None,
        }
    }

    /// The validator diagnostics, if these are validate details.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Self::Validate { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

/// The outcome of one pipeline stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,

    pub status: StageStatus,

    /// Stage-specific score in `[0.0, 1.0]`.
    pub score: f64,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub duration_seconds: f64,

    /// Combined stdout and stderr of the underlying command.
    #[serde(rename = "output", default, skip_serializing_if = "String::is_empty")]
    pub raw_output: String,

    #[serde(default)]
    pub details: StageDetails,
}

impl StageResult {
    fn new(
        stage: StageName,
        status: StageStatus,
        score: f64,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            stage,
            status,
            score,
            message: message.into(),
            duration_seconds: duration.as_secs_f64(),
            raw_output: String::new(),
            details: StageDetails::default(),
        }
    }

    /// A passing result with full score.
    pub fn passed(stage: StageName, message: impl Into<String>, duration: Duration) -> Self {
        Self::new(stage, StageStatus::Passed, 1.0, message, duration)
    }

    /// A failing result with zero score.
    pub fn failed(stage: StageName, message: impl Into<String>, duration: Duration) -> Self {
        Self::new(stage, StageStatus::Failed, 0.0, message, duration)
    }

    /// A harness or tooling error with zero score.
    pub fn error(stage: StageName, message: impl Into<String>, duration: Duration) -> Self {
        Self::new(stage, StageStatus::Error, 0.0, message, duration)
    }

    /// A stage that did not run.
    pub fn skipped(stage: StageName, message: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Skipped, 0.0, message, Duration::ZERO)
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.raw_output = output.into();
        self
    }

    pub fn with_details(mut self, details: StageDetails) -> Self {
        self.details = details;
        self
    }

    /// Replace the score and message while keeping the status.
    ///
    /// This is how the plan stage receives its partial credit: a dry-run that
    /// succeeds stays `passed` even when its resource counts score low.
    pub fn scored(self, score: f64, message: impl Into<String>) -> Self {
        Self {
            score,
            message: message.into(),
            ..self
        }
    }
}

impl Display for StageResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let stage = self.stage.to_string();
        let message = &self.message;
        match self.status {
            StageStatus::Passed => cwrite!(f, "<green>✓</> {stage}")?,
            StageStatus::Failed => cwrite!(f, "<red>✗</> {stage}")?,
            StageStatus::Error => cwrite!(f, "<red,bold>!</> {stage}")?,
            StageStatus::Skipped => return cwrite!(f, "<dim>- {stage}: {message}</>"),
        }
        if self.duration_seconds > 0.0 {
            cwrite!(f, " <dim>({:.1}s)</>", self.duration_seconds)?;
        }
        if self.score < 1.0 {
            cwrite!(f, " <yellow>score={:.2}</>", self.score)?;
        }
        if !message.is_empty() {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// The result of evaluating one benchmark instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceResult {
    pub instance_id: String,

    #[serde(default)]
    pub model: String,

    /// Weighted score over the scored stages; see [`InstanceResult::compute_total_score`].
    #[serde(default)]
    pub total_score: f64,

    /// Every stage attempt, in execution order.
    #[serde(default)]
    pub stages: Vec<StageResult>,

    #[serde(default)]
    pub generated_files: BTreeMap<String, String>,

    #[serde(default)]
    pub error: Option<String>,

    /// The prompt the model was given, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl InstanceResult {
    /// Create an empty result for the given instance.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    /// Create a result for an instance that failed before any stage ran.
    pub fn failed(instance_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Find the result for the given stage, if it was recorded.
    pub fn stage(&self, stage: StageName) -> Option<&StageResult> {
        self.stages.iter().find(|result| result.stage == stage)
    }

    /// Compute (and store) the weighted total score.
    ///
    /// Skipped stages and unscored stages are left out of both the weighted
    /// sum and the total weight, so stages that never ran renormalize the
    /// weights of those that did. With no scored stage the total is `0.0`.
    pub fn compute_total_score(&mut self) -> f64 {
        let (sum, weight) = self
            .stages
            .iter()
            .filter(|result| !result.status.is_skipped())
            .filter_map(|result| result.stage.weight().map(|w| (result.score, w)))
            .fold((0.0, 0.0), |(sum, total), (score, w)| {
                (sum + score * w, total + w)
            });

        self.total_score = if weight > 0.0 { sum / weight } else { 0.0 };
        self.total_score
    }
}

impl Display for InstanceResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let id = &self.instance_id;
        let score = self.total_score;
        match &self.error {
            Some(error) => cwrite!(f, "<red>✗</> <bold>{id}</> score={score:.2}: {error}"),
            None if score >= 1.0 => cwrite!(f, "<green>✓</> <bold>{id}</> score={score:.2}"),
            None => cwrite!(f, "<yellow>~</> <bold>{id}</> score={score:.2}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    use super::*;

    fn result(stages: Vec<StageResult>) -> InstanceResult {
        InstanceResult {
            stages,
            ..InstanceResult::new("terraform-aws-test-001")
        }
    }

    #[test]
    fn destroy_only_scores_zero() {
        let mut result = result(vec![StageResult::passed(
            StageName::Destroy,
            "destroyed",
            Duration::ZERO,
        )]);
        pretty_assert_eq!(result.compute_total_score(), 0.0);
    }

    #[test]
    fn empty_scores_zero() {
        pretty_assert_eq!(result(vec![]).compute_total_score(), 0.0);
    }

    #[test]
    fn skipped_stages_renormalize() {
        let mut result = result(vec![
            StageResult::passed(StageName::Init, "", Duration::ZERO),
            StageResult::passed(StageName::Validate, "", Duration::ZERO),
            StageResult::passed(StageName::Plan, "", Duration::ZERO).scored(0.5, "partial"),
            StageResult::skipped(StageName::Apply, "not requested"),
        ]);

        // (0.1 * 1.0 + 0.2 * 1.0 + 0.4 * 0.5) / 0.7
        let expected = 0.5 / 0.7;
        assert!((result.compute_total_score() - expected).abs() < 1e-12);
    }

    #[test]
    fn failed_init_scores_zero() {
        let mut result = result(vec![
            StageResult::failed(StageName::Init, "init failed", Duration::ZERO),
            StageResult::skipped(StageName::Validate, ""),
            StageResult::skipped(StageName::Plan, ""),
        ]);
        pretty_assert_eq!(result.compute_total_score(), 0.0);
    }

    #[test]
    fn unscored_stages_do_not_dilute() {
        let mut result = result(vec![
            StageResult::passed(StageName::SetupScript, "", Duration::ZERO),
            StageResult::passed(StageName::Init, "", Duration::ZERO),
            StageResult::failed(StageName::Destroy, "", Duration::ZERO),
            StageResult::failed(StageName::CleanupScript, "", Duration::ZERO),
        ]);
        pretty_assert_eq!(result.compute_total_score(), 1.0);
    }

    #[test]
    fn scored_keeps_status() {
        let plan = StageResult::passed(StageName::Plan, "ok", Duration::ZERO).scored(0.0, "bad");
        pretty_assert_eq!(plan.status, StageStatus::Passed);
        pretty_assert_eq!(plan.score, 0.0);
        pretty_assert_eq!(plan.message, "bad");
    }

    #[test_case(StageName::SetupScript, vec![StageName::Init, StageName::Validate, StageName::Plan, StageName::Apply, StageName::ValidationScript]; "setup")]
    #[test_case(StageName::Plan, vec![StageName::Apply, StageName::ValidationScript]; "plan")]
    #[test_case(StageName::ValidationScript, vec![]; "last")]
    #[test]
    fn gated_after(stage: StageName, expected: Vec<StageName>) {
        pretty_assert_eq!(stage.gated_after().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn stage_names_serialize_snake_case() {
        pretty_assert_eq!(StageName::ValidationScript.to_string(), "validation_script");
        pretty_assert_eq!(
            "cleanup_script".parse::<StageName>().ok(),
            Some(StageName::CleanupScript)
        );
    }

    #[test]
    fn details_serialize_untagged() {
        let plan = StageResult::passed(StageName::Plan, "", Duration::ZERO).with_details(
            StageDetails::Plan {
                planned_resources: BTreeMap::from([("aws_s3_bucket".to_string(), 2)]),
            },
        );
        let json = serde_json::to_value(&plan).expect("serialize");
        pretty_assert_eq!(
            json["details"],
            serde_json::json!({ "planned_resources": { "aws_s3_bucket": 2 } })
        );
        assert!(json.get("output").is_none(), "empty output is omitted");

        let back = serde_json::from_value::<StageResult>(json).expect("deserialize");
        pretty_assert_eq!(back, plan);
    }

    #[test]
    fn empty_details_round_trip() {
        let json = serde_json::json!({
            "stage": "init",
            "status": "passed",
            "score": 1.0,
            "details": {}
        });
        let result = serde_json::from_value::<StageResult>(json).expect("deserialize");
        pretty_assert_eq!(result.details, StageDetails::Empty {});
    }
}
