//! Aggregating and displaying benchmark results.

use std::{collections::BTreeMap, io::Write, path::Path};

use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    ext::indent,
    result::{InstanceResult, StageName, StageStatus},
};

/// Score at or above which an instance counts as passed in summaries.
pub const PASS_THRESHOLD: f64 = 0.8;

/// Results of one benchmark run across many instances.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchmarkReport {
    pub model: String,

    /// Seconds since the Unix epoch when the report was created.
    pub generated_at: String,

    pub results: Vec<InstanceResult>,
}

impl BenchmarkReport {
    pub fn new(model: impl Into<String>, results: Vec<InstanceResult>) -> Self {
        Self {
            model: model.into(),
            generated_at: unix_now(),
            results,
        }
    }

    /// Mean total score over all instances; `0.0` for an empty report.
    pub fn mean_score(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().map(|r| r.total_score).sum::<f64>() / self.results.len() as f64
    }

    /// For each stage, the fraction of its non-skipped attempts that passed.
    ///
    /// Stages that never ran (or were always skipped) are absent.
    pub fn stage_pass_rates(&self) -> BTreeMap<StageName, f64> {
        let mut counts = BTreeMap::<StageName, (usize, usize)>::new();
        for stage in self.results.iter().flat_map(|r| &r.stages) {
            if stage.status.is_skipped() {
                continue;
            }
            let (passed, total) = counts.entry(stage.stage).or_default();
            *total += 1;
            if stage.status.is_passed() {
                *passed += 1;
            }
        }
        counts
            .into_iter()
            .map(|(stage, (passed, total))| (stage, passed as f64 / total as f64))
            .collect()
    }

    /// The instances scoring at least `threshold`.
    pub fn passed(&self, threshold: f64) -> usize {
        self.results
            .iter()
            .filter(|r| r.total_score >= threshold)
            .count()
    }

    /// Order results by instance id; parallel runs finish in any order.
    pub fn sort_by_instance_id(&mut self) {
        self.results
            .sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    }

    /// Load a report from JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read report: {}", path.display()))?;

        serde_json::from_str(&content).wrap_err("Failed to parse report JSON")
    }

    /// Save report to JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .wrap_err_with(|| format!("Failed to write report: {}", path.display()))
    }

    /// Print report as markdown.
    pub fn print_markdown<W: Write>(&self, mut w: W) -> Result<()> {
        writeln!(w, "# Terraform Benchmark Results")?;
        writeln!(w)?;
        writeln!(w, "Model: {}", self.model)?;
        writeln!(w, "Generated: {}", self.generated_at)?;
        writeln!(w)?;

        let total = self.results.len();
        let passed = self.passed(PASS_THRESHOLD);
        writeln!(w, "| Instances | Mean score | Passed (score >= {PASS_THRESHOLD}) |")?;
        writeln!(w, "|-----------|------------|------------------|")?;
        writeln!(
            w,
            "| {total} | {:.2} | {passed}/{total} ({:.0}%) |",
            self.mean_score(),
            percentage(passed, total)
        )?;
        writeln!(w)?;

        writeln!(w, "## Stage pass rates")?;
        writeln!(w)?;
        writeln!(w, "| Stage | Pass rate |")?;
        writeln!(w, "|-------|-----------|")?;
        for (stage, rate) in self.stage_pass_rates() {
            writeln!(w, "| {stage} | {:.0}% |", rate * 100.0)?;
        }
        writeln!(w)?;

        writeln!(w, "## Instances")?;
        writeln!(w)?;
        writeln!(w, "| Instance | Score | Stages | Error |")?;
        writeln!(w, "|----------|-------|--------|-------|")?;
        for result in &self.results {
            let stages = result
                .stages
                .iter()
                .map(|stage| format!("{} {}", status_icon(stage.status), stage.stage))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                w,
                "| {} | {:.2} | {} | {} |",
                result.instance_id,
                result.total_score,
                stages,
                result.error.as_deref().unwrap_or("").replace('|', "\\|")
            )?;
        }

        let failures = self
            .results
            .iter()
            .flat_map(|result| result.stages.iter().map(move |stage| (result, stage)))
            .filter(|(_, stage)| matches!(stage.status, StageStatus::Failed | StageStatus::Error))
            .collect::<Vec<_>>();
        if !failures.is_empty() {
            writeln!(w)?;
            writeln!(w, "## Failures")?;
            for (result, stage) in failures {
                writeln!(w)?;
                writeln!(w, "- **{}** `{}`: {}", result.instance_id, stage.stage, stage.message)?;
                for diagnostic in stage.details.diagnostics() {
                    let text = format!("{}: {}\n{}", diagnostic.severity, diagnostic.summary, diagnostic.detail);
                    write!(w, "{}", text.trim_end().indent(4))?;
                    writeln!(w)?;
                }
            }
        }

        Ok(())
    }

    /// Print report as CSV, one row per instance.
    pub fn print_csv<W: Write>(&self, mut w: W) -> Result<()> {
        let stages = StageName::GATED
            .iter()
            .chain(&[StageName::Destroy, StageName::CleanupScript])
            .copied()
            .collect::<Vec<_>>();

        write!(w, "instance_id,model,total_score")?;
        for stage in &stages {
            write!(w, ",{stage}")?;
        }
        writeln!(w, ",error")?;

        for result in &self.results {
            write!(
                w,
                "{},{},{:.4}",
                csv_field(&result.instance_id),
                csv_field(&result.model),
                result.total_score
            )?;
            for stage in &stages {
                match result.stage(*stage) {
                    Some(outcome) => write!(w, ",{}", outcome.status)?,
                    None => write!(w, ",")?,
                }
            }
            writeln!(w, ",{}", csv_field(result.error.as_deref().unwrap_or("")))?;
        }

        Ok(())
    }

    /// Print ASCII bar chart of stage pass rates.
    pub fn print_chart<W: Write>(&self, mut w: W) -> Result<()> {
        writeln!(w, "\nPass rate by stage ({})\n", shorten_model_name(&self.model))?;

        for (stage, rate) in self.stage_pass_rates() {
            let pct = (rate * 100.0).round() as i32;
            let bar_len = (rate * 30.0).round() as usize;
            let bar = "█".repeat(bar_len);
            let empty = "░".repeat(30 - bar_len);

            writeln!(w, "  {:<18} {}{} {:>3}%", stage.to_string(), bar, empty, pct)?;
        }
        writeln!(w)?;

        Ok(())
    }
}

/// The report as written to disk, with the aggregates alongside the results.
#[derive(Serialize)]
struct ArtifactRef<'a> {
    model: &'a str,
    generated_at: &'a str,
    mean_score: f64,
    stage_pass_rates: BTreeMap<StageName, f64>,
    num_instances: usize,
    results: &'a [InstanceResult],
}

/// The parts of a report artifact that are read back; aggregates are
/// recomputed from the results.
#[derive(Deserialize)]
struct Artifact {
    #[serde(default)]
    model: String,

    #[serde(default)]
    generated_at: String,

    #[serde(default)]
    results: Vec<InstanceResult>,
}

impl Serialize for BenchmarkReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ArtifactRef {
            model: &self.model,
            generated_at: &self.generated_at,
            mean_score: self.mean_score(),
            stage_pass_rates: self.stage_pass_rates(),
            num_instances: self.results.len(),
            results: &self.results,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BenchmarkReport {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let artifact = Artifact::deserialize(deserializer)?;
        Ok(Self {
            model: artifact.model,
            generated_at: artifact.generated_at,
            results: artifact.results,
        })
    }
}

fn status_icon(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Passed => "✓",
        StageStatus::Failed => "✗",
        StageStatus::Skipped => "-",
        StageStatus::Error => "!",
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Quote a CSV field if it needs it.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Shorten model name for display.
fn shorten_model_name(model: &str) -> &str {
    if model.contains("opus") {
        "opus"
    } else if model.contains("sonnet") {
        "sonnet"
    } else if model.contains("haiku") {
        "haiku"
    } else {
        model
    }
}

/// Simple timestamp without a date-time dependency.
fn unix_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!("{}", duration.as_secs())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;
    use crate::result::{Diagnostic, StageDetails, StageResult};

    fn report() -> BenchmarkReport {
        let mut passing = InstanceResult {
            model: String::from("sonnet"),
            stages: vec![
                StageResult::passed(StageName::Init, "ok", Duration::from_secs(1)),
                StageResult::passed(StageName::Validate, "ok", Duration::ZERO),
                StageResult::passed(StageName::Plan, "ok", Duration::ZERO),
            ],
            ..InstanceResult::new("terraform-aws-s3-001")
        };
        passing.compute_total_score();

        let diagnostic = Diagnostic {
            severity: String::from("error"),
            summary: String::from("Unsupported argument"),
            detail: String::from("An argument named \"foo\" is not expected here."),
            range: None,
            snippet: None,
        };
        let mut failing = InstanceResult {
            model: String::from("sonnet"),
            stages: vec![
                StageResult::passed(StageName::Init, "ok", Duration::ZERO),
                StageResult::failed(StageName::Validate, "Validation failed with 1 error(s)", Duration::ZERO)
                    .with_details(StageDetails::Validate {
                        diagnostics: vec![diagnostic],
                        error_count: 1,
                        warning_count: 0,
                    }),
                StageResult::skipped(StageName::Plan, "Skipped due to previous stage failure"),
            ],
            ..InstanceResult::new("terraform-aws-lambda-001")
        };
        failing.compute_total_score();

        let errored = InstanceResult {
            model: String::from("sonnet"),
            ..InstanceResult::failed("terraform-aws-vpc-001", "Generation failed: timeout, again")
        };

        BenchmarkReport::new("sonnet", vec![passing, failing, errored])
    }

    #[test]
    fn aggregates() {
        let report = report();
        // (1.0 + 1/3 + 0.0) / 3
        assert!((report.mean_score() - 4.0 / 9.0).abs() < 1e-12, "got {}", report.mean_score());
        pretty_assert_eq!(report.passed(PASS_THRESHOLD), 1);
        pretty_assert_eq!(
            report.stage_pass_rates(),
            BTreeMap::from([
                (StageName::Init, 1.0),
                (StageName::Validate, 0.5),
                (StageName::Plan, 1.0),
            ])
        );
    }

    #[test]
    fn empty_report() {
        let report = BenchmarkReport::new("sonnet", vec![]);
        pretty_assert_eq!(report.mean_score(), 0.0);
        assert!(report.stage_pass_rates().is_empty());
    }

    #[test]
    fn sorts_by_instance_id() {
        let mut report = report();
        report.sort_by_instance_id();
        pretty_assert_eq!(
            report.results.iter().map(|r| r.instance_id.as_str()).collect::<Vec<_>>(),
            vec!["terraform-aws-lambda-001", "terraform-aws-s3-001", "terraform-aws-vpc-001"]
        );
    }

    #[test]
    fn artifact_carries_aggregates_and_round_trips() {
        let report = report();
        let json = serde_json::to_value(&report).expect("serialize");
        pretty_assert_eq!(json["num_instances"], serde_json::json!(3));
        pretty_assert_eq!(json["stage_pass_rates"]["validate"], serde_json::json!(0.5));
        pretty_assert_eq!(
            json["results"][1]["stages"][1]["details"]["diagnostics"][0]["summary"],
            serde_json::json!("Unsupported argument")
        );

        let back = serde_json::from_value::<BenchmarkReport>(json).expect("deserialize");
        pretty_assert_eq!(back, report);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/report.json");
        let report = report();
        report.save(&path).expect("save");
        pretty_assert_eq!(BenchmarkReport::load(&path).expect("load"), report);
    }

    #[test]
    fn markdown_lists_failures_with_diagnostics() {
        let mut out = Vec::new();
        report().print_markdown(&mut out).expect("print");
        let markdown = String::from_utf8(out).expect("utf8");

        assert!(markdown.contains("| 3 | 0.44 | 1/3 (33%) |"), "{markdown}");
        assert!(markdown.contains("| validate | 50% |"), "{markdown}");
        assert!(markdown.contains("- **terraform-aws-lambda-001** `validate`: Validation failed with 1 error(s)"));
        assert!(markdown.contains("    error: Unsupported argument\n    An argument named \"foo\" is not expected here."));
    }

    #[test]
    fn csv_rows() {
        let mut out = Vec::new();
        report().print_csv(&mut out).expect("print");
        let csv = String::from_utf8(out).expect("utf8");
        let lines = csv.lines().collect::<Vec<_>>();

        pretty_assert_eq!(
            lines[0],
            "instance_id,model,total_score,setup_script,init,validate,plan,apply,validation_script,destroy,cleanup_script,error"
        );
        pretty_assert_eq!(
            lines[1],
            "terraform-aws-s3-001,sonnet,1.0000,,passed,passed,passed,,,,,"
        );
        pretty_assert_eq!(
            lines[3],
            "terraform-aws-vpc-001,sonnet,0.0000,,,,,,,,,\"Generation failed: timeout, again\""
        );
    }
}
