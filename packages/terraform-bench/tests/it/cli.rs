//! CLI subcommand smoke tests.

use pretty_assertions::assert_eq as pretty_assert_eq;

use crate::{dataset, run_bench};

#[test]
fn test_list_shows_every_instance() {
    let dataset = dataset();
    let (exit_code, stdout, _stderr) = run_bench(&["list", &dataset.to_string_lossy()]);

    pretty_assert_eq!(exit_code, 0, "list should exit 0");
    for id in ["terraform-aws-s3-001", "terraform-aws-vpc-001", "terraform-aws-lambda-001"] {
        assert!(stdout.contains(id), "list should show {id}, got: {stdout}");
    }
    assert!(stdout.contains("3 instance(s)"), "got: {stdout}");
}

#[test]
fn test_list_filters() {
    let dataset = dataset();
    let (exit_code, stdout, _stderr) = run_bench(&[
        "list",
        &dataset.to_string_lossy(),
        "--difficulty",
        "hard",
    ]);

    pretty_assert_eq!(exit_code, 0, "list should exit 0");
    assert!(stdout.contains("terraform-aws-lambda-001 [hard, aws/us-east-1] lambda, iam"), "got: {stdout}");
    assert!(!stdout.contains("terraform-aws-s3-001"), "got: {stdout}");
    assert!(stdout.contains("1 instance(s)"), "got: {stdout}");
}

#[test]
fn test_list_missing_dataset() {
    let (exit_code, _stdout, stderr) = run_bench(&["list", "does-not-exist.jsonl"]);

    assert!(exit_code != 0, "list should fail for a missing dataset");
    assert!(stderr.contains("read dataset"), "got: {stderr}");
}

#[cfg(unix)]
#[test]
fn test_run_then_report() {
    use indoc::indoc;

    use crate::executable;

    let dir = tempfile::tempdir().expect("tempdir");
    let agent = dir.path().join("fake-agent");
    executable(
        &agent,
        indoc! {r#"
            #!/bin/sh
            cat > /dev/null
            echo 'resource "aws_s3_bucket" "b" {}'
            echo '# --- filename: versioning.tf ---'
            echo 'resource "aws_s3_bucket_versioning" "v" {}'
        "#},
    );
    let terraform = dir.path().join("terraform");
    executable(
        &terraform,
        indoc! {r#"
            #!/bin/sh
            case "$1" in
            validate) echo '{"valid": true, "error_count": 0, "warning_count": 0, "diagnostics": []}' ;;
            show) echo '{"resource_changes": [
                {"type": "aws_s3_bucket", "mode": "managed", "change": {"actions": ["create"]}},
                {"type": "aws_s3_bucket_versioning", "mode": "managed", "change": {"actions": ["create"]}}
            ]}' ;;
            esac
        "#},
    );
    let output = dir.path().join("output");
    let dataset = dataset();

    let (exit_code, stdout, stderr) = run_bench(&[
        "run",
        &dataset.to_string_lossy(),
        "--instance-id",
        "terraform-aws-s3-001",
        "--agent",
        &format!("command:{}", agent.display()),
        "--terraform-binary",
        &terraform.to_string_lossy(),
        "--output-dir",
        &output.to_string_lossy(),
    ]);
    pretty_assert_eq!(exit_code, 0, "run should exit 0, stderr: {stderr}");
    assert!(stdout.contains("Benchmark complete."), "got: {stdout}");

    let instance_dir = output.join("terraform-aws-s3-001");
    assert!(instance_dir.join("main.tf").exists());
    assert!(instance_dir.join("versioning.tf").exists());
    assert!(instance_dir.join("result.json").exists());

    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(output.join("report.json")).expect("read report"),
    )
    .expect("parse report");
    pretty_assert_eq!(report["model"], serde_json::json!("fake-agent"));
    pretty_assert_eq!(report["num_instances"], serde_json::json!(1));
    pretty_assert_eq!(report["mean_score"], serde_json::json!(1.0));
    pretty_assert_eq!(report["stage_pass_rates"]["plan"], serde_json::json!(1.0));

    let (exit_code, stdout, _stderr) = run_bench(&[
        "report",
        "--input",
        &output.join("report.json").to_string_lossy(),
        "--format",
        "csv",
    ]);
    pretty_assert_eq!(exit_code, 0, "report should exit 0");
    assert!(
        stdout.contains("terraform-aws-s3-001,fake-agent,1.0000,,passed,passed,passed"),
        "got: {stdout}"
    );
}
