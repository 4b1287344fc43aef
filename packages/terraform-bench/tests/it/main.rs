//! End-to-end tests for the `terraform-bench` command line.
//!
//! These run the real binary through `cargo run` against the fixture dataset,
//! with fake agent and toolchain executables standing in for the model and
//! for terraform.

mod cli;

use std::path::{Path, PathBuf};

use xshell::{Shell, cmd};

/// Path to the fixture dataset.
pub fn dataset() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/dataset.jsonl")
}

/// Run terraform-bench with the given arguments and return (exit_code, stdout, stderr).
pub fn run_bench(args: &[&str]) -> (i32, String, String) {
    let sh = Shell::new().expect("create shell");
    sh.change_dir(env!("CARGO_MANIFEST_DIR"));
    let output = cmd!(sh, "cargo run --quiet -p terraform-bench -- {args...}")
        .env("TERRAFORM_BENCH_LOG", "warn")
        .ignore_status()
        .output()
        .expect("run terraform-bench");

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (exit_code, stdout, stderr)
}

/// Write an executable shell script.
#[cfg(unix)]
pub fn executable(path: &Path, script: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, script).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}
