//! Benchmark harness for model-generated Terraform configurations.
//!
//! Each benchmark instance is a natural-language infrastructure problem plus
//! the resources a correct solution is expected to create. A model (via a
//! [`Generator`]) writes a configuration for it, and the harness runs that
//! configuration through a staged pipeline inside a sandbox:
//!
//! - `setup_script`: optional out-of-band provisioning the problem needs
//! - `init`, `validate`, `plan`: the toolchain's own checks
//! - `apply` and `validation_script`: deploy against a cloud emulator and
//!   verify the result, when enabled
//! - `destroy` and `cleanup_script`: teardown, never scored
//!
//! The first stage that does not pass ends the chain; every later stage is
//! recorded as skipped. Each stage earns a score in `[0, 1]` and the
//! instance's total is the weighted mean over the stages that ran, where the
//! plan stage earns partial credit by how closely its planned resources match
//! the expected ones.
//!
//! Instances can be evaluated one at a time, each with its own emulator, or
//! concurrently on a bounded worker pool sharing a single emulator.

pub use crate::agent::{Agent, ExistingFiles, Generation, GenerationRequest, Generator};
pub use crate::config::{Backend, EmulatorConfig, EvalConfig, Timeouts};
pub use crate::instance::{BenchmarkInstance, Difficulty, Filter, load_instances};
pub use crate::pipeline::evaluate;
pub use crate::report::BenchmarkReport;
pub use crate::result::{InstanceResult, StageName, StageResult, StageStatus};
pub use crate::runner::{RunConfig, run_benchmark, run_instance};

pub mod agent;
pub mod config;
pub mod ext;
pub mod instance;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod result;
pub mod runner;
pub mod sandbox;
pub mod scorer;
