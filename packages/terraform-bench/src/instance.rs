//! Benchmark instances and the JSONL datasets they are loaded from.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    fs::read_to_string,
    path::{Path, PathBuf},
};

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize};
use serde_plain::{derive_display_from_serialize, derive_fromstr_from_deserialize};

/// One task in the benchmark: a natural-language infrastructure request and
/// the resources a correct answer should plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkInstance {
    /// Unique id of the form `terraform-<provider>-<name>...`.
    pub instance_id: String,

    pub problem_statement: String,

    pub difficulty: Difficulty,

    #[serde(default)]
    pub tags: Vec<String>,

    pub provider: String,

    pub region: String,

    /// Resource type to the number of resources of that type a correct plan
    /// creates.
    #[serde(default)]
    pub expected_resources: BTreeMap<String, u32>,

    /// Script verifying the deployed resources; runs only after apply.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub validation_script: Option<PathBuf>,

    /// Script provisioning out-of-band prerequisites before the toolchain
    /// runs. A `cleanup.sh` next to it undoes them afterwards.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub setup_script: Option<PathBuf>,

    #[serde(default)]
    pub hints: Vec<String>,

    /// Outputs a solution is expected to declare.
    #[serde(default)]
    pub required_outputs: Vec<String>,

    /// A known-good solution, file name to content.
    #[serde(default)]
    pub gold_solution: BTreeMap<String, String>,

    #[serde(default)]
    pub metadata: Option<InstanceMetadata>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

derive_display_from_serialize!(Difficulty);
derive_fromstr_from_deserialize!(Difficulty);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    #[serde(default)]
    pub estimated_cost: String,

    #[serde(default)]
    pub deployment_time_seconds: u64,

    #[serde(default = "default_true")]
    pub cleanup_required: bool,

    #[serde(default)]
    pub created_at: Option<String>,

    #[serde(default = "default_author")]
    pub author: String,
}

fn default_true() -> bool {
    true
}

fn default_author() -> String {
    String::from("terraform-bench")
}

fn empty_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<PathBuf>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from))
}

impl BenchmarkInstance {
    /// Report everything wrong with this instance; empty if it is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.instance_id.trim().is_empty() {
            problems.push(String::from("instance_id is empty"));
        } else {
            let parts = self.instance_id.split('-').collect::<Vec<_>>();
            if parts.len() < 3 || parts[0] != "terraform" {
                problems.push(format!("invalid instance_id format: {}", self.instance_id));
            }
        }
        if self.problem_statement.trim().is_empty() {
            problems.push(String::from("problem_statement is empty"));
        }
        if self.provider.trim().is_empty() {
            problems.push(String::from("provider is empty"));
        }
        if self.region.trim().is_empty() {
            problems.push(String::from("region is empty"));
        }
        problems
    }

    /// The cleanup script paired with this instance's setup script.
    pub fn cleanup_script(&self) -> Option<PathBuf> {
        self.setup_script
            .as_deref()
            .map(|setup| setup.with_file_name("cleanup.sh"))
    }
}

impl Display for BenchmarkInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}, {}/{}]",
            self.instance_id, self.difficulty, self.provider, self.region
        )?;
        if !self.tags.is_empty() {
            write!(f, " {}", self.tags.iter().join(", "))?;
        }
        Ok(())
    }
}

/// Load instances from a JSONL file, or from every `*.jsonl` file in a
/// directory (in file name order).
///
/// Blank lines are skipped. Any line that does not parse, or that describes
/// an instance with [problems](BenchmarkInstance::problems), fails the load.
#[tracing::instrument]
pub fn load_instances(path: &Path) -> Result<Vec<BenchmarkInstance>> {
    let files = if path.is_dir() {
        let pattern = path.join("*.jsonl");
        let mut files = glob::glob(&pattern.to_string_lossy())
            .context("build dataset glob")?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("list dataset directory: {path:?}"))?;
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut instances = Vec::new();
    for file in files {
        let content = read_to_string(&file).with_context(|| format!("read dataset: {file:?}"))?;
        for (index, line) in content.lines().enumerate() {
            let line_number = index + 1;
            if line.trim().is_empty() {
                continue;
            }

            let instance = serde_json::from_str::<BenchmarkInstance>(line)
                .with_context(|| format!("parse instance at {}:{line_number}", file.display()))?;
            let problems = instance.problems();
            if !problems.is_empty() {
                bail!(
                    "invalid instance at {}:{line_number}: {}",
                    file.display(),
                    problems.join("; ")
                );
            }
            instances.push(instance);
        }
    }

    tracing::debug!(count = instances.len(), "loaded instances");
    Ok(instances)
}

/// Selects a subset of a dataset.
#[derive(Debug, Clone, Default, Builder)]
#[non_exhaustive]
pub struct Filter {
    /// Keep only the instance with this id.
    #[builder(into)]
    pub instance_id: Option<String>,

    pub difficulty: Option<Difficulty>,

    #[builder(into)]
    pub provider: Option<String>,

    /// Keep only instances carrying every one of these tags.
    #[builder(default)]
    pub tags: Vec<String>,

    /// Keep at most this many instances.
    pub limit: Option<usize>,
}

impl Filter {
    pub fn matches(&self, instance: &BenchmarkInstance) -> bool {
        self.instance_id
            .as_ref()
            .is_none_or(|id| *id == instance.instance_id)
            && self
                .difficulty
                .is_none_or(|difficulty| difficulty == instance.difficulty)
            && self
                .provider
                .as_ref()
                .is_none_or(|provider| *provider == instance.provider)
            && self.tags.iter().all(|tag| instance.tags.contains(tag))
    }

    /// Apply the filter, preserving dataset order.
    pub fn apply(&self, instances: Vec<BenchmarkInstance>) -> Vec<BenchmarkInstance> {
        instances
            .into_iter()
            .filter(|instance| self.matches(instance))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
