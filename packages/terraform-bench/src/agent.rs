//! Agents that generate configurations for the benchmark to evaluate.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    fs::read_to_string,
    path::PathBuf,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, bail, eyre},
};
use indoc::indoc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

use crate::{instance::BenchmarkInstance, sandbox::process::Invocation};

/// Instructions given to the model ahead of every problem.
pub const SYSTEM_PROMPT: &str = indoc! {"
    You are a Terraform expert. Given a problem statement, generate valid Terraform HCL configuration that solves it.

    Rules:
    - Output ONLY valid Terraform HCL code
    - Include all necessary provider and resource blocks
    - Use the specified provider and region
    - Do not include explanations outside of HCL comments
    - If multiple files are needed, separate them with: # --- filename: <name>.tf ---"
};

/// How long an agent may take to answer one request.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(600);

/// What the model is asked to solve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub instance_id: String,
    pub problem_statement: String,
    pub provider: String,
    pub region: String,
    pub hints: Vec<String>,
}

impl From<&BenchmarkInstance> for GenerationRequest {
    fn from(instance: &BenchmarkInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            problem_statement: instance.problem_statement.clone(),
            provider: instance.provider.clone(),
            region: instance.region.clone(),
            hints: instance.hints.clone(),
        }
    }
}

impl GenerationRequest {
    /// The user turn of the conversation.
    pub fn user_prompt(&self) -> String {
        let mut prompt = format!(
            "Provider: {}\nRegion: {}\n\n{}",
            self.provider, self.region, self.problem_statement
        );
        if !self.hints.is_empty() {
            prompt.push_str("\n\nHints:");
            for hint in &self.hints {
                prompt.push_str(&format!("\n- {hint}"));
            }
        }
        prompt
    }

    /// The complete prompt, system instructions included.
    pub fn prompt(&self) -> String {
        format!("System: {SYSTEM_PROMPT}\n\nUser: {}", self.user_prompt())
    }
}

/// A generated configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    /// File name to content.
    pub files: BTreeMap<String, String>,

    /// The prompt the model was given, if any.
    pub prompt: Option<String>,
}

/// Produces configurations for benchmark problems.
///
/// Implementations are shared between workers in parallel mode.
pub trait Generator: Sync {
    /// The model name recorded in results.
    fn model(&self) -> String;

    fn generate(&self, request: &GenerationRequest) -> Result<Generation>;
}

impl<F> Generator for F
where
    F: Fn(&GenerationRequest) -> Result<Generation> + Sync,
{
    fn model(&self) -> String {
        String::from("custom")
    }

    fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        self(request)
    }
}

/// An agent backed by an external program.
///
/// Written on the command line as `claude-code:<model>` or
/// `command:<path>`.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", content = "model", rename_all = "snake_case")]
pub enum Agent {
    /// Claude Code, given the prompt with `--print`.
    ///
    /// The model is an alias like `sonnet` or a full model id like
    /// `claude-sonnet-4-5-20250929`.
    ClaudeCode(String),

    /// Any executable that reads the prompt on stdin and prints the
    /// configuration on stdout.
    Command(PathBuf),
}

impl Agent {
    fn invocation(&self, prompt: String, cwd: PathBuf) -> Invocation {
        let builder = Invocation::builder().cwd(cwd).timeout(GENERATE_TIMEOUT);
        match self {
            Agent::ClaudeCode(model) => builder
                .program("claude")
                .args(vec![
                    String::from("--model"),
                    model.clone(),
                    String::from("--print"),
                    prompt,
                ])
                .build(),
            Agent::Command(path) => builder
                .program(path.display().to_string())
                .stdin(prompt)
                .build(),
        }
    }
}

impl Generator for Agent {
    fn model(&self) -> String {
        match self {
            Agent::ClaudeCode(model) => model.clone(),
            Agent::Command(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }

    #[tracing::instrument(skip_all, fields(agent = %self, instance = %request.instance_id))]
    fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        // Agents run in an empty directory so they cannot touch the caller's.
        let scratch = tempdir().context("create agent directory")?;
        let prompt = request.prompt();
        let invocation = self.invocation(prompt.clone(), scratch.path().to_path_buf());

        let output = invocation.run()?;
        if !output.success() {
            return Err(eyre!("run {self} ({:?})", output.exit))
                .section(output.stdout.header("Stdout:"))
                .section(output.stderr.header("Stderr:"));
        }

        let files = parse_response(&output.stdout);
        if files.is_empty() {
            return Err(eyre!("{self} returned no configuration"))
                .section(output.stdout.header("Stdout:"));
        }
        tracing::info!(files = files.len(), "generated configuration");
        Ok(Generation {
            files,
            prompt: Some(prompt),
        })
    }
}

impl Display for Agent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Agent::ClaudeCode(model) => write!(f, "claude-code:{model}"),
            Agent::Command(path) => write!(f, "command:{}", path.display()),
        }
    }
}

impl FromStr for Agent {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("claude-code", model)) if !model.is_empty() => Ok(Agent::ClaudeCode(model.to_string())),
            Some(("command", path)) if !path.is_empty() => Ok(Agent::Command(PathBuf::from(path))),
            _ => bail!("invalid agent {s:?}: expected `claude-code:<model>` or `command:<path>`"),
        }
    }
}

/// Reuses configurations written by an earlier run instead of generating.
///
/// Reads every `*.tf` file in `<dir>/<instance_id>/`.
#[derive(Debug, Clone)]
pub struct ExistingFiles {
    pub dir: PathBuf,

    /// The model name recorded in results.
    pub model: String,
}

impl Generator for ExistingFiles {
    fn model(&self) -> String {
        self.model.clone()
    }

    #[tracing::instrument(skip_all, fields(instance = %request.instance_id))]
    fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let dir = self.dir.join(&request.instance_id);
        let pattern = dir.join("*.tf");
        let mut files = BTreeMap::new();
        for path in glob::glob(&pattern.to_string_lossy()).context("build glob")? {
            let path = path.with_context(|| format!("list {dir:?}"))?;
            let Some(name) = path.file_name() else {
                continue;
            };
            let content = read_to_string(&path).with_context(|| format!("read {path:?}"))?;
            files.insert(name.to_string_lossy().into_owned(), content);
        }

        if files.is_empty() {
            bail!("no .tf files found in {}", dir.display());
        }
        Ok(Generation {
            files,
            prompt: None,
        })
    }
}

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:hcl|terraform|tf)?\s*\n(.*?)```").expect("fence pattern is valid")
});

static FILE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#\s*---\s*filename:\s*(\S+)\s*---\s*$").expect("marker pattern is valid")
});

/// Split a model response into configuration files.
///
/// Fenced code blocks are extracted (and joined) if present. Files are
/// separated by `# --- filename: <name> ---` lines; text before the first
/// marker goes to `main.tf`. Without markers the whole text is `main.tf`.
/// Files with no content are dropped.
pub fn parse_response(response: &str) -> BTreeMap<String, String> {
    let blocks = FENCE
        .captures_iter(response)
        .filter_map(|captures| captures.get(1))
        .map(|block| block.as_str())
        .collect::<Vec<_>>();
    let text = if blocks.is_empty() {
        response.to_string()
    } else {
        blocks.join("\n\n")
    };

    let mut files = BTreeMap::new();
    let mut insert = |name: &str, content: &str| {
        let content = content.trim();
        if !content.is_empty() {
            files.insert(name.to_string(), format!("{content}\n"));
        }
    };

    let markers = FILE_MARKER.captures_iter(&text).collect::<Vec<_>>();
    if markers.is_empty() {
        insert("main.tf", &text);
        return files;
    }

    let first = markers[0].get(0).map_or(0, |m| m.start());
    insert("main.tf", &text[..first]);
    for (index, captures) in markers.iter().enumerate() {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let end = markers
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |next| next.start());
        insert(name.as_str(), &text[whole.end()..end]);
    }
    files
}
