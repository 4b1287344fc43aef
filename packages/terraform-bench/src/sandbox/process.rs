//! Subprocess execution with time limits and captured output.

use std::{
    fmt::{self, Display, Formatter},
    io::{ErrorKind, Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::ext::{strip_ansi, truncate_chars};

/// How long to wait for output readers after the process has exited.
///
/// Grandchildren that inherited the pipes can keep them open after the
/// direct child exits; output captured so far is still returned.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A command to run, with its environment and time limit.
#[derive(Debug, Clone, Builder)]
#[non_exhaustive]
pub struct Invocation {
    /// The path to the binary to run, or just its name if it is in `$PATH`.
    #[builder(into)]
    pub program: String,

    #[builder(default)]
    pub args: Vec<String>,

    /// Working directory; the current directory if unset.
    #[builder(into)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables.
    #[builder(default)]
    pub env: Vec<(String, String)>,

    /// Content written to the process's stdin.
    #[builder(into)]
    pub stdin: Option<String>,

    pub timeout: Duration,
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The process exited with a code.
    Code(i32),

    /// The process was terminated by a signal.
    Signal,

    /// The process ran past its time limit and was killed.
    TimedOut(Duration),

    /// The executable could not be found.
    NotFound,
}

/// Captured result of running an [`Invocation`].
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit: Exit,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit == Exit::Code(0)
    }

    /// The exit code, or `-1` if the process did not exit normally.
    pub fn returncode(&self) -> i32 {
        match self.exit {
            Exit::Code(code) => code,
            Exit::Signal | Exit::TimedOut(_) | Exit::NotFound => -1,
        }
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }

    /// A one-line hint at why the command failed: the first line mentioning
    /// an error, or else the last non-empty line of output.
    pub fn summary(&self) -> Option<String> {
        let lines = || {
            self.stderr
                .lines()
                .chain(self.stdout.lines())
                .map(|line| line.strip_ansi())
                .map(|line| line.trim().trim_start_matches('│').trim().to_string())
                .filter(|line| !line.is_empty())
        };
        lines()
            .find(|line| line.starts_with("Error") || line.contains("error:"))
            .or_else(|| lines().last())
            .map(|line| line.truncate_chars(200))
    }
}

impl Invocation {
    /// Run the command to completion or until its time limit.
    ///
    /// A missing executable and a timeout are reported through [`Exit`];
    /// only failures of the harness itself (for example, being unable to
    /// spawn the process for a reason other than a missing executable) are
    /// returned as errors.
    #[tracing::instrument(skip_all, fields(program = %self.program))]
    pub fn run(&self) -> Result<CommandOutput> {
        debug!(command = %self, timeout = ?self.timeout, "run command");
        let start = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(CommandOutput {
                    exit: Exit::NotFound,
                    stdout: String::new(),
                    stderr: format!("Command not found: {}", self.program),
                    duration: start.elapsed(),
                });
            }
            Err(err) => return Err(err).with_context(|| format!("spawn command: {self}")),
        };

        if let (Some(mut pipe), Some(input)) = (child.stdin.take(), self.stdin.clone()) {
            thread::spawn(move || {
                if let Err(err) = pipe.write_all(input.as_bytes()) {
                    debug!(?err, "write command stdin");
                }
            });
        }
        let stdout = child.stdout.take().map(Capture::spawn);
        let stderr = child.stderr.take().map(Capture::spawn);

        let exit = match child
            .wait_timeout(self.timeout)
            .with_context(|| format!("wait for command: {self}"))?
        {
            Some(status) => status.code().map(Exit::Code).unwrap_or(Exit::Signal),
            None => {
                warn!(command = %self, timeout = ?self.timeout, "command timed out");
                if let Err(err) = child.kill() {
                    debug!(?err, "kill timed out command");
                }
                let _ = child.wait();
                Exit::TimedOut(self.timeout)
            }
        };

        let stdout = stdout.map(Capture::finish).unwrap_or_default();
        let mut stderr = stderr.map(Capture::finish).unwrap_or_default();
        if let Exit::TimedOut(limit) = exit {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("Command timed out after {}s", limit.as_secs()));
        }

        Ok(CommandOutput {
            exit,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        write!(f, "{}", shell_words::join(words))
    }
}

/// Output of one pipe, accumulated on a reader thread.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl Capture {
    fn spawn(mut pipe: impl Read + Send + 'static) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buffer, handle }
    }

    fn finish(self) -> String {
        let deadline = Instant::now() + DRAIN_GRACE;
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
        }

        let bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
