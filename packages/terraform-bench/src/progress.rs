//! Live reporting of evaluation progress.

use std::io::{Write, stdout};

use color_print::cformat;
use tracing::debug;

use crate::result::{InstanceResult, StageName, StageResult, StageStatus};

/// Observes evaluations as they run.
///
/// Every method defaults to doing nothing. Implementations are shared
/// between workers in parallel mode, so events from different instances may
/// interleave.
pub trait Progress: Sync {
    fn instance_started(&self, _instance_id: &str) {}

    fn stage_started(&self, _instance_id: &str, _stage: StageName) {}

    fn stage_finished(&self, _instance_id: &str, _result: &StageResult) {}

    fn instance_finished(&self, _result: &InstanceResult) {}
}

impl Progress for () {}

/// Prints a line per stage to stdout.
///
/// When `prefix` is set each line names its instance, which keeps
/// interleaved output from parallel workers readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct Console {
    pub prefix: bool,
}

impl Console {
    fn print(&self, instance_id: &str, line: String) {
        self.write(&mut stdout().lock(), instance_id, &line);
    }

    /// Best-effort: write failures are logged, never returned.
    fn write(&self, out: &mut impl Write, instance_id: &str, line: &str) {
        let written = if self.prefix {
            writeln!(out, "{}", cformat!("<dim>[{instance_id}]</> {line}"))
        } else {
            writeln!(out, "{line}")
        };
        if let Err(err) = written {
            debug!(?err, "write progress line");
        }
    }
}

impl Progress for Console {
    fn instance_started(&self, instance_id: &str) {
        self.print(instance_id, cformat!("<cyan,bold>Evaluating</> {instance_id}"));
    }

    fn stage_started(&self, instance_id: &str, stage: StageName) {
        self.print(instance_id, cformat!("  <dim>running {stage}...</>"));
    }

    fn stage_finished(&self, instance_id: &str, result: &StageResult) {
        self.print(instance_id, format!("  {result}"));
    }

    fn instance_finished(&self, result: &InstanceResult) {
        let failed = result
            .stages
            .iter()
            .filter(|stage| matches!(stage.status, StageStatus::Failed | StageStatus::Error))
            .count();
        let suffix = if failed > 0 {
            cformat!(" <dim>({failed} stage(s) did not pass)</>")
        } else {
            String::new()
        };
        self.print(&result.instance_id, format!("{result}{suffix}"));
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;
    use crate::ext::strip_ansi;

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn prefixes_lines_with_instance() {
        let mut out = Vec::new();
        Console { prefix: true }.write(&mut out, "terraform-aws-s3-001", "  init passed");
        Console { prefix: false }.write(&mut out, "terraform-aws-s3-001", "  plan passed");

        let text = String::from_utf8(out).expect("utf8").strip_ansi();
        pretty_assert_eq!(text, "[terraform-aws-s3-001]   init passed\n  plan passed\n");
    }

    #[test]
    fn closed_output_is_ignored() {
        Console { prefix: true }.write(&mut Closed, "terraform-aws-s3-001", "line");
    }
}
