/// One-shot command execution: spawn, capture stdout/stderr, wait.
///
/// Used for the external unmount request and for probing the service binary.
/// Optionally wrapped by the memory checker, whose log is checked once the
/// command has exited.
use crate::classify::ProcessExit;
use crate::config::{MemcheckConfig, ServiceConfig};
use crate::memcheck::{MemCheck, MemCheckError, MemoryCheckReport};
use std::process::Stdio;
use tokio::process::Command;

/// Line the service prints when `fusemount` is invoked without a mountpoint,
/// present only in builds with FUSE support.
pub const FUSE_SUPPORT_MARKER: &str = "Please supply a mountpoint.";

/// Captured result of a one-shot command.
#[derive(Debug)]
pub struct CommandOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    /// Present when the command ran under the memory checker.
    pub memcheck: Option<MemoryCheckReport>,
}

#[derive(Debug)]
pub enum RunError {
    EmptyCommand,
    Spawn {
        command: String,
        source: std::io::Error,
    },
    MemCheck(MemCheckError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::EmptyCommand => write!(f, "command is empty"),
            RunError::Spawn { command, source } => {
                write!(f, "failed to spawn {command}: {source}")
            }
            RunError::MemCheck(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::EmptyCommand => None,
            RunError::Spawn { source, .. } => Some(source),
            RunError::MemCheck(e) => Some(e),
        }
    }
}

impl From<MemCheckError> for RunError {
    fn from(e: MemCheckError) -> Self {
        RunError::MemCheck(e)
    }
}

/// Run `program args..` to completion.
///
/// With `memcheck` enabled, a log showing errors fails the call with
/// [`MemCheckError::Violation`] regardless of the command's exit status.
pub async fn run(
    program: &str,
    args: &[String],
    memcheck: Option<&MemcheckConfig>,
) -> Result<CommandOutput, RunError> {
    if program.is_empty() {
        return Err(RunError::EmptyCommand);
    }

    let checker = match memcheck {
        Some(config) => MemCheck::from_config(config)?,
        None => None,
    };
    let (program, args) = match checker {
        Some(ref mc) => mc.wrap(program, args),
        None => (program.to_string(), args.to_vec()),
    };

    tracing::info!(command = %program, args = ?args, "running command");

    let output = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| RunError::Spawn {
            command: program.clone(),
            source: e,
        })?;

    let exit = ProcessExit::from(output.status);
    tracing::debug!(command = %program, %exit, "command finished");

    let memcheck = match checker {
        Some(mc) => Some(mc.report()?.check()?),
        None => None,
    };

    Ok(CommandOutput {
        exit,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        memcheck,
    })
}

/// Check whether the service binary was built with FUSE support.
pub async fn probe_fuse_support(service: &ServiceConfig) -> Result<bool, RunError> {
    let subcommand = service
        .args
        .first()
        .cloned()
        .unwrap_or_else(|| "fusemount".to_string());
    let out = run(&service.command, &[subcommand], None).await?;
    Ok(out.stdout.contains(FUSE_SUPPORT_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_run_captures_streams_and_exit() {
        let out = run("sh", &sh("echo out; echo err >&2; exit 3"), None)
            .await
            .unwrap();
        assert_eq!(out.exit, ProcessExit::Code(3));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(out.memcheck.is_none());
    }

    #[tokio::test]
    async fn test_run_reports_signal_death() {
        let out = run("sh", &sh("kill -ABRT $$"), None).await.unwrap();
        assert_eq!(
            out.exit,
            ProcessExit::Signal(nix::sys::signal::Signal::SIGABRT as i32)
        );
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let err = run("nonexistent-binary-xyz", &[], None).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_run_empty_command() {
        assert!(matches!(
            run("", &[], None).await,
            Err(RunError::EmptyCommand)
        ));
    }

    // Stand-in checker: writes a summary line to the --log-file it is handed
    // and never runs the wrapped program.
    fn fake_checker(errors: u32) -> MemcheckConfig {
        let script = format!(
            r#"for a in "$@"; do case "$a" in --log-file=*) echo "==1== ERROR SUMMARY: {errors} errors from 1 contexts" > "${{a#--log-file=}}";; esac; done"#
        );
        MemcheckConfig {
            enabled: true,
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script, "sh".to_string()],
            suppressions: None,
        }
    }

    #[tokio::test]
    async fn test_run_under_clean_memcheck() {
        let config = fake_checker(0);
        let out = run("true", &[], Some(&config)).await.unwrap();
        let report = out.memcheck.unwrap();
        assert_eq!(report.error_count, 0);
        assert_eq!(report.context_count, 1);
    }

    #[tokio::test]
    async fn test_run_under_memcheck_with_errors_fails() {
        let config = fake_checker(4);
        let err = run("true", &[], Some(&config)).await.unwrap_err();
        match err {
            RunError::MemCheck(MemCheckError::Violation { report }) => {
                assert_eq!(report.error_count, 4);
            }
            other => panic!("expected memcheck violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_under_memcheck_without_summary_is_malformed() {
        let config = MemcheckConfig {
            enabled: true,
            command: "true".to_string(),
            args: vec![],
            suppressions: None,
        };
        let err = run("true", &[], Some(&config)).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::MemCheck(MemCheckError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_memcheck_config_is_ignored() {
        let config = MemcheckConfig::default();
        let out = run("true", &[], Some(&config)).await.unwrap();
        assert!(out.memcheck.is_none());
    }

    #[tokio::test]
    async fn test_probe_detects_support_marker() {
        // `echo <marker>` stands in for a fuse-enabled build printing its usage
        let service = ServiceConfig {
            command: "echo".to_string(),
            args: vec![FUSE_SUPPORT_MARKER.to_string()],
        };
        assert!(probe_fuse_support(&service).await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_without_marker() {
        let service = ServiceConfig {
            command: "echo".to_string(),
            args: vec!["fusemount: unknown command".to_string()],
        };
        assert!(!probe_fuse_support(&service).await.unwrap());
    }
}
