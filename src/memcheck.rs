/// Memory-checker (valgrind) integration: wrapping an invocation so the
/// checker writes to a private log file, and parsing that log's summary line.
///
/// Parsing never decides pass/fail on its own. Callers turn a report with
/// errors into a [`MemCheckError::Violation`] via [`MemoryCheckReport::check`].
use crate::config::MemcheckConfig;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::NamedTempFile;

static SUMMARY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ERROR SUMMARY: (\d+) errors from (\d+) contexts").unwrap()
});

/// Parsed summary of a memory-checker log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCheckReport {
    pub error_count: u64,
    pub context_count: u64,
    pub raw_log: String,
}

impl MemoryCheckReport {
    /// Parse the `ERROR SUMMARY: N errors from M contexts` line out of a log.
    pub fn parse(log: &str) -> Result<MemoryCheckReport, MemCheckError> {
        let caps = SUMMARY_PATTERN
            .captures(log)
            .ok_or_else(|| MemCheckError::Malformed {
                log: log.to_string(),
            })?;

        // \d+ can still overflow u64
        let count = |i: usize| caps[i].parse::<u64>().ok();
        match (count(1), count(2)) {
            (Some(error_count), Some(context_count)) => Ok(MemoryCheckReport {
                error_count,
                context_count,
                raw_log: log.to_string(),
            }),
            _ => Err(MemCheckError::Malformed {
                log: log.to_string(),
            }),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.error_count == 0
    }

    /// Raise a violation if the checker reported any errors.
    pub fn check(self) -> Result<MemoryCheckReport, MemCheckError> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(MemCheckError::Violation {
                report: Box::new(self),
            })
        }
    }
}

/// A memory-checker wrapping for one invocation.
///
/// Owns the temporary log file; the file is removed when this value drops.
pub struct MemCheck {
    command: String,
    args: Vec<String>,
    suppressions: Option<PathBuf>,
    log: NamedTempFile,
}

impl MemCheck {
    /// Prepare a wrapping if the config enables it.
    pub fn from_config(config: &MemcheckConfig) -> Result<Option<MemCheck>, MemCheckError> {
        if !config.enabled {
            return Ok(None);
        }
        let log = tempfile::Builder::new()
            .prefix("memcheck-")
            .suffix(".log")
            .tempfile()
            .map_err(|e| MemCheckError::Io { source: e })?;
        Ok(Some(MemCheck {
            command: config.command.clone(),
            args: config.args.clone(),
            suppressions: config.suppressions.clone(),
            log,
        }))
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Prefix `program args..` with the checker invocation.
    ///
    /// Returns the program to execute and its full argument list.
    pub fn wrap(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        let mut wrapped = self.args.clone();
        if let Some(ref supp) = self.suppressions {
            wrapped.push(format!("--suppressions={}", supp.display()));
        }
        wrapped.push(format!("--log-file={}", self.log_path().display()));
        wrapped.push(program.to_string());
        wrapped.extend(args.iter().cloned());
        (self.command.clone(), wrapped)
    }

    /// Read and parse the checker's log. Call only after the wrapped process exited.
    pub fn report(&self) -> Result<MemoryCheckReport, MemCheckError> {
        let log = std::fs::read_to_string(self.log_path())
            .map_err(|e| MemCheckError::Io { source: e })?;
        MemoryCheckReport::parse(&log)
    }
}

#[derive(Debug)]
pub enum MemCheckError {
    /// The log had no `ERROR SUMMARY` line.
    Malformed { log: String },
    /// The checker reported one or more errors.
    Violation { report: Box<MemoryCheckReport> },
    Io { source: std::io::Error },
}

impl std::fmt::Display for MemCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemCheckError::Malformed { log } => {
                write!(
                    f,
                    "memory checker log has no ERROR SUMMARY line ({} bytes of log)",
                    log.len()
                )
            }
            MemCheckError::Violation { report } => write!(
                f,
                "memory checker reported {} errors from {} contexts",
                report.error_count, report.context_count
            ),
            MemCheckError::Io { source } => {
                write!(f, "failed to access memory checker log: {source}")
            }
        }
    }
}

impl std::error::Error for MemCheckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemCheckError::Io { source } => Some(source),
            _ => None,
        }
    }
}
