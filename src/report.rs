/// Lifecycle report: one JSON document describing every supervised cycle of
/// a CLI run.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::classify::{Outcome, ProcessExit};
use crate::supervisor::{ProcessSupervisor, SupervisorState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What happened in one mount/stop/verify cycle.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub cycle: u32,
    pub device: String,
    pub mountpoint: String,
    pub pid: Option<u32>,
    pub command: Option<String>,
    pub transitions: Vec<SupervisorState>,
    pub final_state: SupervisorState,
    pub outcome: Option<Outcome>,
    /// Raw exit status.
    pub exit: Option<ProcessExit>,
    /// Exit status after debug-marker remapping.
    pub status: Option<ProcessExit>,
    pub forced_kill: bool,
    pub memcheck_errors: Option<u64>,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub passed: bool,
    /// First error of the cycle, from mount, stop or verify.
    pub error: Option<String>,
}

impl LifecycleReport {
    /// Snapshot a supervisor after its cycle. `error` is the first failure the
    /// caller ran into; when absent, the verification verdict is used.
    pub fn from_supervisor(cycle: u32, sup: &ProcessSupervisor, error: Option<String>) -> Self {
        let error = error.or_else(|| sup.verify().err().map(|e| e.to_string()));
        let captured = sup.captured();
        let duration_ms = match (sup.started_at(), sup.finished_at()) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };

        LifecycleReport {
            cycle,
            device: sup.device().display().to_string(),
            mountpoint: sup.mountpoint().display().to_string(),
            pid: sup.handle().map(|h| h.pid),
            command: sup
                .handle()
                .map(|h| format!("{} {}", h.program, h.args.join(" "))),
            transitions: sup.transitions().to_vec(),
            final_state: sup.state(),
            outcome: captured.map(|c| c.outcome.clone()),
            exit: captured.map(|c| c.exit),
            status: captured.map(|c| c.status()),
            forced_kill: sup.forced_kill(),
            memcheck_errors: sup.memcheck_report().map(|r| r.error_count),
            stdout_bytes: captured.map_or(0, |c| c.stdout.len()),
            stderr_bytes: captured.map_or(0, |c| c.stderr.len()),
            started_at: sup.started_at(),
            finished_at: sup.finished_at(),
            duration_ms,
            passed: error.is_none(),
            error,
        }
    }
}

/// The JSON payload written by `--report`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cycles: Vec<LifecycleReport>,
    pub passed: bool,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, cycles: Vec<LifecycleReport>) -> Self {
        let passed = cycles.iter().all(|c| c.passed);
        RunReport {
            pid: std::process::id(),
            started_at,
            finished_at: Utc::now(),
            cycles,
            passed,
        }
    }
}

pub struct ReportFile {
    path: PathBuf,
}

impl ReportFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write the report.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, report: &RunReport) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| ReportError::Serialize { source: e })?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report".to_string());
        let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ReportError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| ReportError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        tracing::info!(path = %self.path.display(), "lifecycle report written");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub enum ReportError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => write!(f, "failed to serialize report: {source}"),
            ReportError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            ReportError::Rename { from, to, source } => write!(
                f,
                "failed to rename {} -> {}: {source}",
                from.display(),
                to.display()
            ),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
            ReportError::Rename { source, .. } => Some(source),
        }
    }
}
