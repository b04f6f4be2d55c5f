/// Lifecycle supervision of the filesystem running in foreground mount mode.
///
/// One background task per supervisor owns the child and its pipes. It
/// signals readiness over a oneshot channel the moment the readiness line
/// appears, keeps draining output until the child exits, and hands the
/// captured output back as its return value. The caller only sees that
/// output after joining the task in [`ProcessSupervisor::stop`].
///
/// The child runs in its own process group so a forced kill also reaches
/// anything it spawned (and anything holding its stdout open).
use crate::classify::{classify, MarkerSet, Outcome, ProcessExit, SILENT_DEFECT_EXIT};
use crate::config::{expand_args, ConfigError, HarnessConfig, MemcheckConfig};
use crate::lock::{LockError, MountLock};
use crate::memcheck::{MemCheck, MemCheckError, MemoryCheckReport};
use crate::runner;
use crate::watcher::{self, WatchError};
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::runtime::RuntimeFlavor;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Supervisor lifecycle. Variants are declared in transition order, so a
/// legal history is strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        match (self, next) {
            (Idle, Starting) => true,
            (Starting, Ready) => true,
            // stop() is also valid before readiness was awaited
            (Starting, Stopping) | (Ready, Stopping) => true,
            (Stopping, Stopped) => true,
            (Starting | Ready | Stopping, Failed) => true,
            _ => false,
        }
    }
}

/// Identity of the spawned child.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub program: String,
    pub args: Vec<String>,
    pub pid: u32,
}

/// Everything the background task collected. Only reachable after the task
/// has been joined.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// Output up to and including the readiness line.
    pub ready_output: String,
    /// All of stdout, before and after readiness.
    pub stdout: String,
    pub stderr: String,
    /// Raw exit as reported by the OS.
    pub exit: ProcessExit,
    pub outcome: Outcome,
    pub readiness_observed: bool,
}

impl CapturedOutput {
    /// Exit status as recorded for verification: a clean exit that printed a
    /// debug-assertion marker is reported as [`SILENT_DEFECT_EXIT`].
    pub fn status(&self) -> ProcessExit {
        match self.outcome {
            Outcome::DebugAssertionObserved { .. } => ProcessExit::Code(SILENT_DEFECT_EXIT),
            _ => self.exit,
        }
    }
}

type Readiness = Result<(), WatchError>;
type Supervised = Result<CapturedOutput, WatchError>;

pub struct ProcessSupervisor {
    service_command: String,
    service_args: Vec<String>,
    shutdown_command: String,
    shutdown_args: Vec<String>,
    memcheck_config: MemcheckConfig,
    readiness: Regex,
    markers: MarkerSet,
    device: PathBuf,
    mountpoint: PathBuf,

    state: SupervisorState,
    transitions: Vec<SupervisorState>,
    handle: Option<ProcessHandle>,
    task: Option<JoinHandle<Supervised>>,
    ready_rx: Option<oneshot::Receiver<Readiness>>,
    lock: Option<MountLock>,
    memcheck: Option<MemCheck>,

    captured: Option<CapturedOutput>,
    memcheck_report: Option<MemoryCheckReport>,
    /// Why the memory checker's log could not be read, if it could not.
    memcheck_failure: Option<String>,
    forced_kill: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl ProcessSupervisor {
    /// Build an idle supervisor for `device` mounted at `mountpoint`.
    pub fn new(
        config: &HarnessConfig,
        device: impl Into<PathBuf>,
        mountpoint: impl Into<PathBuf>,
    ) -> Result<ProcessSupervisor, SupervisorError> {
        let readiness =
            Regex::new(&config.readiness.pattern).map_err(SupervisorError::InvalidPattern)?;
        let markers =
            MarkerSet::from_config(&config.markers).map_err(SupervisorError::InvalidPattern)?;
        let device = device.into();
        let mountpoint = mountpoint.into();
        let service_args = expand_args(&config.service.args, &device, &mountpoint)
            .map_err(SupervisorError::Config)?;
        let shutdown_args = expand_args(&config.shutdown.args, &device, &mountpoint)
            .map_err(SupervisorError::Config)?;

        Ok(ProcessSupervisor {
            service_command: config.service.command.clone(),
            service_args,
            shutdown_command: config.shutdown.command.clone(),
            shutdown_args,
            memcheck_config: config.memcheck.clone(),
            readiness,
            markers,
            device,
            mountpoint,
            state: SupervisorState::Idle,
            transitions: vec![SupervisorState::Idle],
            handle: None,
            task: None,
            ready_rx: None,
            lock: None,
            memcheck: None,
            captured: None,
            memcheck_report: None,
            memcheck_failure: None,
            forced_kill: false,
            started_at: None,
            finished_at: None,
        })
    }

    /// Replace the debug-assertion markers.
    pub fn with_markers(mut self, markers: MarkerSet) -> Self {
        self.markers = markers;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn transitions(&self) -> &[SupervisorState] {
        &self.transitions
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Captured output; `None` until the background task has been joined.
    pub fn captured(&self) -> Option<&CapturedOutput> {
        self.captured.as_ref()
    }

    pub fn memcheck_report(&self) -> Option<&MemoryCheckReport> {
        self.memcheck_report.as_ref()
    }

    /// Whether teardown had to fall back to killing the process group.
    pub fn forced_kill(&self) -> bool {
        self.forced_kill
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Spawn the service and its supervising task. Does not wait for readiness.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.state != SupervisorState::Idle {
            return Err(SupervisorError::AlreadyRunning { state: self.state });
        }
        self.transition(SupervisorState::Starting);
        self.started_at = Some(Utc::now());

        if let Err(e) = self.spawn() {
            self.lock = None;
            self.finished_at = Some(Utc::now());
            self.transition(SupervisorState::Failed);
            return Err(e);
        }
        Ok(())
    }

    fn spawn(&mut self) -> Result<(), SupervisorError> {
        let lock = MountLock::acquire(&self.mountpoint).map_err(SupervisorError::Lock)?;
        let memcheck =
            MemCheck::from_config(&self.memcheck_config).map_err(SupervisorError::MemCheck)?;

        let (program, args) = match memcheck {
            Some(ref mc) => mc.wrap(&self.service_command, &self.service_args),
            None => (self.service_command.clone(), self.service_args.clone()),
        };

        tracing::info!(
            command = %program,
            args = ?args,
            mountpoint = %self.mountpoint.display(),
            "starting service"
        );

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                command: program.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                return Err(SupervisorError::Spawn {
                    command: program,
                    source: std::io::Error::other("child output was not captured"),
                })
            }
        };
        tracing::info!(pid, "service process started");

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            child,
            stdout,
            stderr,
            self.readiness.clone(),
            self.markers.clone(),
            ready_tx,
        ));

        self.handle = Some(ProcessHandle { program, args, pid });
        self.task = Some(task);
        self.ready_rx = Some(ready_rx);
        self.lock = Some(lock);
        self.memcheck = memcheck;
        Ok(())
    }

    /// Block until the service reports readiness, bounded by `ready_timeout`.
    ///
    /// On any failure the child is torn down, its output collected, and the
    /// supervisor ends in `Failed`.
    pub async fn wait_ready(&mut self, ready_timeout: Duration) -> Result<(), SupervisorError> {
        if self.state != SupervisorState::Starting {
            return Err(SupervisorError::NotRunning { state: self.state });
        }
        let Some(ready_rx) = self.ready_rx.take() else {
            return Err(SupervisorError::NotRunning { state: self.state });
        };

        // One deadline covers both the readiness verdict and, on failure,
        // collecting the child: stdout closing says nothing about stderr or exit
        let deadline = Instant::now() + ready_timeout;
        let err = match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                self.transition(SupervisorState::Ready);
                tracing::info!(mountpoint = %self.mountpoint.display(), "fuse is mounted");
                return Ok(());
            }
            Ok(Ok(Err(e))) => {
                let _ = self.join_by(deadline).await;
                SupervisorError::Readiness(e)
            }
            // Sender dropped without a verdict: the task failed, report why
            Ok(Err(_)) => match self.join_by(deadline).await {
                Err(e) => e,
                Ok(()) => SupervisorError::BackgroundLost,
            },
            Err(_) => {
                tracing::warn!(
                    timeout_ms = ready_timeout.as_millis() as u64,
                    "service did not become ready in time, killing it"
                );
                self.kill_group();
                let _ = self.join().await;
                SupervisorError::ReadinessTimeout {
                    timeout: ready_timeout,
                }
            }
        };

        if let Err(e) = self.collect_memcheck() {
            tracing::warn!(error = %e, "memory check after failed start");
        }
        self.lock = None;
        self.finished_at = Some(Utc::now());
        self.transition(SupervisorState::Failed);
        Err(err)
    }

    /// Start the service and wait until it is mounted.
    pub async fn mount(&mut self, ready_timeout: Duration) -> Result<(), SupervisorError> {
        tracing::info!("starting fuse supervisor");
        self.start()?;
        self.wait_ready(ready_timeout).await
    }

    /// Request an external unmount and wait up to `timeout` for the service
    /// to exit. Past the bound the process group is killed, which always
    /// fails verification.
    ///
    /// Stopping an already finished supervisor is a no-op.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        match self.state {
            SupervisorState::Idle => {
                return Err(SupervisorError::NotRunning { state: self.state })
            }
            state if state.is_terminal() => {
                tracing::info!(?state, "service already finished");
                return Ok(());
            }
            _ => {}
        }

        self.transition(SupervisorState::Stopping);
        self.ready_rx = None;
        self.request_unmount().await;

        let joined = match self.task.take() {
            Some(mut task) => match tokio::time::timeout(timeout, &mut task).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "service did not exit after unmount, killing process group"
                    );
                    self.forced_kill = true;
                    self.kill_group();
                    Some(task.await)
                }
            },
            None => None,
        };

        let result = match joined {
            Some(joined) => self.finish(joined),
            None => Err(SupervisorError::BackgroundLost),
        };
        let memcheck = self.collect_memcheck();

        let ready = self
            .captured
            .as_ref()
            .is_some_and(|c| c.readiness_observed);
        let next = if result.is_ok() && memcheck.is_ok() && ready && !self.forced_kill {
            SupervisorState::Stopped
        } else {
            SupervisorState::Failed
        };
        self.lock = None;
        self.finished_at = Some(Utc::now());
        self.transition(next);

        result?;
        memcheck
    }

    /// Pass/fail gate after a stop: clean exit, no stderr, no memory errors,
    /// and a teardown that did not need a forced kill.
    pub fn verify(&self) -> Result<(), VerifyError> {
        if self.forced_kill {
            return Err(VerifyError::TeardownTimeout);
        }
        let captured = self.captured.as_ref().ok_or(VerifyError::NotCaptured)?;
        if !captured.readiness_observed {
            return Err(VerifyError::NotReady);
        }
        if let Some(reason) = &self.memcheck_failure {
            return Err(VerifyError::MemCheckUnavailable {
                reason: reason.clone(),
            });
        }
        if let Some(report) = self.memcheck_report.as_ref().filter(|r| !r.is_clean()) {
            return Err(VerifyError::Outcome {
                outcome: Outcome::MemoryViolation {
                    errors: report.error_count,
                },
                status: captured.status(),
            });
        }
        if captured.status() != ProcessExit::Code(0) || !captured.outcome.is_clean() {
            return Err(VerifyError::Outcome {
                outcome: captured.outcome.clone(),
                status: captured.status(),
            });
        }
        if captured.stdout.is_empty() {
            return Err(VerifyError::EmptyStdout);
        }
        if !captured.stderr.is_empty() {
            return Err(VerifyError::UnexpectedStderr {
                stderr: captured.stderr.clone(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: SupervisorState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal supervisor transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "supervisor transition");
        self.state = next;
        self.transitions.push(next);
    }

    async fn join(&mut self) -> Result<(), SupervisorError> {
        match self.task.take() {
            Some(task) => {
                let joined = task.await;
                self.finish(joined)
            }
            None => Ok(()),
        }
    }

    /// Join the task, killing the process group if it is still running at
    /// `deadline`.
    async fn join_by(&mut self, deadline: Instant) -> Result<(), SupervisorError> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        let joined = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("service still running after readiness failed, killing it");
                self.kill_group();
                task.await
            }
        };
        self.finish(joined)
    }

    fn finish(&mut self, joined: Result<Supervised, JoinError>) -> Result<(), SupervisorError> {
        match joined {
            Ok(Ok(captured)) => {
                self.captured = Some(captured);
                Ok(())
            }
            Ok(Err(e)) => Err(SupervisorError::Output(e)),
            Err(e) => Err(SupervisorError::BackgroundPanicked {
                message: e.to_string(),
            }),
        }
    }

    fn collect_memcheck(&mut self) -> Result<(), SupervisorError> {
        let Some(mc) = self.memcheck.take() else {
            return Ok(());
        };
        let report = match mc.report() {
            Ok(report) => report,
            Err(e) => {
                self.memcheck_failure = Some(e.to_string());
                return Err(SupervisorError::MemCheck(e));
            }
        };
        self.memcheck_report = Some(report.clone());
        report.check().map_err(SupervisorError::MemCheck)?;
        Ok(())
    }

    async fn request_unmount(&self) {
        tracing::info!(mountpoint = %self.mountpoint.display(), "unmounting fuse");
        match runner::run(&self.shutdown_command, &self.shutdown_args, None).await {
            Ok(out) if out.exit.success() => {}
            Ok(out) => tracing::warn!(
                exit = %out.exit,
                stderr = %out.stderr.trim_end(),
                "unmount request failed"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to run unmount command"),
        }
    }

    fn kill_group(&self) {
        let Some(pid) = self.handle.as_ref().map(|h| h.pid).filter(|&p| p != 0) else {
            return;
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => tracing::warn!(pid, "killed service process group"),
            Err(nix::errno::Errno::ESRCH) => tracing::debug!(pid, "process group already gone"),
            Err(e) => tracing::warn!(pid, error = %e, "failed to kill process group"),
        }
    }
}

impl Drop for ProcessSupervisor {
    /// A supervisor dropped mid-lifecycle (e.g. a failed assertion) must not
    /// leave the filesystem mounted or the service running.
    ///
    /// The unmount command runs synchronously. On a multi-thread runtime the
    /// worker is handed off with `block_in_place` first; on a current-thread
    /// runtime the runtime stalls until the command returns.
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if task.is_finished() {
            return;
        }
        tracing::warn!(
            mountpoint = %self.mountpoint.display(),
            "supervisor dropped with service running, forcing teardown"
        );
        let unmount = || {
            std::process::Command::new(&self.shutdown_command)
                .args(&self.shutdown_args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
        };
        let status = match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(unmount)
            }
            _ => unmount(),
        };
        if let Err(e) = status {
            tracing::warn!(error = %e, "failed to run unmount command");
        }
        self.kill_group();
        task.abort();
    }
}

/// Background half of the supervisor: watch for readiness, drain both
/// streams to end-of-input, reap the child and classify how it ended.
async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    mut stderr: ChildStderr,
    readiness: Regex,
    markers: MarkerSet,
    ready_tx: oneshot::Sender<Readiness>,
) -> Supervised {
    let stdout_flow = async move {
        let mut reader = BufReader::new(stdout);
        match watcher::wait_for_pattern(&mut reader, &readiness).await {
            Ok(prefix) => {
                // The caller may have given up waiting; nothing to do then
                let _ = ready_tx.send(Ok(()));
                let rest = watcher::drain(&mut reader).await?;
                Ok::<_, WatchError>((prefix, rest, true))
            }
            Err(WatchError::PatternNotObserved { pattern, output }) => {
                let _ = ready_tx.send(Err(WatchError::PatternNotObserved {
                    pattern,
                    output: output.clone(),
                }));
                Ok((output, String::new(), false))
            }
            Err(e) => Err(e),
        }
    };
    let stderr_flow = async move {
        let mut buf = Vec::new();
        stderr
            .read_to_end(&mut buf)
            .await
            .map_err(|e| WatchError::Io { source: e })?;
        Ok::<_, WatchError>(String::from_utf8_lossy(&buf).into_owned())
    };

    let (out, err) = tokio::join!(stdout_flow, stderr_flow);
    let (ready_output, rest, readiness_observed) = out?;
    let stderr = err?;

    tracing::debug!("waiting for service process");
    let status = child
        .wait()
        .await
        .map_err(|e| WatchError::Io { source: e })?;
    let exit = ProcessExit::from(status);

    let stdout = format!("{ready_output}{rest}");
    let combined = format!("{stdout}{stderr}");
    let outcome = classify(exit, &combined, &markers);
    tracing::info!(%exit, %outcome, "service process exited");

    Ok(CapturedOutput {
        ready_output,
        stdout,
        stderr,
        exit,
        outcome,
        readiness_observed,
    })
}

#[derive(Debug)]
pub enum SupervisorError {
    /// `start()` called on a supervisor that has already been started.
    AlreadyRunning { state: SupervisorState },
    NotRunning { state: SupervisorState },
    InvalidPattern(regex::Error),
    Config(ConfigError),
    Lock(LockError),
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Stdout closed before the readiness line appeared.
    Readiness(WatchError),
    ReadinessTimeout { timeout: Duration },
    /// The background task ended without reporting readiness.
    BackgroundLost,
    BackgroundPanicked { message: String },
    Output(WatchError),
    MemCheck(MemCheckError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::AlreadyRunning { state } => {
                write!(f, "supervisor already started (state {state:?})")
            }
            SupervisorError::NotRunning { state } => {
                write!(f, "supervisor is not running (state {state:?})")
            }
            SupervisorError::InvalidPattern(e) => write!(f, "invalid pattern: {e}"),
            SupervisorError::Config(e) => write!(f, "{e}"),
            SupervisorError::Lock(e) => write!(f, "{e}"),
            SupervisorError::Spawn { command, source } => {
                write!(f, "failed to spawn {command}: {source}")
            }
            SupervisorError::Readiness(e) => write!(f, "service never became ready: {e}"),
            SupervisorError::ReadinessTimeout { timeout } => {
                write!(f, "service not ready after {}ms", timeout.as_millis())
            }
            SupervisorError::BackgroundLost => {
                write!(f, "supervising task ended without a readiness verdict")
            }
            SupervisorError::BackgroundPanicked { message } => {
                write!(f, "supervising task failed: {message}")
            }
            SupervisorError::Output(e) => write!(f, "{e}"),
            SupervisorError::MemCheck(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::InvalidPattern(e) => Some(e),
            SupervisorError::Config(e) => Some(e),
            SupervisorError::Lock(e) => Some(e),
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::Readiness(e) => Some(e),
            SupervisorError::Output(e) => Some(e),
            SupervisorError::MemCheck(e) => Some(e),
            _ => None,
        }
    }
}

/// Reasons a finished lifecycle does not pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// No output was collected (never started, or not yet stopped).
    NotCaptured,
    NotReady,
    TeardownTimeout,
    /// Memory checking was on but its log gave no usable summary.
    MemCheckUnavailable { reason: String },
    Outcome { outcome: Outcome, status: ProcessExit },
    EmptyStdout,
    UnexpectedStderr { stderr: String },
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::NotCaptured => write!(f, "no captured output to verify"),
            VerifyError::NotReady => write!(f, "service never reported readiness"),
            VerifyError::TeardownTimeout => {
                write!(f, "service had to be killed after unmount timed out")
            }
            VerifyError::MemCheckUnavailable { reason } => {
                write!(f, "no memory check result: {reason}")
            }
            VerifyError::Outcome { outcome, status } => write!(f, "{outcome} ({status})"),
            VerifyError::EmptyStdout => write!(f, "service produced no stdout"),
            VerifyError::UnexpectedStderr { stderr } => {
                write!(f, "service wrote to stderr: {}", stderr.trim_end())
            }
        }
    }
}

impl std::error::Error for VerifyError {}
