/// Outcome classification for a finished service process.
///
/// A zero exit status is not enough: the service may detect its own defects
/// (leaked iterators, forced read-only mode) and still exit cleanly. Those
/// are recognised through a configurable [`MarkerSet`].
use crate::config::MarkersConfig;
use regex::Regex;
use std::os::unix::process::ExitStatusExt;

/// Exit status recorded in place of 0 when a debug-assertion marker was seen.
pub const SILENT_DEFECT_EXIT: i32 = nix::errno::Errno::ENOMSG as i32;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessExit {
    Code(i32),
    Signal(i32),
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit::Code(code),
            (None, Some(sig)) => ProcessExit::Signal(sig),
            // Neither code nor signal: treat as a generic failure
            (None, None) => ProcessExit::Code(-1),
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {code}"),
            ProcessExit::Signal(sig) => match nix::sys::signal::Signal::try_from(*sig) {
                Ok(signal) => write!(f, "killed by {signal}"),
                Err(_) => write!(f, "killed by signal {sig}"),
            },
        }
    }
}

/// Semantic result of a supervised run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Outcome {
    Clean,
    /// Killed by a signal, or exited with an unexpected non-zero status.
    AbnormalTermination { exit: ProcessExit },
    /// Exited 0 but printed a debug-assertion marker.
    DebugAssertionObserved { marker: String },
    /// The memory checker reported errors.
    MemoryViolation { errors: u64 },
}

impl Outcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, Outcome::Clean)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Clean => write!(f, "clean exit"),
            Outcome::AbnormalTermination { exit } => write!(f, "abnormal termination ({exit})"),
            Outcome::DebugAssertionObserved { marker } => {
                write!(f, "debug assertion in output: {marker:?}")
            }
            Outcome::MemoryViolation { errors } => {
                write!(f, "memory checker reported {errors} errors")
            }
        }
    }
}

/// One output predicate signalling an internally detected defect.
#[derive(Debug, Clone)]
pub enum Marker {
    Literal(String),
    Pattern(Regex),
}

impl Marker {
    /// Return the matched text if this marker occurs in `output`.
    fn find(&self, output: &str) -> Option<String> {
        match self {
            Marker::Literal(s) => output.contains(s.as_str()).then(|| s.clone()),
            Marker::Pattern(re) => re.find(output).map(|m| m.as_str().to_string()),
        }
    }
}

/// The set of debug-assertion markers checked on a clean exit.
#[derive(Debug, Clone, Default)]
pub struct MarkerSet {
    markers: Vec<Marker>,
}

impl MarkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a literal substring marker.
    pub fn literal(mut self, text: impl Into<String>) -> Self {
        self.markers.push(Marker::Literal(text.into()));
        self
    }

    /// Add a regex marker.
    pub fn pattern(mut self, re: Regex) -> Self {
        self.markers.push(Marker::Pattern(re));
        self
    }

    pub fn from_config(config: &MarkersConfig) -> Result<Self, regex::Error> {
        let mut set = MarkerSet::new();
        for lit in &config.literals {
            set = set.literal(lit.clone());
        }
        for pat in &config.patterns {
            set = set.pattern(Regex::new(pat)?);
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// First marker found in `output`, in insertion order.
    pub fn find(&self, output: &str) -> Option<String> {
        self.markers.iter().find_map(|m| m.find(output))
    }
}

/// Classify a finished process from its exit and combined output.
///
/// Signals win; a zero exit is downgraded when a marker is present; any other
/// non-zero exit is abnormal. Memory violations come from the memory checker,
/// never from here.
pub fn classify(exit: ProcessExit, output: &str, markers: &MarkerSet) -> Outcome {
    match exit {
        ProcessExit::Signal(_) => Outcome::AbnormalTermination { exit },
        ProcessExit::Code(0) => match markers.find(output) {
            Some(marker) => {
                tracing::warn!(marker = %marker, "debug error found in output");
                Outcome::DebugAssertionObserved { marker }
            }
            None => Outcome::Clean,
        },
        ProcessExit::Code(_) => Outcome::AbnormalTermination { exit },
    }
}
