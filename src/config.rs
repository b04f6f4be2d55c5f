use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that turns on memory-checker wrapping.
pub const MEMCHECK_ENV: &str = "BCACHEFS_TEST_USE_VALGRIND";

/// Top-level configuration loaded from harness.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct HarnessConfig {
    pub service: ServiceConfig,
    pub readiness: ReadinessConfig,
    pub shutdown: ShutdownConfig,
    pub markers: MarkersConfig,
    pub memcheck: MemcheckConfig,
}

/// How to launch the filesystem in foreground mount mode.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub command: String,
    /// `{device}` and `{mountpoint}` are substituted at spawn time.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub pattern: String,
    pub timeout_secs: u64,
}

/// External unmount request and the bound on waiting for the service to exit.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MarkersConfig {
    pub literals: Vec<String>,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MemcheckConfig {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    /// Relative paths resolve against the config file's directory. An empty
    /// path disables the suppressions argument.
    pub suppressions: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command: "bcachefs".to_string(),
            args: vec![
                "fusemount".to_string(),
                "-f".to_string(),
                "{device}".to_string(),
                "{mountpoint}".to_string(),
            ],
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            pattern: r"^Fuse mount initialized\.$".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            command: "fusermount3".to_string(),
            args: vec!["-zu".to_string(), "{mountpoint}".to_string()],
            timeout_secs: 5,
        }
    }
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            literals: vec![
                "btree iterators leaked!".to_string(),
                "emergency read only!".to_string(),
            ],
            patterns: Vec::new(),
        }
    }
}

impl Default for MemcheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "valgrind".to_string(),
            args: vec![
                "--leak-check=full".to_string(),
                "--gen-suppressions=all".to_string(),
            ],
            suppressions: Some(PathBuf::from("valgrind-suppressions.txt")),
        }
    }
}

impl MemcheckConfig {
    fn resolve_paths(&mut self, base: &Path) {
        match self.suppressions.take() {
            Some(supp) if supp.as_os_str().is_empty() => {}
            Some(supp) if supp.is_relative() => self.suppressions = Some(base.join(supp)),
            other => self.suppressions = other,
        }
    }
}

impl HarnessConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<HarnessConfig, ConfigError> {
        let mut config: HarnessConfig = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                HarnessConfig::default()
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        config.memcheck.resolve_paths(base);
        Ok(config)
    }

    /// Apply environment overrides (`BCACHEFS_TEST_USE_VALGRIND=yes`).
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(MEMCHECK_ENV) {
            self.apply_memcheck_flag(&v);
        }
    }

    fn apply_memcheck_flag(&mut self, value: &str) {
        self.memcheck.enabled = value == "yes";
    }
}

/// Replace `{device}` and `{mountpoint}` placeholders in argument templates.
///
/// Both paths must be valid UTF-8; they are never lossily converted.
pub fn expand_args(
    templates: &[String],
    device: &Path,
    mountpoint: &Path,
) -> Result<Vec<String>, ConfigError> {
    fn utf8(path: &Path) -> Result<&str, ConfigError> {
        path.to_str().ok_or_else(|| ConfigError::NonUtf8Path {
            path: path.to_path_buf(),
        })
    }
    let device = utf8(device)?;
    let mountpoint = utf8(mountpoint)?;
    Ok(templates
        .iter()
        .map(|arg| {
            arg.replace("{device}", device)
                .replace("{mountpoint}", mountpoint)
        })
        .collect())
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A device or mount path that cannot be passed on as UTF-8 text.
    NonUtf8Path { path: PathBuf },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::NonUtf8Path { path } => {
                write!(f, "path is not valid UTF-8: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::NonUtf8Path { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = HarnessConfig::load(&dir.path().join("harness.toml")).unwrap();
        assert_eq!(config.service.command, "bcachefs");
        assert_eq!(config.shutdown.timeout_secs, 5);
        assert!(!config.memcheck.enabled);
        assert_eq!(config.markers.literals.len(), 2);
        assert_eq!(
            config.memcheck.suppressions,
            Some(dir.path().join("valgrind-suppressions.txt"))
        );
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(
            &path,
            r#"
[service]
command = "/usr/local/sbin/bcachefs"

[markers]
patterns = ["fatal error in .*"]

[memcheck]
enabled = true
suppressions = "valgrind-suppressions.txt"
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.service.command, "/usr/local/sbin/bcachefs");
        assert_eq!(config.service.args[0], "fusemount");
        assert_eq!(config.readiness.pattern, r"^Fuse mount initialized\.$");
        assert_eq!(config.markers.patterns, vec!["fatal error in .*"]);
        // Section present but `literals` omitted: the section default applies
        assert_eq!(config.markers.literals.len(), 2);
        assert!(config.memcheck.enabled);
        assert_eq!(
            config.memcheck.suppressions,
            Some(dir.path().join("valgrind-suppressions.txt"))
        );
        assert_eq!(config.memcheck.command, "valgrind");
    }

    #[test]
    fn test_suppressions_absolute_or_disabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harness.toml");

        std::fs::write(&path, "[memcheck]\nsuppressions = \"/etc/vg.supp\"\n").unwrap();
        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.memcheck.suppressions, Some(PathBuf::from("/etc/vg.supp")));

        std::fs::write(&path, "[memcheck]\nsuppressions = \"\"\n").unwrap();
        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.memcheck.suppressions, None);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "[service\ncommand = ").unwrap();
        let err = HarnessConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_memcheck_flag_requires_yes() {
        let mut config = HarnessConfig::default();
        config.apply_memcheck_flag("yes");
        assert!(config.memcheck.enabled);
        config.apply_memcheck_flag("no");
        assert!(!config.memcheck.enabled);
        config.apply_memcheck_flag("1");
        assert!(!config.memcheck.enabled);
    }

    #[test]
    fn test_expand_args_substitutes_placeholders() {
        let config = ServiceConfig::default();
        let args = expand_args(
            &config.args,
            Path::new("/tmp/dev-1g"),
            Path::new("/tmp/mnt"),
        )
        .unwrap();
        assert_eq!(args, vec!["fusemount", "-f", "/tmp/dev-1g", "/tmp/mnt"]);
    }

    #[test]
    fn test_expand_args_without_placeholders() {
        let args = expand_args(
            &["-zu".to_string(), "fixed".to_string()],
            Path::new("d"),
            Path::new("m"),
        )
        .unwrap();
        assert_eq!(args, vec!["-zu", "fixed"]);
    }

    #[test]
    fn test_expand_args_repeated_placeholder() {
        let args = expand_args(
            &["{mountpoint}/a:{mountpoint}/b".to_string()],
            Path::new("d"),
            Path::new("/m"),
        )
        .unwrap();
        assert_eq!(args, vec!["/m/a:/m/b"]);
    }

    #[test]
    fn test_expand_args_rejects_non_utf8_path() {
        use std::os::unix::ffi::OsStrExt;
        let mnt = Path::new(std::ffi::OsStr::from_bytes(b"/tmp/mnt-\xff"));
        let err = expand_args(&["{mountpoint}".to_string()], Path::new("d"), mnt).unwrap_err();
        assert!(matches!(err, ConfigError::NonUtf8Path { ref path } if path == mnt));
    }
}
