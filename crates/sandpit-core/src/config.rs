//! Sandbox and manager configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by every sandbox container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container image holding the interpreter and the checker
    pub image: String,

    /// OCI runtime, e.g. `runsc` for gVisor (None uses the daemon default)
    pub oci_runtime: Option<String>,

    /// Memory limit in bytes
    pub memory_limit: u64,

    /// CPU quota in microseconds per 100ms period
    pub cpu_quota: i64,

    /// Maximum number of processes/threads
    pub max_pids: i64,

    /// Allow network access
    pub allow_network: bool,

    /// Working directory inside sandbox
    pub workdir: PathBuf,

    /// Interpreter command the script path is appended to
    pub interpreter: Vec<String>,

    /// Checker command the script path is appended to
    pub lint_command: Vec<String>,

    /// Maximum execution time
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Combined output beyond this many bytes is dropped
    pub max_output_bytes: usize,

    /// User to run commands as inside the container
    pub user: Option<String>,

    /// Environment variables
    pub env: Vec<(String, String)>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".into(),
            oci_runtime: None,
            memory_limit: 256 * 1024 * 1024, // 256MB
            cpu_quota: 50_000,
            max_pids: 64,
            allow_network: false,
            workdir: PathBuf::from("/sandbox"),
            interpreter: vec!["python3".into()],
            lint_command: vec!["ruff".into(), "check".into(), "--no-fix".into()],
            timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
            user: None,
            env: vec![
                ("PYTHONUNBUFFERED".into(), "1".into()),
                ("HOME".into(), "/sandbox".into()),
                ("MPLBACKEND".into(), "Agg".into()),
            ],
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Canonical location of the user script
    #[must_use]
    pub fn script_path(&self) -> PathBuf {
        self.workdir.join(SCRIPT_FILE)
    }

    /// Location of the document helper pushed at creation
    #[must_use]
    pub fn helper_path(&self) -> PathBuf {
        self.workdir.join(HELPER_FILE)
    }

    /// Directory receiving saved editor tabs
    #[must_use]
    pub fn tabs_dir(&self) -> PathBuf {
        self.workdir.join(TABS_DIR)
    }
}

/// File name of the user script inside the workdir
pub const SCRIPT_FILE: &str = "script.py";

/// File name of the document helper inside the workdir
pub const HELPER_FILE: &str = "playground.py";

/// Directory name for saved tabs inside the workdir
pub const TABS_DIR: &str = "tabs";

/// Builder for SandboxConfig
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    #[must_use]
    pub fn oci_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.config.oci_runtime = Some(runtime.into());
        self
    }

    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.memory_limit = bytes;
        self
    }

    #[must_use]
    pub fn memory_limit_mb(self, mb: u64) -> Self {
        self.memory_limit(mb * 1024 * 1024)
    }

    #[must_use]
    pub fn cpu_quota(mut self, micros: i64) -> Self {
        self.config.cpu_quota = micros;
        self
    }

    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = duration;
        self
    }

    #[must_use]
    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    #[must_use]
    pub fn allow_network(mut self, allow: bool) -> Self {
        self.config.allow_network = allow;
        self
    }

    #[must_use]
    pub fn workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workdir = path.into();
        self
    }

    #[must_use]
    pub fn interpreter(mut self, command: Vec<String>) -> Self {
        self.config.interpreter = command;
        self
    }

    #[must_use]
    pub fn lint_command(mut self, command: Vec<String>) -> Self {
        self.config.lint_command = command;
        self
    }

    #[must_use]
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.config.max_output_bytes = bytes;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

/// Configuration for the session manager and its reaper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Settings applied to every sandbox
    pub sandbox: SandboxConfig,

    /// How long an overlapping run waits for the session lock before rejection
    #[serde(with = "duration_secs")]
    pub lock_wait: Duration,

    /// Sandboxes idle for longer than this are reclaimed
    #[serde(with = "duration_secs")]
    pub idle_ttl: Duration,

    /// Interval between reaper passes
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            lock_wait: Duration::from_secs(40),
            idle_ttl: Duration::from_secs(60 * 60),
            reap_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Get default socket path from SANDPIT_SOCKET env var or system default
///
/// Returns:
/// - `$SANDPIT_SOCKET` if set (for development)
/// - `/run/sandpit/sandpit.sock` otherwise (production)
pub fn default_socket_path() -> PathBuf {
    std::env::var("SANDPIT_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/sandpit/sandpit.sock"))
}

/// Serde adapter storing a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
