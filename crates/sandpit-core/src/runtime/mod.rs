//! Sandbox runtime: the capability surface over the isolation backend
//!
//! A runtime creates, finds, restarts and destroys one container per
//! session, runs commands inside it and materialises files in it. The
//! wall-clock deadline for a run lives here, on the caller side, because
//! nothing inside the sandbox can be trusted to enforce it.

pub mod archive;
pub mod docker;

use crate::{Result, RunOutput, SessionKey};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

pub use docker::DockerRuntime;

/// Handle to one live sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    /// Backend-assigned id
    pub id: String,
    /// Name derived from the session key
    pub name: String,
    /// Owning session
    pub session: SessionKey,
}

/// Result of `acquire`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    /// A new sandbox was created for the session
    Created(Sandbox),
    /// The session's existing sandbox was reused
    Existing(Sandbox),
}

impl Acquired {
    #[must_use]
    pub const fn sandbox(&self) -> &Sandbox {
        match self {
            Self::Created(sandbox) | Self::Existing(sandbox) => sandbox,
        }
    }

    #[must_use]
    pub fn into_sandbox(self) -> Sandbox {
        match self {
            Self::Created(sandbox) | Self::Existing(sandbox) => sandbox,
        }
    }

    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Result of `stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotFound,
}

/// A file to materialise inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub contents: Vec<u8>,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Return the session's sandbox, creating it with the fixed caps if absent
    ///
    /// Concurrent calls for one key must converge on a single sandbox.
    async fn acquire(&self, key: &SessionKey) -> Result<Acquired>;

    /// Look up the session's running sandbox without creating one
    async fn find(&self, key: &SessionKey) -> Result<Option<Sandbox>>;

    /// Run `command` to completion and capture combined output
    ///
    /// No deadline is applied here; see [`SandboxRuntime::run`].
    async fn exec(&self, sandbox: &Sandbox, command: &[String]) -> Result<RunOutput>;

    /// Forcibly terminate every process inside the sandbox
    async fn kill_processes(&self, sandbox: &Sandbox) -> Result<()>;

    /// Whether a process with `path` among its arguments is still alive
    async fn has_process(&self, sandbox: &Sandbox, path: &Path) -> Result<bool>;

    /// Write `files` into `dir` as one bundle: all of them land or none do
    async fn push_files(&self, sandbox: &Sandbox, dir: &Path, files: &[FileEntry]) -> Result<()>;

    /// Reset running processes, keeping identity, caps and filesystem
    async fn restart(&self, sandbox: &Sandbox) -> Result<()>;

    /// Sessions that currently own a sandbox, running or not
    async fn sessions(&self) -> Result<Vec<SessionKey>>;

    /// Halt and destroy the session's sandbox
    async fn stop(&self, key: &SessionKey) -> Result<StopOutcome>;

    /// Run `command` under a wall-clock deadline
    ///
    /// On expiry the process tree is killed, not merely abandoned, and the
    /// returned output is marked as timed out even if the kill itself fails.
    async fn run(&self, sandbox: &Sandbox, command: &[String], timeout: Duration) -> Result<RunOutput> {
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, self.exec(sandbox, command)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    sandbox = %sandbox.name,
                    timeout_secs = timeout.as_secs(),
                    "deadline exceeded, killing sandbox processes"
                );
                if let Err(e) = self.kill_processes(sandbox).await {
                    tracing::error!(sandbox = %sandbox.name, error = %e, "failed to kill timed-out run");
                }
                Ok(RunOutput {
                    exit_code: -1,
                    duration: started.elapsed(),
                    timed_out: true,
                    ..RunOutput::default()
                })
            }
        }
    }

    /// Write a single file at `path`
    async fn push_file(&self, sandbox: &Sandbox, path: &Path, contents: &[u8]) -> Result<()> {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(crate::SandpitError::InjectionFailure(format!(
                "not a file path: {}",
                path.display()
            )));
        };
        let entry = FileEntry::new(name.to_string_lossy(), contents);
        self.push_files(sandbox, dir, std::slice::from_ref(&entry)).await
    }
}
