//! In-memory sandbox runtime
//!
//! Stands in for Docker in tests. Each session gets a map of files; commands
//! are answered by a behaviour function that sees the command line and the
//! sandbox files. The runtime records restarts, kills and how many commands
//! overlapped inside one sandbox.

use crate::locks::KeyedLocks;
use crate::runtime::{Acquired, FileEntry, Sandbox, SandboxRuntime, StopOutcome};
use crate::{Result, RunOutput, SandpitError, SessionKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a simulated command does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Finish after `after` with the given exit code and combined output
    Exit {
        code: i64,
        output: String,
        after: Duration,
    },
    /// Never finish
    Hang,
}

impl Behavior {
    pub fn exit(code: i64, output: impl Into<String>) -> Self {
        Self::Exit {
            code,
            output: output.into(),
            after: Duration::ZERO,
        }
    }
}

/// A command as seen by the behaviour function
#[derive(Debug)]
pub struct Invocation<'a> {
    pub command: &'a [String],
    pub files: &'a BTreeMap<PathBuf, Vec<u8>>,
}

impl Invocation<'_> {
    /// Contents of the file named by the last argument, if any
    #[must_use]
    pub fn target(&self) -> Option<String> {
        let path = Path::new(self.command.last()?);
        self.files
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    #[must_use]
    pub fn program(&self) -> &str {
        self.command.first().map_or("", String::as_str)
    }
}

type BehaviorFn = dyn Fn(&Invocation<'_>) -> Behavior + Send + Sync;

#[derive(Debug, Default, Clone)]
struct MemorySandbox {
    id: String,
    files: BTreeMap<PathBuf, Vec<u8>>,
    restarts: usize,
    kills: usize,
    active: usize,
    max_active: usize,
    stray_process: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    sandboxes: HashMap<SessionKey, MemorySandbox>,
    created: usize,
    fail_pushes: bool,
    fail_creates: bool,
}

pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
    behavior: Box<BehaviorFn>,
    create_delay: Duration,
    stop_delay: Duration,
    creation: KeyedLocks<SessionKey>,
}

impl MemoryRuntime {
    pub fn new(behavior: impl Fn(&Invocation<'_>) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            behavior: Box::new(behavior),
            create_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            creation: KeyedLocks::new(),
        }
    }

    /// Runtime whose interpreter understands a handful of Python one-liners
    ///
    /// `print(...)` of a literal echoes it, `while True` hangs, `1/0`
    /// fails with a traceback. The checker (`ruff`) flags lines using `==`
    /// as a statement.
    #[must_use]
    pub fn python() -> Self {
        Self::new(python_behavior)
    }

    /// Delay sandbox creation, widening the window for racing acquires
    #[must_use]
    pub const fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Delay sandbox removal, as a real container stop would
    #[must_use]
    pub const fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn set_fail_pushes(&self, fail: bool) {
        self.state.lock().fail_pushes = fail;
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.state.lock().fail_creates = fail;
    }

    /// Pretend a process from an earlier run survived
    pub fn leave_stray_process(&self, key: &SessionKey) {
        if let Some(sandbox) = self.state.lock().sandboxes.get_mut(key) {
            sandbox.stray_process = true;
        }
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.state.lock().created
    }

    #[must_use]
    pub fn is_live(&self, key: &SessionKey) -> bool {
        self.state.lock().sandboxes.contains_key(key)
    }

    #[must_use]
    pub fn sandbox_id(&self, key: &SessionKey) -> Option<String> {
        self.state.lock().sandboxes.get(key).map(|s| s.id.clone())
    }

    #[must_use]
    pub fn file(&self, key: &SessionKey, path: impl AsRef<Path>) -> Option<String> {
        let state = self.state.lock();
        let bytes = state.sandboxes.get(key)?.files.get(path.as_ref())?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    #[must_use]
    pub fn file_paths(&self, key: &SessionKey) -> Vec<PathBuf> {
        self.state
            .lock()
            .sandboxes
            .get(key)
            .map(|s| s.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn restarts(&self, key: &SessionKey) -> usize {
        self.state.lock().sandboxes.get(key).map_or(0, |s| s.restarts)
    }

    #[must_use]
    pub fn kills(&self, key: &SessionKey) -> usize {
        self.state.lock().sandboxes.get(key).map_or(0, |s| s.kills)
    }

    /// Most commands ever running at once in the session's sandbox
    #[must_use]
    pub fn max_concurrent(&self, key: &SessionKey) -> usize {
        self.state.lock().sandboxes.get(key).map_or(0, |s| s.max_active)
    }

    fn with_sandbox<T>(
        &self,
        sandbox: &Sandbox,
        f: impl FnOnce(&mut MemorySandbox) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock();
        match state.sandboxes.get_mut(&sandbox.session) {
            Some(live) if live.id == sandbox.id => Ok(f(live)),
            _ => Err(SandpitError::SandboxNotFound(sandbox.session.to_string())),
        }
    }
}

/// Decrements the active count when a command finishes or is abandoned
struct ActiveGuard<'a> {
    runtime: &'a MemoryRuntime,
    session: SessionKey,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(sandbox) = self.runtime.state.lock().sandboxes.get_mut(&self.session) {
            sandbox.active = sandbox.active.saturating_sub(1);
        }
    }
}

#[async_trait]
impl SandboxRuntime for MemoryRuntime {
    async fn acquire(&self, key: &SessionKey) -> Result<Acquired> {
        let _creating = self.creation.lock(key).await;

        {
            let state = self.state.lock();
            if state.fail_creates {
                return Err(SandpitError::CreationFailure("image not found".into()));
            }
            if let Some(existing) = state.sandboxes.get(key) {
                return Ok(Acquired::Existing(Sandbox {
                    id: existing.id.clone(),
                    name: key.container_name(),
                    session: key.clone(),
                }));
            }
        }

        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let mut state = self.state.lock();
        state.created += 1;
        let id = format!("mem-{}", state.created);
        state.sandboxes.insert(
            key.clone(),
            MemorySandbox {
                id: id.clone(),
                ..MemorySandbox::default()
            },
        );
        Ok(Acquired::Created(Sandbox {
            id,
            name: key.container_name(),
            session: key.clone(),
        }))
    }

    async fn find(&self, key: &SessionKey) -> Result<Option<Sandbox>> {
        Ok(self.state.lock().sandboxes.get(key).map(|live| Sandbox {
            id: live.id.clone(),
            name: key.container_name(),
            session: key.clone(),
        }))
    }

    async fn exec(&self, sandbox: &Sandbox, command: &[String]) -> Result<RunOutput> {
        let behavior = self.with_sandbox(sandbox, |live| {
            live.active += 1;
            live.max_active = live.max_active.max(live.active);
            (self.behavior)(&Invocation {
                command,
                files: &live.files,
            })
        })?;
        let _active = ActiveGuard {
            runtime: self,
            session: sandbox.session.clone(),
        };

        match behavior {
            Behavior::Exit {
                code,
                output,
                after,
            } => {
                if !after.is_zero() {
                    tokio::time::sleep(after).await;
                }
                Ok(RunOutput {
                    exit_code: code,
                    output: output.into_bytes(),
                    duration: after,
                    timed_out: false,
                    truncated: false,
                })
            }
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn kill_processes(&self, sandbox: &Sandbox) -> Result<()> {
        self.with_sandbox(sandbox, |live| {
            live.kills += 1;
            live.stray_process = false;
        })
    }

    async fn has_process(&self, sandbox: &Sandbox, _path: &Path) -> Result<bool> {
        self.with_sandbox(sandbox, |live| live.stray_process || live.active > 0)
    }

    async fn push_files(&self, sandbox: &Sandbox, dir: &Path, files: &[FileEntry]) -> Result<()> {
        if self.state.lock().fail_pushes {
            return Err(SandpitError::InjectionFailure("upload rejected".into()));
        }
        for file in files {
            crate::runtime::archive::validate_file_name(&file.name)?;
        }
        self.with_sandbox(sandbox, |live| {
            for file in files {
                live.files.insert(dir.join(&file.name), file.contents.clone());
            }
        })
    }

    async fn restart(&self, sandbox: &Sandbox) -> Result<()> {
        self.with_sandbox(sandbox, |live| {
            live.restarts += 1;
            live.stray_process = false;
        })
    }

    async fn sessions(&self) -> Result<Vec<SessionKey>> {
        Ok(self.state.lock().sandboxes.keys().cloned().collect())
    }

    async fn stop(&self, key: &SessionKey) -> Result<StopOutcome> {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        Ok(if self.state.lock().sandboxes.remove(key).is_some() {
            StopOutcome::Stopped
        } else {
            StopOutcome::NotFound
        })
    }
}

fn python_behavior(call: &Invocation<'_>) -> Behavior {
    let Some(source) = call.target() else {
        return Behavior::exit(2, "can't open file: No such file or directory");
    };

    if call.program() == "ruff" {
        let findings: Vec<String> = source
            .lines()
            .enumerate()
            .filter(|(_, line)| line.contains("==") && !line.trim_start().starts_with("if "))
            .map(|(n, _)| format!("script.py:{}:1: E001 comparison used as a statement", n + 1))
            .collect();
        return if findings.is_empty() {
            Behavior::exit(0, "")
        } else {
            Behavior::exit(1, findings.join("\n") + "\nFound errors.\n")
        };
    }

    let mut output = String::new();
    for line in source.lines().map(str::trim) {
        if line.starts_with("while True") {
            return Behavior::Hang;
        }
        if line == "1/0" {
            output.push_str(
                "Traceback (most recent call last):\n  File \"script.py\", line 1, in <module>\n    1/0\nZeroDivisionError: division by zero\n",
            );
            return Behavior::exit(1, output);
        }
        if let Some(arg) = line.strip_prefix("print(").and_then(|r| r.strip_suffix(')')) {
            let literal = arg.trim_matches(|c| c == '\'' || c == '"');
            output.push_str(literal);
            output.push('\n');
        }
    }
    Behavior::exit(0, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s).unwrap()
    }

    #[tokio::test]
    async fn files_are_per_session() {
        let runtime = MemoryRuntime::python();
        let a = runtime.acquire(&key("a")).await.unwrap().into_sandbox();
        let _b = runtime.acquire(&key("b")).await.unwrap();
        runtime
            .push_file(&a, Path::new("/sandbox/x.py"), b"print(1)")
            .await
            .unwrap();
        assert_eq!(runtime.file(&key("a"), "/sandbox/x.py").as_deref(), Some("print(1)"));
        assert!(runtime.file(&key("b"), "/sandbox/x.py").is_none());
    }

    #[tokio::test]
    async fn stale_handles_are_rejected_after_stop() {
        let runtime = MemoryRuntime::python();
        let old = runtime.acquire(&key("a")).await.unwrap().into_sandbox();
        assert_eq!(runtime.stop(&key("a")).await.unwrap(), StopOutcome::Stopped);
        assert_eq!(runtime.stop(&key("a")).await.unwrap(), StopOutcome::NotFound);
        let new = runtime.acquire(&key("a")).await.unwrap().into_sandbox();
        assert_ne!(old.id, new.id);
        assert!(matches!(
            runtime.restart(&old).await,
            Err(SandpitError::SandboxNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_kills_on_deadline() {
        let runtime = MemoryRuntime::new(|_| Behavior::Hang);
        let sandbox = runtime.acquire(&key("a")).await.unwrap().into_sandbox();
        let out = runtime
            .run(&sandbox, &["python3".into()], Duration::from_secs(30))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.is_success());
        assert_eq!(runtime.kills(&key("a")), 1);
        assert!(!runtime.has_process(&sandbox, Path::new("/x")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_reported_when_kill_fails() {
        let runtime = MemoryRuntime::new(|_| Behavior::Hang);
        let sandbox = runtime.acquire(&key("a")).await.unwrap().into_sandbox();

        // the sandbox disappears mid-run, so the kill has nothing to hit
        let command = ["python3".into()];
        let (out, stopped) = tokio::join!(
            runtime.run(&sandbox, &command, Duration::from_secs(30)),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                runtime.stop(&key("a")).await
            }
        );
        assert_eq!(stopped.unwrap(), StopOutcome::Stopped);
        let out = out.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, -1);
    }
}
