//! Session manager: lifecycle, execution and linting
//!
//! One `SandboxManager` is built at startup and shared as an `Arc`. It owns
//! the runtime, the session registry and the per-session execution locks.
//!
//! Every run on a session holds that session's lock from lookup until the
//! sandbox has been restarted, so two runs never overlap inside a sandbox.
//! A caller arriving while the lock is held waits up to `lock_wait` and is
//! then turned away with [`SandpitError::SandboxBusy`].

use crate::injector::CodeInjector;
use crate::locks::KeyedLocks;
use crate::registry::SessionRegistry;
use crate::runtime::{Sandbox, SandboxRuntime, StopOutcome};
use crate::separator::separate;
use crate::{
    ExecutionOutput, LintReport, ManagerConfig, Result, RunOutput, SandpitError, SessionKey,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// What a reaper pass did with one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Sandbox destroyed (or already gone) and entry removed
    Reaped(StopOutcome),
    /// A run holds the session lock; left for a later pass
    Busy,
    /// Touched again since the expiry scan; kept
    Refreshed,
}

pub struct SandboxManager {
    runtime: Arc<dyn SandboxRuntime>,
    registry: SessionRegistry,
    sessions: KeyedLocks<SessionKey>,
    config: ManagerConfig,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: ManagerConfig) -> Self {
        Self {
            runtime,
            registry: SessionRegistry::new(),
            sessions: KeyedLocks::new(),
            config,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn injector(&self) -> CodeInjector<'_> {
        CodeInjector::new(self.runtime.as_ref(), &self.config.sandbox)
    }

    async fn lock_session(&self, key: &SessionKey) -> Result<OwnedMutexGuard<()>> {
        self.sessions
            .lock_within(key, self.config.lock_wait)
            .await
            .ok_or_else(|| {
                tracing::warn!(session = %key, "session lock wait exceeded");
                SandpitError::SandboxBusy(key.to_string())
            })
    }

    /// Look up the session's live sandbox
    async fn locate(&self, key: &SessionKey) -> Result<Sandbox> {
        if let Some(sandbox) = self.runtime.find(key).await? {
            Ok(sandbox)
        } else {
            self.registry.remove(key);
            Err(SandpitError::SandboxNotFound(key.to_string()))
        }
    }

    /// Create the session's sandbox, or reuse the one it already has
    pub async fn start(&self, key: &SessionKey) -> Result<()> {
        let _guard = self.lock_session(key).await?;

        let acquired = self.runtime.acquire(key).await.map_err(|e| match e {
            SandpitError::CreationFailure(_) => e,
            other => SandpitError::CreationFailure(other.to_string()),
        })?;

        if acquired.is_created() {
            if let Err(e) = self.injector().install_helper(acquired.sandbox()).await {
                // a retried START must create afresh, not reuse a sandbox without the helper
                if let Err(stop) = self.runtime.stop(key).await {
                    tracing::warn!(session = %key, error = %stop, "failed to discard half-initialised sandbox");
                }
                return Err(e);
            }
        }

        self.registry.touch(key);
        tracing::info!(
            session = %key,
            sandbox = %acquired.sandbox().name,
            created = acquired.is_created(),
            "session started"
        );
        Ok(())
    }

    /// Run `code` and split its output into document and text
    pub async fn execute(&self, key: &SessionKey, code: &str) -> Result<ExecutionOutput> {
        let mut command = self.config.sandbox.interpreter.clone();
        command.push(self.script_arg());

        let run = self.run_guarded(key, code, &command).await?;
        let output = run.output_str();
        if !run.is_success() {
            tracing::debug!(session = %key, exit_code = run.exit_code, "script failed");
            return Err(SandpitError::ExecutionFailure(output));
        }

        let separated = separate(&output);
        Ok(ExecutionOutput {
            html: separated.document,
            text: separated.residual,
        })
    }

    /// Run the checker over `code` and pass its report through
    pub async fn lint(&self, key: &SessionKey, code: &str) -> Result<LintReport> {
        let mut command = self.config.sandbox.lint_command.clone();
        command.push(self.script_arg());

        let run = self.run_guarded(key, code, &command).await?;
        let output = run.output_str();
        if !run.is_success() {
            return Err(SandpitError::LintFailure(output));
        }
        Ok(LintReport {
            report: output.trim().to_owned(),
        })
    }

    /// Store editor tabs in the sandbox's tabs directory
    pub async fn save_tabs(&self, key: &SessionKey, tabs: &BTreeMap<String, String>) -> Result<()> {
        let _guard = self.lock_session(key).await?;
        let sandbox = self.locate(key).await?;
        self.registry.touch(key);
        self.injector().save_tabs(&sandbox, tabs).await
    }

    /// Destroy the session's sandbox
    pub async fn stop(&self, key: &SessionKey) -> Result<()> {
        let guard = self.lock_session(key).await?;
        let outcome = self.runtime.stop(key).await;
        self.registry.remove(key);
        drop(guard);
        self.sessions.prune(key);

        match outcome? {
            StopOutcome::Stopped => Ok(()),
            StopOutcome::NotFound => Err(SandpitError::SandboxNotFound(key.to_string())),
        }
    }

    /// Reclaim one session idle for longer than `ttl`
    ///
    /// Skipped while a run holds the session lock. Idleness is checked again
    /// under the lock, so a session touched after the expiry scan survives.
    pub async fn reap(&self, key: &SessionKey, ttl: Duration) -> Result<ReapOutcome> {
        let Some(guard) = self.sessions.try_lock(key) else {
            return Ok(ReapOutcome::Busy);
        };
        if self.registry.last_access(key).is_some_and(|last| last.elapsed() <= ttl) {
            return Ok(ReapOutcome::Refreshed);
        }
        let outcome = self.runtime.stop(key).await?;
        self.registry.remove(key);
        drop(guard);
        self.sessions.prune(key);
        Ok(ReapOutcome::Reaped(outcome))
    }

    /// Register sandboxes the backend already holds, e.g. from an earlier daemon
    ///
    /// Adopted sessions count as freshly touched, so the reaper reclaims
    /// them one TTL from now unless they are used. Returns how many were added.
    pub async fn adopt_existing(&self) -> Result<usize> {
        let mut adopted = 0;
        for key in self.runtime.sessions().await? {
            if !self.registry.contains(&key) {
                self.registry.touch(&key);
                adopted += 1;
            }
        }
        if adopted > 0 {
            tracing::info!(adopted, "registered sandboxes left by an earlier run");
        }
        Ok(adopted)
    }

    /// Number of sessions with a registry entry
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    fn script_arg(&self) -> String {
        self.config.sandbox.script_path().to_string_lossy().into_owned()
    }

    /// Lock, inject, run under the deadline, then restart the sandbox
    async fn run_guarded(&self, key: &SessionKey, code: &str, command: &[String]) -> Result<RunOutput> {
        let _guard = self.lock_session(key).await?;
        let sandbox = self.locate(key).await?;
        self.registry.touch(key);

        let result = self.inject_and_run(&sandbox, code, command).await;

        if let Err(e) = self.runtime.restart(&sandbox).await {
            tracing::warn!(session = %key, error = %e, "sandbox restart after run failed");
        }
        result
    }

    async fn inject_and_run(&self, sandbox: &Sandbox, code: &str, command: &[String]) -> Result<RunOutput> {
        let script = self.config.sandbox.script_path();
        match self.runtime.has_process(sandbox, &script).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!(sandbox = %sandbox.name, "leftover script process, restarting first");
                self.runtime.restart(sandbox).await?;
            }
            Err(e @ SandpitError::SandboxNotFound(_)) => return Err(e),
            Err(e) => tracing::warn!(sandbox = %sandbox.name, error = %e, "liveness probe failed"),
        }

        self.injector().inject_script(sandbox, code).await?;

        let timeout = self.config.sandbox.timeout;
        let run = self.runtime.run(sandbox, command, timeout).await?;
        if run.timed_out {
            tracing::info!(sandbox = %sandbox.name, timeout_secs = timeout.as_secs(), "run timed out");
            return Err(SandpitError::ExecutionTimeout(timeout.as_secs()));
        }

        tracing::debug!(
            sandbox = %sandbox.name,
            exit_code = run.exit_code,
            duration_ms = u64::try_from(run.duration.as_millis()).unwrap_or(u64::MAX),
            "run finished"
        );
        Ok(run)
    }
}
