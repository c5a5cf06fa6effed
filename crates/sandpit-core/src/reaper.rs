//! Background reclamation of idle sandboxes

use crate::manager::{ReapOutcome, SandboxManager};
use crate::runtime::StopOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Counts from one reaper pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub reaped: usize,
    pub already_gone: usize,
    pub busy: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Periodically stops sandboxes whose session has gone idle
pub struct IdleReaper {
    manager: Arc<SandboxManager>,
    interval: Duration,
    ttl: Duration,
}

impl IdleReaper {
    #[must_use]
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let interval = manager.config().reap_interval;
        let ttl = manager.config().idle_ttl;
        Self {
            manager,
            interval,
            ttl,
        }
    }

    /// One scan of the registry
    ///
    /// A failure on one session is logged and the pass moves on.
    pub async fn pass(&self) -> ReapSummary {
        let mut summary = ReapSummary::default();
        let expired = self.manager.registry().scan_expired(self.ttl);

        for key in expired {
            match self.manager.reap(&key, self.ttl).await {
                Ok(ReapOutcome::Reaped(StopOutcome::Stopped)) => {
                    tracing::info!(session = %key, "reaped idle sandbox");
                    summary.reaped += 1;
                }
                Ok(ReapOutcome::Reaped(StopOutcome::NotFound)) => {
                    tracing::debug!(session = %key, "idle sandbox already gone");
                    summary.already_gone += 1;
                }
                Ok(ReapOutcome::Busy) => summary.busy += 1,
                Ok(ReapOutcome::Refreshed) => summary.refreshed += 1,
                Err(e) => {
                    tracing::warn!(session = %key, error = %e, "failed to reap sandbox");
                    summary.failed += 1;
                }
            }
        }

        if summary != ReapSummary::default() {
            tracing::info!(
                reaped = summary.reaped,
                already_gone = summary.already_gone,
                busy = summary.busy,
                refreshed = summary.refreshed,
                failed = summary.failed,
                "reaper pass finished"
            );
        }
        summary
    }

    /// Run passes every interval until `shutdown` flips to true or closes
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            ttl_secs = self.ttl.as_secs(),
            "idle reaper running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.pass().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("idle reaper stopped");
    }

    /// Start the loop on the current runtime
    #[must_use]
    pub fn spawn(self) -> ReaperHandle {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        ReaperHandle { shutdown: tx, task }
    }
}

/// Handle to a spawned reaper
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the loop and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "reaper task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SandboxRuntime;
    use crate::testing::MemoryRuntime;
    use crate::{ManagerConfig, SessionKey};

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s).unwrap()
    }

    fn setup() -> (Arc<MemoryRuntime>, Arc<SandboxManager>) {
        let runtime = Arc::new(MemoryRuntime::python());
        let config = ManagerConfig {
            idle_ttl: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(300),
            ..ManagerConfig::default()
        };
        let manager = Arc::new(SandboxManager::new(runtime.clone(), config));
        (runtime, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn pass_reaps_only_expired_sessions() {
        let (runtime, manager) = setup();
        manager.start(&key("idle")).await.unwrap();
        manager.start(&key("active")).await.unwrap();

        tokio::time::advance(Duration::from_secs(3000)).await;
        manager.execute(&key("active"), "print(1)").await.unwrap();
        tokio::time::advance(Duration::from_secs(700)).await;

        let summary = IdleReaper::new(Arc::clone(&manager)).pass().await;
        assert_eq!(summary.reaped, 1);
        assert!(!runtime.is_live(&key("idle")));
        assert!(!manager.registry().contains(&key("idle")));
        assert!(runtime.is_live(&key("active")));
        assert!(manager.registry().contains(&key("active")));
    }

    #[tokio::test(start_paused = true)]
    async fn already_removed_sandbox_counts_as_success() {
        let (runtime, manager) = setup();
        manager.start(&key("u1")).await.unwrap();
        runtime.stop(&key("u1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(3601)).await;

        let summary = IdleReaper::new(Arc::clone(&manager)).pass().await;
        assert_eq!(summary.already_gone, 1);
        assert_eq!(summary.failed, 0);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_touched_during_pass_survives() {
        let runtime = Arc::new(MemoryRuntime::python().with_stop_delay(Duration::from_secs(5)));
        let manager = Arc::new(SandboxManager::new(runtime.clone(), ManagerConfig::default()));
        manager.start(&key("a")).await.unwrap();
        manager.start(&key("b")).await.unwrap();
        tokio::time::advance(Duration::from_secs(3601)).await;

        let reaper = IdleReaper::new(Arc::clone(&manager));
        let pass = tokio::spawn(async move { reaper.pass().await });

        // the first stop is under way; both sessions see fresh traffic
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.registry().touch(&key("a"));
        manager.registry().touch(&key("b"));

        let summary = pass.await.unwrap();
        assert_eq!(summary.reaped, 1);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(
            usize::from(runtime.is_live(&key("a"))) + usize::from(runtime.is_live(&key("b"))),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_reaps_and_shuts_down() {
        let (runtime, manager) = setup();
        manager.start(&key("u1")).await.unwrap();

        let handle = IdleReaper::new(Arc::clone(&manager)).spawn();
        // expiry needs > 1h idle; the pass after that runs at the 65 minute tick
        tokio::time::sleep(Duration::from_secs(66 * 60)).await;
        assert!(!runtime.is_live(&key("u1")));

        handle.shutdown().await;
    }
}
