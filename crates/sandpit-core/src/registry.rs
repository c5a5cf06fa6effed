//! Session registry: last-access bookkeeping for live sandboxes

use crate::SessionKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Map of session to last access time
///
/// Request handlers touch entries while the reaper scans and removes them,
/// so every access goes through the one lock. Scans return a snapshot and
/// never hold the lock across backend calls.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<SessionKey, Instant>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the entry for `key`
    pub fn touch(&self, key: &SessionKey) {
        self.entries.lock().insert(key.clone(), Instant::now());
    }

    /// Sessions not touched for longer than `ttl`
    #[must_use]
    pub fn scan_expired(&self, ttl: Duration) -> Vec<SessionKey> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > ttl)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop the entry for `key`, returning whether it existed
    pub fn remove(&self, key: &SessionKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    #[must_use]
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    #[must_use]
    pub fn last_access(&self, key: &SessionKey) -> Option<Instant> {
        self.entries.lock().get(key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_follows_last_touch() {
        let registry = SessionRegistry::new();
        registry.touch(&key("old"));
        tokio::time::advance(Duration::from_secs(50)).await;
        registry.touch(&key("fresh"));
        tokio::time::advance(Duration::from_secs(20)).await;

        let expired = registry.scan_expired(Duration::from_secs(60));
        assert_eq!(expired, vec![key("old")]);

        registry.touch(&key("old"));
        assert!(registry.scan_expired(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn remove_reports_presence() {
        let registry = SessionRegistry::new();
        registry.touch(&key("a"));
        assert!(registry.contains(&key("a")));
        assert!(registry.remove(&key("a")));
        assert!(!registry.remove(&key("a")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn concurrent_touch_and_scan() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let k = key(&format!("s{i}"));
                for _ in 0..100 {
                    registry.touch(&k);
                    let _ = registry.scan_expired(Duration::ZERO);
                }
                registry.remove(&k);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.len(), 0);
    }
}
