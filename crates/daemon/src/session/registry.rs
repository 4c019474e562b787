//! Principal to session mapping.
//!
//! At most one session exists per principal. Installing a session for a
//! principal that already has one swaps it in under the lock and hands the
//! previous session back to the caller for teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::Principal;

use super::handle::Session;

/// Concurrency-safe map from principal to its live session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Principal, Arc<Session>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Principal, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Installs `session` and returns the one it replaced.
    pub fn install(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.lock().insert(session.principal(), session)
    }

    /// Removes the principal's session.
    pub fn remove(&self, principal: Principal) -> Option<Arc<Session>> {
        self.lock().remove(&principal)
    }

    /// Removes the principal's session only if it is `session`.
    ///
    /// A channel tearing down an old session must not evict its replacement.
    pub fn remove_if(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.lock();
        match sessions.get(&session.principal()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.principal());
                true
            }
            _ => false,
        }
    }

    /// Returns the principal's session.
    pub fn get(&self, principal: Principal) -> Option<Arc<Session>> {
        self.lock().get(&principal).cloned()
    }

    /// Returns true if the principal has a session.
    pub fn contains(&self, principal: Principal) -> bool {
        self.lock().contains_key(&principal)
    }

    /// Returns all sessions.
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.lock().values().cloned().collect()
    }

    /// Number of sessions.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.lock().drain().map(|(_, session)| session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::{ChildProcess, PtyBackend, UnixPtyBackend, WindowSize};
    use nix::unistd::Pid;

    /// A session whose child is never spawned. Its pid is the test process
    /// itself, and nothing in these tests signals it.
    fn session(principal: i64) -> Arc<Session> {
        let pair = UnixPtyBackend::new().allocate(WindowSize::default()).unwrap();
        drop(pair.target);
        Arc::new(Session::new(
            Principal(principal),
            pair.controller,
            ChildProcess::new(Pid::this()),
            WindowSize::default(),
            std::env::temp_dir(),
            Vec::new(),
        ))
    }

    #[test]
    fn test_install_and_get() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        let s = session(1);
        assert!(registry.install(Arc::clone(&s)).is_none());
        assert!(registry.contains(Principal(1)));
        assert!(Arc::ptr_eq(&registry.get(Principal(1)).unwrap(), &s));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_install_replaces_previous() {
        let registry = SessionRegistry::new();
        let first = session(1);
        let second = session(1);

        registry.install(Arc::clone(&first));
        let replaced = registry.install(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&registry.get(Principal(1)).unwrap(), &second));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_remove_if_ignores_stale_session() {
        let registry = SessionRegistry::new();
        let first = session(1);
        let second = session(1);
        registry.install(Arc::clone(&first));
        registry.install(Arc::clone(&second));

        assert!(!registry.remove_if(&first));
        assert!(registry.contains(Principal(1)));
        assert!(registry.remove_if(&second));
        assert!(!registry.contains(Principal(1)));
    }

    #[test]
    fn test_principals_are_independent() {
        let registry = SessionRegistry::new();
        registry.install(session(1));
        registry.install(session(2));
        assert_eq!(registry.count(), 2);

        assert!(registry.remove(Principal(1)).is_some());
        assert!(registry.remove(Principal(1)).is_none());
        assert!(registry.contains(Principal(2)));
    }

    #[test]
    fn test_drain_empties() {
        let registry = SessionRegistry::new();
        registry.install(session(1));
        registry.install(session(2));
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.list().len(), 0);
    }

    #[test]
    fn test_concurrent_installs_keep_one_per_principal() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        registry.install(session(i % 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.count(), 2);
    }
}
