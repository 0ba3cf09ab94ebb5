//! Relay-wide session bookkeeping: session id assignment and the namespace
//! uniqueness check shared by all concurrently-handshaking sessions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

/// Process-wide registry owned by a relay. The namespace map has its own
/// lock, independent of any per-session lock, because handshakes of
/// different sessions race against each other on it.
#[derive(Default)]
pub struct SessionRegistry {
    session_counter: AtomicU64,
    namespaces: Mutex<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next relay-local session id. Relay ids (`s1`, `s2`, ...)
    /// and client ids (`c1`, ...) are separate namespaces and never compared.
    pub fn assign_session_id(&self) -> String {
        format!("s{}", self.session_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Claims `namespace_id` for `session_id`. Returns false if it is
    /// already in use; the caller must refuse the session rather than
    /// reuse the namespace.
    pub fn attempt_assign_namespace(&self, namespace_id: &str, session_id: &str) -> bool {
        let mut namespaces = self.namespaces.lock().expect("registry lock poisoned");
        if let Some(existing) = namespaces.get(namespace_id) {
            warn!(
                namespace_id,
                session_id,
                bound_to = %existing,
                "refusing namespace assignment, already in use"
            );
            return false;
        }
        namespaces.insert(namespace_id.to_string(), session_id.to_string());
        debug!(namespace_id, session_id, "assigned namespace");
        true
    }

    /// Releases a namespace claimed by `session_id`. Unknown namespaces are
    /// ignored (cleanup paths may race); a namespace bound to a different
    /// session is left untouched.
    pub fn release_namespace(&self, namespace_id: &str, session_id: &str) {
        let mut namespaces = self.namespaces.lock().expect("registry lock poisoned");
        match namespaces.get(namespace_id) {
            None => {
                debug!(
                    namespace_id,
                    session_id, "ignoring release of unregistered namespace"
                );
            }
            Some(existing) if existing != session_id => {
                warn!(
                    namespace_id,
                    session_id,
                    bound_to = %existing,
                    "ignoring release of namespace bound to another session"
                );
            }
            Some(_) => {
                namespaces.remove(namespace_id);
                debug!(namespace_id, session_id, "released namespace");
            }
        }
    }

    /// Number of currently claimed namespaces.
    pub fn active_namespace_count(&self) -> usize {
        self.namespaces.lock().expect("registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn session_ids_are_unique_and_prefixed() {
        let registry = SessionRegistry::new();
        let first = registry.assign_session_id();
        let second = registry.assign_session_id();
        assert_eq!(first, "s1");
        assert_eq!(second, "s2");
    }

    #[test]
    fn namespace_collision_is_rejected_until_released() {
        let registry = SessionRegistry::new();
        assert!(registry.attempt_assign_namespace("alice/default", "s1"));
        assert!(!registry.attempt_assign_namespace("alice/default", "s2"));

        registry.release_namespace("alice/default", "s1");
        assert!(registry.attempt_assign_namespace("alice/default", "s2"));
    }

    #[test]
    fn release_ignores_unknown_and_foreign_namespaces() {
        let registry = SessionRegistry::new();
        registry.release_namespace("never/assigned", "s1");

        assert!(registry.attempt_assign_namespace("alice/default", "s1"));
        registry.release_namespace("alice/default", "s2");
        // still bound to s1
        assert!(!registry.attempt_assign_namespace("alice/default", "s3"));
        assert_eq!(registry.active_namespace_count(), 1);
    }

    #[test]
    fn concurrent_assignments_never_share_a_namespace() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let mut won = Vec::new();
                for n in 0..64 {
                    let session_id = registry.assign_session_id();
                    if registry.attempt_assign_namespace(&format!("ns-{n}"), &session_id) {
                        won.push(n);
                    }
                }
                won
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.join().expect("thread"));
        }
        // every namespace claimed exactly once across all threads
        let distinct: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), distinct.len());
        assert_eq!(distinct.len(), 64);
    }
}
