//! Peer registry
//!
//! Maps peer identity to its live [`Session`]. A single lock guards the whole
//! map and is never held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::session::Session;

/// Identity to session mapping shared by every connection task
#[derive(Default)]
pub struct Registry {
    peers: Mutex<HashMap<String, Arc<Session>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection id for a new session
    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a session under its identity
    ///
    /// A session already registered under the same identity is replaced and
    /// returned. It is not closed here.
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let identity = session.identity().to_string();
        let displaced = self.peers.lock().insert(identity.clone(), session);
        debug!(
            "Registry: registered {} (replaced: {})",
            identity,
            displaced.is_some()
        );
        displaced
    }

    /// Remove whatever session is registered under `identity`
    pub fn unregister(&self, identity: &str) -> Option<Arc<Session>> {
        let removed = self.peers.lock().remove(identity);
        if removed.is_some() {
            debug!("Registry: unregistered {}", identity);
        }
        removed
    }

    /// Remove `session` only if it is still the registered one for its identity
    pub fn unregister_session(&self, session: &Session) -> bool {
        let mut peers = self.peers.lock();
        match peers.get(session.identity()) {
            Some(current) if current.id() == session.id() => {
                peers.remove(session.identity());
                debug!("Registry: unregistered {}#{}", session.identity(), session.id());
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<Arc<Session>> {
        self.peers.lock().get(identity).cloned()
    }

    /// All registered identities except `excluding`, sorted
    pub fn list(&self, excluding: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .lock()
            .keys()
            .filter(|id| id.as_str() != excluding)
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.peers.lock().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
