//! The session registry: the relay's map from client identity to live
//! session, consulted on every forwarded dial.

use std::collections::HashMap;
use std::sync::RwLock;

use weft_crypto::PublicKey;
use weft_session::{ServerSessionHandle, SessionLookup};

/// Live sessions keyed by authenticated client identity.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<PublicKey, ServerSessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, returning the handle it displaced, if any.
    /// A reconnecting client replaces its old session.
    pub fn insert(&self, handle: ServerSessionHandle) -> Option<ServerSessionHandle> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.peer_pk(), handle)
    }

    /// Removes the entry for `pk`, but only while it still belongs to the
    /// session identified by `id`. A newer session for the same client
    /// stays registered.
    pub fn remove_if_current(&self, pk: &PublicKey, id: u64) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.get(pk).is_some_and(|h| h.id() == id) {
            sessions.remove(pk);
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionLookup for SessionRegistry {
    fn session(&self, pk: &PublicKey) -> Option<ServerSessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pk)
            .cloned()
    }
}
