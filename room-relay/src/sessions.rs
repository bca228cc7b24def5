//! Session registry: the only place that maps a username to a live session.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;

use crate::{
    error::{Reason, RelayError},
    session::{SessionHandle, SessionId},
};

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, handle: SessionHandle) -> Result<(), RelayError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(handle.username()) {
            return Err(RelayError::conflict(
                Reason::NameTaken,
                format!("Name '{}' is already in use.", handle.username()),
            ));
        }
        sessions.insert(handle.username().to_string(), handle);
        Ok(())
    }

    /// Removes `username` only if it still belongs to session `id`.
    pub async fn remove(&self, username: &str, id: SessionId) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(username) {
            Some(handle) if handle.id() == id => sessions.remove(username),
            _ => None,
        }
    }

    pub async fn is_current(&self, username: &str, id: SessionId) -> bool {
        let sessions = self.sessions.lock().await;
        sessions.get(username).is_some_and(|handle| handle.id() == id)
    }

    pub async fn get(&self, username: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions.get(username).cloned()
    }

    /// Handles for every listed user that is still connected.
    pub async fn resolve<'a, I>(&self, usernames: I) -> Vec<SessionHandle>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let sessions = self.sessions.lock().await;
        usernames
            .into_iter()
            .filter_map(|username| sessions.get(username).cloned())
            .collect()
    }

    pub async fn all(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions.values().cloned().collect()
    }

    pub async fn usernames(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut names: Vec<String> = sessions.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::{Capabilities, ProtocolKind};

    fn handle(registry: &SessionRegistry, name: &str) -> SessionHandle {
        let (tx, _rx) = mpsc::channel(8);
        SessionHandle::new(
            registry.next_id(),
            name,
            ProtocolKind::Legacy,
            Capabilities::default(),
            tx,
        )
    }

    #[tokio::test]
    async fn rejects_duplicate_usernames() {
        let registry = SessionRegistry::new();
        registry
            .register(handle(&registry, "alice"))
            .await
            .expect("first registration should pass");
        let err = registry
            .register(handle(&registry, "alice"))
            .await
            .expect_err("duplicate should fail");
        assert_eq!(err.reason(), Some(Reason::NameTaken));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_ignores_stale_session_ids() {
        let registry = SessionRegistry::new();
        let first = handle(&registry, "alice");
        registry.register(first.clone()).await.expect("register");
        assert!(registry.remove("alice", first.id()).await.is_some());

        let second = handle(&registry, "alice");
        registry.register(second.clone()).await.expect("name is free again");

        assert!(registry.remove("alice", first.id()).await.is_none());
        assert!(registry.is_current("alice", second.id()).await);
        assert_eq!(registry.usernames().await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn resolve_skips_disconnected_users() {
        let registry = SessionRegistry::new();
        registry.register(handle(&registry, "alice")).await.expect("register");
        registry.register(handle(&registry, "bob")).await.expect("register");

        let resolved = registry.resolve(["alice", "carol", "bob"]).await;
        let mut names: Vec<&str> = resolved.iter().map(SessionHandle::username).collect();
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);
    }
}
