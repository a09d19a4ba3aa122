use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::config::BackendServer;

/// Messages other tasks send to a running session
#[derive(Debug)]
pub enum SessionControl {
    /// Close the session
    Kill,
    /// Report the backend connections: server and backend thread id
    BackendThreads(oneshot::Sender<Vec<(BackendServer, u32)>>),
    Diagnostics(oneshot::Sender<serde_json::Value>),
}

/// Address of a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub user: String,
    pub host: String,
    control: mpsc::UnboundedSender<SessionControl>,
}

impl SessionHandle {
    pub fn new(
        id: u64,
        user: &str,
        host: &str,
        control: mpsc::UnboundedSender<SessionControl>,
    ) -> Self {
        Self {
            id,
            user: user.to_string(),
            host: host.to_string(),
            control,
        }
    }

    /// False once the session is gone
    pub fn send(&self, msg: SessionControl) -> bool {
        self.control.send(msg).is_ok()
    }

    pub async fn backend_threads(&self) -> Vec<(BackendServer, u32)> {
        let (tx, rx) = oneshot::channel();
        if !self.send(SessionControl::BackendThreads(tx)) {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn diagnostics(&self) -> Option<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        if !self.send(SessionControl::Diagnostics(tx)) {
            return None;
        }
        rx.await.ok()
    }
}

/// All authenticated sessions of the process, shared by the workers
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionHandle>,
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
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a session id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id, handle);
    }

    pub fn unregister(&self, id: u64) {
        self.sessions.remove(&id);
    }

    /// Record the new identity after COM_CHANGE_USER
    pub fn set_user(&self, id: u64, user: &str) {
        if let Some(mut handle) = self.sessions.get_mut(&id) {
            handle.user = user.to_string();
        }
    }

    pub fn get(&self, id: u64) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|h| h.value().clone())
    }

    pub fn find_by_user(&self, user: &str) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .filter(|h| h.user == user)
            .map(|h| h.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(registry: &SessionRegistry, user: &str) -> (SessionHandle, mpsc::UnboundedReceiver<SessionControl>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(registry.next_id(), user, "127.0.0.1", tx);
        registry.register(handle.clone());
        (handle, rx)
    }

    #[test]
    fn test_register_and_find() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = handle(&registry, "app");
        let (_b, _rx_b) = handle(&registry, "app");
        let (c, _rx_c) = handle(&registry, "admin");

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.find_by_user("app").len(), 2);
        assert_eq!(registry.get(c.id).unwrap().user, "admin");

        registry.set_user(a.id, "admin");
        assert_eq!(registry.find_by_user("admin").len(), 2);

        registry.unregister(a.id);
        assert!(registry.get(a.id).is_none());
    }

    #[tokio::test]
    async fn test_backend_threads_roundtrip() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = handle(&registry, "app");

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let SessionControl::BackendThreads(reply) = msg {
                    let server = crate::router::test_util::server("db1", crate::config::ServerRole::Primary);
                    let _ = reply.send(vec![(server, 42)]);
                }
            }
        });

        let threads = handle.backend_threads().await;
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].1, 42);
    }

    #[tokio::test]
    async fn test_gone_session() {
        let registry = SessionRegistry::new();
        let (handle, rx) = handle(&registry, "app");
        drop(rx);
        assert!(!handle.send(SessionControl::Kill));
        assert!(handle.backend_threads().await.is_empty());
        assert!(handle.diagnostics().await.is_none());
    }
}
