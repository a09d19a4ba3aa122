use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::connection::{BackendConnection, BackendCredentials, ConnectionError};
use super::limiter::ConnectionLimiter;
use crate::config::{BackendServer, PoolConfig};

/// Idle connections are only reused by the same user on the same server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub server: String,
    pub user: String,
}

impl PoolKey {
    pub fn new(server: &str, user: &str) -> Self {
        Self {
            server: server.to_string(),
            user: user.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdlePoolConfig {
    /// Idle connections kept per key
    pub max_idle: usize,
    /// Maximum connection age before recycling
    pub max_age: Duration,
    /// Maximum idle time before closing
    pub max_idle_time: Duration,
    pub connect_timeout: Duration,
}

impl Default for IdlePoolConfig {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for IdlePoolConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_idle: config.max_idle,
            max_age: Duration::from_secs(config.max_age_secs),
            max_idle_time: Duration::from_secs(config.max_idle_secs),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

/// Idle backend connections of one worker
#[derive(Debug, Default)]
pub struct IdlePool {
    config: IdlePoolConfig,
    idle: HashMap<PoolKey, VecDeque<BackendConnection>>,
}

impl IdlePool {
    pub fn new(config: IdlePoolConfig) -> Self {
        Self {
            config,
            idle: HashMap::new(),
        }
    }

    /// Most recently used connection that is still fresh
    pub fn take(&mut self, key: &PoolKey) -> Option<BackendConnection> {
        let queue = self.idle.get_mut(key)?;
        while let Some(conn) = queue.pop_back() {
            if conn.is_expired(self.config.max_age) {
                debug!(server = %key.server, "Connection expired, discarding");
                continue;
            }
            if conn.is_idle_too_long(self.config.max_idle_time) {
                debug!(server = %key.server, "Connection idle too long, discarding");
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Keep a connection for reuse, dropping it when the key is full
    pub fn put(&mut self, mut conn: BackendConnection) -> bool {
        if conn.is_expired(self.config.max_age) {
            debug!(server = %conn.server(), "Connection expired, discarding");
            return false;
        }

        let key = PoolKey::new(conn.server(), conn.user());
        let queue = self.idle.entry(key).or_default();
        if queue.len() >= self.config.max_idle {
            debug!(server = %conn.server(), "Idle pool full, discarding connection");
            return false;
        }

        conn.touch();
        queue.push_back(conn);
        true
    }

    /// Close connections that are too old or idle for too long
    pub fn evict_stale(&mut self) -> usize {
        let max_age = self.config.max_age;
        let max_idle = self.config.max_idle_time;
        let mut evicted = 0;
        for queue in self.idle.values_mut() {
            let before = queue.len();
            queue.retain(|c| !c.is_expired(max_age) && !c.is_idle_too_long(max_idle));
            evicted += before - queue.len();
        }
        self.idle.retain(|_, q| !q.is_empty());
        evicted
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.idle.get(key).map_or(0, |q| q.len())
    }

    pub fn total_idle(&self) -> usize {
        self.idle.values().map(|q| q.len()).sum()
    }
}

/// Backend connections of one worker: idle reuse plus the shared
/// per-server connection cap.
pub struct BackendPool {
    idle: RefCell<IdlePool>,
    limiter: Arc<ConnectionLimiter>,
    config: IdlePoolConfig,
}

impl BackendPool {
    pub fn new(config: IdlePoolConfig, limiter: Arc<ConnectionLimiter>) -> Self {
        Self {
            idle: RefCell::new(IdlePool::new(config.clone())),
            limiter,
            config,
        }
    }

    /// Reuse an idle connection or open a new one.
    ///
    /// A reused connection is switched to the requested database.
    pub async fn acquire(
        &self,
        server: &BackendServer,
        creds: &BackendCredentials,
    ) -> Result<BackendConnection, ConnectionError> {
        let key = PoolKey::new(&server.name, &creds.user);

        loop {
            let candidate = self.idle.borrow_mut().take(&key);
            let Some(mut conn) = candidate else { break };

            match creds.database.as_deref() {
                Some(db) if conn.database() != Some(db) => {
                    if let Err(e) = conn.change_database(db).await {
                        warn!(server = %server.name, error = %e, "Failed to change database, discarding connection");
                        continue;
                    }
                }
                _ => {}
            }

            conn.touch();
            debug!(server = %server.name, thread_id = conn.thread_id(), "Reusing idle connection");
            return Ok(conn);
        }

        let permit = self.limiter.acquire(&server.name).await?;
        BackendConnection::connect(server, creds, self.config.connect_timeout, Some(permit)).await
    }

    /// Open a connection that bypasses the idle pool, used for KILL and
    /// shard map queries
    pub async fn connect_direct(
        &self,
        server: &BackendServer,
        creds: &BackendCredentials,
    ) -> Result<BackendConnection, ConnectionError> {
        let permit = self.limiter.acquire(&server.name).await?;
        BackendConnection::connect(server, creds, self.config.connect_timeout, Some(permit)).await
    }

    /// Return a connection whose last reply completed.
    ///
    /// Session state is cleared with COM_RESET_CONNECTION first; connections
    /// that fail the reset are closed.
    pub async fn release(&self, mut conn: BackendConnection) {
        if !conn.reset().await {
            debug!(server = %conn.server(), "Reset failed, discarding connection");
            return;
        }
        self.idle.borrow_mut().put(conn);
    }

    pub fn evict_stale(&self) -> usize {
        self.idle.borrow_mut().evict_stale()
    }

    pub fn idle_count(&self, server: &str, user: &str) -> usize {
        self.idle.borrow().idle_count(&PoolKey::new(server, user))
    }

    pub fn limiter(&self) -> &Arc<ConnectionLimiter> {
        &self.limiter
    }
}
