use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::metrics::metrics;

/// Configuration for per-server connection limits
#[derive(Debug, Clone)]
pub struct LimitConfig {
    /// Maximum open connections per server
    pub max_connections: usize,
    /// Maximum queue size (requests waiting for a slot)
    pub max_queue_size: usize,
    /// Timeout for waiting in queue
    pub queue_timeout: Duration,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_connections: 500,
            max_queue_size: 50,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&PoolConfig> for LimitConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_queue_size: config.queue_size,
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
        }
    }
}

/// Connection slots of one server
pub struct ServerLimit {
    semaphore: Arc<Semaphore>,
    /// Current number of waiting requests
    waiting: AtomicUsize,
}

impl ServerLimit {
    fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Slots not taken by an open connection
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Current number of waiting requests
    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }
}

/// RAII slot held by an open backend connection
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
    server: String,
}

impl ConnectionPermit {
    /// Server this permit belongs to
    pub fn server(&self) -> &str {
        &self.server
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    #[error("Queue full: max queue size {max} exceeded")]
    QueueFull { max: usize },

    #[error("Timeout waiting for available slot after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Limits the number of connections open to each backend server.
///
/// Shared by all workers. A connection holds its permit from connect until
/// it is closed, including the time it spends idle in a pool.
pub struct ConnectionLimiter {
    limits: DashMap<String, Arc<ServerLimit>>,
    config: LimitConfig,
}

impl ConnectionLimiter {
    pub fn new(config: LimitConfig) -> Self {
        Self {
            limits: DashMap::new(),
            config,
        }
    }

    fn limit(&self, server: &str) -> Arc<ServerLimit> {
        self.limits
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(ServerLimit::new(self.config.max_connections)))
            .clone()
    }

    /// Wait for a connection slot on `server`
    pub async fn acquire(&self, server: &str) -> Result<ConnectionPermit, LimitError> {
        let limit = self.limit(server);

        // Fast path, no queueing
        if let Ok(permit) = limit.semaphore.clone().try_acquire_owned() {
            metrics().record_pool_acquired(server);
            return Ok(ConnectionPermit {
                _permit: permit,
                server: server.to_string(),
            });
        }

        let current_waiting = limit.waiting.fetch_add(1, Ordering::SeqCst);
        if current_waiting >= self.config.max_queue_size {
            limit.waiting.fetch_sub(1, Ordering::SeqCst);
            metrics().record_pool_queue_full(server);
            warn!(
                server = %server,
                max_queue = self.config.max_queue_size,
                "Connection queue full"
            );
            return Err(LimitError::QueueFull {
                max: self.config.max_queue_size,
            });
        }

        let semaphore = limit.semaphore.clone();
        let result = timeout(self.config.queue_timeout, semaphore.acquire_owned()).await;
        limit.waiting.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(Ok(permit)) => {
                metrics().record_pool_acquired(server);
                debug!(server = %server, "Acquired connection slot after waiting");
                Ok(ConnectionPermit {
                    _permit: permit,
                    server: server.to_string(),
                })
            }
            // Semaphores are never closed
            Ok(Err(_)) | Err(_) => {
                metrics().record_pool_timeout(server);
                warn!(
                    server = %server,
                    timeout = ?self.config.queue_timeout,
                    "Timed out waiting for a connection slot"
                );
                Err(LimitError::Timeout {
                    timeout: self.config.queue_timeout,
                })
            }
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self, server: &str) -> Option<ConnectionPermit> {
        let limit = self.limit(server);
        let permit = limit.semaphore.clone().try_acquire_owned().ok()?;
        metrics().record_pool_acquired(server);
        Some(ConnectionPermit {
            _permit: permit,
            server: server.to_string(),
        })
    }

    pub fn server_limit(&self, server: &str) -> Option<Arc<ServerLimit>> {
        self.limits.get(server).map(|r| r.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, queue: usize, timeout_ms: u64) -> ConnectionLimiter {
        ConnectionLimiter::new(LimitConfig {
            max_connections: max,
            max_queue_size: queue,
            queue_timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[tokio::test]
    async fn test_basic_acquire_release() {
        let limiter = limiter(2, 10, 1000);

        let permit1 = limiter.acquire("db1").await.unwrap();
        assert_eq!(permit1.server(), "db1");
        let permit2 = limiter.acquire("db1").await.unwrap();
        assert_eq!(limiter.server_limit("db1").unwrap().available(), 0);

        drop(permit1);
        drop(permit2);
        assert_eq!(limiter.server_limit("db1").unwrap().available(), 2);
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let limiter = limiter(1, 10, 1000);

        let permit = limiter.try_acquire("db1").unwrap();
        assert!(limiter.try_acquire("db1").is_none());

        drop(permit);
        assert!(limiter.try_acquire("db1").is_some());
    }

    #[tokio::test]
    async fn test_queue_full() {
        let limiter = Arc::new(limiter(1, 1, 200));
        let _permit1 = limiter.acquire("db1").await.unwrap();

        let waiter = limiter.clone();
        let handle = tokio::spawn(async move { waiter.acquire("db1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.server_limit("db1").unwrap().waiting_count(), 1);

        let result = limiter.acquire("db1").await;
        assert!(matches!(result, Err(LimitError::QueueFull { .. })));

        handle.abort();
    }

    #[tokio::test]
    async fn test_timeout() {
        let limiter = limiter(1, 10, 50);
        let _permit = limiter.acquire("db1").await.unwrap();

        let result = limiter.acquire("db1").await;
        assert!(matches!(result, Err(LimitError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let limiter = Arc::new(limiter(1, 10, 1000));
        let permit = limiter.acquire("db1").await.unwrap();

        let waiter = limiter.clone();
        let handle = tokio::spawn(async move { waiter.acquire("db1").await.is_ok() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(permit);

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_servers_are_independent() {
        let limiter = limiter(1, 10, 1000);
        let _a = limiter.acquire("db1").await.unwrap();
        let _b = limiter.acquire("db2").await.unwrap();
        assert!(limiter.try_acquire("db1").is_none());
    }
}
