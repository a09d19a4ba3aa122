//! Backend connections: connect and authenticate, per-worker idle reuse and
//! a process-wide cap on connections per server.

mod connection;
mod limiter;
mod manager;

pub use connection::{BackendConnection, BackendCredentials, ConnectionError};
pub use limiter::{ConnectionLimiter, ConnectionPermit, LimitConfig, LimitError, ServerLimit};
pub use manager::{BackendPool, IdlePool, IdlePoolConfig, PoolKey};

#[cfg(test)]
pub(crate) use manager::test_server;
