//! MySQL/MariaDB protocol proxy
//!
//! Clients authenticate against the proxy, which then routes their
//! statements to one or more backend servers with one of three routers:
//! read/write splitting with transaction replay, fan-out to every server,
//! or routing by database.

pub mod auth;
pub mod client;
pub mod config;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod session;
pub mod trx;
pub mod worker;
