//! Integration test entry point
//!
//! These tests need a running proxy in front of real servers.
//!
//! Run with: MARINER_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - MARINER_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - MARINER_TEST_PROXY_HOST: Proxy host (default: 127.0.0.1)
//! - MARINER_TEST_PROXY_PORT: Proxy port (default: 4006)
//! - MARINER_TEST_PROXY_USER: Proxy user (default: app)
//! - MARINER_TEST_PROXY_PASS: Proxy password (default: app)
//! - MARINER_TEST_PROXY_DB: Default database (default: shop)
//! - MARINER_TEST_ADMIN_USER / MARINER_TEST_ADMIN_PASS: account allowed to
//!   KILL other users' sessions (default: admin / admin)

mod auth;
mod kill;
mod rw_split;
mod transaction;

use mysql::{Conn, Error as MySqlError, OptsBuilder};
use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("MARINER_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set MARINER_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// Get proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("MARINER_TEST_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("MARINER_TEST_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4006),
        user: env::var("MARINER_TEST_PROXY_USER").unwrap_or_else(|_| "app".to_string()),
        password: env::var("MARINER_TEST_PROXY_PASS").unwrap_or_else(|_| "app".to_string()),
        database: env::var("MARINER_TEST_PROXY_DB").unwrap_or_else(|_| "shop".to_string()),
    }
}

/// Same proxy, logged in as the account with the KILL privilege
pub fn get_admin_config() -> ProxyTestConfig {
    ProxyTestConfig {
        user: env::var("MARINER_TEST_ADMIN_USER").unwrap_or_else(|_| "admin".to_string()),
        password: env::var("MARINER_TEST_ADMIN_PASS").unwrap_or_else(|_| "admin".to_string()),
        ..get_proxy_config()
    }
}

/// Proxy test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn opts(&self) -> OptsBuilder {
        OptsBuilder::new()
            .ip_or_hostname(Some(&self.host))
            .tcp_port(self.port)
            .user(Some(&self.user))
            .pass(Some(&self.password))
            .db_name(Some(&self.database))
    }

    /// Open a connection to the proxy
    pub fn conn(&self) -> Conn {
        Conn::new(self.opts()).expect("Failed to connect to proxy")
    }

    /// Try to connect, returning the error
    pub fn try_conn(&self) -> Result<Conn, MySqlError> {
        Conn::new(self.opts())
    }
}

/// Assert that a query result is a MySQL error with given code and message
pub fn assert_query_error<T: std::fmt::Debug>(
    result: Result<T, MySqlError>,
    expected_code: u16,
    expected_msg: &str,
) {
    match result {
        Ok(v) => panic!(
            "Expected MySQL error {} with message containing '{}', but got: {:?}",
            expected_code, expected_msg, v
        ),
        Err(MySqlError::MySqlError(ref e)) => {
            assert_eq!(
                e.code, expected_code,
                "Expected error code {}, got {}. Message: {}",
                expected_code, e.code, e.message
            );
            assert!(
                e.message.contains(expected_msg),
                "Expected message containing '{}', got: {}",
                expected_msg,
                e.message
            );
        }
        Err(e) => panic!(
            "Expected MySQL error {} with message containing '{}', got different error: {:?}",
            expected_code, expected_msg, e
        ),
    }
}
