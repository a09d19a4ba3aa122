//! Client authentication
//!
//! An [`AuthenticatorModule`] is registered per plugin family and creates a
//! fresh [`ClientAuthenticator`] for every authentication attempt. The client
//! state machine feeds packets into [`ClientAuthenticator::exchange`] until it
//! reports [`ExchangeResult::Ready`], then awaits
//! [`ClientAuthenticator::authenticate`] exactly once. Checks that may block,
//! such as a PAM conversation, run on tokio's blocking pool.

mod clear;
mod native;
mod pam;
mod users;

pub use clear::ClearPasswordModule;
pub use native::NativePasswordModule;
pub use pam::{PamModule, PamOutcome, PamRequest, PamService, StaticPamService, PAM_PLUGIN};
pub use users::{host_matches, UserAccount, UserAccountStore};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Config;
use crate::protocol::SCRAMBLE_LEN;

/// Progress of one authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Init,
    AskedForPassword,
    AskedFor2fa,
    Received,
    Done,
}

/// Result of feeding one packet to an authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeResult {
    /// Send this payload to the client and wait for its answer
    Incomplete(Bytes),
    /// All client input has been read
    Ready,
    Error,
}

/// Result of the final credential check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Authenticated, possibly as a different (mapped) user
    Success(Option<String>),
    WrongPassword,
    Error(String),
}

/// Credentials the proxy presents to backends on the client's behalf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackendToken {
    /// Empty password
    #[default]
    None,
    /// SHA1(password), enough to answer a native password challenge
    NativeHash([u8; 20]),
    Cleartext(String),
}

/// Everything known about a client while it authenticates
#[derive(Debug, Clone)]
pub struct AuthenticationData {
    pub user: String,
    pub host: String,
    /// Plugin the client used in its handshake response
    pub client_plugin: String,
    pub client_token: Vec<u8>,
    pub client_token_2fa: Vec<u8>,
    pub scramble: [u8; SCRAMBLE_LEN],
    pub default_db: Option<String>,
    /// Matching account, if any
    pub account: Option<UserAccount>,
    pub backend_token: BackendToken,
    pub mapped_user: Option<String>,
}

impl AuthenticationData {
    pub fn new(user: &str, host: &str, scramble: [u8; SCRAMBLE_LEN]) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
            client_plugin: String::new(),
            client_token: Vec::new(),
            client_token_2fa: Vec::new(),
            scramble,
            default_db: None,
            account: None,
            backend_token: BackendToken::None,
            mapped_user: None,
        }
    }

    /// User name the backends see
    pub fn effective_user(&self) -> &str {
        self.mapped_user.as_deref().unwrap_or(&self.user)
    }

    pub fn used_password(&self) -> bool {
        !self.client_token.is_empty()
    }
}

/// One authentication attempt of one client
#[async_trait]
pub trait ClientAuthenticator: Send {
    /// Consume a client packet. The first call receives the handshake
    /// response (or COM_CHANGE_USER) payload with the client token already
    /// stored in `data`.
    fn exchange(&mut self, payload: &[u8], data: &mut AuthenticationData) -> ExchangeResult;

    /// Check the credentials collected by `exchange`
    async fn authenticate(&mut self, data: &mut AuthenticationData) -> AuthResult;

    fn state(&self) -> AuthState;
}

/// A plugin family
pub trait AuthenticatorModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Account plugin names this module handles
    fn supported_plugins(&self) -> &[&'static str];

    fn create_client_authenticator(&self) -> Box<dyn ClientAuthenticator>;
}

/// All loaded authenticator modules
#[derive(Clone)]
pub struct AuthModules {
    modules: Vec<Arc<dyn AuthenticatorModule>>,
}

impl AuthModules {
    pub fn new(modules: Vec<Arc<dyn AuthenticatorModule>>) -> Self {
        Self { modules }
    }

    /// Native, clear-text and PAM modules, PAM backed by the built-in service
    pub fn from_config(config: &Config) -> Self {
        let pam_service = Arc::new(StaticPamService::from_config(&config.pam));
        Self::new(vec![
            Arc::new(NativePasswordModule),
            Arc::new(ClearPasswordModule),
            Arc::new(PamModule::new(config.pam.clone(), pam_service)),
        ])
    }

    /// Module responsible for an account plugin
    pub fn find(&self, plugin: &str) -> Option<&Arc<dyn AuthenticatorModule>> {
        let plugin = if plugin.is_empty() {
            crate::protocol::NATIVE_PASSWORD_PLUGIN
        } else {
            plugin
        };
        self.modules
            .iter()
            .find(|m| m.supported_plugins().contains(&plugin))
    }
}

impl std::fmt::Debug for AuthModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modules.iter().map(|m| m.name()))
            .finish()
    }
}

/// Strip the terminating NUL of a clear-text or dialog answer
pub(crate) fn strip_nul(payload: &[u8]) -> &[u8] {
    match payload.split_last() {
        Some((0, rest)) => rest,
        _ => payload,
    }
}

/// Reasons a client is refused during login or COM_CHANGE_USER
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Access denied for user '{user}'@'{host}' (using password: {})", yes_no(.using_password))]
    AccessDenied {
        user: String,
        host: String,
        using_password: bool,
    },

    #[error("Access denied for user '{user}'@'{host}' to database '{database}'")]
    DatabaseDenied {
        user: String,
        host: String,
        database: String,
    },

    #[error("Client does not support authentication protocol requested by server; consider upgrading MariaDB client")]
    UnsupportedPlugin(String),

    #[error("SSL connections are not supported")]
    SslNotSupported,

    #[error("Client does not support protocol 4.1")]
    OldProtocol,

    #[error("Bad handshake")]
    Malformed,
}

fn yes_no(flag: &bool) -> &'static str {
    if *flag {
        "YES"
    } else {
        "NO"
    }
}

impl AuthError {
    /// Error code and SQL state sent to the client
    pub fn to_err(&self) -> (u16, &'static str) {
        match self {
            AuthError::AccessDenied { .. } => (1045, "28000"),
            AuthError::DatabaseDenied { .. } => (1044, "42000"),
            AuthError::UnsupportedPlugin(_) => (1251, "08004"),
            AuthError::SslNotSupported | AuthError::OldProtocol | AuthError::Malformed => {
                (1045, "08S01")
            }
        }
    }

    /// Label used for the auth failure metric
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::AccessDenied { .. } => "wrong_password",
            AuthError::DatabaseDenied { .. } => "db_access",
            AuthError::UnsupportedPlugin(_) => "unknown_plugin",
            AuthError::SslNotSupported | AuthError::OldProtocol | AuthError::Malformed => "protocol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_module_by_plugin() {
        let modules = AuthModules::from_config(&Config::default());
        assert_eq!(modules.find("mysql_native_password").unwrap().name(), "native");
        assert_eq!(modules.find("").unwrap().name(), "native");
        assert_eq!(modules.find("mysql_clear_password").unwrap().name(), "clear");
        assert_eq!(modules.find("pam").unwrap().name(), "pam");
        assert!(modules.find("caching_sha2_password").is_none());
    }

    #[test]
    fn test_effective_user() {
        let mut data = AuthenticationData::new("alice", "10.0.0.1", [1; SCRAMBLE_LEN]);
        assert_eq!(data.effective_user(), "alice");
        data.mapped_user = Some("dba".into());
        assert_eq!(data.effective_user(), "dba");
    }

    #[test]
    fn test_strip_nul() {
        assert_eq!(strip_nul(b"pw\0"), b"pw");
        assert_eq!(strip_nul(b"pw"), b"pw");
        assert_eq!(strip_nul(b""), b"");
    }

    #[test]
    fn test_auth_error_messages() {
        let err = AuthError::AccessDenied {
            user: "bob".into(),
            host: "10.0.0.1".into(),
            using_password: true,
        };
        assert_eq!(err.to_string(), "Access denied for user 'bob'@'10.0.0.1' (using password: YES)");
        assert_eq!(err.to_err(), (1045, "28000"));

        let err = AuthError::DatabaseDenied {
            user: "bob".into(),
            host: "h".into(),
            database: "shop".into(),
        };
        assert_eq!(err.to_err(), (1044, "42000"));
        assert_eq!(AuthError::UnsupportedPlugin("x".into()).to_err(), (1251, "08004"));
    }
}
