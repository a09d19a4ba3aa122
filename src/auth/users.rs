use std::net::IpAddr;

use tracing::warn;

use crate::config::{ConfigError, UserConfig};
use crate::protocol::password_double_sha1;

/// A client account known to the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    pub user: String,
    pub host_pattern: String,
    /// SHA1(SHA1(password)), None for an empty password
    pub password_sha2: Option<[u8; 20]>,
    /// Authentication plugin the account uses
    pub plugin: String,
    /// Databases the account may use, `*` grants all
    pub databases: Vec<String>,
    pub shutdown_priv: bool,
}

impl UserAccount {
    pub fn can_access_db(&self, db: &str) -> bool {
        self.databases
            .iter()
            .any(|d| d == "*" || d.eq_ignore_ascii_case(db))
    }

    fn from_config(config: &UserConfig) -> Result<Self, ConfigError> {
        let password_sha2 = match (&config.password_hash, &config.password) {
            (Some(hash), _) => {
                let hex_part = hash.strip_prefix('*').unwrap_or(hash);
                let bytes = hex::decode(hex_part).map_err(|e| {
                    ConfigError::Invalid(format!("user '{}': bad password_hash: {}", config.name, e))
                })?;
                let arr: [u8; 20] = bytes.try_into().map_err(|_| {
                    ConfigError::Invalid(format!("user '{}': password_hash must be 20 bytes", config.name))
                })?;
                Some(arr)
            }
            (None, Some(pw)) if !pw.is_empty() => Some(password_double_sha1(pw)),
            _ => None,
        };

        Ok(Self {
            user: config.name.clone(),
            host_pattern: config.host.clone(),
            password_sha2,
            plugin: config.plugin.clone(),
            databases: config.databases.clone(),
            shutdown_priv: config.shutdown_priv,
        })
    }

    /// Higher is more specific. Literal hosts sort before patterns.
    fn specificity(&self) -> (bool, usize) {
        let wildcard = self.host_pattern.contains(['%', '_']);
        let literal = self
            .host_pattern
            .chars()
            .filter(|c| *c != '%' && *c != '_')
            .count();
        (!wildcard, literal)
    }
}

/// Snapshot of all client accounts
#[derive(Debug, Clone, Default)]
pub struct UserAccountStore {
    accounts: Vec<UserAccount>,
    version: u64,
}

impl UserAccountStore {
    pub fn new(accounts: Vec<UserAccount>, version: u64) -> Self {
        Self { accounts, version }
    }

    pub fn from_config(users: &[UserConfig], version: u64) -> Result<Self, ConfigError> {
        let accounts = users
            .iter()
            .map(UserAccount::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(accounts, version))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Find the most specific account matching user and client host
    pub fn find(&self, user: &str, host: &str) -> Option<&UserAccount> {
        self.accounts
            .iter()
            .filter(|a| a.user == user && host_matches(&a.host_pattern, host))
            .max_by_key(|a| a.specificity())
    }

    /// Whether any account with this name exists, regardless of host
    pub fn user_exists(&self, user: &str) -> bool {
        self.accounts.iter().any(|a| a.user == user)
    }
}

/// Match a client address against a MySQL host pattern
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern.eq_ignore_ascii_case("localhost") {
        return match host.parse::<IpAddr>() {
            Ok(ip) => ip.is_loopback(),
            Err(_) => host.eq_ignore_ascii_case("localhost"),
        };
    }
    if !pattern.is_ascii() {
        warn!(pattern = %pattern, "Ignoring non-ASCII host pattern");
        return false;
    }
    wildcard_match(pattern.as_bytes(), host.as_bytes())
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'_' || pattern[p].eq_ignore_ascii_case(&text[t])) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'%' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'%' {
        p += 1;
    }
    p == pattern.len()
}
