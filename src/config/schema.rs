use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Backend servers
    #[serde(default)]
    pub servers: Vec<BackendServer>,
    /// Credentials the proxy itself uses for shard map queries and KILL
    #[serde(default)]
    pub service: ServiceCredentials,
    #[serde(default)]
    pub router: RouterConfig,
    /// Client accounts
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub pam: PamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub kill: KillConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Number of routing workers, 0 means one per CPU
    #[serde(default)]
    pub workers: usize,
    /// Version string sent in the server greeting
    #[serde(default = "default_server_version")]
    pub server_version: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    4006
}

fn default_server_version() -> String {
    "10.6.0-mariner".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            workers: 0,
            server_version: default_server_version(),
        }
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Role of a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    #[default]
    Primary,
    Replica,
}

/// One backend database server
#[derive(Debug, Clone, Deserialize)]
pub struct BackendServer {
    /// Unique server name
    pub name: String,
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default)]
    pub role: ServerRole,
    /// Relative weight for replica selection
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_backend_port() -> u16 {
    3306
}

fn default_weight() -> u32 {
    1
}

impl BackendServer {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_primary(&self) -> bool {
        self.role == ServerRole::Primary
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCredentials {
    #[serde(default = "default_service_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_service_user() -> String {
    "mariner".to_string()
}

impl Default for ServiceCredentials {
    fn default() -> Self {
        Self {
            user: default_service_user(),
            password: String::new(),
        }
    }
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouterKind {
    #[default]
    ReadWriteSplit,
    Cat,
    SchemaRouter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub kind: RouterKind,
    /// Replay open transactions on a new primary connection
    #[serde(default = "default_true")]
    pub transaction_replay: bool,
    /// Largest transaction, in statement bytes, that is still replayed
    #[serde(default = "default_trx_max_size")]
    pub trx_max_size: usize,
    /// Replay attempts per transaction
    #[serde(default = "default_trx_max_attempts")]
    pub trx_max_attempts: u32,
    /// Retry reads that failed before any reply was sent
    #[serde(default = "default_true")]
    pub retry_failed_reads: bool,
    /// Session commands kept for replay on new connections
    #[serde(default = "default_max_sescmd_history")]
    pub max_sescmd_history: usize,
    /// Seconds a shard map stays valid
    #[serde(default = "default_shard_map_refresh_secs")]
    pub shard_map_refresh_secs: u64,
    /// Concurrent shard map updates allowed per user
    #[serde(default = "default_shard_map_update_limit")]
    pub shard_map_update_limit: u64,
}

fn default_true() -> bool {
    true
}

fn default_trx_max_size() -> usize {
    1024 * 1024
}

fn default_trx_max_attempts() -> u32 {
    5
}

fn default_max_sescmd_history() -> usize {
    50
}

fn default_shard_map_refresh_secs() -> u64 {
    300
}

fn default_shard_map_update_limit() -> u64 {
    1
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            kind: RouterKind::default(),
            transaction_replay: true,
            trx_max_size: default_trx_max_size(),
            trx_max_attempts: default_trx_max_attempts(),
            retry_failed_reads: true,
            max_sescmd_history: default_max_sescmd_history(),
            shard_map_refresh_secs: default_shard_map_refresh_secs(),
            shard_map_update_limit: default_shard_map_update_limit(),
        }
    }
}

// ============================================================================
// Accounts
// ============================================================================

/// A client account
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    /// Host pattern, `%` and `_` wildcards allowed
    #[serde(default = "default_user_host")]
    pub host: String,
    /// Hex SHA1(SHA1(password)), optionally prefixed with `*`
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Clear-text password, hashed on load
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_user_plugin")]
    pub plugin: String,
    /// Databases the account may use, `*` for any
    #[serde(default = "default_user_databases")]
    pub databases: Vec<String>,
    /// Whether the account may KILL other users' sessions
    #[serde(default)]
    pub shutdown_priv: bool,
}

fn default_user_host() -> String {
    "%".to_string()
}

fn default_user_plugin() -> String {
    "mysql_native_password".to_string()
}

fn default_user_databases() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PamMode {
    #[default]
    Password,
    PasswordTwoFactor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PamConfig {
    #[serde(default)]
    pub mode: PamMode,
    /// Ask for the password with mysql_clear_password instead of dialog
    #[serde(default)]
    pub use_cleartext_plugin: bool,
    /// Let the PAM service substitute the user name
    #[serde(default)]
    pub user_mapping: bool,
    #[serde(default = "default_pam_service")]
    pub service: String,
    /// Passwords used on backends for mapped users
    #[serde(default)]
    pub backend_passwords: HashMap<String, String>,
    /// Credentials known to the built-in PAM service
    #[serde(default)]
    pub accounts: Vec<PamAccount>,
}

fn default_pam_service() -> String {
    "mysql".to_string()
}

impl Default for PamConfig {
    fn default() -> Self {
        Self {
            mode: PamMode::default(),
            use_cleartext_plugin: false,
            user_mapping: false,
            service: default_pam_service(),
            backend_passwords: HashMap::new(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PamAccount {
    pub user: String,
    pub password: String,
    /// Expected second factor code
    #[serde(default)]
    pub otp: Option<String>,
    /// User name the account maps to
    #[serde(default)]
    pub mapped_user: Option<String>,
}

// ============================================================================
// Connection pool
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Idle connections kept per server and user
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Maximum connection age in seconds
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Maximum idle time in seconds
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    /// Connections allowed per backend server
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Connection requests allowed to wait for a free slot
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Timeout in milliseconds for waiting in queue
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Timeout in milliseconds for connecting to a backend
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_max_idle() -> usize {
    10
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_max_connections() -> usize {
    500
}

fn default_queue_size() -> usize {
    50
}

fn default_queue_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_age_secs: default_max_age_secs(),
            max_idle_secs: default_max_idle_secs(),
            max_connections: default_max_connections(),
            queue_size: default_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

// ============================================================================
// Misc
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct KillConfig {
    /// Milliseconds to wait for backend KILL connections
    #[serde(default = "default_kill_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_kill_timeout_ms() -> u64 {
    10_000
}

impl Default for KillConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_kill_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    /// Address of the Prometheus scrape endpoint, disabled when unset
    #[serde(default)]
    pub listen_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            servers: vec![BackendServer {
                name: "server1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 3306,
                role: ServerRole::Primary,
                weight: 1,
            }],
            service: ServiceCredentials::default(),
            router: RouterConfig::default(),
            users: Vec::new(),
            pam: PamConfig::default(),
            pool: PoolConfig::default(),
            kill: KillConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    pub fn primaries(&self) -> impl Iterator<Item = &BackendServer> {
        self.servers.iter().filter(|s| s.is_primary())
    }
}
