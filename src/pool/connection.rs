use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use super::limiter::ConnectionPermit;
use crate::auth::BackendToken;
use crate::config::BackendServer;
use crate::metrics::metrics;
use crate::protocol::{
    capabilities, compute_auth_response, is_err_packet, is_ok_packet, native_token_from_sha1,
    AuthSwitchRequest, Command, ErrPacket, HandshakeResponse, InitialHandshake, Packet,
    PacketCodec, Reply, ReplyTracker, CLEAR_PASSWORD_PLUGIN, NATIVE_PASSWORD_PLUGIN,
};

/// Auth switch rounds accepted before giving up
const MAX_AUTH_ROUNDS: usize = 4;

/// Who a backend connection logs in as
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCredentials {
    pub user: String,
    pub token: BackendToken,
    pub database: Option<String>,
}

impl BackendCredentials {
    pub fn new(user: impl Into<String>, token: BackendToken, database: Option<String>) -> Self {
        Self {
            user: user.into(),
            token,
            database,
        }
    }

    /// Credentials of the proxy's own service account
    pub fn service(user: &str, password: &str) -> Self {
        let token = if password.is_empty() {
            BackendToken::None
        } else {
            BackendToken::Cleartext(password.to_string())
        };
        Self::new(user, token, None)
    }

    fn native_token(&self, scramble: &[u8]) -> Vec<u8> {
        match &self.token {
            BackendToken::None => Vec::new(),
            BackendToken::NativeHash(hash1) => native_token_from_sha1(hash1, scramble).to_vec(),
            BackendToken::Cleartext(password) => compute_auth_response(password, scramble),
        }
    }

    fn clear_token(&self) -> Option<Vec<u8>> {
        match &self.token {
            BackendToken::None => Some(vec![0]),
            BackendToken::Cleartext(password) => {
                let mut token = password.as_bytes().to_vec();
                token.push(0);
                Some(token)
            }
            BackendToken::NativeHash(_) => None,
        }
    }
}

/// An authenticated connection to a backend server
pub struct BackendConnection {
    framed: Framed<TcpStream, PacketCodec>,
    server: String,
    user: String,
    /// Connection id assigned by the backend
    thread_id: u32,
    capabilities: u32,
    database: Option<String>,
    created_at: Instant,
    last_used_at: Instant,
    _permit: Option<ConnectionPermit>,
}

impl BackendConnection {
    /// Connect and authenticate
    pub async fn connect(
        server: &BackendServer,
        creds: &BackendCredentials,
        connect_timeout: Duration,
        permit: Option<ConnectionPermit>,
    ) -> Result<Self, ConnectionError> {
        let addr = server.addr();
        debug!(server = %server.name, addr = %addr, user = %creds.user, "Connecting to backend");

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Connect(format!("timed out connecting to {}", addr)))?
            .map_err(|e| {
                error!(server = %server.name, error = %e, "Failed to connect to backend");
                ConnectionError::Connect(e.to_string())
            })?;
        stream.set_nodelay(true).ok();

        let mut framed = Framed::new(stream, PacketCodec::new());

        // Receive backend handshake
        let handshake_packet = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if is_err_packet(&handshake_packet.payload) {
            let err = ErrPacket::parse(&handshake_packet.payload, capabilities::CLIENT_PROTOCOL_41)
                .unwrap_or_else(|| ErrPacket::new(1040, "08004", "Connection refused"));
            return Err(ConnectionError::Refused(err.error_message));
        }

        let backend_handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server_version = %backend_handshake.server_version,
            thread_id = backend_handshake.connection_id,
            "Received backend handshake"
        );

        let mut caps = capabilities::DEFAULT_CAPABILITIES & backend_handshake.capability_flags;
        if creds.database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let backend_response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21, // utf8_general_ci
            username: creds.user.clone(),
            auth_response: creds.native_token(&backend_handshake.auth_plugin_data()),
            database: creds.database.clone(),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        };

        framed
            .send(backend_response.encode(1))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        for _ in 0..MAX_AUTH_ROUNDS {
            let response = framed
                .next()
                .await
                .ok_or(ConnectionError::Disconnected)?
                .map_err(|e| ConnectionError::Io(e.to_string()))?;

            match response.payload.first() {
                Some(0x00) => {
                    debug!(server = %server.name, "Backend authentication successful");
                    metrics().backend_connected(&server.name);
                    let now = Instant::now();
                    return Ok(Self {
                        framed,
                        server: server.name.clone(),
                        user: creds.user.clone(),
                        thread_id: backend_handshake.connection_id,
                        capabilities: caps,
                        database: creds.database.clone(),
                        created_at: now,
                        last_used_at: now,
                        _permit: permit,
                    });
                }
                Some(0xFF) => {
                    let err = ErrPacket::parse(&response.payload, caps)
                        .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
                    error!(
                        server = %server.name,
                        error_code = err.error_code,
                        error_message = %err.error_message,
                        "Backend authentication failed"
                    );
                    return Err(ConnectionError::Auth(err.error_message));
                }
                Some(0xFE) => {
                    let switch = AuthSwitchRequest::parse(&response.payload)
                        .ok_or_else(|| ConnectionError::Protocol("Invalid auth switch request".into()))?;
                    let token = match switch.plugin_name.as_str() {
                        NATIVE_PASSWORD_PLUGIN => creds.native_token(&switch.plugin_data),
                        CLEAR_PASSWORD_PLUGIN => creds.clear_token().ok_or_else(|| {
                            ConnectionError::Auth("no clear-text password for backend".into())
                        })?,
                        other => {
                            return Err(ConnectionError::Protocol(format!(
                                "Unsupported backend authentication plugin '{}'",
                                other
                            )))
                        }
                    };
                    debug!(plugin = %switch.plugin_name, "Backend requested authentication switch");
                    framed
                        .send(Packet::new(response.sequence_id.wrapping_add(1), token))
                        .await
                        .map_err(|e| ConnectionError::Io(e.to_string()))?;
                }
                _ => {
                    return Err(ConnectionError::Protocol(
                        "Unexpected packet during backend authentication".into(),
                    ))
                }
            }
        }

        Err(ConnectionError::Protocol("Too many authentication rounds".into()))
    }

    /// Check if connection is healthy by sending a ping
    pub async fn ping(&mut self) -> bool {
        self.simple_command(Packet::new(0, vec![Command::Ping as u8])).await
    }

    /// Reset session state with COM_RESET_CONNECTION
    pub async fn reset(&mut self) -> bool {
        self.simple_command(Packet::new(0, vec![Command::ResetConnection as u8]))
            .await
    }

    async fn simple_command(&mut self, packet: Packet) -> bool {
        if self.framed.send(packet).await.is_err() {
            return false;
        }
        match self.framed.next().await {
            Some(Ok(packet)) if is_ok_packet(&packet.payload) => {
                self.last_used_at = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Change current database
    pub async fn change_database(&mut self, db: &str) -> Result<(), ConnectionError> {
        let mut payload = vec![Command::InitDb as u8];
        payload.extend_from_slice(db.as_bytes());
        self.send(Packet::new(0, payload)).await?;

        let response = self.recv().await?;
        if is_err_packet(&response.payload) {
            let err = ErrPacket::parse(&response.payload, self.capabilities)
                .unwrap_or_else(|| ErrPacket::new(1049, "42000", "Unknown database"));
            return Err(ConnectionError::Database(err.error_message));
        }

        self.database = Some(db.to_string());
        self.last_used_at = Instant::now();
        Ok(())
    }

    /// Run a statement and read its complete reply
    pub async fn execute(&mut self, sql: &str) -> Result<Reply, ConnectionError> {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(Command::Query as u8);
        payload.extend_from_slice(sql.as_bytes());
        let packet = Packet::new(0, payload);

        let mut tracker = ReplyTracker::new();
        tracker.on_write(&packet);
        self.send(packet).await?;

        loop {
            let response = self.recv().await?;
            let reply = tracker.on_read(&response);
            if reply.is_complete() {
                if let Some(err) = reply.error() {
                    return Err(ConnectionError::Query {
                        code: err.error_code,
                        message: err.error_message.clone(),
                    });
                }
                self.last_used_at = Instant::now();
                return Ok(reply.clone());
            }
        }
    }

    /// Check if connection has exceeded max age
    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    /// Check if connection has been idle too long
    pub fn is_idle_too_long(&self, max_idle: Duration) -> bool {
        self.last_used_at.elapsed() > max_idle
    }

    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Get backend capability flags
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Send a packet to the backend
    pub async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.framed
            .send(packet)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }

    /// Receive a packet from the backend
    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            None => Err(ConnectionError::Disconnected),
        }
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        metrics().backend_disconnected(&self.server);
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("server", &self.server)
            .field("user", &self.user)
            .field("thread_id", &self.thread_id)
            .field("database", &self.database)
            .finish()
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection refused by server: {0}")]
    Refused(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Query failed ({code}): {message}")]
    Query { code: u16, message: String },

    #[error("Too many connections: {0}")]
    Limit(#[from] super::limiter::LimitError),

    #[error("Connection disconnected")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{password_double_sha1, password_sha1};

    #[test]
    fn test_native_token_from_hash_matches_password() {
        let scramble = [7u8; 20];
        let from_password = BackendCredentials::new("u", BackendToken::Cleartext("pw".into()), None);
        let from_hash = BackendCredentials::new("u", BackendToken::NativeHash(password_sha1("pw")), None);
        assert_eq!(from_password.native_token(&scramble), from_hash.native_token(&scramble));

        let token = from_hash.native_token(&scramble);
        assert!(crate::protocol::check_native_token(&token, &scramble, &password_double_sha1("pw")).is_some());
    }

    #[test]
    fn test_empty_password_tokens() {
        let creds = BackendCredentials::service("mariner", "");
        assert!(creds.native_token(&[1u8; 20]).is_empty());
        assert_eq!(creds.clear_token(), Some(vec![0]));
    }

    #[test]
    fn test_clear_token_needs_password() {
        let creds = BackendCredentials::new("u", BackendToken::NativeHash([0u8; 20]), None);
        assert!(creds.clear_token().is_none());

        let creds = BackendCredentials::new("u", BackendToken::Cleartext("pw".into()), None);
        assert_eq!(creds.clear_token(), Some(b"pw\0".to_vec()));
    }
}
