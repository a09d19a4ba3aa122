//! Client connection state machine
//!
//! [`ClientConnection`] performs no I/O. The session driver feeds it every
//! frame read from the client socket and executes the [`ClientAction`]s it
//! returns.
//!
//! ```text
//! Handshaking -> Authenticating -> Ready <-> ChangingUser
//!        \              \            \
//!         +--------------+-> Failed   +-> Quit
//! ```

pub mod kill;

pub use kill::{KillError, KillKind, KillMode, KillRequest, KillTarget, Killer};

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::auth::{
    AuthError, AuthModules, AuthResult, AuthenticationData, ClientAuthenticator, ExchangeResult,
    UserAccountStore,
};
use crate::metrics::metrics;
use crate::parser::{Classification, Classifier, TypeMask};
use crate::pool::BackendCredentials;
use crate::protocol::capabilities::CLIENT_PROTOCOL_41;
use crate::protocol::{
    is_ssl_request, new_scramble, status, ChangeUserRequest, ClientCommand, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, Packet, MAX_PACKET_SIZE,
    NATIVE_PASSWORD_PLUGIN, SCRAMBLE_LEN,
};
use crate::router::{Completion, RoutedStatement};
use crate::session::SessionState;

/// What the driver has to do
#[derive(Debug)]
pub enum ClientAction {
    /// Write a packet to the client
    Send(Packet),
    /// All credentials are in, await [`ClientConnection::authenticate`]
    Authenticate,
    /// Authentication finished, create the router session
    StartSession,
    Route(RoutedStatement),
    Kill(KillRequest),
    /// The client logged in as someone else, backend connections must be
    /// replaced by ones using these credentials
    ChangeUser(BackendCredentials),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Handshaking,
    Authenticating,
    Ready,
    ChangingUser,
    Failed,
    Quit,
}

/// Where the next client packet belongs while `Ready`
#[derive(Debug)]
enum RoutingState {
    PacketStart,
    /// Frames of a packet of 16MB or more
    LargePacket {
        first_seq: u8,
        next_seq: u8,
        payload: BytesMut,
        load_data: bool,
    },
    /// Raw LOAD DATA LOCAL INFILE content until an empty packet
    LoadData,
}

struct AuthAttempt {
    authenticator: Box<dyn ClientAuthenticator>,
    data: AuthenticationData,
    /// Sequence number of the next packet sent to the client
    next_seq: u8,
    change_user: bool,
}

/// Shared state the state machine reads
pub struct ClientContext<'a> {
    pub users: &'a UserAccountStore,
    pub modules: &'a AuthModules,
}

pub struct ClientConnection {
    state: ClientState,
    routing: RoutingState,
    session: SessionState,
    server_version: String,
    scramble: [u8; SCRAMBLE_LEN],
    auth: Option<AuthAttempt>,
    /// Identity of the authenticated user
    identity: Option<AuthenticationData>,
    classifier: Classifier,
}

impl ClientConnection {
    pub fn new(id: u64, host: &str, server_version: &str) -> Self {
        Self {
            state: ClientState::Handshaking,
            routing: RoutingState::PacketStart,
            session: SessionState::new(id, host),
            server_version: server_version.to_string(),
            scramble: new_scramble(),
            auth: None,
            identity: None,
            classifier: Classifier::new(),
        }
    }

    /// The server greeting, the first packet of the connection
    pub fn greeting(&self) -> Packet {
        InitialHandshake::new(self.session.id as u32, &self.server_version, &self.scramble).encode()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn identity(&self) -> Option<&AuthenticationData> {
        self.identity.as_ref()
    }

    /// User name the backends see
    pub fn backend_user(&self) -> &str {
        self.identity
            .as_ref()
            .map_or(self.session.username.as_str(), |i| i.effective_user())
    }

    /// Credentials for backend connections of this client
    pub fn backend_credentials(&self) -> BackendCredentials {
        let token = self
            .identity
            .as_ref()
            .map(|i| i.backend_token.clone())
            .unwrap_or_default();
        BackendCredentials::new(self.backend_user(), token, self.session.database.clone())
    }

    pub fn killer(&self) -> Killer {
        Killer {
            session_id: self.session.id,
            user: self.session.username.clone(),
            shutdown_priv: self
                .identity
                .as_ref()
                .and_then(|i| i.account.as_ref())
                .is_some_and(|a| a.shutdown_priv),
        }
    }

    /// Process one frame read from the client
    pub fn on_packet(&mut self, ctx: &ClientContext<'_>, packet: Packet) -> Vec<ClientAction> {
        match self.state {
            ClientState::Handshaking => self.on_handshake_response(ctx, packet),
            ClientState::Authenticating | ClientState::ChangingUser => self.on_auth_packet(packet),
            ClientState::Ready => self.on_ready_packet(ctx, packet),
            ClientState::Failed | ClientState::Quit => Vec::new(),
        }
    }

    /// A routed reply reached its end
    pub fn on_reply_complete(&mut self, completion: Completion) {
        self.session.on_completion(completion);
    }

    /// The backend asked for the contents of a LOCAL INFILE
    pub fn on_load_data_requested(&mut self) {
        if self.state == ClientState::Ready {
            self.routing = RoutingState::LoadData;
        }
    }

    // ------------------------------------------------------------------
    // Handshake and authentication
    // ------------------------------------------------------------------

    fn on_handshake_response(&mut self, ctx: &ClientContext<'_>, packet: Packet) -> Vec<ClientAction> {
        let seq = packet.sequence_id.wrapping_add(1);

        if is_ssl_request(&packet.payload) {
            return self.refuse(seq, AuthError::SslNotSupported);
        }
        let Some(response) = HandshakeResponse::parse(&packet.payload) else {
            return self.refuse(seq, AuthError::Malformed);
        };
        if response.capability_flags & CLIENT_PROTOCOL_41 == 0 {
            return self.refuse(seq, AuthError::OldProtocol);
        }

        debug!(
            session_id = self.session.id,
            username = %response.username,
            database = ?response.database,
            plugin = %response.auth_plugin_name,
            "Received handshake response"
        );

        self.session.set_from_handshake(
            response.username.clone(),
            None,
            response.capability_flags,
            response.character_set,
        );

        let mut data = AuthenticationData::new(&response.username, &self.session.host, self.scramble);
        data.client_plugin = if response.auth_plugin_name.is_empty() {
            NATIVE_PASSWORD_PLUGIN.to_string()
        } else {
            response.auth_plugin_name
        };
        data.client_token = response.auth_response;
        data.default_db = response.database.filter(|db| !db.is_empty());
        data.account = ctx.users.find(&response.username, &self.session.host).cloned();

        self.state = ClientState::Authenticating;
        self.start_auth(ctx, data, packet.sequence_id, false, &packet.payload)
    }

    fn start_auth(
        &mut self,
        ctx: &ClientContext<'_>,
        data: AuthenticationData,
        client_seq: u8,
        change_user: bool,
        payload: &[u8],
    ) -> Vec<ClientAction> {
        let plugin = data.account.as_ref().map(|a| a.plugin.as_str()).unwrap_or("");
        let Some(module) = ctx.modules.find(plugin) else {
            warn!(session_id = self.session.id, user = %data.user, plugin = %plugin, "No module for authentication plugin");
            let err = AuthError::UnsupportedPlugin(plugin.to_string());
            return self.deny(client_seq.wrapping_add(1), err, change_user);
        };

        self.auth = Some(AuthAttempt {
            authenticator: module.create_client_authenticator(),
            data,
            next_seq: client_seq.wrapping_add(1),
            change_user,
        });
        self.exchange(payload)
    }

    fn on_auth_packet(&mut self, packet: Packet) -> Vec<ClientAction> {
        let Some(attempt) = self.auth.as_mut() else {
            return self.protocol_violation("authentication packet without an exchange");
        };
        if packet.sequence_id != attempt.next_seq {
            return self.protocol_violation("out of order authentication packet");
        }
        attempt.next_seq = packet.sequence_id.wrapping_add(1);
        self.exchange(&packet.payload)
    }

    fn exchange(&mut self, payload: &[u8]) -> Vec<ClientAction> {
        let Some(attempt) = self.auth.as_mut() else {
            return self.protocol_violation("no authentication in progress");
        };

        match attempt.authenticator.exchange(payload, &mut attempt.data) {
            ExchangeResult::Incomplete(reply) => {
                let seq = attempt.next_seq;
                // The client answers with the following sequence number
                attempt.next_seq = seq.wrapping_add(1);
                vec![ClientAction::Send(Packet::new(seq, reply))]
            }
            ExchangeResult::Ready => vec![ClientAction::Authenticate],
            ExchangeResult::Error => {
                let Some(attempt) = self.auth.take() else {
                    return Vec::new();
                };
                let err = access_denied(&attempt.data);
                self.deny(attempt.next_seq, err, attempt.change_user)
            }
        }
    }

    /// Check the collected credentials and finish the login or
    /// COM_CHANGE_USER that asked for [`ClientAction::Authenticate`]
    pub async fn authenticate(&mut self) -> Vec<ClientAction> {
        let Some(mut attempt) = self.auth.take() else {
            return Vec::new();
        };
        let result = attempt.authenticator.authenticate(&mut attempt.data).await;
        let seq = attempt.next_seq;
        let data = &mut attempt.data;

        match result {
            AuthResult::Success(_) => {}
            AuthResult::WrongPassword => {
                let err = access_denied(data);
                return self.deny(seq, err, attempt.change_user);
            }
            AuthResult::Error(msg) => {
                warn!(session_id = self.session.id, user = %data.user, error = %msg, "Authentication error");
                let err = access_denied(data);
                return self.deny(seq, err, attempt.change_user);
            }
        }

        if let (Some(db), Some(account)) = (&data.default_db, &data.account) {
            if !account.can_access_db(db) {
                let err = AuthError::DatabaseDenied {
                    user: data.user.clone(),
                    host: data.host.clone(),
                    database: db.clone(),
                };
                return self.deny(seq, err, attempt.change_user);
            }
        }

        let ok = OkPacket::new()
            .with_status(status::SERVER_STATUS_AUTOCOMMIT)
            .encode(seq, self.session.capability_flags);
        let data = attempt.data;

        if attempt.change_user {
            info!(
                session_id = self.session.id,
                from = %self.session.username,
                to = %data.user,
                "Client changed user"
            );
            self.session.reset_for_user(data.user.clone(), data.default_db.clone());
            self.identity = Some(data);
            self.state = ClientState::Ready;
            self.routing = RoutingState::PacketStart;
            return vec![
                ClientAction::Send(ok),
                ClientAction::ChangeUser(self.backend_credentials()),
            ];
        }

        info!(
            session_id = self.session.id,
            user = %data.user,
            host = %data.host,
            backend_user = %data.effective_user(),
            "Client authenticated"
        );
        self.session.database = data.default_db.clone();
        self.identity = Some(data);
        self.state = ClientState::Ready;
        vec![ClientAction::Send(ok), ClientAction::StartSession]
    }

    /// Authentication failure: fatal at login, recoverable on COM_CHANGE_USER
    fn deny(&mut self, seq: u8, err: AuthError, change_user: bool) -> Vec<ClientAction> {
        warn!(session_id = self.session.id, error = %err, change_user, "Authentication failed");
        metrics().record_auth_failure(err.reason());

        if change_user {
            self.state = ClientState::Ready;
            let (code, sql_state) = err.to_err();
            let packet = ErrPacket::new(code, sql_state, &err.to_string())
                .encode(seq, self.session.capability_flags);
            return vec![ClientAction::Send(packet)];
        }
        self.refuse(seq, err)
    }

    fn refuse(&mut self, seq: u8, err: AuthError) -> Vec<ClientAction> {
        self.state = ClientState::Failed;
        let (code, sql_state) = err.to_err();
        let packet = ErrPacket::new(code, sql_state, &err.to_string()).encode(seq, CLIENT_PROTOCOL_41);
        vec![ClientAction::Send(packet), ClientAction::Close]
    }

    fn protocol_violation(&mut self, what: &str) -> Vec<ClientAction> {
        warn!(session_id = self.session.id, state = ?self.state, "Protocol violation: {}", what);
        self.state = ClientState::Failed;
        vec![ClientAction::Close]
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_ready_packet(&mut self, ctx: &ClientContext<'_>, packet: Packet) -> Vec<ClientAction> {
        let routing = std::mem::replace(&mut self.routing, RoutingState::PacketStart);
        let full_frame = packet.payload.len() == MAX_PACKET_SIZE;
        let in_load_data = matches!(routing, RoutingState::LoadData);

        // Every command starts a new exchange
        if matches!(routing, RoutingState::PacketStart) && packet.sequence_id != 0 {
            return self.protocol_violation("command with non-zero sequence");
        }

        match routing {
            RoutingState::PacketStart | RoutingState::LoadData if full_frame => {
                self.routing = RoutingState::LargePacket {
                    first_seq: packet.sequence_id,
                    next_seq: packet.sequence_id.wrapping_add(1),
                    payload: BytesMut::from(&packet.payload[..]),
                    load_data: in_load_data,
                };
                Vec::new()
            }
            RoutingState::PacketStart => self.on_command(ctx, packet),
            RoutingState::LoadData => self.on_load_data(packet),
            RoutingState::LargePacket {
                first_seq,
                next_seq,
                mut payload,
                load_data,
            } => {
                if packet.sequence_id != next_seq {
                    return self.protocol_violation("out of order continuation frame");
                }
                payload.extend_from_slice(&packet.payload);
                if full_frame {
                    self.routing = RoutingState::LargePacket {
                        first_seq,
                        next_seq: next_seq.wrapping_add(1),
                        payload,
                        load_data,
                    };
                    return Vec::new();
                }

                let packet = Packet::new(first_seq, payload.freeze());
                debug!(session_id = self.session.id, bytes = packet.payload.len(), "Large packet complete");
                if load_data {
                    self.routing = RoutingState::LoadData;
                    self.on_load_data(packet)
                } else {
                    self.on_command(ctx, packet)
                }
            }
        }
    }

    fn on_load_data(&mut self, packet: Packet) -> Vec<ClientAction> {
        if packet.payload.is_empty() {
            debug!(session_id = self.session.id, "LOAD DATA upload finished");
            self.routing = RoutingState::PacketStart;
        } else {
            self.routing = RoutingState::LoadData;
        }
        vec![ClientAction::Route(RoutedStatement::load_data(packet))]
    }

    fn on_command(&mut self, ctx: &ClientContext<'_>, packet: Packet) -> Vec<ClientAction> {
        let cmd = ClientCommand::parse(&packet.payload);

        let classification = match &cmd {
            ClientCommand::Quit => {
                info!(session_id = self.session.id, "Client sent QUIT");
                self.state = ClientState::Quit;
                return vec![ClientAction::Close];
            }
            ClientCommand::ChangeUser => return self.on_change_user(ctx, packet),
            ClientCommand::ProcessKill(id) => {
                return vec![ClientAction::Kill(KillRequest::connection(u64::from(*id)))];
            }
            ClientCommand::Query(sql) => {
                let classification = self.classifier.classify(sql);
                if classification.mask.contains(TypeMask::KILL) {
                    match kill::parse_kill(sql) {
                        Ok(Some(req)) => return vec![ClientAction::Kill(req)],
                        Ok(None) => {}
                        Err(e) => return vec![ClientAction::Send(self.error_packet(&e))],
                    }
                }
                classification
            }
            ClientCommand::InitDb(db) => {
                let mut classification =
                    Classification::from_mask(TypeMask::SESSION_WRITE | TypeMask::USE_DB);
                classification.database = Some(db.clone());
                classification
            }
            ClientCommand::Ping | ClientCommand::FieldList { .. } | ClientCommand::Other(_) => {
                Classification::from_mask(TypeMask::NONE)
            }
        };

        self.session.on_statement(&classification);
        vec![ClientAction::Route(RoutedStatement::new(packet, classification))]
    }

    fn on_change_user(&mut self, ctx: &ClientContext<'_>, packet: Packet) -> Vec<ClientAction> {
        let Some(req) = ChangeUserRequest::parse(&packet.payload, self.session.capability_flags) else {
            return self.refuse(packet.sequence_id.wrapping_add(1), AuthError::Malformed);
        };
        debug!(session_id = self.session.id, user = %req.username, "COM_CHANGE_USER");

        let mut data = AuthenticationData::new(&req.username, &self.session.host, self.scramble);
        data.client_plugin = if req.auth_plugin_name.is_empty() {
            NATIVE_PASSWORD_PLUGIN.to_string()
        } else {
            req.auth_plugin_name
        };
        data.client_token = req.auth_response;
        data.default_db = req.database.filter(|db| !db.is_empty());
        data.account = ctx.users.find(&req.username, &self.session.host).cloned();

        self.state = ClientState::ChangingUser;
        self.start_auth(ctx, data, packet.sequence_id, true, &packet.payload)
    }

    fn error_packet(&self, err: &KillError) -> Packet {
        let (code, sql_state) = err.to_err();
        ErrPacket::new(code, sql_state, &err.to_string()).encode(1, self.session.capability_flags)
    }
}

fn access_denied(data: &AuthenticationData) -> AuthError {
    AuthError::AccessDenied {
        user: data.user.clone(),
        host: data.host.clone(),
        using_password: data.used_password(),
    }
}
