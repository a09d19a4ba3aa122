//! Router sessions
//!
//! A router session decides which backends receive a client statement and
//! which backend packets reach the client. It never performs I/O itself: all
//! effects are collected in an [`Outbox`] that the session driver executes.

mod cat;
mod rw_split;
mod schema;
mod selector;
mod sescmd;
pub mod shard_map;

pub use cat::CatSession;
pub use rw_split::RwSplitSession;
pub use schema::SchemaRouterSession;
pub use selector::{FirstSelector, InstanceSelector, WeightedRoundRobin};
pub use sescmd::{SescmdEntry, SescmdHistory};
pub use shard_map::{ServerMap, Shard, ShardManager};

use std::sync::Arc;

use thiserror::Error;

use crate::config::{BackendServer, RouterConfig, RouterKind, ServerRole};
use crate::parser::Classification;
use crate::protocol::{capabilities::CLIENT_PROTOCOL_41, Command, ErrPacket, Packet, PacketKind, Reply};
use crate::trx::TrxError;

/// Index of an endpoint within its router session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub usize);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A backend server as seen by one router session
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub server: BackendServer,
    /// A connection has been requested and not closed since
    pub in_use: bool,
}

impl Endpoint {
    pub fn new(id: EndpointId, server: BackendServer) -> Self {
        Self {
            id,
            server,
            in_use: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.server.name
    }

    pub fn role(&self) -> ServerRole {
        self.server.role
    }

    pub fn is_primary(&self) -> bool {
        self.server.is_primary()
    }

    pub fn weight(&self) -> u32 {
        self.server.weight
    }
}

/// Build one endpoint per configured server
pub fn endpoints_for(servers: &[BackendServer]) -> Vec<Endpoint> {
    servers
        .iter()
        .enumerate()
        .map(|(i, s)| Endpoint::new(EndpointId(i), s.clone()))
        .collect()
}

/// Session flags the routers decide on
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub user: String,
    pub current_db: Option<String>,
    pub autocommit: bool,
    pub trx_active: bool,
    pub trx_read_only: bool,
}

/// A client statement ready for routing
#[derive(Debug, Clone)]
pub struct RoutedStatement {
    pub packet: Packet,
    pub command: Command,
    pub classification: Classification,
    /// Raw LOAD DATA LOCAL INFILE content, not a command
    pub load_data: bool,
}

impl RoutedStatement {
    pub fn new(packet: Packet, classification: Classification) -> Self {
        let command = packet
            .command_byte()
            .map(Command::from)
            .unwrap_or(Command::Unknown);
        Self {
            packet,
            command,
            classification,
            load_data: false,
        }
    }

    pub fn load_data(packet: Packet) -> Self {
        Self {
            packet,
            command: Command::Unknown,
            classification: Classification::from_mask(crate::parser::TypeMask::NONE),
            load_data: true,
        }
    }

    pub fn expects_reply(&self) -> bool {
        !self.load_data && self.command.expects_reply()
    }

    /// SQL text of a COM_QUERY
    pub fn sql(&self) -> Option<String> {
        (self.command == Command::Query)
            .then(|| String::from_utf8_lossy(&self.packet.payload[1..]).into_owned())
    }
}

/// What a backend should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRequest {
    /// Write a packet, connecting first if needed
    Write(Packet),
    Close,
}

/// End of a client-visible reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub ok: bool,
    /// Status flags of the backend reply, `None` when the proxy generated it
    pub server_status: Option<u16>,
}

/// Effects produced by a router session
#[derive(Debug, Default)]
pub struct Outbox {
    pub backend: Vec<(EndpointId, BackendRequest)>,
    pub client: Vec<Packet>,
    pub completion: Option<Completion>,
    /// Client must now stream LOAD DATA content
    pub load_data: bool,
    /// Close the client session
    pub close: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, endpoint: EndpointId, packet: Packet) {
        self.backend.push((endpoint, BackendRequest::Write(packet)));
    }

    pub fn close_backend(&mut self, endpoint: EndpointId) {
        self.backend.push((endpoint, BackendRequest::Close));
    }

    pub fn send(&mut self, packet: Packet) {
        self.client.push(packet);
    }

    /// Send a backend packet to the client and note where the reply stands
    pub fn forward(&mut self, packet: Packet, reply: &Reply) {
        self.client.push(packet);
        if reply.last_kind() == PacketKind::LocalInfile {
            self.load_data = true;
        }
        if reply.is_complete() {
            self.complete(reply.is_ok(), reply.server_status());
        }
    }

    /// End of a reply that came from a backend
    pub fn complete(&mut self, ok: bool, server_status: u16) {
        self.completion = Some(Completion {
            ok,
            server_status: Some(server_status),
        });
    }

    /// End of a reply the proxy generated itself
    pub fn complete_generated(&mut self, ok: bool) {
        self.completion = Some(Completion {
            ok,
            server_status: None,
        });
    }

    /// Reply to the client with an error generated by the proxy
    pub fn error(&mut self, code: u16, sql_state: &str, message: &str) {
        self.client
            .push(ErrPacket::new(code, sql_state, message).encode(1, CLIENT_PROTOCOL_41));
        self.complete_generated(false);
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty() && self.client.is_empty() && self.completion.is_none() && !self.close
    }
}

/// Whether the session survives a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    Close,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("No backend available for {0}")]
    NoBackend(String),
    #[error("Statement references tables on several servers: {0}")]
    CrossShard(String),
    #[error("Unknown database '{0}'")]
    UnknownDatabase(String),
    #[error("{0} is not supported")]
    Unsupported(String),
    #[error(transparent)]
    Trx(#[from] TrxError),
}

impl RouteError {
    /// Error packet fields sent to the client
    pub fn to_err(&self) -> (u16, &'static str, String) {
        match self {
            RouteError::UnknownDatabase(db) => (1049, "42000", format!("Unknown database '{}'", db)),
            other => (1105, "HY000", other.to_string()),
        }
    }
}

/// Per-client routing logic
pub trait RouterSession {
    /// Decide where a client statement goes
    fn route_query(
        &mut self,
        ctx: &RouteContext,
        stmt: RoutedStatement,
        out: &mut Outbox,
    ) -> Result<(), RouteError>;

    /// Handle one packet of a backend reply
    fn client_reply(&mut self, endpoint: EndpointId, packet: Packet, reply: &Reply, out: &mut Outbox);

    /// A backend connection failed or was closed by the server
    fn handle_error(&mut self, endpoint: EndpointId, reason: &str, out: &mut Outbox) -> ErrorAction;

    fn diagnostics(&self) -> serde_json::Value;

    /// Endpoints the session may connect to
    fn endpoints(&self) -> &[Endpoint];
}

/// Create the router session for one client
pub fn new_router_session(
    config: &RouterConfig,
    servers: &[BackendServer],
    shards: &Arc<ShardManager>,
    user: &str,
) -> Box<dyn RouterSession> {
    let endpoints = endpoints_for(servers);
    match config.kind {
        RouterKind::ReadWriteSplit => Box::new(RwSplitSession::new(config.clone(), endpoints)),
        RouterKind::Cat => Box::new(CatSession::new(endpoints)),
        RouterKind::SchemaRouter => Box::new(SchemaRouterSession::new(
            config.clone(),
            endpoints,
            Arc::clone(shards),
            user,
        )),
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    //! Packet builders shared by the router tests

    use super::*;
    use crate::protocol::resultset::{column_count, column_definition, text_row};
    use crate::protocol::{EofPacket, OkPacket, ReplyTracker};

    pub fn query(sql: &str) -> Packet {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        Packet::new(0, payload)
    }

    pub fn statement(sql: &str) -> RoutedStatement {
        RoutedStatement::new(query(sql), crate::parser::Classifier::new().classify(sql))
    }

    pub fn server(name: &str, role: ServerRole) -> BackendServer {
        BackendServer {
            name: name.into(),
            host: "127.0.0.1".into(),
            port: 3306,
            role,
            weight: 1,
        }
    }

    pub fn ok(status: u16) -> Vec<Packet> {
        vec![OkPacket::new().with_status(status).encode(1, CLIENT_PROTOCOL_41)]
    }

    pub fn err(code: u16) -> Vec<Packet> {
        vec![ErrPacket::new(code, "HY000", "boom").encode(1, CLIENT_PROTOCOL_41)]
    }

    /// One-column result set with the given rows
    pub fn resultset(rows: &[&str]) -> Vec<Packet> {
        let mut seq = 1;
        let mut next = || {
            let s = seq;
            seq += 1;
            s
        };
        let mut packets = vec![column_count(next(), 1), column_definition(next(), "db", "t", "c")];
        packets.push(EofPacket::new(2).encode(next()));
        for row in rows {
            packets.push(text_row(next(), &[Some(row)]));
        }
        packets.push(EofPacket::new(2).encode(next()));
        packets
    }

    /// Feeds backend replies through per-endpoint reply trackers
    #[derive(Default)]
    pub struct Backends {
        trackers: std::collections::HashMap<EndpointId, ReplyTracker>,
        pub written: Vec<(EndpointId, Packet)>,
        pub closed: Vec<EndpointId>,
    }

    impl Backends {
        /// Record what the router asked for and clear those requests
        pub fn take(&mut self, out: &mut Outbox) -> Vec<(EndpointId, Packet)> {
            let mut writes = Vec::new();
            for (id, req) in out.backend.drain(..) {
                match req {
                    BackendRequest::Write(packet) => {
                        self.trackers.entry(id).or_default().on_write(&packet);
                        self.written.push((id, packet.clone()));
                        writes.push((id, packet));
                    }
                    BackendRequest::Close => {
                        self.trackers.remove(&id);
                        self.closed.push(id);
                    }
                }
            }
            writes
        }

        /// Deliver a reply from `id`, collecting any new requests
        pub fn reply(
            &mut self,
            router: &mut dyn RouterSession,
            id: EndpointId,
            packets: Vec<Packet>,
            out: &mut Outbox,
        ) {
            for packet in packets {
                let reply = self.trackers.entry(id).or_default().on_read(&packet).clone();
                router.client_reply(id, packet, &reply, out);
            }
        }

        pub fn fail(&mut self, id: EndpointId) {
            self.trackers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_util::*;

    #[test]
    fn test_route_error_mapping() {
        assert_eq!(RouteError::UnknownDatabase("x".into()).to_err().0, 1049);
        let (code, state, msg) = RouteError::CrossShard("a.t, b.u".into()).to_err();
        assert_eq!((code, state), (1105, "HY000"));
        assert!(msg.contains("a.t"));
    }

    #[test]
    fn test_outbox_forward_sets_completion() {
        let mut tracker = crate::protocol::ReplyTracker::new();
        tracker.on_write(&query("SELECT 1"));
        let mut out = Outbox::new();

        for packet in resultset(&["1"]) {
            let reply = tracker.on_read(&packet).clone();
            out.forward(packet, &reply);
        }
        assert_eq!(out.client.len(), 5);
        assert_eq!(
            out.completion,
            Some(Completion {
                ok: true,
                server_status: Some(2),
            })
        );
    }

    #[test]
    fn test_endpoints_for_servers() {
        let endpoints = endpoints_for(&[
            server("a", ServerRole::Primary),
            server("b", ServerRole::Replica),
        ]);
        assert_eq!(endpoints[1].id, EndpointId(1));
        assert!(endpoints[0].is_primary());
        assert!(!endpoints[1].in_use);
    }
}
