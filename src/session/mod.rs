//! Session driver
//!
//! Connects a client socket, its [`ClientConnection`] state machine, the
//! router session and one task per backend connection. Everything runs on
//! the worker's `LocalSet`; backend tasks report back through an event
//! channel so that all routing decisions happen in one place.

mod registry;
mod state;

pub use registry::{SessionControl, SessionHandle, SessionRegistry};
pub use state::SessionState;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::client::kill::{execute_kill, KillContext};
use crate::client::{ClientAction, ClientConnection, ClientContext, KillError, KillRequest};
use crate::config::{BackendServer, RouterKind};
use crate::metrics::metrics;
use crate::pool::{BackendCredentials, ConnectionError};
use crate::protocol::capabilities::CLIENT_PROTOCOL_41;
use crate::protocol::{CodecError, ErrPacket, OkPacket, Packet, PacketCodec, ReplyTracker};
use crate::router::{
    new_router_session, BackendRequest, EndpointId, ErrorAction, Outbox, RoutedStatement,
    RouterSession,
};
use crate::worker::{DcId, DelayedCalls, WorkerContext};

const CR_SERVER_LOST: u16 = 2013;
const ER_CON_COUNT_ERROR: u16 = 1040;

type ClientStream<S> = Framed<S, PacketCodec>;

/// Requests for a backend connection task
#[derive(Debug)]
enum BackendCommand {
    Write(Packet),
    /// Return the connection to the pool
    Release,
    Close,
}

/// Things that happen outside the client socket
#[derive(Debug)]
enum SessionEvent {
    Connected {
        endpoint: EndpointId,
        generation: u64,
        thread_id: u32,
    },
    Packet {
        endpoint: EndpointId,
        generation: u64,
        packet: Packet,
    },
    Failed {
        endpoint: EndpointId,
        generation: u64,
        reason: String,
        /// The connection cap of the server was reached
        exhausted: bool,
    },
    KillDone(u64, Result<(), KillError>),
    KillTimeout(u64),
}

struct BackendSlot {
    tx: mpsc::UnboundedSender<BackendCommand>,
    tracker: ReplyTracker,
    /// Distinguishes this connection from earlier ones of the same endpoint
    generation: u64,
    server: BackendServer,
    thread_id: Option<u32>,
}

struct PendingKill {
    id: u64,
    timer: DcId,
    /// Set once the KILL finished or timed out
    result: Option<Result<(), KillError>>,
}

struct QueryTimer {
    started: Instant,
    command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One client session
pub struct Session {
    client: ClientConnection,
    worker: Rc<WorkerContext>,
    router: Option<Box<dyn RouterSession>>,
    backends: HashMap<EndpointId, BackendSlot>,
    creds: BackendCredentials,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    control_tx: mpsc::UnboundedSender<SessionControl>,
    control_rx: mpsc::UnboundedReceiver<SessionControl>,
    dcalls: DelayedCalls,
    /// KILLs in the order the client sent them
    kills: VecDeque<PendingKill>,
    next_kill: u64,
    /// A reply to the last routed statement is outstanding
    awaiting_reply: bool,
    /// Some part of that reply reached the client
    replied: bool,
    query: Option<QueryTimer>,
    registered: bool,
}

impl Session {
    pub fn new(id: u64, host: &str, worker: Rc<WorkerContext>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let client = ClientConnection::new(id, host, &worker.service.config.server.server_version);
        Self {
            client,
            worker,
            router: None,
            backends: HashMap::new(),
            creds: BackendCredentials::default(),
            next_generation: 0,
            events_tx,
            events_rx,
            control_tx,
            control_rx,
            dcalls: DelayedCalls::new(),
            kills: VecDeque::new(),
            next_kill: 0,
            awaiting_reply: false,
            replied: false,
            query: None,
            registered: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.client.session().id
    }

    /// Run the session until either side closes it
    #[instrument(skip_all, fields(session_id = self.id()))]
    pub async fn run<S>(mut self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(stream, PacketCodec::frames());
        client.send(self.client.greeting()).await?;

        let result = self.event_loop(&mut client).await;
        self.shutdown();
        result
    }

    async fn event_loop<S>(&mut self, client: &mut ClientStream<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let flow = tokio::select! {
                frame = client.next() => match frame {
                    Some(Ok(packet)) => self.on_client_packet(client, packet).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        debug!("Client disconnected");
                        Flow::Stop
                    }
                },
                Some(event) = self.events_rx.recv() => self.on_event(client, event).await?,
                Some(msg) = self.control_rx.recv() => self.on_control(msg),
            };
            if flow == Flow::Stop {
                client.flush().await?;
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    async fn on_client_packet<S>(
        &mut self,
        client: &mut ClientStream<S>,
        packet: Packet,
    ) -> Result<Flow, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let users = self.worker.users();
        let ctx = ClientContext {
            users: &users,
            modules: &self.worker.service.modules,
        };
        let mut actions = VecDeque::from(self.client.on_packet(&ctx, packet));

        while let Some(action) = actions.pop_front() {
            let flow = match action {
                ClientAction::Send(packet) => {
                    client.feed(packet).await?;
                    Flow::Continue
                }
                ClientAction::Authenticate => {
                    actions.extend(self.client.authenticate().await);
                    Flow::Continue
                }
                ClientAction::StartSession => {
                    self.start_router();
                    Flow::Continue
                }
                ClientAction::Route(stmt) => {
                    let mut out = Outbox::new();
                    self.route(stmt, &mut out);
                    self.apply(client, out).await?
                }
                ClientAction::Kill(req) => {
                    self.start_kill(req);
                    Flow::Continue
                }
                ClientAction::ChangeUser(creds) => {
                    self.change_user(creds);
                    Flow::Continue
                }
                ClientAction::Close => Flow::Stop,
            };
            if flow == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }

        client.flush().await?;
        Ok(Flow::Continue)
    }

    fn start_router(&mut self) {
        let id = self.id();
        let service = &self.worker.service;
        self.creds = self.client.backend_credentials();
        self.router = Some(new_router_session(
            &service.config.router,
            &service.config.servers,
            &service.shards,
            self.client.backend_user(),
        ));

        let state = self.client.session();
        service.registry.register(SessionHandle::new(
            id,
            &state.username,
            &state.host,
            self.control_tx.clone(),
        ));
        self.registered = true;
        info!(user = %state.username, db = ?state.database, "Session started");
    }

    /// Replace every backend connection after COM_CHANGE_USER
    fn change_user(&mut self, creds: BackendCredentials) {
        self.release_backends();
        self.creds = creds;

        let service = &self.worker.service;
        self.router = Some(new_router_session(
            &service.config.router,
            &service.config.servers,
            &service.shards,
            self.client.backend_user(),
        ));
        service
            .registry
            .set_user(self.client.session().id, &self.client.session().username);
        info!(user = %self.client.session().username, "Changed user");
    }

    fn route(&mut self, stmt: RoutedStatement, out: &mut Outbox) {
        let Some(router) = self.router.as_mut() else {
            out.error(1105, "HY000", "Session is not ready");
            return;
        };

        if stmt.expects_reply() {
            self.awaiting_reply = true;
            self.replied = false;
            self.query = Some(QueryTimer {
                started: Instant::now(),
                command: format!("{:?}", stmt.command).to_lowercase(),
            });
        }

        let ctx = self.client.session().route_context(self.client.backend_user());
        if let Err(e) = router.route_query(&ctx, stmt, out) {
            warn!(error = %e, "Failed to route statement");
            metrics().record_query_error("route");
            let (code, state, message) = e.to_err();
            out.error(code, state, &message);
        }
    }

    /// Execute the effects a router produced
    async fn apply<S>(&mut self, client: &mut ClientStream<S>, out: Outbox) -> Result<Flow, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for (endpoint, request) in out.backend {
            match request {
                BackendRequest::Write(packet) => self.write_backend(endpoint, packet),
                BackendRequest::Close => self.close_backend(endpoint),
            }
        }

        if !out.client.is_empty() {
            self.replied = true;
            for packet in out.client {
                client.feed(packet).await?;
            }
            client.flush().await?;
        }

        if out.load_data {
            self.client.on_load_data_requested();
        }

        if let Some(completion) = out.completion {
            self.client.on_reply_complete(completion);
            self.awaiting_reply = false;
            if let Some(query) = self.query.take() {
                metrics().record_query(
                    &query.command,
                    router_label(self.worker.service.config.router.kind),
                    query.started.elapsed().as_secs_f64(),
                );
            }
        }

        Ok(if out.close { Flow::Stop } else { Flow::Continue })
    }

    // ------------------------------------------------------------------
    // Backend side
    // ------------------------------------------------------------------

    fn write_backend(&mut self, endpoint: EndpointId, packet: Packet) {
        if !self.backends.contains_key(&endpoint) && !self.open_backend(endpoint) {
            return;
        }
        if let Some(slot) = self.backends.get_mut(&endpoint) {
            slot.tracker.on_write(&packet);
            // A dead task has already queued its failure event
            let _ = slot.tx.send(BackendCommand::Write(packet));
        }
    }

    fn open_backend(&mut self, endpoint: EndpointId) -> bool {
        let Some(server) = self
            .router
            .as_ref()
            .and_then(|r| r.endpoints().get(endpoint.0))
            .map(|e| e.server.clone())
        else {
            warn!(endpoint = %endpoint, "Write to unknown endpoint");
            return false;
        };

        let mut creds = self.creds.clone();
        creds.database = match self.worker.service.config.router.kind {
            // Databases live on different servers, the router switches them
            RouterKind::SchemaRouter => None,
            _ => self.client.session().database.clone(),
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::task::spawn_local(run_backend(
            self.worker.clone(),
            server.clone(),
            creds,
            BackendTask {
                endpoint,
                generation,
                commands: rx,
                events: self.events_tx.clone(),
            },
        ));

        self.backends.insert(
            endpoint,
            BackendSlot {
                tx,
                tracker: ReplyTracker::new(),
                generation,
                server,
                thread_id: None,
            },
        );
        true
    }

    fn close_backend(&mut self, endpoint: EndpointId) {
        if let Some(slot) = self.backends.remove(&endpoint) {
            debug!(server = %slot.server.name, "Closing backend connection");
            let _ = slot.tx.send(BackendCommand::Close);
        }
    }

    /// Give idle connections back to the pool and close the rest
    fn release_backends(&mut self) {
        for (_, slot) in self.backends.drain() {
            let command = if slot.tracker.is_idle() && slot.thread_id.is_some() {
                BackendCommand::Release
            } else {
                BackendCommand::Close
            };
            let _ = slot.tx.send(command);
        }
    }

    fn current_slot(&mut self, endpoint: EndpointId, generation: u64) -> Option<&mut BackendSlot> {
        self.backends
            .get_mut(&endpoint)
            .filter(|slot| slot.generation == generation)
    }

    async fn on_event<S>(&mut self, client: &mut ClientStream<S>, event: SessionEvent) -> Result<Flow, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match event {
            SessionEvent::Connected {
                endpoint,
                generation,
                thread_id,
            } => {
                if let Some(slot) = self.current_slot(endpoint, generation) {
                    slot.thread_id = Some(thread_id);
                }
                Ok(Flow::Continue)
            }
            SessionEvent::Packet {
                endpoint,
                generation,
                packet,
            } => {
                let Some(slot) = self.current_slot(endpoint, generation) else {
                    return Ok(Flow::Continue);
                };
                let reply = slot.tracker.on_read(&packet).clone();

                let mut out = Outbox::new();
                if let Some(router) = self.router.as_mut() {
                    router.client_reply(endpoint, packet, &reply, &mut out);
                }
                self.apply(client, out).await
            }
            SessionEvent::Failed {
                endpoint,
                generation,
                reason,
                exhausted,
            } => {
                if self.current_slot(endpoint, generation).is_none() {
                    return Ok(Flow::Continue);
                }
                self.backends.remove(&endpoint);
                self.on_backend_failure(client, endpoint, &reason, exhausted).await
            }
            SessionEvent::KillDone(id, result) => {
                self.finish_kill(client, id, result).await?;
                Ok(Flow::Continue)
            }
            SessionEvent::KillTimeout(id) => {
                if self.kills.iter().any(|k| k.id == id && k.result.is_none()) {
                    warn!("KILL did not finish in time, answering the client anyway");
                }
                self.finish_kill(client, id, Ok(())).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_backend_failure<S>(
        &mut self,
        client: &mut ClientStream<S>,
        endpoint: EndpointId,
        reason: &str,
        exhausted: bool,
    ) -> Result<Flow, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut out = Outbox::new();
        let action = match self.router.as_mut() {
            Some(router) => router.handle_error(endpoint, reason, &mut out),
            None => ErrorAction::Close,
        };

        if exhausted {
            for packet in out.client.iter_mut() {
                if is_server_lost(packet) {
                    *packet = too_many_connections(packet.sequence_id);
                }
            }
        }

        if action == ErrorAction::Close {
            if self.awaiting_reply && !self.replied && out.client.is_empty() {
                if exhausted {
                    out.client.push(too_many_connections(1));
                    out.complete_generated(false);
                } else {
                    out.error(CR_SERVER_LOST, "HY000", "Lost connection to backend server during query");
                }
            }
            metrics().record_query_error("backend_lost");
            out.close = true;
        }

        self.apply(client, out).await
    }

    // ------------------------------------------------------------------
    // KILL
    // ------------------------------------------------------------------

    fn start_kill(&mut self, req: KillRequest) {
        self.next_kill += 1;
        let id = self.next_kill;

        let worker = self.worker.clone();
        let killer = self.client.killer();
        let events = self.events_tx.clone();
        tokio::task::spawn_local(async move {
            let ctx = KillContext {
                registry: &worker.service.registry,
                pool: &worker.pool,
                service: worker.service.service_credentials(),
            };
            let result = execute_kill(&req, &killer, &ctx).await;
            let _ = events.send(SessionEvent::KillDone(id, result));
        });

        let events = self.events_tx.clone();
        let timeout = Duration::from_millis(self.worker.service.config.kill.timeout_ms);
        let timer = self.dcalls.add(timeout, move || {
            let _ = events.send(SessionEvent::KillTimeout(id));
        });
        self.kills.push_back(PendingKill {
            id,
            timer,
            result: None,
        });
    }

    /// Answer each KILL exactly once, whichever of completion and timeout
    /// comes first. Replies go out in the order the KILLs were received.
    async fn finish_kill<S>(
        &mut self,
        client: &mut ClientStream<S>,
        id: u64,
        result: Result<(), KillError>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(pending) = self.kills.iter_mut().find(|k| k.id == id) else {
            return Ok(());
        };
        if pending.result.is_some() {
            return Ok(());
        }
        pending.result = Some(result);
        let timer = pending.timer;
        self.dcalls.cancel(timer);

        let caps = self.client.session().capability_flags;
        let mut answered = false;
        while self.kills.front().is_some_and(|k| k.result.is_some()) {
            let Some(PendingKill { result: Some(result), .. }) = self.kills.pop_front() else {
                break;
            };
            let packet = match result {
                Ok(()) => OkPacket::new()
                    .with_status(self.client.session().server_status())
                    .encode(1, caps),
                Err(e) => {
                    let (code, state) = e.to_err();
                    ErrPacket::new(code, state, &e.to_string()).encode(1, caps)
                }
            };
            client.feed(packet).await?;
            answered = true;
        }
        if answered {
            client.flush().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control messages
    // ------------------------------------------------------------------

    fn on_control(&mut self, msg: SessionControl) -> Flow {
        match msg {
            SessionControl::Kill => {
                info!("Session killed");
                Flow::Stop
            }
            SessionControl::BackendThreads(reply) => {
                let threads = self
                    .backends
                    .values()
                    .filter_map(|slot| slot.thread_id.map(|t| (slot.server.clone(), t)))
                    .collect();
                let _ = reply.send(threads);
                Flow::Continue
            }
            SessionControl::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
                Flow::Continue
            }
        }
    }

    fn diagnostics(&self) -> serde_json::Value {
        let state = self.client.session();
        json!({
            "id": state.id,
            "user": state.username,
            "host": state.host,
            "state": format!("{:?}", self.client.state()),
            "database": state.database,
            "autocommit": state.autocommit,
            "trx_active": state.in_transaction,
            "trx_read_only": state.read_only_transaction,
            "backends": self.backends.iter().map(|(id, slot)| json!({
                "endpoint": id.0,
                "server": slot.server.name,
                "thread_id": slot.thread_id,
            })).collect::<Vec<_>>(),
            "router": self.router.as_ref().map(|r| r.diagnostics()),
        })
    }

    fn shutdown(&mut self) {
        self.dcalls.cancel_all();
        self.release_backends();
        if self.registered {
            self.worker.service.registry.unregister(self.id());
            self.registered = false;
        }
    }
}

struct BackendTask {
    endpoint: EndpointId,
    generation: u64,
    commands: mpsc::UnboundedReceiver<BackendCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl BackendTask {
    fn fail(&self, reason: String, exhausted: bool) {
        let _ = self.events.send(SessionEvent::Failed {
            endpoint: self.endpoint,
            generation: self.generation,
            reason,
            exhausted,
        });
    }
}

/// Owns one backend connection for as long as the session uses it
async fn run_backend(
    worker: Rc<WorkerContext>,
    server: BackendServer,
    creds: BackendCredentials,
    mut task: BackendTask,
) {
    let mut conn = match worker.pool.acquire(&server, &creds).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(server = %server.name, error = %e, "Failed to connect to backend");
            task.fail(e.to_string(), matches!(e, ConnectionError::Limit(_)));
            return;
        }
    };

    let _ = task.events.send(SessionEvent::Connected {
        endpoint: task.endpoint,
        generation: task.generation,
        thread_id: conn.thread_id(),
    });

    loop {
        tokio::select! {
            command = task.commands.recv() => match command {
                Some(BackendCommand::Write(packet)) => {
                    if let Err(e) = conn.send(packet).await {
                        task.fail(e.to_string(), false);
                        return;
                    }
                }
                Some(BackendCommand::Release) => {
                    worker.pool.release(conn).await;
                    return;
                }
                Some(BackendCommand::Close) | None => return,
            },
            packet = conn.recv() => match packet {
                Ok(packet) => {
                    let _ = task.events.send(SessionEvent::Packet {
                        endpoint: task.endpoint,
                        generation: task.generation,
                        packet,
                    });
                }
                Err(e) => {
                    debug!(server = %server.name, error = %e, "Backend connection lost");
                    task.fail(e.to_string(), false);
                    return;
                }
            },
        }
    }
}

fn router_label(kind: RouterKind) -> &'static str {
    match kind {
        RouterKind::ReadWriteSplit => "readwritesplit",
        RouterKind::Cat => "cat",
        RouterKind::SchemaRouter => "schemarouter",
    }
}

fn is_server_lost(packet: &Packet) -> bool {
    ErrPacket::parse(&packet.payload, CLIENT_PROTOCOL_41).is_some_and(|e| e.error_code == CR_SERVER_LOST)
}

fn too_many_connections(sequence_id: u8) -> Packet {
    ErrPacket::new(ER_CON_COUNT_ERROR, "08004", "Too many connections").encode(sequence_id, CLIENT_PROTOCOL_41)
}

/// Serve one accepted client on the current worker
pub async fn handle_client(worker: Rc<WorkerContext>, stream: TcpStream, peer: SocketAddr) {
    stream.set_nodelay(true).ok();
    metrics().record_connection_accepted();

    let id = worker.service.registry.next_id();
    info!(session_id = id, peer = %peer, worker = worker.id, "New connection");

    let session = Session::new(id, &peer.ip().to_string(), worker);
    match session.run(stream).await {
        Ok(()) => info!(session_id = id, "Session ended"),
        Err(e) => warn!(session_id = id, error = %e, "Session ended with error"),
    }
    metrics().record_connection_closed();
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}
