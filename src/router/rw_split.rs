//! Read/write splitting
//!
//! Writes, transactions and anything that cannot be proven to be a plain
//! read go to the primary. Reads outside transactions are spread over the
//! replicas. Session commands run on every connection the session has and
//! are replayed onto connections opened later. An open transaction is logged
//! so that it can be replayed when the primary connection is lost.

use std::collections::{HashMap, VecDeque};

use serde_json::json;
use tracing::{debug, info, warn};

use super::selector::{FirstSelector, InstanceSelector, WeightedRoundRobin};
use super::sescmd::{SescmdCheck, SescmdHistory};
use super::{
    Endpoint, EndpointId, ErrorAction, Outbox, RouteContext, RouteError, RoutedStatement,
    RouterSession,
};
use crate::config::RouterConfig;
use crate::metrics::metrics;
use crate::parser::TypeMask;
use crate::protocol::{status, Command, Packet, Reply};
use crate::trx::Trx;

const ER_CONNECTION_KILLED: u16 = 1927;
const CR_SERVER_LOST: u16 = 2013;

/// What to do with the reply an endpoint sends next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyRoute {
    Forward,
    /// Session command, only the first endpoint to answer is forwarded
    Sescmd(u64),
    /// Session command replayed onto a new connection, never forwarded
    SescmdReplay(u64),
    /// Logged transaction statement being replayed
    TrxReplay,
}

#[derive(Debug, Clone)]
struct InFlight {
    target: EndpointId,
    packet: Packet,
    /// Plain read on a replica, may be retried elsewhere
    is_read: bool,
    in_trx: bool,
    /// Part of the reply has reached the client
    replied: bool,
}

#[derive(Debug, Default)]
struct PendingSescmd {
    responder: Option<EndpointId>,
    remaining: usize,
}

struct Replay {
    target: EndpointId,
    /// Statements whose replies are still outstanding
    statements: VecDeque<Packet>,
    trx: Trx,
    expected: [u8; 20],
    interrupted: Option<InFlight>,
}

#[derive(Debug, Default)]
struct RouteStats {
    primary: u64,
    replica: u64,
    all: u64,
}

pub struct RwSplitSession {
    config: RouterConfig,
    endpoints: Vec<Endpoint>,
    primary_selector: FirstSelector,
    replica_selector: WeightedRoundRobin,
    history: SescmdHistory,
    queues: HashMap<EndpointId, VecDeque<ReplyRoute>>,
    sescmds: HashMap<u64, PendingSescmd>,
    current: Option<InFlight>,
    load_data_target: Option<EndpointId>,
    trx: Trx,
    trx_open: bool,
    trx_target: Option<EndpointId>,
    trx_read_only: bool,
    trx_replayable: bool,
    replay: Option<Replay>,
    replay_attempts: u32,
    held: VecDeque<(RouteContext, RoutedStatement)>,
    stats: RouteStats,
}

impl RwSplitSession {
    pub fn new(config: RouterConfig, endpoints: Vec<Endpoint>) -> Self {
        let history = SescmdHistory::new(config.max_sescmd_history);
        Self {
            config,
            endpoints,
            primary_selector: FirstSelector,
            replica_selector: WeightedRoundRobin::new(),
            history,
            queues: HashMap::new(),
            sescmds: HashMap::new(),
            current: None,
            load_data_target: None,
            trx: Trx::new(),
            trx_open: false,
            trx_target: None,
            trx_read_only: false,
            trx_replayable: true,
            replay: None,
            replay_attempts: 0,
            held: VecDeque::new(),
            stats: RouteStats::default(),
        }
    }

    fn endpoint(&self, id: EndpointId) -> &Endpoint {
        &self.endpoints[id.0]
    }

    fn queue(&mut self, id: EndpointId) -> &mut VecDeque<ReplyRoute> {
        self.queues.entry(id).or_default()
    }

    fn primary(&self) -> Option<EndpointId> {
        let primaries: Vec<&Endpoint> = self.endpoints.iter().filter(|e| e.is_primary()).collect();
        self.primary_selector.select(&primaries)
    }

    /// Pick a replica, preferring ones already connected
    fn replica(&self, exclude: Option<EndpointId>) -> Option<EndpointId> {
        let replicas: Vec<&Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| !e.is_primary() && Some(e.id) != exclude)
            .collect();
        let connected: Vec<&Endpoint> = replicas.iter().copied().filter(|e| e.in_use).collect();
        if connected.is_empty() {
            self.replica_selector.select(&replicas)
        } else {
            self.replica_selector.select(&connected)
        }
    }

    fn is_session_command(stmt: &RoutedStatement) -> bool {
        match stmt.command {
            Command::InitDb | Command::SetOption => true,
            Command::Query => {
                let mask = stmt.classification.mask;
                mask.contains(TypeMask::SESSION_WRITE) && !mask.intersects(TypeMask::WRITE)
            }
            _ => false,
        }
    }

    /// Open a connection, replaying the session command history onto it
    fn ensure_connected(&mut self, id: EndpointId, out: &mut Outbox) {
        if self.endpoints[id.0].in_use {
            return;
        }
        self.endpoints[id.0].in_use = true;

        let replay: Vec<(u64, Packet)> = self
            .history
            .iter()
            .map(|e| (e.id, e.packet.clone()))
            .collect();
        if !replay.is_empty() {
            debug!(endpoint = %self.endpoint(id).name(), commands = replay.len(), "Replaying session commands");
        }
        for (sescmd, packet) in replay {
            out.write(id, packet);
            self.queue(id).push_back(ReplyRoute::SescmdReplay(sescmd));
        }
    }

    fn close_endpoint(&mut self, id: EndpointId, out: &mut Outbox) {
        self.endpoints[id.0].in_use = false;
        out.close_backend(id);
        let dropped = self.queues.remove(&id).unwrap_or_default();
        self.forget_sescmds(id, &dropped);
    }

    /// Drop an endpoint's claims on pending session commands.
    ///
    /// Returns true if the client can no longer get a reply for one of them.
    fn forget_sescmds(&mut self, id: EndpointId, routes: &VecDeque<ReplyRoute>) -> bool {
        let mut lost = false;
        for route in routes {
            if let ReplyRoute::Sescmd(sescmd) = route {
                if let Some(pending) = self.sescmds.get_mut(sescmd) {
                    pending.remaining = pending.remaining.saturating_sub(1);
                    if pending.responder == Some(id) || pending.remaining == 0 {
                        lost = true;
                    }
                    if pending.remaining == 0 {
                        self.sescmds.remove(sescmd);
                    }
                }
            }
        }
        lost
    }

    fn route_sescmd(&mut self, stmt: RoutedStatement, out: &mut Outbox) -> Result<(), RouteError> {
        let mut targets: Vec<EndpointId> = self
            .endpoints
            .iter()
            .filter(|e| e.in_use)
            .map(|e| e.id)
            .collect();
        if targets.is_empty() {
            let target = self
                .primary()
                .or_else(|| self.replica(None))
                .ok_or_else(|| RouteError::NoBackend("session command".into()))?;
            self.ensure_connected(target, out);
            targets.push(target);
        }

        let id = self.history.add(stmt.packet.clone());
        debug!(targets = targets.len(), sescmd = id, "Routing session command");
        for &target in &targets {
            out.write(target, stmt.packet.clone());
            if stmt.expects_reply() {
                self.queue(target).push_back(ReplyRoute::Sescmd(id));
            }
        }
        if stmt.expects_reply() {
            self.sescmds.insert(
                id,
                PendingSescmd {
                    responder: None,
                    remaining: targets.len(),
                },
            );
        }
        self.current = None;
        self.load_data_target = targets.first().copied();
        self.stats.all += 1;
        metrics().record_route("all");
        Ok(())
    }

    fn select_target(&mut self, ctx: &RouteContext, stmt: &RoutedStatement) -> Result<(EndpointId, bool), RouteError> {
        let mask = stmt.classification.mask;

        if self.trx_open {
            if let Some(target) = self.trx_target {
                return Ok((target, false));
            }
        }

        let starts_trx = mask.contains(TypeMask::BEGIN_TRX);
        let read_only_trx = starts_trx && mask.contains(TypeMask::READONLY);
        let in_trx = starts_trx || ctx.trx_active || !ctx.autocommit;

        let replica_ok = read_only_trx
            || (!in_trx && stmt.command == Command::Query && mask.is_pure_read());

        let (target, is_read) = match replica_ok.then(|| self.replica(None)).flatten() {
            Some(replica) => (replica, !read_only_trx),
            None => (
                self.primary()
                    .ok_or_else(|| RouteError::NoBackend("primary".into()))?,
                false,
            ),
        };

        if in_trx {
            self.trx_open = true;
            self.trx_target = Some(target);
            self.trx_read_only = read_only_trx;
            self.trx_replayable = self.config.transaction_replay
                && !read_only_trx
                && self.endpoint(target).is_primary();
        }
        Ok((target, is_read))
    }

    fn write_statement(&mut self, target: EndpointId, packet: Packet, is_read: bool, out: &mut Outbox) {
        self.ensure_connected(target, out);
        out.write(target, packet.clone());
        self.load_data_target = Some(target);

        let in_trx = self.trx_open && self.trx_target == Some(target);
        if packet.command_byte().map(Command::from).map_or(false, Command::expects_reply) {
            self.queue(target).push_back(ReplyRoute::Forward);
            self.current = Some(InFlight {
                target,
                packet,
                is_read,
                in_trx,
                replied: false,
            });
        } else if in_trx {
            self.log_statement(target, packet);
        }

        if self.endpoint(target).is_primary() {
            self.stats.primary += 1;
            metrics().record_route("primary");
        } else {
            self.stats.replica += 1;
            metrics().record_route("replica");
        }
    }

    fn log_statement(&mut self, target: EndpointId, packet: Packet) {
        if !self.trx_replayable {
            return;
        }
        if self.trx.size() + packet.payload.len() > self.config.trx_max_size {
            info!(max = self.config.trx_max_size, "Transaction is too large to be replayed");
            self.trx_replayable = false;
            return;
        }
        if let Err(e) = self.trx.add_stmt(target, packet) {
            warn!(error = %e, "Transaction log rejected statement, disabling replay");
            self.trx_replayable = false;
        }
    }

    fn end_trx(&mut self) {
        self.trx.close();
        self.trx_open = false;
        self.trx_target = None;
        self.trx_read_only = false;
        self.trx_replayable = true;
        self.replay_attempts = 0;
    }

    fn on_forward_complete(&mut self, endpoint: EndpointId, reply: &Reply) {
        if let Some(current) = self.current.take() {
            if current.target != endpoint {
                self.current = Some(current);
            } else if current.in_trx {
                self.log_statement(endpoint, current.packet);
            }
        }

        // Status flags of an error reply are meaningless
        if reply.is_ok()
            && self.trx_open
            && self.trx_target == Some(endpoint)
            && reply.server_status() & status::SERVER_STATUS_IN_TRANS == 0
        {
            debug!(statements = self.trx.len(), "Transaction ended");
            self.end_trx();
        }
    }

    fn on_sescmd_reply(
        &mut self,
        endpoint: EndpointId,
        sescmd: u64,
        packet: Packet,
        reply: &Reply,
        out: &mut Outbox,
    ) {
        let pending = self.sescmds.entry(sescmd).or_default();
        let responder = *pending.responder.get_or_insert(endpoint);
        if responder == endpoint {
            out.forward(packet, reply);
        }
        if !reply.is_complete() {
            return;
        }

        self.queue(endpoint).pop_front();
        if let Some(pending) = self.sescmds.get_mut(&sescmd) {
            pending.remaining = pending.remaining.saturating_sub(1);
            if pending.remaining == 0 {
                self.sescmds.remove(&sescmd);
            }
        }

        // SET autocommit=1 commits an open transaction
        if reply.is_ok()
            && self.trx_open
            && self.trx_target == Some(endpoint)
            && reply.server_status() & status::SERVER_STATUS_IN_TRANS == 0
        {
            self.end_trx();
        }

        if self.history.check(sescmd, reply.is_ok()) == SescmdCheck::Mismatch {
            warn!(
                endpoint = %self.endpoint(endpoint).name(),
                sescmd,
                "Session command result differs from the first reply, closing connection"
            );
            self.close_endpoint(endpoint, out);
        }
    }

    fn start_replay(&mut self, target: EndpointId, out: &mut Outbox) -> ErrorAction {
        let interrupted = self.current.take().filter(|c| c.target == target);
        let partial = interrupted.as_ref().map_or(false, |c| c.replied);

        if !self.config.transaction_replay
            || !self.trx_replayable
            || self.replay_attempts >= self.config.trx_max_attempts
            || partial
        {
            warn!(
                attempts = self.replay_attempts,
                replayable = self.trx_replayable,
                partial_reply = partial,
                "Transaction cannot be replayed"
            );
            metrics().record_replay("ineligible");
            out.error(ER_CONNECTION_KILLED, "08S01", "Transaction replay is not possible");
            out.close = true;
            return ErrorAction::Close;
        }

        self.replay_attempts += 1;
        let expected = self.trx.finalize();
        let statements: VecDeque<Packet> = self.trx.statements().cloned().collect();
        info!(
            attempt = self.replay_attempts,
            statements = statements.len(),
            "Replaying transaction"
        );

        self.ensure_connected(target, out);
        for stmt in &statements {
            out.write(target, stmt.clone());
            self.queue(target).push_back(ReplyRoute::TrxReplay);
        }
        self.replay = Some(Replay {
            target,
            statements,
            trx: Trx::new(),
            expected,
            interrupted,
        });

        if self.replay.as_ref().map_or(false, |r| r.statements.is_empty()) {
            self.finish_replay(out);
        }
        ErrorAction::Continue
    }

    fn on_replay_reply(&mut self, endpoint: EndpointId, packet: &Packet, reply: &Reply, out: &mut Outbox) {
        let Some(replay) = self.replay.as_mut() else {
            return;
        };
        replay.trx.add_result(packet);
        if !reply.is_complete() {
            return;
        }

        if let Some(stmt) = replay.statements.pop_front() {
            // Same target every time, cannot fail
            let _ = replay.trx.add_stmt(endpoint, stmt);
        }
        let done = replay.statements.is_empty();
        self.queue(endpoint).pop_front();
        if done {
            self.finish_replay(out);
        }
    }

    fn finish_replay(&mut self, out: &mut Outbox) {
        let Some(mut replay) = self.replay.take() else {
            return;
        };

        if replay.trx.finalize() != replay.expected {
            warn!("Transaction checksum mismatch encountered when replaying transaction");
            metrics().record_replay("mismatch");
            out.error(
                ER_CONNECTION_KILLED,
                "08S01",
                "Transaction checksum mismatch encountered when replaying transaction.",
            );
            out.close = true;
            return;
        }

        info!(statements = replay.trx.len(), "Transaction replay successful");
        metrics().record_replay("success");
        self.trx = replay.trx;
        self.trx_target = Some(replay.target);

        if let Some(mut interrupted) = replay.interrupted {
            debug!("Resending interrupted statement");
            out.write(replay.target, interrupted.packet.clone());
            self.queue(replay.target).push_back(ReplyRoute::Forward);
            interrupted.replied = false;
            self.current = Some(interrupted);
        }

        while let Some((ctx, stmt)) = self.held.pop_front() {
            if let Err(e) = self.route_query(&ctx, stmt, out) {
                let (code, state, msg) = e.to_err();
                out.error(code, state, &msg);
            }
        }
    }

    /// Retry a failed replica read elsewhere if nothing reached the client
    fn retry_read(&mut self, failed: &InFlight, out: &mut Outbox) -> bool {
        if !self.config.retry_failed_reads || !failed.is_read || failed.replied {
            return false;
        }
        let Some(target) = self.replica(Some(failed.target)).or_else(|| self.primary()) else {
            return false;
        };
        info!(
            from = %self.endpoint(failed.target).name(),
            to = %self.endpoint(target).name(),
            "Retrying failed read"
        );
        self.write_statement(target, failed.packet.clone(), true, out);
        true
    }
}

impl RouterSession for RwSplitSession {
    fn route_query(
        &mut self,
        ctx: &RouteContext,
        stmt: RoutedStatement,
        out: &mut Outbox,
    ) -> Result<(), RouteError> {
        if self.replay.is_some() {
            self.held.push_back((ctx.clone(), stmt));
            return Ok(());
        }

        if stmt.load_data {
            let target = self
                .load_data_target
                .ok_or_else(|| RouteError::NoBackend("LOAD DATA".into()))?;
            out.write(target, stmt.packet);
            return Ok(());
        }

        if Self::is_session_command(&stmt) {
            return self.route_sescmd(stmt, out);
        }

        let (target, is_read) = self.select_target(ctx, &stmt)?;
        debug!(
            target = %self.endpoint(target).name(),
            mask = ?stmt.classification.mask,
            in_trx = self.trx_open,
            "Routing statement"
        );
        self.write_statement(target, stmt.packet, is_read, out);
        Ok(())
    }

    fn client_reply(&mut self, endpoint: EndpointId, packet: Packet, reply: &Reply, out: &mut Outbox) {
        let Some(route) = self.queues.get(&endpoint).and_then(|q| q.front()).copied() else {
            warn!(endpoint = %endpoint, "Unexpected reply from backend");
            return;
        };

        match route {
            ReplyRoute::Forward => {
                if let Some(current) = self.current.as_mut().filter(|c| c.target == endpoint) {
                    current.replied = true;
                    if current.in_trx && self.trx_replayable {
                        self.trx.add_result(&packet);
                    }
                }
                out.forward(packet, reply);
                if reply.is_complete() {
                    self.queue(endpoint).pop_front();
                    self.on_forward_complete(endpoint, reply);
                }
            }
            ReplyRoute::Sescmd(id) => self.on_sescmd_reply(endpoint, id, packet, reply, out),
            ReplyRoute::SescmdReplay(id) => {
                if reply.is_complete() {
                    self.queue(endpoint).pop_front();
                    if self.history.check(id, reply.is_ok()) == SescmdCheck::Mismatch {
                        warn!(
                            endpoint = %self.endpoint(endpoint).name(),
                            "Replayed session command result differs, closing connection"
                        );
                        self.close_endpoint(endpoint, out);
                    }
                }
            }
            ReplyRoute::TrxReplay => self.on_replay_reply(endpoint, &packet, reply, out),
        }
    }

    fn handle_error(&mut self, endpoint: EndpointId, reason: &str, out: &mut Outbox) -> ErrorAction {
        warn!(endpoint = %self.endpoint(endpoint).name(), reason = %reason, "Backend connection failed");
        self.endpoints[endpoint.0].in_use = false;
        let dropped = self.queues.remove(&endpoint).unwrap_or_default();
        let sescmd_lost = self.forget_sescmds(endpoint, &dropped);

        if let Some(replay) = self.replay.take() {
            if replay.target == endpoint {
                // Failed again while replaying, start over
                self.current = replay.interrupted;
                return self.start_replay(endpoint, out);
            }
            self.replay = Some(replay);
        }

        if self.trx_open && self.trx_target == Some(endpoint) {
            return self.start_replay(endpoint, out);
        }

        if sescmd_lost {
            out.error(CR_SERVER_LOST, "HY000", "Lost connection to backend server during query");
            return ErrorAction::Close;
        }

        if let Some(current) = self.current.take() {
            if current.target != endpoint {
                self.current = Some(current);
                return ErrorAction::Continue;
            }
            if self.retry_read(&current, out) {
                return ErrorAction::Continue;
            }
            if !current.replied {
                out.error(CR_SERVER_LOST, "HY000", "Lost connection to backend server during query");
            }
            return ErrorAction::Close;
        }

        ErrorAction::Continue
    }

    fn diagnostics(&self) -> serde_json::Value {
        json!({
            "router": "readwritesplit",
            "endpoints": self.endpoints.iter().map(|e| json!({
                "name": e.name(),
                "role": if e.is_primary() { "primary" } else { "replica" },
                "in_use": e.in_use,
            })).collect::<Vec<_>>(),
            "routed": {
                "primary": self.stats.primary,
                "replica": self.stats.replica,
                "all": self.stats.all,
            },
            "sescmd_history": self.history.len(),
            "trx": {
                "open": self.trx_open,
                "read_only": self.trx_read_only,
                "target": self.trx_target.map(|t| self.endpoint(t).name().to_string()),
                "statements": self.trx.len(),
                "size": self.trx.size(),
                "replayable": self.trx_replayable,
                "replay_attempts": self.replay_attempts,
            },
        })
    }

    fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerRole;
    use crate::router::endpoints_for;
    use crate::router::test_util::*;

    const P: EndpointId = EndpointId(0);
    const R1: EndpointId = EndpointId(1);
    const R2: EndpointId = EndpointId(2);

    const AUTOCOMMIT: u16 = status::SERVER_STATUS_AUTOCOMMIT;
    const IN_TRX: u16 = status::SERVER_STATUS_AUTOCOMMIT | status::SERVER_STATUS_IN_TRANS;

    fn router_with(config: RouterConfig) -> RwSplitSession {
        RwSplitSession::new(
            config,
            endpoints_for(&[
                server("primary", ServerRole::Primary),
                server("replica1", ServerRole::Replica),
                server("replica2", ServerRole::Replica),
            ]),
        )
    }

    fn router() -> RwSplitSession {
        router_with(RouterConfig::default())
    }

    fn ctx() -> RouteContext {
        RouteContext {
            autocommit: true,
            ..Default::default()
        }
    }

    fn route(router: &mut RwSplitSession, b: &mut Backends, sql: &str, out: &mut Outbox) -> Vec<(EndpointId, Packet)> {
        router.route_query(&ctx(), statement(sql), out).unwrap();
        b.take(out)
    }

    #[test]
    fn test_reads_to_replica_writes_to_primary() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();

        let writes = route(&mut r, &mut b, "SELECT * FROM t", &mut out);
        assert_eq!(writes.len(), 1);
        assert!(writes[0].0 == R1 || writes[0].0 == R2);
        let replica = writes[0].0;
        b.reply(&mut r, replica, resultset(&["1"]), &mut out);
        assert!(out.completion.unwrap().ok);

        // Connected replica is preferred
        assert_eq!(route(&mut r, &mut b, "SELECT 2", &mut out)[0].0, replica);
        b.reply(&mut r, replica, resultset(&["2"]), &mut out);

        assert_eq!(route(&mut r, &mut b, "INSERT INTO t VALUES (1)", &mut out)[0].0, P);
        assert_eq!(route(&mut r, &mut b, "SELECT LAST_INSERT_ID()", &mut out)[0].0, P);
    }

    #[test]
    fn test_transaction_stays_on_primary() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();

        assert_eq!(route(&mut r, &mut b, "BEGIN", &mut out)[0].0, P);
        b.reply(&mut r, P, ok(IN_TRX), &mut out);
        assert_eq!(route(&mut r, &mut b, "SELECT * FROM t", &mut out)[0].0, P);
        b.reply(&mut r, P, resultset(&["a"]), &mut out);
        assert_eq!(route(&mut r, &mut b, "COMMIT", &mut out)[0].0, P);
        b.reply(&mut r, P, ok(AUTOCOMMIT), &mut out);

        assert!(!r.trx_open);
        assert!(r.trx.is_empty());
        assert_ne!(route(&mut r, &mut b, "SELECT * FROM t", &mut out)[0].0, P);
    }

    #[test]
    fn test_autocommit_off_goes_to_primary() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();
        let ctx = RouteContext {
            autocommit: false,
            ..Default::default()
        };

        r.route_query(&ctx, statement("SELECT 1"), &mut out).unwrap();
        assert_eq!(b.take(&mut out)[0].0, P);
    }

    #[test]
    fn test_read_only_transaction_uses_replica() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();

        let target = route(&mut r, &mut b, "START TRANSACTION READ ONLY", &mut out)[0].0;
        assert_ne!(target, P);
        b.reply(&mut r, target, ok(IN_TRX | status::SERVER_STATUS_IN_TRANS_READONLY), &mut out);
        assert_eq!(route(&mut r, &mut b, "SELECT 1", &mut out)[0].0, target);
        b.reply(&mut r, target, resultset(&["1"]), &mut out);
        assert_eq!(route(&mut r, &mut b, "COMMIT", &mut out)[0].0, target);
    }

    #[test]
    fn test_session_commands_go_everywhere() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();

        // Connect the primary and one replica
        route(&mut r, &mut b, "INSERT INTO t VALUES (1)", &mut out);
        b.reply(&mut r, P, ok(AUTOCOMMIT), &mut out);
        let replica = route(&mut r, &mut b, "SELECT 1", &mut out)[0].0;
        b.reply(&mut r, replica, resultset(&["1"]), &mut out);
        out.client.clear();

        let writes = route(&mut r, &mut b, "SET @a = 1", &mut out);
        assert_eq!(writes.len(), 2);

        b.reply(&mut r, replica, ok(AUTOCOMMIT), &mut out);
        assert_eq!(out.client.len(), 1);
        b.reply(&mut r, P, ok(AUTOCOMMIT), &mut out);
        // Only the first reply reaches the client
        assert_eq!(out.client.len(), 1);
        assert!(r.sescmds.is_empty());

        // A new connection gets the history first
        let other = if replica == R1 { R2 } else { R1 };
        r.endpoints[replica.0].in_use = false;
        let writes = route(&mut r, &mut b, "SELECT 2", &mut out);
        assert_eq!(writes[0].0, other);
        assert_eq!(writes.len(), 2);
        assert_eq!(&writes[0].1.payload[1..], b"SET @a = 1");

        out.client.clear();
        b.reply(&mut r, other, ok(AUTOCOMMIT), &mut out);
        assert!(out.client.is_empty());
        b.reply(&mut r, other, resultset(&["2"]), &mut out);
        assert_eq!(out.client.len(), 5);
    }

    #[test]
    fn test_session_command_mismatch_closes_endpoint() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();

        route(&mut r, &mut b, "INSERT INTO t VALUES (1)", &mut out);
        b.reply(&mut r, P, ok(AUTOCOMMIT), &mut out);
        let replica = route(&mut r, &mut b, "SELECT 1", &mut out)[0].0;
        b.reply(&mut r, replica, resultset(&["1"]), &mut out);

        route(&mut r, &mut b, "SET @a = 1", &mut out);
        b.reply(&mut r, P, ok(AUTOCOMMIT), &mut out);
        b.reply(&mut r, replica, err(1064), &mut out);
        b.take(&mut out);

        assert_eq!(b.closed, vec![replica]);
        assert!(!r.endpoints[replica.0].in_use);
    }

    fn open_trx(r: &mut RwSplitSession, b: &mut Backends, out: &mut Outbox) {
        route(r, b, "BEGIN", out);
        b.reply(r, P, ok(IN_TRX), out);
        route(r, b, "INSERT INTO t VALUES (1)", out);
        b.reply(r, P, ok(IN_TRX), out);
        out.client.clear();
        out.completion = None;
    }

    #[test]
    fn test_transaction_replay_after_idle_failure() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();
        open_trx(&mut r, &mut b, &mut out);
        assert_eq!(r.trx.len(), 2);

        b.fail(P);
        assert_eq!(r.handle_error(P, "connection reset", &mut out), ErrorAction::Continue);
        let writes = b.take(&mut out);
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|(id, _)| *id == P));

        b.reply(&mut r, P, ok(IN_TRX), &mut out);
        b.reply(&mut r, P, ok(IN_TRX), &mut out);
        assert!(out.client.is_empty());
        assert!(r.replay.is_none());
        assert!(!out.close);
        assert_eq!(r.trx.len(), 2);

        // Session continues inside the same transaction
        assert_eq!(route(&mut r, &mut b, "SELECT 1", &mut out)[0].0, P);
    }

    #[test]
    fn test_interrupted_statement_is_resent() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();
        open_trx(&mut r, &mut b, &mut out);

        route(&mut r, &mut b, "UPDATE t SET a = 2", &mut out);
        b.fail(P);
        assert_eq!(r.handle_error(P, "connection reset", &mut out), ErrorAction::Continue);
        assert_eq!(b.take(&mut out).len(), 2);

        b.reply(&mut r, P, ok(IN_TRX), &mut out);
        b.reply(&mut r, P, ok(IN_TRX), &mut out);
        let resent = b.take(&mut out);
        assert_eq!(resent.len(), 1);
        assert_eq!(&resent[0].1.payload[1..], b"UPDATE t SET a = 2");

        b.reply(&mut r, P, ok(IN_TRX), &mut out);
        assert_eq!(out.client.len(), 1);
        assert!(out.completion.unwrap().ok);
        assert_eq!(r.trx.len(), 3);
    }

    #[test]
    fn test_replay_checksum_mismatch() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();
        open_trx(&mut r, &mut b, &mut out);

        b.fail(P);
        r.handle_error(P, "connection reset", &mut out);
        b.take(&mut out);
        b.reply(&mut r, P, ok(IN_TRX), &mut out);
        // Different result for the INSERT
        b.reply(&mut r, P, err(1062), &mut out);

        assert!(out.close);
        let err = crate::protocol::ErrPacket::parse(&out.client[0].payload, crate::protocol::capabilities::CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, 1927);
        assert_eq!(err.sql_state, "08S01");
    }

    #[test]
    fn test_replay_refused_when_too_large() {
        let mut r = router_with(RouterConfig {
            trx_max_size: 8,
            ..RouterConfig::default()
        });
        let mut b = Backends::default();
        let mut out = Outbox::new();
        open_trx(&mut r, &mut b, &mut out);
        assert!(!r.trx_replayable);

        b.fail(P);
        assert_eq!(r.handle_error(P, "connection reset", &mut out), ErrorAction::Close);
        assert_eq!(out.client[0].payload[0], 0xFF);
    }

    #[test]
    fn test_replay_refused_after_partial_reply() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();
        open_trx(&mut r, &mut b, &mut out);

        route(&mut r, &mut b, "SELECT * FROM t", &mut out);
        let partial: Vec<Packet> = resultset(&["a", "b"]).into_iter().take(4).collect();
        b.reply(&mut r, P, partial, &mut out);

        b.fail(P);
        assert_eq!(r.handle_error(P, "connection reset", &mut out), ErrorAction::Close);
        assert!(out.close);
    }

    #[test]
    fn test_failed_replica_read_is_retried() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();

        let replica = route(&mut r, &mut b, "SELECT * FROM t", &mut out)[0].0;
        b.fail(replica);
        assert_eq!(r.handle_error(replica, "connection reset", &mut out), ErrorAction::Continue);

        let retry = b.take(&mut out);
        assert_eq!(retry.len(), 1);
        assert_ne!(retry[0].0, replica);
        b.reply(&mut r, retry[0].0, resultset(&["a"]), &mut out);
        assert!(out.completion.unwrap().ok);
    }

    #[test]
    fn test_failed_write_closes_session() {
        let mut r = router_with(RouterConfig {
            retry_failed_reads: false,
            ..RouterConfig::default()
        });
        let mut b = Backends::default();
        let mut out = Outbox::new();

        route(&mut r, &mut b, "INSERT INTO t VALUES (1)", &mut out);
        b.fail(P);
        assert_eq!(r.handle_error(P, "connection reset", &mut out), ErrorAction::Close);
        assert_eq!(out.client[0].payload[0], 0xFF);
    }

    #[test]
    fn test_idle_replica_failure_is_harmless() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();

        let replica = route(&mut r, &mut b, "SELECT 1", &mut out)[0].0;
        b.reply(&mut r, replica, resultset(&["1"]), &mut out);
        b.fail(replica);
        assert_eq!(r.handle_error(replica, "timeout", &mut out), ErrorAction::Continue);
        assert!(!r.endpoints[replica.0].in_use);
    }

    #[test]
    fn test_diagnostics() {
        let mut r = router();
        let mut b = Backends::default();
        let mut out = Outbox::new();
        open_trx(&mut r, &mut b, &mut out);

        let diag = r.diagnostics();
        assert_eq!(diag["router"], "readwritesplit");
        assert_eq!(diag["trx"]["open"], true);
        assert_eq!(diag["trx"]["statements"], 2);
        assert_eq!(diag["endpoints"][0]["in_use"], true);
    }
}
