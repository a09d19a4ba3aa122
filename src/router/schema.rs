//! Schema-based sharding
//!
//! Each database lives on one backend. The session learns where databases
//! and tables are from a shard map, building one by querying every backend
//! when no fresh map is shared for the user, and routes each statement to
//! the backend holding the objects it references.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use super::sescmd::{SescmdCheck, SescmdHistory};
use super::shard_map::{ServerMap, Shard, ShardManager};
use super::{
    Endpoint, EndpointId, ErrorAction, Outbox, RouteContext, RouteError, RoutedStatement,
    RouterSession,
};
use crate::config::RouterConfig;
use crate::parser::TypeMask;
use crate::protocol::resultset::{parse_text_row, single_column_resultset};
use crate::protocol::{Command, Packet, PacketKind, Reply};

const CR_SERVER_LOST: u16 = 2013;

const DATABASES_QUERY: &str = "SELECT schema_name FROM information_schema.schemata";
const TABLES_QUERY: &str = "SELECT table_schema, table_name FROM information_schema.tables \
     WHERE table_schema NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys')";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapQuery {
    Databases,
    Tables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyRoute {
    Forward,
    Sescmd { id: u64, forward: bool },
    SescmdReplay(u64),
    Mapping(MapQuery),
}

struct MapBuild {
    map: ServerMap,
    pending: usize,
    /// This session may publish the result
    granted: bool,
}

pub struct SchemaRouterSession {
    endpoints: Vec<Endpoint>,
    shards: Arc<ShardManager>,
    user: String,
    shard: Option<Shard>,
    mapping: Option<MapBuild>,
    history: SescmdHistory,
    queues: HashMap<EndpointId, VecDeque<ReplyRoute>>,
    held: VecDeque<(RouteContext, RoutedStatement)>,
    load_data_target: Option<EndpointId>,
    maps_built: u64,
}

impl SchemaRouterSession {
    pub fn new(config: RouterConfig, endpoints: Vec<Endpoint>, shards: Arc<ShardManager>, user: &str) -> Self {
        Self {
            endpoints,
            shards,
            user: user.to_string(),
            shard: None,
            mapping: None,
            history: SescmdHistory::new(config.max_sescmd_history),
            queues: HashMap::new(),
            held: VecDeque::new(),
            load_data_target: None,
            maps_built: 0,
        }
    }

    fn queue(&mut self, id: EndpointId) -> &mut VecDeque<ReplyRoute> {
        self.queues.entry(id).or_default()
    }

    fn endpoint_by_name(&self, name: &str) -> Option<EndpointId> {
        self.endpoints.iter().find(|e| e.name() == name).map(|e| e.id)
    }

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
        for (sescmd, packet) in replay {
            out.write(id, packet);
            self.queue(id).push_back(ReplyRoute::SescmdReplay(sescmd));
        }
    }

    fn start_mapping(&mut self, out: &mut Outbox) -> Result<(), RouteError> {
        if self.endpoints.is_empty() {
            return Err(RouteError::NoBackend("shard mapping".into()));
        }
        let granted = self.shards.start_update(&self.user);
        debug!(user = %self.user, granted, "Building shard map");

        let ids: Vec<EndpointId> = self.endpoints.iter().map(|e| e.id).collect();
        for &id in &ids {
            self.ensure_connected(id, out);
            out.write(id, query_packet(DATABASES_QUERY));
            self.queue(id).push_back(ReplyRoute::Mapping(MapQuery::Databases));
            out.write(id, query_packet(TABLES_QUERY));
            self.queue(id).push_back(ReplyRoute::Mapping(MapQuery::Tables));
        }
        self.mapping = Some(MapBuild {
            map: ServerMap::new(),
            pending: ids.len() * 2,
            granted,
        });
        Ok(())
    }

    fn on_mapping_reply(&mut self, endpoint: EndpointId, query: MapQuery, packet: &Packet, reply: &Reply, out: &mut Outbox) {
        let server = self.endpoints[endpoint.0].name().to_string();
        let Some(build) = self.mapping.as_mut() else {
            return;
        };

        if reply.last_kind() == PacketKind::Row {
            match (query, parse_text_row(&packet.payload).as_deref()) {
                (MapQuery::Databases, Some([Some(db), ..])) => {
                    build.map.add_location(&String::from_utf8_lossy(db), "", &server);
                }
                (MapQuery::Tables, Some([Some(db), Some(table), ..])) => {
                    build.map.add_location(&String::from_utf8_lossy(db), &String::from_utf8_lossy(table), &server);
                }
                _ => warn!(server = %server, "Malformed shard mapping row"),
            }
        }

        if reply.is_complete() {
            if let Some(err) = reply.error() {
                warn!(server = %server, error = %err.error_message, "Shard mapping query failed");
            }
            self.queue(endpoint).pop_front();
            self.mapping_step_done(1, out);
        }
    }

    fn mapping_step_done(&mut self, steps: usize, out: &mut Outbox) {
        let Some(build) = self.mapping.as_mut() else {
            return;
        };
        build.pending = build.pending.saturating_sub(steps);
        if build.pending > 0 {
            return;
        }

        let Some(build) = self.mapping.take() else {
            return;
        };
        let shard = Shard::new(build.map);
        info!(
            user = %self.user,
            databases = shard.map().databases().len(),
            "Shard map built"
        );
        if build.granted {
            self.shards.update_shard(&self.user, shard.clone());
        }
        self.shard = Some(shard);
        self.maps_built += 1;

        while let Some((ctx, stmt)) = self.held.pop_front() {
            if self.mapping.is_some() {
                self.held.push_front((ctx, stmt));
                break;
            }
            if let Err(e) = self.route_query(&ctx, stmt, out) {
                let (code, state, msg) = e.to_err();
                out.error(code, state, &msg);
            }
        }
    }

    fn route_sescmd(&mut self, stmt: RoutedStatement, out: &mut Outbox) -> Result<(), RouteError> {
        let ids: Vec<EndpointId> = self.endpoints.iter().map(|e| e.id).collect();
        if ids.is_empty() {
            return Err(RouteError::NoBackend("session command".into()));
        }
        for &id in &ids {
            self.ensure_connected(id, out);
        }
        let sescmd = self.history.add(stmt.packet.clone());
        for (i, &id) in ids.iter().enumerate() {
            out.write(id, stmt.packet.clone());
            if stmt.expects_reply() {
                self.queue(id).push_back(ReplyRoute::Sescmd {
                    id: sescmd,
                    forward: i == 0,
                });
            }
        }
        self.load_data_target = ids.first().copied();
        Ok(())
    }

    fn route_to(&mut self, target: EndpointId, stmt: RoutedStatement, out: &mut Outbox) {
        self.ensure_connected(target, out);
        debug!(target = %self.endpoints[target.0].name(), "Routing statement");
        if stmt.expects_reply() {
            self.queue(target).push_back(ReplyRoute::Forward);
        }
        out.write(target, stmt.packet);
        self.load_data_target = Some(target);
    }

    fn route_with_map(&mut self, ctx: &RouteContext, map: &ServerMap, stmt: RoutedStatement, out: &mut Outbox) -> Result<(), RouteError> {
        let mask = stmt.classification.mask;

        if stmt.command == Command::Query && mask.contains(TypeMask::SHOW_DATABASES) {
            for packet in single_column_resultset(1, "Database", &map.databases()) {
                out.send(packet);
            }
            out.complete_generated(true);
            return Ok(());
        }

        let use_db = match stmt.command {
            Command::InitDb => Some(String::from_utf8_lossy(&stmt.packet.payload[1..]).into_owned()),
            Command::Query if mask.contains(TypeMask::USE_DB) => stmt.classification.database.clone(),
            _ => None,
        };
        if let Some(db) = use_db {
            let server = map
                .database_location(&db)
                .ok_or_else(|| RouteError::UnknownDatabase(db.clone()))?;
            let target = self
                .endpoint_by_name(&server)
                .ok_or_else(|| RouteError::NoBackend(server.clone()))?;
            self.route_to(target, stmt, out);
            return Ok(());
        }

        if mask.contains(TypeMask::SESSION_WRITE) && !mask.intersects(TypeMask::WRITE) {
            return self.route_sescmd(stmt, out);
        }

        let mut servers: BTreeSet<String> = BTreeSet::new();
        let mut names = Vec::new();
        for table in &stmt.classification.tables {
            let Some(db) = table.database.as_deref().or(ctx.current_db.as_deref()) else {
                continue;
            };
            let locations = map.table_locations(db, &table.table);
            if !locations.is_empty() {
                names.push(format!("{}.{}", db, table.table));
                servers.extend(locations);
            }
        }
        if servers.len() > 1 {
            return Err(RouteError::CrossShard(names.join(", ")));
        }

        let server = servers.into_iter().next().or_else(|| {
            stmt.classification
                .database
                .as_deref()
                .or(ctx.current_db.as_deref())
                .and_then(|db| map.database_location(db))
        });
        let target = match server {
            Some(name) => self
                .endpoint_by_name(&name)
                .ok_or_else(|| RouteError::NoBackend(name.clone()))?,
            None => self
                .endpoints
                .first()
                .map(|e| e.id)
                .ok_or_else(|| RouteError::NoBackend("statement".into()))?,
        };
        self.route_to(target, stmt, out);
        Ok(())
    }
}

fn query_packet(sql: &str) -> Packet {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.push(Command::Query as u8);
    payload.extend_from_slice(sql.as_bytes());
    Packet::new(0, payload)
}

impl RouterSession for SchemaRouterSession {
    fn route_query(
        &mut self,
        ctx: &RouteContext,
        stmt: RoutedStatement,
        out: &mut Outbox,
    ) -> Result<(), RouteError> {
        if stmt.load_data {
            let target = self
                .load_data_target
                .ok_or_else(|| RouteError::NoBackend("LOAD DATA".into()))?;
            out.write(target, stmt.packet);
            return Ok(());
        }

        if self.mapping.is_some() {
            self.held.push_back((ctx.clone(), stmt));
            return Ok(());
        }

        let max_age = self.shards.max_age();
        if self.shard.as_ref().map_or(true, |s| s.stale(max_age)) {
            self.shard = self.shards.get_shard(&self.user);
        }
        let Some(shard) = self.shard.clone() else {
            self.start_mapping(out)?;
            self.held.push_back((ctx.clone(), stmt));
            return Ok(());
        };

        self.route_with_map(ctx, shard.map(), stmt, out)
    }

    fn client_reply(&mut self, endpoint: EndpointId, packet: Packet, reply: &Reply, out: &mut Outbox) {
        let Some(route) = self.queues.get(&endpoint).and_then(|q| q.front()).copied() else {
            warn!(endpoint = %endpoint, "Unexpected reply from backend");
            return;
        };

        match route {
            ReplyRoute::Forward => {
                out.forward(packet, reply);
                if reply.is_complete() {
                    self.queue(endpoint).pop_front();
                }
            }
            ReplyRoute::Sescmd { id, forward } => {
                if forward {
                    out.forward(packet, reply);
                }
                if reply.is_complete() {
                    self.queue(endpoint).pop_front();
                    if self.history.check(id, reply.is_ok()) == SescmdCheck::Mismatch {
                        warn!(endpoint = %self.endpoints[endpoint.0].name(), "Session command result differs, closing connection");
                        self.endpoints[endpoint.0].in_use = false;
                        self.queues.remove(&endpoint);
                        out.close_backend(endpoint);
                    }
                }
            }
            ReplyRoute::SescmdReplay(id) => {
                if reply.is_complete() {
                    self.queue(endpoint).pop_front();
                    if self.history.check(id, reply.is_ok()) == SescmdCheck::Mismatch {
                        self.endpoints[endpoint.0].in_use = false;
                        self.queues.remove(&endpoint);
                        out.close_backend(endpoint);
                    }
                }
            }
            ReplyRoute::Mapping(query) => self.on_mapping_reply(endpoint, query, &packet, reply, out),
        }
    }

    fn handle_error(&mut self, endpoint: EndpointId, reason: &str, out: &mut Outbox) -> ErrorAction {
        warn!(endpoint = %self.endpoints[endpoint.0].name(), reason = %reason, "Backend connection failed");
        self.endpoints[endpoint.0].in_use = false;
        let dropped = self.queues.remove(&endpoint).unwrap_or_default();

        let client_waiting = dropped.iter().any(|r| {
            matches!(r, ReplyRoute::Forward | ReplyRoute::Sescmd { forward: true, .. })
        });
        let mapping_steps = dropped
            .iter()
            .filter(|r| matches!(r, ReplyRoute::Mapping(_)))
            .count();

        if client_waiting {
            out.error(CR_SERVER_LOST, "HY000", "Lost connection to backend server during query");
            return ErrorAction::Close;
        }
        if mapping_steps > 0 {
            self.mapping_step_done(mapping_steps, out);
        }
        ErrorAction::Continue
    }

    fn diagnostics(&self) -> serde_json::Value {
        json!({
            "router": "schemarouter",
            "user": self.user,
            "maps_built": self.maps_built,
            "mapping": self.mapping.is_some(),
            "databases": self.shard.as_ref().map(|s| s.map().databases()),
            "endpoints": self.endpoints.iter().map(|e| json!({
                "name": e.name(),
                "in_use": e.in_use,
            })).collect::<Vec<_>>(),
        })
    }

    fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}
