//! Fan-out concatenation
//!
//! Every statement runs on every backend, one backend after another. The
//! client sees a single result: the first backend's result set header, the
//! rows of all backends and the final packet of the last backend. An error
//! from any backend is forwarded and closes the session, as the rows already
//! sent cannot be taken back.

use std::collections::VecDeque;

use serde_json::json;
use tracing::{debug, warn};

use super::{
    Endpoint, EndpointId, ErrorAction, Outbox, RouteContext, RouteError, RoutedStatement,
    RouterSession,
};
use crate::protocol::{Packet, PacketKind, Reply};

struct FanOut {
    stmt: Packet,
    order: Vec<EndpointId>,
    current: usize,
    /// Next sequence number sent to the client
    seq: u8,
}

pub struct CatSession {
    endpoints: Vec<Endpoint>,
    fanout: Option<FanOut>,
    /// Statements that arrived while a fan-out was running
    held: VecDeque<(RouteContext, RoutedStatement)>,
    queries: u64,
}

impl CatSession {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            fanout: None,
            held: VecDeque::new(),
            queries: 0,
        }
    }
}

impl FanOut {
    fn send(&mut self, packet: Packet, out: &mut Outbox) {
        out.send(packet.with_sequence(self.seq));
        self.seq = self.seq.wrapping_add(1);
    }
}

impl CatSession {
    /// Route what was held back behind the fan-out that just ended
    fn route_held(&mut self, out: &mut Outbox) {
        while self.fanout.is_none() {
            let Some((ctx, stmt)) = self.held.pop_front() else {
                break;
            };
            if let Err(e) = self.route_query(&ctx, stmt, out) {
                let (code, state, msg) = e.to_err();
                out.error(code, state, &msg);
            }
        }
    }
}

impl RouterSession for CatSession {
    fn route_query(
        &mut self,
        ctx: &RouteContext,
        stmt: RoutedStatement,
        out: &mut Outbox,
    ) -> Result<(), RouteError> {
        if self.fanout.is_some() {
            debug!("Fan-out in progress, holding statement");
            self.held.push_back((ctx.clone(), stmt));
            return Ok(());
        }
        if stmt.load_data {
            return Err(RouteError::Unsupported("LOAD DATA LOCAL INFILE".into()));
        }
        if self.endpoints.is_empty() {
            return Err(RouteError::NoBackend("fan-out".into()));
        }
        for endpoint in &mut self.endpoints {
            endpoint.in_use = true;
        }

        if !stmt.expects_reply() {
            for endpoint in &self.endpoints {
                out.write(endpoint.id, stmt.packet.clone());
            }
            return Ok(());
        }

        let order: Vec<EndpointId> = self.endpoints.iter().map(|e| e.id).collect();
        debug!(targets = order.len(), "Fanning out statement");
        out.write(order[0], stmt.packet.clone());
        self.fanout = Some(FanOut {
            stmt: stmt.packet,
            order,
            current: 0,
            seq: 1,
        });
        self.queries += 1;
        crate::metrics::metrics().record_fanout();
        Ok(())
    }

    fn client_reply(&mut self, endpoint: EndpointId, packet: Packet, reply: &Reply, out: &mut Outbox) {
        let Some(fanout) = self.fanout.as_mut() else {
            warn!(endpoint = %endpoint, "Reply without an active fan-out");
            return;
        };
        if fanout.order[fanout.current] != endpoint {
            warn!(endpoint = %endpoint, "Reply from a backend that is not being read");
            return;
        }

        let is_first = fanout.current == 0;
        let is_last = fanout.current + 1 == fanout.order.len();

        if reply.is_complete() {
            if !reply.is_ok() {
                warn!(endpoint = %endpoint, "Error during fan-out, closing session");
                fanout.send(packet, out);
                out.complete(false, reply.server_status());
                out.close = true;
                self.fanout = None;
                self.held.clear();
            } else if is_last {
                fanout.send(packet, out);
                out.complete(true, reply.server_status());
                self.fanout = None;
                self.route_held(out);
            } else {
                fanout.current += 1;
                out.write(fanout.order[fanout.current], fanout.stmt.clone());
            }
            return;
        }

        match reply.last_kind() {
            PacketKind::LocalInfile => {
                // No file upload through fan-out, send an empty file
                out.write(endpoint, Packet::new(packet.sequence_id.wrapping_add(1), Vec::new()));
            }
            PacketKind::Row => fanout.send(packet, out),
            _ if is_first => fanout.send(packet, out),
            _ => {}
        }
    }

    fn handle_error(&mut self, endpoint: EndpointId, reason: &str, _out: &mut Outbox) -> ErrorAction {
        warn!(endpoint = %endpoint, reason = %reason, "Backend failed during fan-out, closing session");
        self.fanout = None;
        self.held.clear();
        ErrorAction::Close
    }

    fn diagnostics(&self) -> serde_json::Value {
        json!({
            "router": "cat",
            "queries": self.queries,
            "endpoints": self.endpoints.iter().map(|e| e.name()).collect::<Vec<_>>(),
            "active": self.fanout.as_ref().map(|f| f.order[f.current].0),
            "held": self.held.len(),
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
    use crate::protocol::is_eof_packet;
    use crate::router::endpoints_for;
    use crate::router::test_util::*;

    fn cat(n: usize) -> CatSession {
        let servers: Vec<_> = (0..n)
            .map(|i| server(&format!("s{}", i), ServerRole::Primary))
            .collect();
        CatSession::new(endpoints_for(&servers))
    }

    #[test]
    fn test_rows_are_concatenated() {
        let mut router = cat(3);
        let mut backends = Backends::default();
        let mut out = Outbox::new();

        router
            .route_query(&RouteContext::default(), statement("SELECT c FROM t"), &mut out)
            .unwrap();
        let writes = backends.take(&mut out);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, EndpointId(0));

        backends.reply(&mut router, EndpointId(0), resultset(&["a", "b"]), &mut out);
        // Header and rows of the first backend, not its final EOF
        assert_eq!(out.client.len(), 5);
        assert!(out.completion.is_none());
        assert_eq!(backends.take(&mut out)[0].0, EndpointId(1));

        backends.reply(&mut router, EndpointId(1), resultset(&[]), &mut out);
        backends.take(&mut out);
        backends.reply(&mut router, EndpointId(2), resultset(&["c"]), &mut out);

        // 3 header packets, 3 rows, 1 EOF
        assert_eq!(out.client.len(), 7);
        assert!(is_eof_packet(&out.client.last().unwrap().payload));
        let seqs: Vec<u8> = out.client.iter().map(|p| p.sequence_id).collect();
        assert_eq!(seqs, (1..=7).collect::<Vec<u8>>());
        assert!(out.completion.unwrap().ok);
    }

    #[test]
    fn test_only_current_endpoint_receives_statement() {
        let mut router = cat(2);
        let mut backends = Backends::default();
        let mut out = Outbox::new();

        router
            .route_query(&RouteContext::default(), statement("SELECT 1"), &mut out)
            .unwrap();
        backends.take(&mut out);
        assert_eq!(backends.written.len(), 1);

        backends.reply(&mut router, EndpointId(0), resultset(&["1"]), &mut out);
        backends.take(&mut out);
        assert_eq!(backends.written.len(), 2);
        assert_eq!(backends.written[1].0, EndpointId(1));
    }

    #[test]
    fn test_error_closes_session() {
        let mut router = cat(3);
        let mut backends = Backends::default();
        let mut out = Outbox::new();

        router
            .route_query(&RouteContext::default(), statement("SELECT c FROM t"), &mut out)
            .unwrap();
        backends.take(&mut out);
        backends.reply(&mut router, EndpointId(0), resultset(&["a"]), &mut out);
        backends.take(&mut out);
        assert!(!out.close);
        backends.reply(&mut router, EndpointId(1), err(1146), &mut out);

        // The error reaches the client, the last backend is never asked
        assert!(backends.take(&mut out).is_empty());
        assert!(backends.written.iter().all(|(id, _)| *id != EndpointId(2)));
        assert!(!out.completion.unwrap().ok);
        assert_eq!(out.client.last().unwrap().payload[0], 0xFF);
        assert!(out.close);
    }

    #[test]
    fn test_pipelined_statement_waits_for_fan_out() {
        let mut router = cat(2);
        let mut backends = Backends::default();
        let mut out = Outbox::new();

        router
            .route_query(&RouteContext::default(), statement("SELECT 1"), &mut out)
            .unwrap();
        router
            .route_query(&RouteContext::default(), statement("SELECT 2"), &mut out)
            .unwrap();
        // Only the first statement went out
        assert_eq!(backends.take(&mut out).len(), 1);

        backends.reply(&mut router, EndpointId(0), resultset(&["1"]), &mut out);
        assert_eq!(backends.take(&mut out)[0].0, EndpointId(1));
        assert!(out.completion.is_none());

        backends.reply(&mut router, EndpointId(1), resultset(&["1"]), &mut out);
        assert!(out.completion.unwrap().ok);

        // The held statement starts on the first backend again
        let writes = backends.take(&mut out);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, EndpointId(0));
        assert_eq!(&writes[0].1.payload[1..], b"SELECT 2");
    }

    #[test]
    fn test_ok_replies_forward_last_only() {
        let mut router = cat(2);
        let mut backends = Backends::default();
        let mut out = Outbox::new();

        router
            .route_query(&RouteContext::default(), statement("SET @a = 1"), &mut out)
            .unwrap();
        backends.take(&mut out);
        backends.reply(&mut router, EndpointId(0), ok(2), &mut out);
        assert!(out.client.is_empty());
        backends.take(&mut out);
        backends.reply(&mut router, EndpointId(1), ok(2), &mut out);
        assert_eq!(out.client.len(), 1);
        assert_eq!(out.client[0].sequence_id, 1);
    }

    #[test]
    fn test_backend_failure_closes() {
        let mut router = cat(2);
        let mut out = Outbox::new();
        assert_eq!(
            router.handle_error(EndpointId(1), "reset", &mut out),
            ErrorAction::Close
        );
    }
}
