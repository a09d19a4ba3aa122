//! KILL statements
//!
//! Sessions are identified by the proxy's own session ids. Killing a query
//! means running `KILL QUERY` on every backend connection of the target
//! session; killing a connection additionally closes the target session.

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BackendServer;
use crate::metrics::metrics;
use crate::pool::{BackendCredentials, BackendPool};
use crate::session::{SessionControl, SessionHandle, SessionRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    Session(u64),
    User(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillKind {
    Connection,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillMode {
    #[default]
    Default,
    Hard,
    Soft,
}

impl KillMode {
    fn keyword(self) -> &'static str {
        match self {
            KillMode::Default => "",
            KillMode::Hard => "HARD ",
            KillMode::Soft => "SOFT ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    pub target: KillTarget,
    pub kind: KillKind,
    pub mode: KillMode,
}

impl KillRequest {
    /// COM_PROCESS_KILL
    pub fn connection(id: u64) -> Self {
        Self {
            target: KillTarget::Session(id),
            kind: KillKind::Connection,
            mode: KillMode::Default,
        }
    }
}

/// Who issued the KILL
#[derive(Debug, Clone)]
pub struct Killer {
    pub session_id: u64,
    pub user: String,
    /// May kill sessions of other users
    pub shutdown_priv: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KillError {
    #[error("Unknown thread id: {0}")]
    UnknownThread(u64),
    #[error("You are not owner of thread {0}")]
    NotOwner(u64),
    #[error("{0} is not supported")]
    Unsupported(String),
}

impl KillError {
    /// Error packet fields sent to the client
    pub fn to_err(&self) -> (u16, &'static str) {
        match self {
            KillError::UnknownThread(_) => (1094, "HY000"),
            KillError::NotOwner(_) => (1095, "HY000"),
            KillError::Unsupported(_) => (1105, "HY000"),
        }
    }
}

/// Parse a KILL statement.
///
/// `Ok(None)` means the text is not a KILL form the proxy understands and
/// should go to the backend unchanged.
pub fn parse_kill(sql: &str) -> Result<Option<KillRequest>, KillError> {
    let sql = sql.trim().trim_end_matches(';');
    let mut words = sql.split_whitespace();

    if !words.next().is_some_and(|w| w.eq_ignore_ascii_case("KILL")) {
        return Ok(None);
    }

    let mut mode = KillMode::Default;
    let mut kind = KillKind::Connection;
    let mut word = words.next();

    match word.map(str::to_ascii_uppercase).as_deref() {
        Some("HARD") => {
            mode = KillMode::Hard;
            word = words.next();
        }
        Some("SOFT") => {
            mode = KillMode::Soft;
            word = words.next();
        }
        _ => {}
    }

    match word.map(str::to_ascii_uppercase).as_deref() {
        Some("CONNECTION") => word = words.next(),
        Some("QUERY") => {
            kind = KillKind::Query;
            word = words.next();
            if word.is_some_and(|w| w.eq_ignore_ascii_case("ID")) {
                return Err(KillError::Unsupported("KILL QUERY ID".into()));
            }
        }
        Some("USER") => {
            let Some(user) = words.next() else {
                return Ok(None);
            };
            if words.next().is_some() {
                return Ok(None);
            }
            let user = user.trim_matches(|c| c == '\'' || c == '"' || c == '`');
            return Ok(Some(KillRequest {
                target: KillTarget::User(user.to_string()),
                kind,
                mode,
            }));
        }
        _ => {}
    }

    let Some(id) = word.and_then(|w| w.parse::<u64>().ok()) else {
        return Ok(None);
    };
    if words.next().is_some() {
        return Ok(None);
    }

    Ok(Some(KillRequest {
        target: KillTarget::Session(id),
        kind,
        mode,
    }))
}

/// Sessions the killer may kill
pub fn resolve_targets(
    req: &KillRequest,
    killer: &Killer,
    registry: &SessionRegistry,
) -> Result<Vec<SessionHandle>, KillError> {
    let targets = match &req.target {
        KillTarget::Session(id) => {
            vec![registry.get(*id).ok_or(KillError::UnknownThread(*id))?]
        }
        KillTarget::User(user) => registry.find_by_user(user),
    };

    for target in &targets {
        if target.user != killer.user && !killer.shutdown_priv {
            return Err(KillError::NotOwner(target.id));
        }
    }
    Ok(targets)
}

/// Everything a KILL needs besides the request
pub struct KillContext<'a> {
    pub registry: &'a SessionRegistry,
    pub pool: &'a BackendPool,
    /// Credentials used for the throwaway KILL connections
    pub service: BackendCredentials,
}

/// Execute a KILL.
///
/// Returns once every backend KILL finished. The caller bounds the wait and
/// answers the client with exactly one OK.
pub async fn execute_kill(
    req: &KillRequest,
    killer: &Killer,
    ctx: &KillContext<'_>,
) -> Result<(), KillError> {
    let targets = resolve_targets(req, killer, ctx.registry)?;
    info!(
        session_id = killer.session_id,
        target = ?req.target,
        kind = ?req.kind,
        sessions = targets.len(),
        "Executing KILL"
    );

    let mut backends = Vec::new();
    for target in &targets {
        backends.extend(target.backend_threads().await);
    }

    let kills = backends
        .iter()
        .map(|(server, thread_id)| kill_backend_query(ctx, server, *thread_id, req.mode));
    join_all(kills).await;

    if req.kind == KillKind::Connection {
        for target in &targets {
            target.send(SessionControl::Kill);
        }
    }

    metrics().record_kill(match req.kind {
        KillKind::Connection => "connection",
        KillKind::Query => "query",
    });
    Ok(())
}

async fn kill_backend_query(ctx: &KillContext<'_>, server: &BackendServer, thread_id: u32, mode: KillMode) {
    let sql = format!("KILL {}QUERY {}", mode.keyword(), thread_id);
    match ctx.pool.connect_direct(server, &ctx.service).await {
        Ok(mut conn) => match conn.execute(&sql).await {
            Ok(_) => debug!(server = %server.name, thread_id, "Backend query killed"),
            Err(e) => warn!(server = %server.name, thread_id, error = %e, "Backend KILL failed"),
        },
        Err(e) => {
            warn!(server = %server.name, error = %e, "Failed to open connection for KILL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;
    use tokio::sync::mpsc;

    fn session(id: u64) -> KillTarget {
        KillTarget::Session(id)
    }

    #[test]
    fn test_parse_kill_forms() {
        assert_eq!(
            parse_kill("KILL 5").unwrap(),
            Some(KillRequest::connection(5))
        );
        assert_eq!(
            parse_kill("kill connection 7;").unwrap(),
            Some(KillRequest::connection(7))
        );

        let req = parse_kill("KILL HARD QUERY 9").unwrap().unwrap();
        assert_eq!(req.target, session(9));
        assert_eq!(req.kind, KillKind::Query);
        assert_eq!(req.mode, KillMode::Hard);

        let req = parse_kill("KILL SOFT USER 'app'").unwrap().unwrap();
        assert_eq!(req.target, KillTarget::User("app".into()));
        assert_eq!(req.kind, KillKind::Connection);
        assert_eq!(req.mode, KillMode::Soft);
    }

    #[test]
    fn test_parse_kill_query_id_unsupported() {
        assert!(matches!(
            parse_kill("KILL QUERY ID 1234"),
            Err(KillError::Unsupported(_))
        ));
    }

    #[test]
    fn test_parse_kill_passthrough() {
        assert_eq!(parse_kill("KILL @var").unwrap(), None);
        assert_eq!(parse_kill("KILL 1 2").unwrap(), None);
        assert_eq!(parse_kill("SELECT 1").unwrap(), None);
    }

    #[test]
    fn test_error_codes() {
        let err = KillError::UnknownThread(12);
        assert_eq!(err.to_err().0, 1094);
        assert_eq!(err.to_string(), "Unknown thread id: 12");

        let err = KillError::NotOwner(3);
        assert_eq!(err.to_err().0, 1095);
        assert_eq!(err.to_string(), "You are not owner of thread 3");
    }

    fn register(registry: &SessionRegistry, user: &str) -> (u64, mpsc::UnboundedReceiver<SessionControl>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.next_id();
        registry.register(SessionHandle::new(id, user, "127.0.0.1", tx));
        (id, rx)
    }

    fn killer(user: &str, shutdown_priv: bool) -> Killer {
        Killer {
            session_id: 999,
            user: user.into(),
            shutdown_priv,
        }
    }

    #[test]
    fn test_resolve_authorization() {
        let registry = SessionRegistry::new();
        let (own, _rx1) = register(&registry, "app");
        let (foreign, _rx2) = register(&registry, "admin");

        let req = KillRequest::connection(own);
        assert_eq!(resolve_targets(&req, &killer("app", false), &registry).unwrap().len(), 1);

        let req = KillRequest::connection(foreign);
        assert_eq!(
            resolve_targets(&req, &killer("app", false), &registry).unwrap_err(),
            KillError::NotOwner(foreign)
        );
        assert!(resolve_targets(&req, &killer("root", true), &registry).is_ok());

        let req = KillRequest::connection(12345);
        assert_eq!(
            resolve_targets(&req, &killer("root", true), &registry).unwrap_err(),
            KillError::UnknownThread(12345)
        );
    }

    #[test]
    fn test_resolve_user_target() {
        let registry = SessionRegistry::new();
        let _a = register(&registry, "app");
        let _b = register(&registry, "app");

        let req = KillRequest {
            target: KillTarget::User("app".into()),
            kind: KillKind::Connection,
            mode: KillMode::Default,
        };
        assert_eq!(resolve_targets(&req, &killer("app", false), &registry).unwrap().len(), 2);

        // No sessions of that user is not an error
        let req = KillRequest {
            target: KillTarget::User("nobody".into()),
            ..req
        };
        assert!(resolve_targets(&req, &killer("root", true), &registry).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_kill_queries_backends_and_closes_session() {
        use crate::pool::{test_server, ConnectionLimiter, IdlePoolConfig, LimitConfig};
        use std::sync::Arc;

        let fake = test_server::start("db1").await;
        let pool = BackendPool::new(
            IdlePoolConfig::default(),
            Arc::new(ConnectionLimiter::new(LimitConfig::default())),
        );
        let registry = SessionRegistry::new();
        let (target, mut rx) = register(&registry, "app");

        let server = fake.server.clone();
        let responder = tokio::spawn(async move {
            let mut killed = false;
            while let Some(msg) = rx.recv().await {
                match msg {
                    SessionControl::BackendThreads(reply) => {
                        let _ = reply.send(vec![(server.clone(), 77)]);
                    }
                    SessionControl::Kill => {
                        killed = true;
                        break;
                    }
                    SessionControl::Diagnostics(_) => {}
                }
            }
            killed
        });

        let ctx = KillContext {
            registry: &registry,
            pool: &pool,
            service: BackendCredentials::service("mariner", ""),
        };
        execute_kill(&KillRequest::connection(target), &killer("app", false), &ctx)
            .await
            .unwrap();

        assert!(responder.await.unwrap());
        assert_eq!(
            fake.commands.lock().as_slice(),
            &[crate::protocol::Command::Query as u8]
        );
    }
}
