//! Routing workers
//!
//! Every worker is an OS thread running a current-thread tokio runtime and a
//! `LocalSet`. A client session, its backend connections and its delayed
//! calls all live on the worker that accepted the client, so none of them
//! need to be `Send`.

pub mod dcall;

pub use dcall::{DcId, DelayedCalls};

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, info};

use crate::auth::{AuthModules, UserAccountStore};
use crate::config::Config;
use crate::pool::{BackendCredentials, BackendPool, ConnectionLimiter, IdlePoolConfig, LimitConfig};
use crate::router::ShardManager;
use crate::session::SessionRegistry;

/// How often idle backend connections are checked for expiry
const EVICT_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide state shared by all workers
pub struct Service {
    pub config: Config,
    pub modules: AuthModules,
    pub shards: Arc<ShardManager>,
    pub registry: SessionRegistry,
    pub limiter: Arc<ConnectionLimiter>,
}

impl Service {
    pub fn new(config: Config) -> Self {
        let modules = AuthModules::from_config(&config);
        let shards = Arc::new(ShardManager::new(
            config.router.shard_map_update_limit,
            Duration::from_secs(config.router.shard_map_refresh_secs),
        ));
        let limiter = Arc::new(ConnectionLimiter::new(LimitConfig::from(&config.pool)));
        Self {
            config,
            modules,
            shards,
            registry: SessionRegistry::new(),
            limiter,
        }
    }

    /// Credentials of the proxy's own service account
    pub fn service_credentials(&self) -> BackendCredentials {
        BackendCredentials::service(&self.config.service.user, &self.config.service.password)
    }
}

/// State of one worker, reachable from every task it runs
pub struct WorkerContext {
    pub id: usize,
    pub service: Arc<Service>,
    pub pool: BackendPool,
    users: RefCell<Arc<UserAccountStore>>,
}

impl WorkerContext {
    pub fn new(id: usize, service: Arc<Service>, users: Arc<UserAccountStore>) -> Self {
        let pool = BackendPool::new(
            IdlePoolConfig::from(&service.config.pool),
            Arc::clone(&service.limiter),
        );
        Self {
            id,
            service,
            pool,
            users: RefCell::new(users),
        }
    }

    /// Current snapshot of the client accounts
    pub fn users(&self) -> Arc<UserAccountStore> {
        Arc::clone(&self.users.borrow())
    }

    pub fn set_users(&self, users: Arc<UserAccountStore>) {
        *self.users.borrow_mut() = users;
    }
}

type Task = Box<dyn FnOnce(&Rc<WorkerContext>) + Send>;

enum WorkerMessage {
    Accept(std::net::TcpStream, SocketAddr),
    Call(Task),
}

/// Handle to the running workers
pub struct Workers {
    senders: Vec<mpsc::UnboundedSender<WorkerMessage>>,
    threads: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl Workers {
    /// Start `count` workers, one per CPU when `count` is zero
    pub fn start(
        count: usize,
        service: Arc<Service>,
        users: Arc<UserAccountStore>,
    ) -> std::io::Result<Self> {
        let count = if count == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            count
        };

        let mut senders = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let service = Arc::clone(&service);
            let users = Arc::clone(&users);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let thread = std::thread::Builder::new()
                .name(format!("mariner-worker-{}", id))
                .spawn(move || {
                    let ctx = Rc::new(WorkerContext::new(id, service, users));
                    let local = LocalSet::new();
                    local.block_on(&runtime, worker_loop(ctx, rx));
                })?;

            senders.push(tx);
            threads.push(thread);
        }

        info!(workers = count, "Routing workers started");
        Ok(Self {
            senders,
            threads,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Hand an accepted client to the next worker
    pub fn dispatch(&self, stream: tokio::net::TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        let stream = stream.into_std()?;
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if self.senders[idx].send(WorkerMessage::Accept(stream, peer)).is_err() {
            error!(worker = idx, "Worker is gone, dropping client");
        }
        Ok(())
    }

    /// Run `f` on one worker
    pub fn execute<F>(&self, worker: usize, f: F) -> bool
    where
        F: FnOnce(&Rc<WorkerContext>) + Send + 'static,
    {
        self.senders
            .get(worker)
            .is_some_and(|tx| tx.send(WorkerMessage::Call(Box::new(f))).is_ok())
    }

    /// Run `f` on every worker without waiting for it
    pub fn broadcast<F>(&self, f: F)
    where
        F: Fn(&Rc<WorkerContext>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        for tx in &self.senders {
            let f = Arc::clone(&f);
            let _ = tx.send(WorkerMessage::Call(Box::new(move |ctx| f(ctx))));
        }
    }

    /// Stop accepting work and wait for the workers to finish their sessions
    pub fn shutdown(self) {
        drop(self.senders);
        for thread in self.threads {
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

async fn worker_loop(ctx: Rc<WorkerContext>, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    debug!(worker = ctx.id, "Worker running");
    let mut evict = tokio::time::interval(EVICT_INTERVAL);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WorkerMessage::Accept(stream, peer)) => {
                    match tokio::net::TcpStream::from_std(stream) {
                        Ok(stream) => {
                            tokio::task::spawn_local(crate::session::handle_client(ctx.clone(), stream, peer));
                        }
                        Err(e) => error!(worker = ctx.id, error = %e, "Failed to register client socket"),
                    }
                }
                Some(WorkerMessage::Call(task)) => task(&ctx),
                None => break,
            },
            _ = evict.tick() => {
                let evicted = ctx.pool.evict_stale();
                if evicted > 0 {
                    debug!(worker = ctx.id, evicted, "Closed stale idle connections");
                }
            }
        }
    }
    debug!(worker = ctx.id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn service() -> Arc<Service> {
        Arc::new(Service::new(Config::default()))
    }

    #[test]
    fn test_broadcast_reaches_every_worker() {
        let workers = Workers::start(3, service(), Arc::new(UserAccountStore::default())).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);

        workers.broadcast(move |ctx| {
            let _ = tx.lock().unwrap().send(ctx.id);
        });

        let mut ids: Vec<usize> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);
        workers.shutdown();
    }

    #[test]
    fn test_user_reload() {
        let workers = Workers::start(2, service(), Arc::new(UserAccountStore::default())).unwrap();
        let config: Config = toml::from_str(
            r#"
[[servers]]
name = "a"
host = "h"

[[users]]
name = "app"
password = "pw"
"#,
        )
        .unwrap();
        let users = Arc::new(UserAccountStore::from_config(&config.users, 2).unwrap());

        workers.broadcast(move |ctx| ctx.set_users(Arc::clone(&users)));

        let (tx, rx) = std::sync::mpsc::channel();
        for id in 0..2 {
            let tx = tx.clone();
            workers.execute(id, move |ctx| {
                let _ = tx.send(ctx.users().version());
            });
        }
        for _ in 0..2 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        }
        workers.shutdown();
    }

    #[test]
    fn test_zero_means_per_cpu() {
        let workers = Workers::start(0, service(), Arc::new(UserAccountStore::default())).unwrap();
        assert!(!workers.is_empty());
        workers.shutdown();
    }
}
