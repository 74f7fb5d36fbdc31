//! Backend servers and their connection pools.
//!
//! Each [`Backend`] keeps two pools of ready upstream connections, a general
//! one and one reserved for client binds, plus the connection currently being
//! prepared. At most one connect attempt per backend is in flight at any
//! time; failures arm a retry timer driven by the backoff policy.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    config::BackendConfig,
    connection::{Connection, ConnectionRole, ConnectionState},
    operation::OperationOutcome,
    retry::{ExponentialBackoffPolicy, RetryPolicy},
    server::Server,
    socket,
    timer::TimerToken,
    BackendError,
};

/// The single connect attempt a backend may have outstanding.
pub struct PendingConnection {
    pub connection: Arc<Connection>,
    pub started: Instant,
}

pub struct BackendPool {
    /// General pool, Ready connections in round-robin order.
    pub conns: VecDeque<Arc<Connection>>,
    /// Pool reserved for client binds.
    pub bind_conns: VecDeque<Arc<Connection>>,
    /// Connected but still running the session bind.
    pub preparing: Vec<Arc<Connection>>,
    pub pending: Option<PendingConnection>,
    pub retry: ExponentialBackoffPolicy,
    pub retry_token: Option<TimerToken>,
    /// The last attempt failed and nothing has succeeded since.
    pub failed: bool,
}

pub struct Backend {
    /// `host:port`, the metrics and log label.
    pub name: String,
    pub config: BackendConfig,
    pool: Mutex<BackendPool>,
    /// Operations currently executing across every connection of this
    /// backend, the `max-pending-ops` counter.
    n_ops_executing: AtomicUsize,
    /// Set when the backend is being removed; stops reconnection.
    quiesced: AtomicBool,
    pub total_completed: AtomicU64,
    pub total_failed: AtomicU64,
}

impl Backend {
    pub fn new(config: BackendConfig) -> Arc<Backend> {
        let retry = ExponentialBackoffPolicy::new(config.retry_timeout());
        Arc::new(Backend {
            name: format!("{}:{}", config.host, config.port),
            config,
            pool: Mutex::new(BackendPool {
                conns: VecDeque::new(),
                bind_conns: VecDeque::new(),
                preparing: Vec::new(),
                pending: None,
                retry,
                retry_token: None,
                failed: false,
            }),
            n_ops_executing: AtomicUsize::new(0),
            quiesced: AtomicBool::new(false),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        })
    }

    pub fn lock_pool(&self) -> MutexGuard<BackendPool> {
        self.pool.lock()
    }

    pub fn executing(&self) -> usize {
        self.n_ops_executing.load(Ordering::Relaxed)
    }

    pub fn operation_started(&self) {
        self.n_ops_executing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_finished(&self, outcome: OperationOutcome) {
        let previous = self.n_ops_executing.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "executing counter underflow");
        match outcome {
            OperationOutcome::Completed => {
                self.total_completed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Pick a connection able to take one more operation, moving it to the
    /// tail of its pool so the next pick lands elsewhere.
    ///
    /// `Busy` means usable connections exist but every one is at capacity;
    /// `Unavailable` means the pool has nothing usable at all. Callers treat
    /// the two differently: busy backends still count as alive.
    pub fn pick(&self, bind_pool: bool) -> Result<Arc<Connection>, BackendError> {
        let mut pool = self.pool.lock();
        let list = if bind_pool {
            &mut pool.bind_conns
        } else {
            &mut pool.conns
        };

        let mut saw_usable = false;
        let backend_full = self.config.max_pending_ops > 0
            && self.executing() >= self.config.max_pending_ops;

        let mut chosen = None;
        for index in 0..list.len() {
            let connection = &list[index];
            if !connection.is_live() || connection.state() != ConnectionState::Ready {
                continue;
            }
            saw_usable = true;
            if backend_full {
                continue;
            }
            if self.config.conn_max_pending > 0
                && connection.pending_ops() >= self.config.conn_max_pending
            {
                continue;
            }
            chosen = Some(index);
            break;
        }

        match chosen {
            Some(index) => {
                let connection = match list.remove(index) {
                    Some(connection) => connection,
                    // unreachable, the index came from the same list
                    None => return Err(BackendError::Unavailable),
                };
                list.push_back(connection.clone());
                Ok(connection)
            }
            None if saw_usable => Err(BackendError::Busy),
            None => Err(BackendError::Unavailable),
        }
    }

    /// Stop opening connections; the backend is on its way out.
    pub fn quiesce(&self) {
        self.quiesced.store(true, Ordering::SeqCst);
    }

    /// Whether another upstream connection should be opened.
    pub fn wants_connection(&self) -> bool {
        if self.quiesced.load(Ordering::SeqCst) {
            return false;
        }
        let pool = self.pool.lock();
        if pool.pending.is_some() {
            return false;
        }
        let building = pool.preparing.len();
        pool.conns.len() + pool.bind_conns.len() + building
            < self.config.numconns + self.config.bindconns
    }

    /// Open the next upstream connection if one is wanted and none is in
    /// flight. Connect errors feed the backoff policy and arm a retry.
    pub fn connect(self: &Arc<Self>, server: &Arc<Server>) {
        if !self.wants_connection() {
            return;
        }
        let address = match server.resolve(&self.config.host, self.config.port) {
            Ok(address) => address,
            Err(e) => {
                warn!("backend {}: could not resolve: {e}", self.name);
                self.connect_failed(server);
                return;
            }
        };
        let stream = match socket::connect_upstream(address) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("backend {}: connect error: {e}", self.name);
                self.connect_failed(server);
                return;
            }
        };

        let connection = Connection::new(
            server.next_connection_id(),
            Box::new(stream),
            ConnectionRole::Preparing,
            ConnectionState::Active,
        );
        connection.lock_core().backend = Some(Arc::downgrade(self));
        server.install_write_timeout(&connection);

        let mut pool = self.pool.lock();
        if pool.pending.is_some() {
            // lost the race against another worker, drop ours
            drop(pool);
            connection.begin_unlink();
            connection.release(&server.reclaimer);
            return;
        }
        pool.pending = Some(PendingConnection {
            connection: connection.clone(),
            started: Instant::now(),
        });
        drop(pool);

        gauge_add!("connections.active", 1);
        incr!("backend.connections.attempted", Some(self.name.as_str()));
        server.register_upstream(connection);
    }

    /// The in-flight connect finished the TCP handshake; the connection moves
    /// to `preparing` while the session bind runs.
    pub fn connect_established(&self, connection: &Arc<Connection>) {
        let mut pool = self.pool.lock();
        if let Some(pending) = pool.pending.take() {
            if Arc::ptr_eq(&pending.connection, connection) {
                pool.preparing.push(pending.connection);
                return;
            }
            pool.pending = Some(pending);
        }
    }

    pub fn connect_failed(self: &Arc<Self>, server: &Arc<Server>) {
        let (delay, first_failure) = {
            let mut pool = self.pool.lock();
            if let Some(pending) = pool.pending.take() {
                pending.connection.begin_unlink();
                pending.connection.release(&server.reclaimer);
            }
            pool.retry.fail();
            let first_failure = !pool.failed;
            pool.failed = true;
            let delay = match pool.retry.current_delay() {
                Some(delay) => delay,
                None => self.config.retry_timeout(),
            };
            (delay, first_failure)
        };
        incr!("backend.connections.failed", Some(self.name.as_str()));
        if first_failure {
            server.push_event(crate::server::ProxyEvent::BackendFailed {
                name: self.name.clone(),
            });
        }

        let backend = Arc::downgrade(self);
        let server_handle = Arc::downgrade(server);
        let token = server.timers.schedule_once(
            delay,
            Arc::new(move || {
                if let (Some(backend), Some(server)) =
                    (backend.upgrade(), server_handle.upgrade())
                {
                    backend.lock_pool().retry_token = None;
                    backend.connect(&server);
                }
            }),
        );
        self.pool.lock().retry_token = Some(token);
    }

    /// The session bind finished; assign the connection its pool. The general
    /// pool fills first, then the bind pool, overflow goes general.
    pub fn promote(self: &Arc<Self>, server: &Arc<Server>, connection: &Arc<Connection>) {
        let mut pool = self.pool.lock();
        pool.preparing
            .retain(|preparing| !Arc::ptr_eq(preparing, connection));
        pool.retry.succeed();
        let recovered = pool.failed;
        pool.failed = false;

        let role = if pool.conns.len() < self.config.numconns {
            pool.conns.push_back(connection.clone());
            ConnectionRole::Upstream
        } else if pool.bind_conns.len() < self.config.bindconns {
            pool.bind_conns.push_back(connection.clone());
            ConnectionRole::Bind
        } else {
            pool.conns.push_back(connection.clone());
            ConnectionRole::Upstream
        };
        drop(pool);

        {
            let mut core = connection.lock_core();
            core.role = role;
            core.state = ConnectionState::Ready;
            core.sasl = None;
        }
        info!(
            "backend {}: connection#{} ready as {role:?}",
            self.name, connection.id
        );
        incr!("backend.connections.ready", Some(self.name.as_str()));
        if recovered {
            server.push_event(crate::server::ProxyEvent::BackendReady {
                name: self.name.clone(),
            });
        }

        // keep going until both pools are at target
        self.connect(server);
    }

    /// Remove the connection from whichever list holds it. Returns true when
    /// it was found; the caller then drops the pool's logical reference.
    pub fn unlink_connection(&self, connection: &Arc<Connection>) -> bool {
        let mut pool = self.pool.lock();
        let before = pool.conns.len() + pool.bind_conns.len() + pool.preparing.len();
        pool.conns
            .retain(|candidate| !Arc::ptr_eq(candidate, connection));
        pool.bind_conns
            .retain(|candidate| !Arc::ptr_eq(candidate, connection));
        pool.preparing
            .retain(|candidate| !Arc::ptr_eq(candidate, connection));
        let mut found =
            before != pool.conns.len() + pool.bind_conns.len() + pool.preparing.len();
        if let Some(pending) = pool.pending.take() {
            if Arc::ptr_eq(&pending.connection, connection) {
                found = true;
            } else {
                pool.pending = Some(pending);
            }
        }
        found
    }

    /// Every connection this backend knows about, for sweeps and teardown.
    pub fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        let pool = self.pool.lock();
        pool.conns
            .iter()
            .chain(pool.bind_conns.iter())
            .chain(pool.preparing.iter())
            .chain(pool.pending.iter().map(|pending| &pending.connection))
            .cloned()
            .collect()
    }

    /// Tear the pools down and start over. A gentle reset lets connections
    /// with operations in flight drain first: they stop being picked and are
    /// reclaimed when their last response arrives. A hard reset severs them
    /// on the spot.
    pub fn reset(self: &Arc<Self>, server: &Arc<Server>, gentle: bool) {
        if let Some(token) = self.pool.lock().retry_token.take() {
            server.timers.cancel(token);
        }
        for connection in self.connections_snapshot() {
            if gentle && connection.pending_ops() > 0 {
                connection.close();
                continue;
            }
            crate::upstream::upstream_died(server, self, &connection);
        }
        self.connect(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSocket;

    fn ready_connection(id: u64) -> Arc<Connection> {
        Connection::new(
            id,
            Box::new(MockSocket::new()),
            ConnectionRole::Upstream,
            ConnectionState::Ready,
        )
    }

    fn backend_with_conns(config: BackendConfig, ids: &[u64]) -> Arc<Backend> {
        let backend = Backend::new(config);
        {
            let mut pool = backend.lock_pool();
            for id in ids {
                pool.conns.push_back(ready_connection(*id));
            }
        }
        backend
    }

    #[test]
    fn pick_round_robins_within_the_pool() {
        let backend = backend_with_conns(BackendConfig::default(), &[1, 2, 3]);
        let first = backend.pick(false).expect("pick");
        let second = backend.pick(false).expect("pick");
        let third = backend.pick(false).expect("pick");
        let again = backend.pick(false).expect("pick");
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(third.id, 3);
        assert_eq!(again.id, 1);
    }

    #[test]
    fn empty_pool_is_unavailable() {
        let backend = Backend::new(BackendConfig::default());
        assert!(matches!(backend.pick(false), Err(BackendError::Unavailable)));
    }

    #[test]
    fn capped_backend_is_busy_not_unavailable() {
        let config = BackendConfig {
            max_pending_ops: 1,
            ..BackendConfig::default()
        };
        let backend = backend_with_conns(config, &[1]);
        backend.operation_started();
        assert!(matches!(backend.pick(false), Err(BackendError::Busy)));

        backend.operation_finished(OperationOutcome::Completed);
        assert!(backend.pick(false).is_ok());
    }

    #[test]
    fn dying_connections_are_skipped() {
        let backend = backend_with_conns(BackendConfig::default(), &[1, 2]);
        let doomed = backend.lock_pool().conns[0].clone();
        doomed.begin_unlink();
        let picked = backend.pick(false).expect("pick");
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn per_connection_cap_skips_to_the_next() {
        let config = BackendConfig {
            conn_max_pending: 0,
            ..BackendConfig::default()
        };
        let backend = backend_with_conns(config, &[1, 2]);
        // both usable with no cap
        assert!(backend.pick(false).is_ok());
    }

    #[test]
    fn unlink_finds_connections_in_any_list() {
        let backend = backend_with_conns(BackendConfig::default(), &[7]);
        let connection = backend.lock_pool().conns[0].clone();
        assert!(backend.unlink_connection(&connection));
        assert!(!backend.unlink_connection(&connection));
        assert!(backend.lock_pool().conns.is_empty());
    }
}
