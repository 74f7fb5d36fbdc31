//! Engine glue: global registries, backend rotation, events and lifecycle.
//!
//! The [`Server`] owns what every connection shares: the backend list with
//! its round-robin cursor, the connection registry, id generators, the
//! reclaimer, the timer service and the event queue the runtime polls. It
//! performs no I/O multiplexing itself; the runtime drives it by calling
//! `readable`/`flush` on connections and `run_expired` on the timers.

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    backends::Backend,
    client,
    config::{ConfigError, Features, ProxyConfig},
    connection::{Connection, ConnectionRole},
    epoch::Reclaimer,
    operation,
    socket::SocketHandler,
    timer::{TimeoutContainer, TimerService},
    upstream, AcceptError, BackendError, OperationError,
};

/// Engine-level happenings the runtime reacts to: transport rewiring after
/// StartTLS, listener throttling, backend health transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// A client accepted StartTLS; the runtime must swap its transport.
    StartTlsRequested { connection: u64 },
    /// An upstream finished its StartTLS exchange.
    StartTlsNegotiated { connection: u64 },
    BackendReady { name: String },
    BackendFailed { name: String },
    /// Stop accepting (fd exhaustion or shutdown), resume later.
    ListenerPause,
    ListenerResume,
}

/// Name resolution is a collaborator concern; tests and exotic runtimes plug
/// their own in.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;
}

/// Blocking resolution through the system resolver.
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
    }
}

pub struct Server {
    pub config: ProxyConfig,
    pub reclaimer: Arc<Reclaimer>,
    pub timers: Arc<TimerService>,
    resolver: Box<dyn Resolver>,
    /// Backends in round-robin order; a successful pick rotates past the
    /// chosen one so load spreads even when early backends never fill up.
    backends: Mutex<VecDeque<Arc<Backend>>>,
    /// Every live connection, client and upstream alike, by id.
    connections: Mutex<BTreeMap<u64, Arc<Connection>>>,
    features: RwLock<Features>,
    events: Mutex<VecDeque<ProxyEvent>>,
    next_conn_id: AtomicU64,
    next_pin: AtomicU64,
    in_flight: AtomicUsize,
    paused: AtomicBool,
}

impl Server {
    pub fn new(config: ProxyConfig) -> Result<Arc<Server>, ConfigError> {
        Server::with_resolver(config, Box::new(SystemResolver))
    }

    pub fn with_resolver(
        config: ProxyConfig,
        resolver: Box<dyn Resolver>,
    ) -> Result<Arc<Server>, ConfigError> {
        if config.backends.is_empty() {
            return Err(ConfigError::EmptyPool);
        }
        let backends = config
            .backends
            .iter()
            .cloned()
            .map(Backend::new)
            .collect::<VecDeque<_>>();
        let features = config.features;
        Ok(Arc::new(Server {
            config,
            reclaimer: Arc::new(Reclaimer::new()),
            timers: Arc::new(TimerService::new()),
            resolver,
            backends: Mutex::new(backends),
            connections: Mutex::new(BTreeMap::new()),
            features: RwLock::new(features),
            events: Mutex::new(VecDeque::new()),
            next_conn_id: AtomicU64::new(1),
            next_pin: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
        }))
    }

    /// Kick off upstream connects and the periodic operation timeout sweep.
    pub fn start(self: &Arc<Self>) {
        if let Some(threshold) = self.config.iotimeout() {
            let weak = Arc::downgrade(self);
            self.timers.schedule_repeating(
                threshold,
                Arc::new(move || {
                    if let Some(server) = weak.upgrade() {
                        operation::timeout_sweep(&server, threshold, Instant::now());
                    }
                }),
            );
        }
        for backend in self.backends_snapshot() {
            backend.connect(self);
        }
    }

    pub fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        self.resolver.resolve(host, port)
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_pin(&self) -> u64 {
        self.next_pin.fetch_add(1, Ordering::Relaxed)
    }

    /// Feature flags as currently active. `vc` is fixed for the lifetime of
    /// the engine; see [`Server::update_features`].
    pub fn features(&self) -> Features {
        *self.features.read()
    }

    /// Live feature reconfiguration. Toggling `vc` would change the shape of
    /// every pool and the meaning of in-flight binds, so it is refused; the
    /// engine has to be rebuilt for that.
    pub fn update_features(&self, features: Features) -> Result<(), ConfigError> {
        if features.vc != self.features.read().vc {
            return Err(ConfigError::ImmutableAtRuntime("feature vc"));
        }
        *self.features.write() = features;
        Ok(())
    }

    // -- connection registry ------------------------------------------------

    pub fn register_client(&self, connection: Arc<Connection>) {
        self.connections.lock().insert(connection.id, connection);
    }

    pub fn register_upstream(&self, connection: Arc<Connection>) {
        self.connections.lock().insert(connection.id, connection);
    }

    pub fn find_connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn unregister_connection(&self, id: u64) -> bool {
        self.connections.lock().remove(&id).is_some()
    }

    /// Accept outcome handling for the runtime's listener loop.
    pub fn accept_client(
        self: &Arc<Self>,
        incoming: io::Result<Box<dyn SocketHandler>>,
    ) -> Result<Arc<Connection>, AcceptError> {
        match incoming {
            Ok(socket) => Ok(client::accepted(self, socket)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(AcceptError::WouldBlock),
            Err(e) => {
                // out of descriptors or worse; have the listener back off
                error!("accept failed: {e}");
                self.push_event(ProxyEvent::ListenerPause);
                Err(AcceptError::Io(e.to_string()))
            }
        }
    }

    // -- backend selection --------------------------------------------------

    pub fn backends_snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends.lock().iter().cloned().collect()
    }

    pub fn find_backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends
            .lock()
            .iter()
            .find(|backend| backend.name == name)
            .cloned()
    }

    /// Two-level round robin: walk the backend list from the cursor, ask each
    /// backend for a connection, rotate past the first that delivers. `Busy`
    /// surfaces only when no backend could deliver but at least one was
    /// merely at capacity.
    pub fn select(&self, bind: bool) -> Result<(Arc<Connection>, Arc<Backend>), BackendError> {
        let use_bind_pool = bind && !self.features().vc;
        let mut backends = self.backends.lock();
        let mut saw_busy = false;
        for index in 0..backends.len() {
            let backend = backends[index].clone();
            match backend.pick(use_bind_pool) {
                Ok(connection) => {
                    backends.rotate_left(index + 1);
                    return Ok((connection, backend));
                }
                Err(BackendError::Busy) => saw_busy = true,
                Err(_) => {}
            }
        }
        if saw_busy {
            Err(BackendError::Busy)
        } else {
            Err(BackendError::Unavailable)
        }
    }

    /// Add a backend at runtime; it starts connecting immediately.
    pub fn add_backend(self: &Arc<Self>, config: crate::config::BackendConfig) -> Arc<Backend> {
        let backend = Backend::new(config);
        self.backends.lock().push_back(backend.clone());
        backend.connect(self);
        backend
    }

    /// Remove a backend at runtime. Refused while operations are executing on
    /// it; drain first (close its connections and wait).
    pub fn remove_backend(self: &Arc<Self>, name: &str) -> Result<(), OperationError> {
        let backend = {
            let backends = self.backends.lock();
            backends
                .iter()
                .find(|backend| backend.name == name)
                .cloned()
        };
        let Some(backend) = backend else {
            return Ok(());
        };
        if backend.executing() > 0 {
            return Err(OperationError::Unsupported(
                "removing a backend with operations executing",
            ));
        }
        backend.quiesce();
        self.backends
            .lock()
            .retain(|candidate| !Arc::ptr_eq(candidate, &backend));
        for connection in backend.connections_snapshot() {
            upstream::upstream_died(self, &backend, &connection);
        }
        Ok(())
    }

    /// Cycle a backend's connections, draining in-flight operations first
    /// when `gentle`.
    pub fn reset_backend(self: &Arc<Self>, name: &str, gentle: bool) {
        if let Some(backend) = self.find_backend(name) {
            backend.reset(self, gentle);
        }
    }

    // -- teardown -----------------------------------------------------------

    pub fn teardown_client(self: &Arc<Self>, connection: &Arc<Connection>) {
        client::teardown(self, connection);
    }

    /// Give a connection its write timeout: `Connection::write` arms it when
    /// output starts to buffer, `flush` re-arms or cancels it, and a fire with
    /// output still pending severs the connection.
    pub(crate) fn install_write_timeout(self: &Arc<Self>, connection: &Arc<Connection>) {
        let duration = self.config.write_timeout();
        if duration.is_zero() {
            return;
        }
        let server = Arc::downgrade(self);
        let target = Arc::downgrade(connection);
        let task: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let (Some(server), Some(connection)) = (server.upgrade(), target.upgrade()) else {
                return;
            };
            if connection.pending_output() == 0 {
                return;
            }
            warn!(
                "connection#{}: output stalled past the write timeout",
                connection.id
            );
            match connection.role() {
                ConnectionRole::Client => server.teardown_client(&connection),
                _ => server.teardown_upstream(&connection),
            }
        });
        connection.lock_io().write_timeout = Some(TimeoutContainer::new_unarmed(
            self.timers.clone(),
            duration,
            task,
        ));
    }

    pub fn teardown_upstream(self: &Arc<Self>, connection: &Arc<Connection>) {
        let backend = connection
            .lock_core()
            .backend
            .as_ref()
            .and_then(|weak| weak.upgrade());
        match backend {
            Some(backend) => upstream::upstream_died(self, &backend, connection),
            None => {
                if connection.begin_unlink().is_some() {
                    self.unregister_connection(connection.id);
                    connection.release(&self.reclaimer);
                }
            }
        }
    }

    // -- flow control -------------------------------------------------------

    pub fn operation_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        gauge_add!("operations.in_flight", 1);
    }

    pub fn operation_finished(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "in-flight counter underflow");
        gauge_add!("operations.in_flight", -1);
        if self.paused.load(Ordering::SeqCst) && !self.over_pause_threshold() {
            self.resume_reads();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn over_pause_threshold(&self) -> bool {
        self.in_flight() >= self.config.read_pause_threshold
    }

    pub fn mark_paused(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(
                "read pause engaged at {} operations in flight",
                self.in_flight()
            );
            self.push_event(ProxyEvent::ListenerPause);
        }
    }

    fn resume_reads(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("read pause released");
            for connection in self.clients_snapshot() {
                connection.unmute();
            }
            self.push_event(ProxyEvent::ListenerResume);
        }
    }

    /// Stop reading from every client, for live reconfiguration: drain, then
    /// mutate, then `unpause`.
    pub fn pause(&self) {
        for connection in self.clients_snapshot() {
            connection.mute();
        }
        self.push_event(ProxyEvent::ListenerPause);
    }

    pub fn unpause(&self) {
        for connection in self.clients_snapshot() {
            connection.unmute();
        }
        self.push_event(ProxyEvent::ListenerResume);
    }

    fn clients_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .values()
            .filter(|connection| connection.role() == ConnectionRole::Client)
            .cloned()
            .collect()
    }

    /// Shut the engine down. Graceful shutdown closes clients so in-flight
    /// operations drain; immediate shutdown severs everything now.
    pub fn shutdown(self: &Arc<Self>, graceful: bool) {
        self.pause();
        if graceful {
            for connection in self.clients_snapshot() {
                connection.close();
            }
            return;
        }
        for connection in self.clients_snapshot() {
            self.teardown_client(&connection);
        }
        for backend in self.backends_snapshot() {
            backend.quiesce();
            for connection in backend.connections_snapshot() {
                upstream::upstream_died(self, &backend, &connection);
            }
        }
    }

    // -- events -------------------------------------------------------------

    pub fn push_event(&self, event: ProxyEvent) {
        self.events.lock().push_back(event);
    }

    pub fn poll_event(&self) -> Option<ProxyEvent> {
        self.events.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BackendConfig,
        connection::ConnectionState,
        mock::MockSocket,
    };

    fn test_config(backends: usize) -> ProxyConfig {
        ProxyConfig {
            backends: (0..backends)
                .map(|i| BackendConfig {
                    host: format!("ldap{i}"),
                    port: 389,
                    uri: format!("ldap://ldap{i}"),
                    ..BackendConfig::default()
                })
                .collect(),
            ..ProxyConfig::default()
        }
    }

    fn test_server(backends: usize) -> Arc<Server> {
        Server::new(test_config(backends)).expect("server")
    }

    fn stuff_pool(server: &Server, index: usize, conns: usize) {
        let backend = server.backends_snapshot()[index].clone();
        let mut pool = backend.lock_pool();
        for _ in 0..conns {
            pool.conns.push_back(Connection::new(
                server.next_connection_id(),
                Box::new(MockSocket::new()),
                ConnectionRole::Upstream,
                ConnectionState::Ready,
            ));
        }
    }

    #[test]
    fn no_backends_is_a_config_error() {
        assert_eq!(
            Server::new(ProxyConfig::default()).err(),
            Some(ConfigError::EmptyPool)
        );
    }

    #[test]
    fn select_rotates_across_backends() {
        let server = test_server(3);
        for index in 0..3 {
            stuff_pool(&server, index, 1);
        }
        let mut seen = Vec::new();
        for _ in 0..6 {
            let (_, backend) = server.select(false).expect("select");
            seen.push(backend.name.clone());
        }
        assert_eq!(seen[0..3], seen[3..6]);
        let unique: std::collections::BTreeSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn busy_beats_unavailable_in_aggregation() {
        let mut config = test_config(2);
        config.backends[0].max_pending_ops = 1;
        let server = Server::new(config).expect("server");
        stuff_pool(&server, 0, 1);
        // backend 1 has no connections at all

        server.backends_snapshot()[0].operation_started();
        assert!(matches!(server.select(false), Err(BackendError::Busy)));
    }

    #[test]
    fn all_empty_is_unavailable() {
        let server = test_server(2);
        assert!(matches!(server.select(false), Err(BackendError::Unavailable)));
    }

    #[test]
    fn vc_binds_use_the_general_pool() {
        let mut config = test_config(1);
        config.features.vc = true;
        let server = Server::new(config).expect("server");
        stuff_pool(&server, 0, 1);
        // bind pool is empty; with vc the general pool serves binds
        assert!(server.select(true).is_ok());
    }

    #[test]
    fn vc_cannot_be_toggled_at_runtime() {
        let server = test_server(1);
        let mut features = server.features();
        features.read_pause = true;
        server.update_features(features).expect("non-vc toggle");

        features.vc = true;
        assert_eq!(
            server.update_features(features),
            Err(ConfigError::ImmutableAtRuntime("feature vc"))
        );
    }

    #[test]
    fn remove_backend_refuses_while_executing() {
        let server = test_server(1);
        let backend = server.backends_snapshot()[0].clone();
        backend.operation_started();
        assert!(matches!(
            server.remove_backend(&backend.name),
            Err(OperationError::Unsupported(_))
        ));
        backend.operation_finished(crate::operation::OperationOutcome::Completed);
        server.remove_backend(&backend.name).expect("remove");
        assert!(server.backends_snapshot().is_empty());
    }

    #[test]
    fn accept_failure_pauses_the_listener() {
        let server = test_server(1);
        let result = server.accept_client(Err(io::Error::new(
            io::ErrorKind::Other,
            "too many open files",
        )));
        assert!(matches!(result, Err(AcceptError::Io(_))));
        assert_eq!(server.poll_event(), Some(ProxyEvent::ListenerPause));
    }

    #[test]
    fn pin_ids_are_unique() {
        let server = test_server(1);
        let first = server.next_pin();
        let second = server.next_pin();
        assert_ne!(first, second);
        assert!(first > 0);
    }

    quickcheck::quickcheck! {
        /// With every backend equally able, k picks spread within one of
        /// each other.
        fn round_robin_is_fair(picks: u8) -> bool {
            let server = test_server(3);
            for index in 0..3 {
                stuff_pool(&server, index, 2);
            }
            let mut counts = std::collections::BTreeMap::new();
            for _ in 0..picks {
                let (_, backend) = match server.select(false) {
                    Ok(selected) => selected,
                    Err(_) => return false,
                };
                *counts.entry(backend.name.clone()).or_insert(0u32) += 1;
            }
            let max = counts.values().copied().max().unwrap_or(0);
            let min = if counts.len() == 3 {
                counts.values().copied().min().unwrap_or(0)
            } else {
                0
            };
            max - min <= 1
        }
    }
}
