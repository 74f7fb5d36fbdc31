//! The shared connection object.
//!
//! One [`Connection`] wraps one socket, client-facing or upstream-facing.
//! Both sides run the same state machine; the `client` and `upstream` modules
//! layer their own PDU handling over it.
//!
//! Two locks, two domains: the state lock guards role, state and the attached
//! operation set; the I/O lock guards the socket, the read accumulation
//! buffer and the pending-write buffer. The event loop can flush output
//! without contending with a handler that holds the state lock.
//!
//! Lock order, outermost first: backend lock, then connection state lock,
//! then operation link lock. Paths that need the locks in another order
//! release and reacquire instead.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, MutexGuard};
use rusty_ulid::Ulid;

use crate::{
    backends::Backend,
    bind::SaslClient,
    epoch::{Reclaimer, RefCount},
    operation::{Operation, OperationKey},
    ready::{Readiness, Ready},
    socket::{SocketHandler, SocketResult},
    timer::TimeoutContainer,
    ConnectionError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Freshly created, mid-handshake (TLS, or the upstream session bind).
    Active,
    /// Idle and able to receive or forward operations.
    Ready,
    /// A bind operation owns the connection.
    Binding,
    /// Draining, no new operations accepted.
    Closing,
    /// Unlinked from every index; only outstanding references remain.
    Dying,
    /// Terminal, reclaimed.
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    /// Pooled upstream, general traffic.
    Upstream,
    /// Upstream still being prepared (connect or session bind in progress).
    Preparing,
    /// Pooled upstream reserved for client binds.
    Bind,
}

#[derive(Default)]
pub struct ConnectionCounters {
    pub received: AtomicU64,
    pub forwarded: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

impl ConnectionCounters {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.received.load(Ordering::Relaxed),
            self.forwarded.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

pub struct ConnectionCore {
    pub state: ConnectionState,
    pub role: ConnectionRole,
    /// Operations attached to this side, ordered by message id (pins last).
    pub ops: BTreeMap<OperationKey, Arc<Operation>>,
    /// Client side: the pin of the bind in progress, 0 when unpinned.
    pub pin: u64,
    /// Authenticated identity (client) or session identity (upstream).
    pub identity: Option<String>,
    /// Upstream side: owning backend.
    pub backend: Option<Weak<Backend>>,
    /// Idle/IO timeout, re-armed on activity.
    pub timeout: Option<TimeoutContainer>,
    /// Upstream side: SASL context of the session bind in progress.
    pub sasl: Option<Box<dyn SaslClient>>,
    /// Client side: StartTLS already negotiated, a second one is a
    /// protocol error.
    pub tls_established: bool,
}

pub struct ConnectionIo {
    pub socket: Box<dyn SocketHandler>,
    pub readiness: Readiness,
    /// Unparsed inbound bytes (at most one partial PDU plus whatever the
    /// last read dragged in).
    pub recv: Vec<u8>,
    pub pending_write: Vec<u8>,
    /// Armed while `pending_write` is non-empty.
    pub write_timeout: Option<TimeoutContainer>,
}

pub struct Connection {
    pub id: u64,
    pub ulid: Ulid,
    /// The liveness token: consumed exactly once, under the state lock, by
    /// `begin_unlink`. Consuming it is the only trigger for teardown.
    live: AtomicBool,
    refcount: RefCount,
    next_msgid: AtomicI32,
    pub counters: ConnectionCounters,
    core: Mutex<ConnectionCore>,
    io: Mutex<ConnectionIo>,
}

/// What `begin_unlink` tears out of the connection, to be drained by the
/// caller without any connection lock held.
pub struct UnlinkWork {
    pub role: ConnectionRole,
    pub ops: Vec<Arc<Operation>>,
    pub backend: Option<Weak<Backend>>,
    pub pin: u64,
}

impl Connection {
    pub fn new(
        id: u64,
        socket: Box<dyn SocketHandler>,
        role: ConnectionRole,
        state: ConnectionState,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            ulid: Ulid::generate(),
            live: AtomicBool::new(true),
            refcount: RefCount::new(1),
            next_msgid: AtomicI32::new(1),
            counters: ConnectionCounters::default(),
            core: Mutex::new(ConnectionCore {
                state,
                role,
                ops: BTreeMap::new(),
                pin: 0,
                identity: None,
                backend: None,
                timeout: None,
                sasl: None,
                tls_established: false,
            }),
            io: Mutex::new(ConnectionIo {
                socket,
                readiness: Readiness {
                    interest: Ready::READABLE | Ready::HUP | Ready::ERROR,
                    event: Ready::EMPTY,
                },
                recv: Vec::new(),
                pending_write: Vec::new(),
                write_timeout: None,
            }),
        })
    }

    pub fn lock_core(&self) -> MutexGuard<ConnectionCore> {
        self.core.lock()
    }

    pub fn lock_io(&self) -> MutexGuard<ConnectionIo> {
        self.io.lock()
    }

    /// Take a logical reference; fails once the connection is being torn
    /// down. Callers that found `self` through a shared index must check.
    pub fn acquire(&self) -> bool {
        self.refcount.acquire()
    }

    /// Drop a logical reference; on the last one, schedule `destroy` through
    /// the reclaimer so concurrent readers inside an epoch stay safe.
    pub fn release(self: &Arc<Self>, reclaimer: &Reclaimer) {
        if self.refcount.release() {
            let connection = self.clone();
            reclaimer.defer(Box::new(move || connection.destroy()));
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Message ids this side assigns on the wire it writes to. Client
    /// connections never call this; upstream ones use it for re-framed
    /// requests and proxy-internal operations.
    pub fn alloc_msgid(&self) -> i32 {
        let msgid = self.next_msgid.fetch_add(1, Ordering::Relaxed);
        if msgid <= 0 {
            // wrapped; restart the space rather than emit msgid 0
            self.next_msgid.store(2, Ordering::Relaxed);
            return 1;
        }
        msgid
    }

    /// First half of teardown: consume the liveness token, move to `Dying`,
    /// detach every operation and timer. Idempotent through the token: the
    /// second caller gets `None` and must do nothing.
    ///
    /// The caller finishes the job with the returned work: removing the
    /// connection from its owning index and resolving each operation, both
    /// of which need locks that must not nest under the state lock.
    pub fn begin_unlink(&self) -> Option<UnlinkWork> {
        let mut core = self.core.lock();
        if !self.live.swap(false, Ordering::SeqCst) {
            return None;
        }
        core.state = ConnectionState::Dying;
        core.timeout = None;
        core.sasl = None;
        let pin = core.pin;
        core.pin = 0;
        let ops = std::mem::take(&mut core.ops).into_values().collect();
        let backend = core.backend.take();
        let role = core.role;
        drop(core);

        let mut io = self.io.lock();
        io.write_timeout = None;
        io.readiness.interest = Ready::EMPTY;

        Some(UnlinkWork {
            role,
            ops,
            backend,
            pin,
        })
    }

    /// Final teardown, run by the reclaimer once no epoch can observe us.
    fn destroy(&self) {
        let mut core = self.core.lock();
        debug_assert!(!self.is_live(), "destroy on a live connection");
        debug_assert_eq!(self.refcount.count(), 0, "destroy with references left");
        debug_assert!(core.ops.is_empty(), "destroy with operations attached");
        core.state = ConnectionState::Invalid;
        drop(core);

        let mut io = self.io.lock();
        io.socket.socket_close();
        io.recv = Vec::new();
        io.pending_write = Vec::new();
        gauge_add!("connections.active", -1);
    }

    /// Refuse new operations from now on; existing ones drain.
    pub fn close(&self) {
        let mut core = self.core.lock();
        if core.state < ConnectionState::Closing {
            core.state = ConnectionState::Closing;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lock().state
    }

    pub fn role(&self) -> ConnectionRole {
        self.core.lock().role
    }

    pub fn pending_ops(&self) -> usize {
        self.core.lock().ops.len()
    }

    /// Queue `bytes` for the peer and flush opportunistically. Buffered
    /// output arms the write timeout and WRITABLE interest so the event loop
    /// finishes the job.
    pub fn write(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut io = self.io.lock();
        if !io.pending_write.is_empty() {
            io.pending_write.extend_from_slice(bytes);
            return Ok(());
        }

        let (written, result) = io.socket.socket_write(bytes);
        match result {
            SocketResult::Closed | SocketResult::Error => {
                return Err(ConnectionError::SocketGone(self.id))
            }
            SocketResult::Continue | SocketResult::WouldBlock => {}
        }
        if written < bytes.len() {
            io.pending_write.extend_from_slice(&bytes[written..]);
            io.readiness.interest.insert(Ready::WRITABLE);
            if let Some(timeout) = io.write_timeout.as_mut() {
                timeout.reset();
            }
        }
        count!("bytes_out", written);
        Ok(())
    }

    /// Flush the pending-write buffer; called by the event loop on WRITABLE.
    pub fn flush(&self) -> Result<(), ConnectionError> {
        let mut io = self.io.lock();
        if io.pending_write.is_empty() {
            io.readiness.interest.remove(Ready::WRITABLE);
            return Ok(());
        }
        let buf = std::mem::take(&mut io.pending_write);
        let (written, result) = io.socket.socket_write(&buf);
        match result {
            SocketResult::Closed | SocketResult::Error => {
                return Err(ConnectionError::SocketGone(self.id))
            }
            SocketResult::Continue | SocketResult::WouldBlock => {}
        }
        count!("bytes_out", written);
        if written < buf.len() {
            io.pending_write.extend_from_slice(&buf[written..]);
            if let Some(timeout) = io.write_timeout.as_mut() {
                timeout.reset();
            }
        } else {
            io.readiness.interest.remove(Ready::WRITABLE);
            if let Some(timeout) = io.write_timeout.as_mut() {
                timeout.cancel();
            }
        }
        Ok(())
    }

    pub fn pending_output(&self) -> usize {
        self.io.lock().pending_write.len()
    }

    /// Disable read events while a worker task owns this connection or while
    /// backpressure is engaged; at most one task processes a connection at a
    /// time.
    pub fn mute(&self) {
        self.io.lock().readiness.interest.remove(Ready::READABLE);
    }

    pub fn unmute(&self) {
        let mut io = self.io.lock();
        if self.is_live() {
            io.readiness.interest.insert(Ready::READABLE);
        }
    }

    pub fn is_muted(&self) -> bool {
        !self.io.lock().readiness.interest.is_readable()
    }

    /// Pull whatever the socket has into the read buffer, capped at
    /// `max_incoming` total buffered bytes.
    pub fn fill(&self, max_incoming: usize) -> (usize, SocketResult) {
        let mut io = self.io.lock();
        let mut total = 0usize;
        loop {
            let buffered = io.recv.len();
            if buffered >= max_incoming {
                return (total, SocketResult::Continue);
            }
            let chunk = (max_incoming - buffered).min(16 * 1024);
            let start = io.recv.len();
            io.recv.resize(start + chunk, 0);
            let (size, result) = {
                let ConnectionIo { socket, recv, .. } = &mut *io;
                socket.socket_read(&mut recv[start..])
            };
            io.recv.truncate(start + size);
            total += size;
            count!("bytes_in", size);
            match result {
                SocketResult::Continue => {}
                other => return (total, other),
            }
        }
    }

    /// Pop one complete PDU off the read buffer, copied out so no I/O lock is
    /// held while it is handled.
    pub fn next_pdu(
        &self,
        max_incoming: usize,
    ) -> Result<Option<Vec<u8>>, crate::protocol::ProtocolError> {
        let mut io = self.io.lock();
        match crate::protocol::parser::parse_envelope(&io.recv, max_incoming)? {
            Some((envelope, consumed)) => {
                let pdu = envelope.raw.to_vec();
                io.recv.drain(..consumed);
                Ok(Some(pdu))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::MockSocket;

    fn test_connection() -> Arc<Connection> {
        Connection::new(
            1,
            Box::new(MockSocket::new()),
            ConnectionRole::Client,
            ConnectionState::Ready,
        )
    }

    #[test]
    fn liveness_token_is_consumed_once() {
        let connection = test_connection();
        assert!(connection.is_live());
        assert!(connection.begin_unlink().is_some());
        assert!(!connection.is_live());
        assert!(connection.begin_unlink().is_none());
        assert_eq!(connection.state(), ConnectionState::Dying);
    }

    #[test]
    fn release_defers_destroy_until_epoch_clears() {
        let reclaimer = Arc::new(Reclaimer::new());
        let connection = test_connection();
        connection.begin_unlink();

        let guard = reclaimer.join();
        connection.release(&reclaimer);
        // a reader inside an older epoch still holds the object usable
        assert_ne!(connection.state(), ConnectionState::Invalid);
        drop(guard);
        assert_eq!(connection.state(), ConnectionState::Invalid);
    }

    #[test]
    fn acquire_fails_after_last_release() {
        let reclaimer = Arc::new(Reclaimer::new());
        let connection = test_connection();
        assert!(connection.acquire());
        connection.release(&reclaimer);
        connection.begin_unlink();
        connection.release(&reclaimer);
        assert!(!connection.acquire());
    }

    #[test]
    fn short_writes_are_buffered_and_flushed() {
        let connection = Connection::new(
            2,
            Box::new(MockSocket::with_write_limit(4)),
            ConnectionRole::Client,
            ConnectionState::Ready,
        );
        connection.write(b"0123456789").expect("write");
        assert!(connection.pending_output() > 0);
        assert!(connection.lock_io().readiness.interest.is_writable());

        while connection.pending_output() > 0 {
            connection.flush().expect("flush");
        }
        assert!(!connection.lock_io().readiness.interest.is_writable());
    }

    #[test]
    fn mute_round_trip() {
        let connection = test_connection();
        assert!(!connection.is_muted());
        connection.mute();
        assert!(connection.is_muted());
        connection.unmute();
        assert!(!connection.is_muted());

        // a dying connection stays muted
        connection.begin_unlink();
        connection.unmute();
        assert!(connection.is_muted());
    }

    #[test]
    fn msgid_allocation_is_positive_and_monotonic() {
        let connection = test_connection();
        let first = connection.alloc_msgid();
        let second = connection.alloc_msgid();
        assert!(first > 0);
        assert_eq!(second, first + 1);
    }
}
