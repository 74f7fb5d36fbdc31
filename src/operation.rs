//! In-flight operations and their registry.
//!
//! An [`Operation`] ties one client request to the upstream request it
//! spawned. It lives in the client connection's operation set (keyed by the
//! client message id, or by its pin while a multi-step bind holds it) and, once
//! dispatched, in the upstream connection's set (keyed by the substituted
//! message id). The link structure carries both sides and is guarded by its
//! own lock, the innermost of the lock hierarchy.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};
use rusty_ulid::Ulid;

use crate::{
    backends::Backend,
    connection::{Connection, ConnectionState},
    epoch::RefCount,
    protocol::{
        self, codec,
        parser::Envelope,
        tag, ResultCode,
    },
    server::Server,
    OperationError,
};

/// Key of an operation inside one connection's set. Message-id keys order
/// first; a pinned operation surrendered its message id and sorts by pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKey {
    Msgid(i32),
    Pin(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    Pending,
    /// Refused locally, never reached an upstream.
    Rejected,
    Completed,
    Failed,
}

pub struct OperationLink {
    pub client: Option<Arc<Connection>>,
    pub client_msgid: i32,
    pub upstream: Option<Arc<Connection>>,
    pub upstream_msgid: i32,
    /// Non-zero while a multi-step bind owns this operation.
    pub pin: u64,
    /// Backend whose execution counter this operation holds, cleared on the
    /// single decrement.
    pub backend: Option<Arc<Backend>>,
    pub outcome: OperationOutcome,
    pub last_response: Option<Instant>,
    /// Bind success withheld while a Who Am I query resolves the identity.
    pub saved_response: Option<Vec<u8>>,
    pub awaiting_whoami: bool,
    /// The client abandoned this operation; any late response is dropped.
    pub abandoned: bool,
}

pub struct Operation {
    pub ulid: Ulid,
    /// Application tag of the original request.
    pub tag: u8,
    /// The original client PDU, kept for retransmission during bind
    /// continuations and for VC translation.
    pub request: Vec<u8>,
    pub created: Instant,
    refcount: RefCount,
    link: Mutex<OperationLink>,
}

impl Operation {
    pub fn lock_link(&self) -> MutexGuard<OperationLink> {
        self.link.lock()
    }

    pub fn acquire(&self) -> bool {
        self.refcount.acquire()
    }

    /// Returns true on the last release; the operation is then inert and
    /// only `Arc` drops remain.
    pub fn release(&self) -> bool {
        self.refcount.release()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    /// Key under which this operation currently sits in its client's set.
    pub fn client_key(&self) -> OperationKey {
        let link = self.link.lock();
        if link.pin != 0 {
            OperationKey::Pin(link.pin)
        } else {
            OperationKey::Msgid(link.client_msgid)
        }
    }

    pub fn client_msgid(&self) -> i32 {
        self.link.lock().client_msgid
    }
}

/// Register a new operation for a client PDU.
///
/// Only the message id and outer tag have been parsed at this point. A
/// duplicate message id is a protocol violation surfaced to the caller, which
/// tears the client down.
pub fn create(
    server: &Server,
    client: &Arc<Connection>,
    envelope: &Envelope,
) -> Result<Arc<Operation>, OperationError> {
    let operation = Arc::new(Operation {
        ulid: Ulid::generate(),
        tag: envelope.tag,
        request: envelope.raw.to_vec(),
        created: Instant::now(),
        // one reference for the client set; the upstream set takes its own
        refcount: RefCount::new(1),
        link: Mutex::new(OperationLink {
            client: Some(client.clone()),
            client_msgid: envelope.msgid,
            upstream: None,
            upstream_msgid: 0,
            pin: 0,
            backend: None,
            outcome: OperationOutcome::Pending,
            last_response: None,
            saved_response: None,
            awaiting_whoami: false,
            abandoned: false,
        }),
    });

    {
        let mut core = client.lock_core();
        if core.state >= ConnectionState::Closing {
            return Err(OperationError::ConnectionClosing);
        }
        if server.config.client_max_pending > 0
            && core.ops.len() >= server.config.client_max_pending
        {
            return Err(OperationError::TooManyPending);
        }
        let key = OperationKey::Msgid(envelope.msgid);
        if core.ops.contains_key(&key) {
            return Err(OperationError::DuplicateMsgId(envelope.msgid));
        }
        core.ops.insert(key, operation.clone());
    }

    client
        .counters
        .received
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    incr!("operations.received");
    server.operation_started();
    Ok(operation)
}

/// Dispatch a freshly forwarded request onto `upstream` under `msgid`,
/// taking the upstream-set reference and the backend execution slot.
pub fn attach_upstream(
    operation: &Arc<Operation>,
    upstream: &Arc<Connection>,
    msgid: i32,
    backend: Arc<Backend>,
) {
    {
        let mut core = upstream.lock_core();
        core.ops
            .insert(OperationKey::Msgid(msgid), operation.clone());
        let mut link = operation.lock_link();
        link.upstream = Some(upstream.clone());
        link.upstream_msgid = msgid;
        link.backend = Some(backend);
    }
    operation.acquire();
}

/// Detach the operation from both connection sets, give back the backend
/// execution slot, and record the outcome. Safe to call from either side's
/// teardown; every step is guarded so it happens exactly once.
pub fn retire(server: &Server, operation: &Arc<Operation>, outcome: OperationOutcome) {
    let (first, client, client_key, upstream, upstream_key, backend) = {
        let mut link = operation.lock_link();
        // two resolvers can race here; the outcome transition elects the one
        // that owns the global accounting
        let first = link.outcome == OperationOutcome::Pending;
        if first {
            link.outcome = outcome;
        }
        let client_key = if link.pin != 0 {
            OperationKey::Pin(link.pin)
        } else {
            OperationKey::Msgid(link.client_msgid)
        };
        let upstream_key = OperationKey::Msgid(link.upstream_msgid);
        link.pin = 0;
        (
            first,
            link.client.take(),
            client_key,
            link.upstream.take(),
            upstream_key,
            link.backend.take(),
        )
    };

    if let Some(client) = client {
        let removed = client.lock_core().ops.remove(&client_key).is_some();
        if removed {
            operation.release();
        }
    }
    if let Some(upstream) = upstream {
        let removed = upstream.lock_core().ops.remove(&upstream_key).is_some();
        if removed {
            operation.release();
        }
    }
    if let Some(backend) = backend {
        backend.operation_finished(outcome);
    }
    if !first {
        return;
    }
    server.operation_finished();

    match outcome {
        OperationOutcome::Completed => incr!("operations.completed"),
        OperationOutcome::Failed => incr!("operations.failed"),
        OperationOutcome::Rejected => incr!("operations.rejected"),
        OperationOutcome::Pending => {}
    }
    record_time!(
        "operation.duration",
        operation.age(Instant::now()).as_millis()
    );
}

/// Answer the client with a synthesized result and retire the operation.
/// Operations whose request kind has no response shape are retired silently.
pub fn reject(
    server: &Server,
    operation: &Arc<Operation>,
    code: ResultCode,
    diagnostic: &str,
    outcome: OperationOutcome,
) {
    let (client, msgid) = {
        let link = operation.lock_link();
        (link.client.clone(), link.client_msgid)
    };
    if let Some(client) = client {
        if let Some(response_tag) = protocol::response_tag(operation.tag) {
            let pdu = codec::result_message(msgid, response_tag, code, diagnostic);
            if let Err(e) = client.write(&pdu) {
                debug!("client#{} gone while rejecting: {e}", client.id);
            }
        }
        client
            .counters
            .failed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    retire(server, operation, outcome);
}

/// Best-effort Abandon toward the upstream half of an operation, used when
/// the client abandoned it or the timeout sweep gave up on it.
pub fn abandon_upstream(operation: &Arc<Operation>) {
    let (upstream, upstream_msgid) = {
        let mut link = operation.lock_link();
        link.abandoned = true;
        (link.upstream.clone(), link.upstream_msgid)
    };
    let Some(upstream) = upstream else { return };
    if upstream_msgid == 0 || !upstream.is_live() {
        return;
    }
    let pdu = codec::abandon_request(upstream.alloc_msgid(), upstream_msgid);
    if let Err(e) = upstream.write(&pdu) {
        debug!("could not abandon msgid {upstream_msgid} upstream: {e}");
    }
    incr!("operations.abandoned");
}

/// Walk every backend's connections and give up on operations older than
/// `threshold` that have produced no response since. The client gets an
/// administrative-limit result, the upstream a best-effort Abandon.
pub fn timeout_sweep(server: &Server, threshold: Duration, now: Instant) -> usize {
    let _guard = server.reclaimer.join();

    let mut stale: Vec<Arc<Operation>> = Vec::new();
    for backend in server.backends_snapshot() {
        for connection in backend.connections_snapshot() {
            let core = connection.lock_core();
            for operation in core.ops.values() {
                if operation.age(now) < threshold {
                    continue;
                }
                let link = operation.lock_link();
                let recent = link
                    .last_response
                    .map(|at| now.saturating_duration_since(at) < threshold)
                    .unwrap_or(false);
                if recent {
                    continue;
                }
                drop(link);
                if operation.acquire() {
                    stale.push(operation.clone());
                }
            }
        }
    }

    // oldest first, the registry never reorders but expires in start order
    stale.sort_by_key(|operation| operation.created);

    let expired = stale.len();
    for operation in stale {
        warn!(
            "operation {} (msgid {}) timed out after {:?}",
            operation.ulid,
            operation.client_msgid(),
            operation.age(now)
        );
        abandon_upstream(&operation);
        if operation.tag == tag::BIND_REQUEST {
            crate::bind::fail_bind(server, &operation, ResultCode::AdminLimitExceeded, "bind timed out");
        } else {
            reject(
                server,
                &operation,
                ResultCode::AdminLimitExceeded,
                "the operation exceeded the configured time limit",
                OperationOutcome::Failed,
            );
        }
        operation.release();
        incr!("operations.timed_out");
    }
    expired
}

/// Resolve every operation attached to a dead upstream with the severed
/// diagnostic; part of the upstream unlink path.
pub fn fail_severed(server: &Server, operation: &Arc<Operation>) {
    {
        let mut link = operation.lock_link();
        // the upstream set is already being drained; drop our half
        link.upstream = None;
        link.upstream_msgid = 0;
        if link.abandoned {
            drop(link);
            retire(server, operation, OperationOutcome::Failed);
            return;
        }
    }
    if operation.tag == tag::BIND_REQUEST {
        crate::bind::fail_bind(server, operation, ResultCode::Other, protocol::SEVERED_MSG);
    } else {
        reject(
            server,
            operation,
            ResultCode::Other,
            protocol::SEVERED_MSG,
            OperationOutcome::Failed,
        );
    }
}
