//! Upstream-side PDU handling.
//!
//! A freshly connected upstream runs the optional StartTLS exchange and the
//! configured session bind before its backend puts it into a pool. Once
//! pooled, everything it sends is a response: demultiplexed by message id,
//! re-framed under the client's original id and relayed. Bind, Who Am I and
//! VerifyCredentials responses detour through the `bind` module.

use std::{sync::Arc, time::Instant};

use crate::{
    backends::Backend,
    bind::{self, SaslStep},
    config::{BindMethod, TlsMode},
    connection::{Connection, ConnectionRole, ConnectionState},
    operation::{self, OperationKey, OperationOutcome},
    protocol::{
        self, codec, oid,
        parser::{self, Envelope},
        tag,
    },
    server::Server,
    socket::SocketResult,
    OperationError,
};

fn owning_backend(upstream: &Connection) -> Option<Arc<Backend>> {
    upstream
        .lock_core()
        .backend
        .as_ref()
        .and_then(|weak| weak.upgrade())
}

/// The non-blocking connect completed; start TLS or the session bind.
pub fn established(server: &Arc<Server>, upstream: &Arc<Connection>) {
    let Some(backend) = owning_backend(upstream) else {
        return;
    };
    if let Some(e) = upstream.lock_io().socket.connect_error() {
        warn!("backend {}: connect failed: {e}", backend.name);
        upstream_died(server, &backend, upstream);
        return;
    }
    backend.connect_established(upstream);
    debug!("backend {}: connection#{} established", backend.name, upstream.id);

    match backend.config.tls {
        TlsMode::StartTls | TlsMode::StartTlsOptional => {
            let msgid = upstream.alloc_msgid();
            let pdu = codec::extended_request(msgid, oid::STARTTLS, None);
            if upstream.write(&pdu).is_err() {
                upstream_died(server, &backend, upstream);
            }
        }
        TlsMode::Off | TlsMode::Ldaps => {
            if start_session_bind(server, &backend, upstream).is_err() {
                upstream_died(server, &backend, upstream);
            }
        }
    }
}

/// Issue the configured session bind, or promote straight away for anonymous
/// sessions.
fn start_session_bind(
    server: &Arc<Server>,
    backend: &Arc<Backend>,
    upstream: &Arc<Connection>,
) -> Result<(), OperationError> {
    match &server.config.bindconf.method {
        BindMethod::None => {
            backend.promote(server, upstream);
            Ok(())
        }
        BindMethod::Simple {
            binddn,
            credentials,
        } => {
            let msgid = upstream.alloc_msgid();
            let pdu = codec::bind_request_simple(msgid, binddn, credentials.as_bytes());
            upstream.write(&pdu).map_err(OperationError::Connection)
        }
        method @ BindMethod::Sasl { .. } => {
            let mut sasl = match bind::session_sasl_client(method)? {
                Some(sasl) => sasl,
                None => {
                    backend.promote(server, upstream);
                    return Ok(());
                }
            };
            let initial = match sasl.step(None)? {
                SaslStep::Respond(initial) => initial,
                SaslStep::Done => Vec::new(),
            };
            let mechanism = sasl.mechanism().to_string();
            upstream.lock_core().sasl = Some(sasl);
            let msgid = upstream.alloc_msgid();
            let pdu = codec::bind_request_sasl(msgid, "", &mechanism, Some(&initial));
            upstream.write(&pdu).map_err(OperationError::Connection)
        }
    }
}

/// Read-side entry point for the event loop.
pub fn readable(server: &Arc<Server>, upstream: &Arc<Connection>) {
    if !upstream.is_live() {
        return;
    }
    let (_, fill_result) = upstream.fill(server.config.sockbuf_max_upstream);

    for _ in 0..server.config.max_pdus_per_cycle.max(1) {
        match upstream.next_pdu(server.config.sockbuf_max_upstream) {
            Ok(Some(pdu)) => {
                if let Err(e) = handle_pdu(server, upstream, &pdu) {
                    warn!("upstream#{}: {e}", upstream.id);
                    server.teardown_upstream(upstream);
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                // a malformed upstream is connection-fatal
                warn!("upstream#{}: protocol error: {e}", upstream.id);
                server.teardown_upstream(upstream);
                return;
            }
        }
    }

    if matches!(fill_result, SocketResult::Closed | SocketResult::Error) {
        server.teardown_upstream(upstream);
    }
}

fn handle_pdu(
    server: &Arc<Server>,
    upstream: &Arc<Connection>,
    pdu: &[u8],
) -> Result<(), OperationError> {
    let envelope = match parser::parse_envelope(pdu, usize::MAX)? {
        Some((envelope, _)) => envelope,
        None => return Err(OperationError::Protocol(protocol::ProtocolError::Ber(
            "truncated message",
        ))),
    };
    if envelope.msgid == 0 {
        // unsolicited notification, usually a notice of disconnection
        warn!("upstream#{}: unsolicited notification", upstream.id);
        return Err(OperationError::ConnectionClosing);
    }

    match upstream.role() {
        ConnectionRole::Preparing => prepare_step(server, upstream, &envelope),
        _ => route_response(server, upstream, &envelope),
    }
}

/// Responses received while the connection is still being prepared: the
/// StartTLS result or a step of the session bind.
fn prepare_step(
    server: &Arc<Server>,
    upstream: &Arc<Connection>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let Some(backend) = owning_backend(upstream) else {
        return Err(OperationError::ConnectionClosing);
    };

    if envelope.tag == tag::EXTENDED_RESPONSE && !upstream.lock_core().tls_established {
        let result = parser::parse_result(envelope.op)?;
        if result.code == 0 {
            upstream.lock_core().tls_established = true;
            server.push_event(crate::server::ProxyEvent::StartTlsNegotiated {
                connection: upstream.id,
            });
        } else if backend.config.tls == TlsMode::StartTls {
            warn!(
                "backend {}: critical starttls refused ({})",
                backend.name, result.code
            );
            return Err(OperationError::ConnectionClosing);
        }
        return start_session_bind(server, &backend, upstream);
    }

    if envelope.tag != tag::BIND_RESPONSE {
        return Err(OperationError::Protocol(
            protocol::ProtocolError::UnexpectedTag {
                tag: envelope.tag,
                expected: "session BindResponse",
            },
        ));
    }
    let result = parser::parse_result(envelope.op)?;
    match result.code {
        0 => {
            backend.promote(server, upstream);
            Ok(())
        }
        code if code == protocol::ResultCode::SaslBindInProgress.as_u32() => {
            let challenge = result
                .extra
                .and_then(|(tag, value)| (tag == 0x87).then_some(value));
            let step = {
                let mut core = upstream.lock_core();
                match core.sasl.as_mut() {
                    Some(sasl) => (sasl.mechanism().to_string(), sasl.step(challenge)?),
                    None => {
                        return Err(OperationError::Protocol(protocol::ProtocolError::Ber(
                            "saslBindInProgress without a sasl exchange",
                        )))
                    }
                }
            };
            let (mechanism, step) = step;
            let credentials = match step {
                SaslStep::Respond(credentials) => credentials,
                SaslStep::Done => Vec::new(),
            };
            let msgid = upstream.alloc_msgid();
            let pdu = codec::bind_request_sasl(msgid, "", &mechanism, Some(&credentials));
            upstream.write(&pdu).map_err(OperationError::Connection)
        }
        code => {
            warn!(
                "backend {}: session bind failed with {code}: {}",
                backend.name,
                String::from_utf8_lossy(result.diagnostic)
            );
            Err(OperationError::ConnectionClosing)
        }
    }
}

/// Demultiplex a pooled upstream's response onto its operation.
fn route_response(
    server: &Arc<Server>,
    upstream: &Arc<Connection>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let operation = upstream
        .lock_core()
        .ops
        .get(&OperationKey::Msgid(envelope.msgid))
        .cloned();
    let Some(operation) = operation else {
        // late response to an operation we already gave up on
        debug!(
            "upstream#{}: unmatched response msgid {}",
            upstream.id, envelope.msgid
        );
        return Ok(());
    };

    if operation.tag == tag::BIND_REQUEST {
        let awaiting_whoami = operation.lock_link().awaiting_whoami;
        return if awaiting_whoami {
            bind::handle_whoami_response(server, upstream, &operation, envelope)
        } else {
            bind::handle_upstream_bind_response(server, upstream, &operation, envelope)
        };
    }

    let (client, client_msgid, abandoned) = {
        let mut link = operation.lock_link();
        link.last_response = Some(Instant::now());
        (link.client.clone(), link.client_msgid, link.abandoned)
    };
    let is_final = protocol::is_final_response(envelope.tag);

    if !abandoned {
        if let Some(client) = client {
            let pdu = codec::reframe(envelope, client_msgid, None);
            if let Err(e) = client.write(&pdu) {
                debug!("client#{} lost mid-response: {e}", client.id);
                server.teardown_client(&client);
            } else if is_final {
                client
                    .counters
                    .completed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    if is_final {
        upstream
            .counters
            .completed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let outcome = if abandoned {
            OperationOutcome::Failed
        } else {
            OperationOutcome::Completed
        };
        operation::retire(server, &operation, outcome);
        if upstream.state() == ConnectionState::Closing && upstream.pending_ops() == 0 {
            // a gently reset connection drains out with its last response
            server.teardown_upstream(upstream);
        }
    }
    Ok(())
}

/// Tear an upstream connection down: every attached operation fails toward
/// its client with the severed diagnostic, the pool slot is reclaimed and a
/// replacement connect is kicked off (with backoff if the connection never
/// became ready).
pub fn upstream_died(server: &Arc<Server>, backend: &Arc<Backend>, connection: &Arc<Connection>) {
    let Some(work) = connection.begin_unlink() else {
        return;
    };
    info!(
        "backend {}: connection#{} severed with {} operations",
        backend.name,
        connection.id,
        work.ops.len()
    );
    incr!("upstream.disconnects", Some(backend.name.as_str()));

    for operation in work.ops {
        operation::fail_severed(server, &operation);
        operation.release();
    }
    if backend.unlink_connection(connection) {
        connection.release(&server.reclaimer);
    }
    server.unregister_connection(connection.id);

    match work.role {
        ConnectionRole::Preparing => backend.connect_failed(server),
        _ => backend.connect(server),
    }
}
