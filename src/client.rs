//! Client-side PDU handling.
//!
//! A client connection accepts requests, creates operations for them and
//! routes them to the backend pools. Unbind and Abandon are acted on locally
//! and never create operations; StartTLS is answered by the proxy itself;
//! binds detour through the `bind` module; everything else is re-framed and
//! relayed verbatim.

use std::sync::{atomic::Ordering, Arc};

use crate::{
    bind,
    connection::{Connection, ConnectionRole, ConnectionState},
    operation::{self, OperationKey, OperationOutcome},
    protocol::{
        self, codec, oid,
        parser::{self, Envelope},
        tag, ResultCode,
    },
    server::{ProxyEvent, Server},
    socket::{SocketHandler, SocketResult},
    OperationError,
};

/// Register a freshly accepted client connection.
pub fn accepted(server: &Arc<Server>, socket: Box<dyn SocketHandler>) -> Arc<Connection> {
    let connection = Connection::new(
        server.next_connection_id(),
        socket,
        ConnectionRole::Client,
        ConnectionState::Ready,
    );
    server.register_client(connection.clone());
    server.install_write_timeout(&connection);
    gauge_add!("connections.active", 1);
    incr!("clients.accepted");
    debug!(
        "client#{} accepted from {:?}",
        connection.id,
        connection.lock_io().socket.peer_addr()
    );
    connection
}

/// Read-side entry point for the event loop. At most one task runs this per
/// connection at a time; the caller guarantees that through read-muting.
pub fn readable(server: &Arc<Server>, client: &Arc<Connection>) {
    if !client.is_live() {
        return;
    }
    if server.features().read_pause && server.over_pause_threshold() {
        // global backpressure: stop reading until operations drain
        client.mute();
        server.mark_paused();
        return;
    }

    let (_, fill_result) = client.fill(server.config.sockbuf_max_client);

    for _ in 0..server.config.max_pdus_per_cycle.max(1) {
        match client.next_pdu(server.config.sockbuf_max_client) {
            Ok(Some(pdu)) => {
                if let Err(e) = handle_pdu(server, client, &pdu) {
                    debug!("client#{}: {e}", client.id);
                    server.teardown_client(client);
                    return;
                }
                if !client.is_live() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                // a client speaking garbage gets no diagnostic, just a close
                debug!("client#{}: protocol error: {e}", client.id);
                server.teardown_client(client);
                return;
            }
        }
    }

    if matches!(fill_result, SocketResult::Closed | SocketResult::Error) {
        server.teardown_client(client);
    }
}

fn handle_pdu(
    server: &Arc<Server>,
    client: &Arc<Connection>,
    pdu: &[u8],
) -> Result<(), OperationError> {
    let envelope = match parser::parse_envelope(pdu, usize::MAX)? {
        Some((envelope, _)) => envelope,
        None => {
            return Err(OperationError::Protocol(protocol::ProtocolError::Ber(
                "truncated message",
            )))
        }
    };

    match envelope.tag {
        tag::UNBIND_REQUEST => {
            // no response is ever sent to an unbind
            trace!("client#{}: unbind", client.id);
            server.teardown_client(client);
            Ok(())
        }
        tag::ABANDON_REQUEST => handle_abandon(server, client, &envelope),
        tag::BIND_REQUEST => bind::handle_client_bind(server, client, &envelope),
        tag::EXTENDED_REQUEST => handle_extended(server, client, &envelope),
        tag if protocol::is_request(tag) => forward(server, client, &envelope),
        tag => Err(OperationError::Protocol(
            protocol::ProtocolError::UnexpectedTag {
                tag,
                expected: "a request",
            },
        )),
    }
}

/// Abandon cancels delivery locally and nudges the upstream; it never gets a
/// response of its own and never applies to a bind in progress. The operation
/// is retired on the spot: the upstream will not answer an abandoned request,
/// so leaving it registered would hold its capacity slots until the sweep.
fn handle_abandon(
    server: &Arc<Server>,
    client: &Arc<Connection>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let target = parser::parse_abandon(envelope.op)?;
    let operation = client
        .lock_core()
        .ops
        .get(&OperationKey::Msgid(target))
        .cloned();
    let Some(operation) = operation else {
        return Ok(());
    };
    if operation.tag == tag::BIND_REQUEST {
        debug!("client#{}: abandon of a bind ignored", client.id);
        return Ok(());
    }
    operation::abandon_upstream(&operation);
    operation::retire(server, &operation, OperationOutcome::Failed);
    Ok(())
}

fn handle_extended(
    server: &Arc<Server>,
    client: &Arc<Connection>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let request = parser::parse_extended_request(envelope.op)?;
    match request.oid {
        oid::STARTTLS => {
            let (code, diagnostic) = {
                let core = client.lock_core();
                if core.tls_established {
                    (ResultCode::ProtocolError, "TLS already established")
                } else if !core.ops.is_empty() {
                    (ResultCode::OperationsError, "operations are pending")
                } else {
                    (ResultCode::Success, "")
                }
            };
            let pdu = codec::extended_response(envelope.msgid, code, diagnostic, None);
            client.write(&pdu).map_err(OperationError::Connection)?;
            if code == ResultCode::Success {
                client.lock_core().tls_established = true;
                // the runtime swaps the transport under the I/O lock
                server.push_event(ProxyEvent::StartTlsRequested {
                    connection: client.id,
                });
            }
            Ok(())
        }
        oid::VERIFY_CREDENTIALS => {
            // proxy-internal; clients do not get to issue it
            let pdu = codec::extended_response(
                envelope.msgid,
                ResultCode::UnwillingToPerform,
                "reserved for proxy use",
                None,
            );
            client.write(&pdu).map_err(OperationError::Connection)
        }
        _ => forward(server, client, envelope),
    }
}

/// Route a generic request to the pool, re-framed under a fresh upstream
/// message id, with the proxy-authorization control appended when the client
/// has an authenticated identity to forward under.
fn forward(
    server: &Arc<Server>,
    client: &Arc<Connection>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let operation = match operation::create(server, client, envelope) {
        Ok(operation) => operation,
        Err(OperationError::TooManyPending) => {
            if let Some(response_tag) = protocol::response_tag(envelope.tag) {
                let pdu = codec::result_message(
                    envelope.msgid,
                    response_tag,
                    ResultCode::Busy,
                    "too many pending operations",
                );
                client.write(&pdu).map_err(OperationError::Connection)?;
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let (upstream, backend) = match server.select(false) {
        Ok(selected) => selected,
        Err(e) => {
            let (code, diagnostic) = match e {
                crate::BackendError::Busy => {
                    (ResultCode::Busy, "all backends are at capacity")
                }
                _ => (ResultCode::Unavailable, "no backends are available"),
            };
            operation::reject(server, &operation, code, diagnostic, OperationOutcome::Rejected);
            return Ok(());
        }
    };

    let control = if server.features().proxyauthz {
        client
            .lock_core()
            .identity
            .as_deref()
            .map(codec::proxy_authz_control)
    } else {
        None
    };

    let msgid = upstream.alloc_msgid();
    let pdu = codec::reframe(envelope, msgid, control.as_deref());
    operation::attach_upstream(&operation, &upstream, msgid, backend.clone());
    backend.operation_started();
    if let Err(e) = upstream.write(&pdu) {
        warn!("upstream#{} lost while forwarding: {e}", upstream.id);
        server.teardown_upstream(&upstream);
        return Ok(());
    }
    client.counters.forwarded.fetch_add(1, Ordering::Relaxed);
    upstream.counters.received.fetch_add(1, Ordering::Relaxed);
    incr!("operations.forwarded", Some(backend.name.as_str()));
    Ok(())
}

/// Tear a client connection down, abandoning whatever it still had in
/// flight toward the upstreams. Nothing is written back to the client.
pub fn teardown(server: &Arc<Server>, client: &Arc<Connection>) {
    let Some(work) = client.begin_unlink() else {
        return;
    };
    debug!(
        "client#{} torn down with {} operations pending",
        client.id,
        work.ops.len()
    );
    for operation in work.ops {
        if operation.tag == tag::BIND_REQUEST {
            bind::release_binding_upstream(&operation);
        } else {
            operation::abandon_upstream(&operation);
        }
        operation::retire(server, &operation, OperationOutcome::Failed);
        operation.release();
    }
    if server.unregister_connection(client.id) {
        client.release(&server.reclaimer);
    }
    incr!("clients.closed");
}
