//! Bind handling on both sides of the proxy.
//!
//! Client binds are exclusive: while one runs, the client connection and the
//! upstream connection serving it are both in the `Binding` state and carry a
//! shared pin, so multi-step SASL exchanges keep landing on the same upstream
//! even though each step arrives as a separate BindRequest. When the `vc`
//! feature is on, client binds are translated into VerifyCredentials exops
//! instead and run on the general pool without any exclusivity.
//!
//! The proxy's own session binds (authenticating pooled upstream connections
//! after connect) go through the [`SaslClient`] trait; only PLAIN is built in.

use std::{sync::Arc, time::Instant};

use crate::{
    config::BindMethod,
    connection::{Connection, ConnectionState},
    operation::{self, Operation, OperationKey, OperationOutcome},
    protocol::{
        self, codec, oid,
        parser::{self, BindAuth, Envelope},
        tag, ResultCode,
    },
    server::Server,
    BackendError, OperationError,
};

pub enum SaslStep {
    Respond(Vec<u8>),
    Done,
}

/// Client side of a SASL exchange, used for the proxy's own session binds.
pub trait SaslClient: Send {
    fn mechanism(&self) -> &str;
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<SaslStep, OperationError>;
}

/// PLAIN (RFC 4616): a single message, `authzid NUL authcid NUL passwd`.
pub struct PlainSasl {
    authcid: String,
    authzid: String,
    password: String,
    sent: bool,
}

impl PlainSasl {
    pub fn new(authcid: &str, authzid: Option<&str>, password: &str) -> PlainSasl {
        PlainSasl {
            authcid: authcid.to_string(),
            authzid: authzid.unwrap_or("").to_string(),
            password: password.to_string(),
            sent: false,
        }
    }
}

impl SaslClient for PlainSasl {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn step(&mut self, _challenge: Option<&[u8]>) -> Result<SaslStep, OperationError> {
        if self.sent {
            return Ok(SaslStep::Done);
        }
        self.sent = true;
        let mut message = Vec::new();
        message.extend_from_slice(self.authzid.as_bytes());
        message.push(0);
        message.extend_from_slice(self.authcid.as_bytes());
        message.push(0);
        message.extend_from_slice(self.password.as_bytes());
        Ok(SaslStep::Respond(message))
    }
}

/// SASL context for the configured session bind method, `None` when the
/// method needs no SASL exchange.
pub fn session_sasl_client(method: &BindMethod) -> Result<Option<Box<dyn SaslClient>>, OperationError> {
    match method {
        BindMethod::None | BindMethod::Simple { .. } => Ok(None),
        BindMethod::Sasl {
            mechanism,
            authcid,
            authzid,
            credentials,
        } => {
            if mechanism != "PLAIN" {
                return Err(OperationError::UnsupportedSaslMechanism(mechanism.clone()));
            }
            let authcid = authcid.as_deref().unwrap_or("");
            let password = credentials.as_deref().unwrap_or("");
            Ok(Some(Box::new(PlainSasl::new(
                authcid,
                authzid.as_deref(),
                password,
            ))))
        }
    }
}

/// Entry point for a BindRequest PDU read from a client.
pub fn handle_client_bind(
    server: &Arc<Server>,
    client: &Arc<Connection>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let bind = match parser::parse_bind_request(envelope.op) {
        Ok(bind) => bind,
        Err(e) => {
            debug!("client#{}: malformed bind: {e}", client.id);
            let pdu = codec::bind_response(
                envelope.msgid,
                ResultCode::ProtocolError,
                "malformed bind request",
                None,
            );
            let _ = client.write(&pdu);
            return Err(OperationError::Protocol(e));
        }
    };
    if bind.version != 3 {
        let pdu = codec::bind_response(
            envelope.msgid,
            ResultCode::ProtocolError,
            "only LDAPv3 is supported",
            None,
        );
        client.write(&pdu).map_err(OperationError::Connection)?;
        return Ok(());
    }

    let pin = {
        let mut core = client.lock_core();
        if core.state >= ConnectionState::Closing {
            return Err(OperationError::ConnectionClosing);
        }
        // a new bind discards whatever identity the connection had
        core.identity = None;
        core.state = ConnectionState::Binding;
        core.pin
    };

    if pin != 0 {
        return continue_pinned_bind(server, client, envelope, pin);
    }

    let operation = operation::create(server, client, envelope)?;
    incr!("binds.started");

    if server.features().vc {
        return start_vc_bind(server, client, &operation, envelope, bind.dn);
    }

    match server.select(true) {
        Ok((upstream, backend)) => {
            let msgid = upstream.alloc_msgid();
            upstream.lock_core().state = ConnectionState::Binding;
            let pdu = codec::reframe(envelope, msgid, None);
            operation::attach_upstream(&operation, &upstream, msgid, backend.clone());
            backend.operation_started();
            if let Err(e) = upstream.write(&pdu) {
                warn!("upstream#{} lost mid-bind: {e}", upstream.id);
                server.teardown_upstream(&upstream);
                return Ok(());
            }
            client
                .counters
                .forwarded
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            reject_selection(server, &operation, e);
            Ok(())
        }
    }
}

/// Another BindRequest on a pinned client: the next step of the SASL exchange
/// in progress (or a mechanism switch, which the upstream arbitrates).
fn continue_pinned_bind(
    server: &Arc<Server>,
    client: &Arc<Connection>,
    envelope: &Envelope,
    pin: u64,
) -> Result<(), OperationError> {
    let operation = client
        .lock_core()
        .ops
        .get(&OperationKey::Pin(pin))
        .cloned();
    let Some(operation) = operation else {
        // the pinned operation is gone, nothing to continue
        let mut core = client.lock_core();
        core.pin = 0;
        core.state = ConnectionState::Ready;
        drop(core);
        let pdu = codec::bind_response(
            envelope.msgid,
            ResultCode::Other,
            protocol::SEVERED_MSG,
            None,
        );
        client.write(&pdu).map_err(OperationError::Connection)?;
        return Ok(());
    };

    let (upstream, old_msgid) = {
        let mut link = operation.lock_link();
        link.client_msgid = envelope.msgid;
        (link.upstream.clone(), link.upstream_msgid)
    };
    let Some(upstream) = upstream else {
        pinned_upstream_died(server, &operation);
        return Ok(());
    };
    if !upstream.is_live() {
        pinned_upstream_died(server, &operation);
        return Ok(());
    }

    let msgid = upstream.alloc_msgid();
    {
        let mut core = upstream.lock_core();
        if let Some(op) = core.ops.remove(&OperationKey::Msgid(old_msgid)) {
            core.ops.insert(OperationKey::Msgid(msgid), op);
        }
    }
    operation.lock_link().upstream_msgid = msgid;

    let pdu = codec::reframe(envelope, msgid, None);
    if let Err(e) = upstream.write(&pdu) {
        warn!("upstream#{} lost mid-sasl: {e}", upstream.id);
        server.teardown_upstream(&upstream);
    }
    Ok(())
}

/// Translate a client bind into a VerifyCredentials exop on the general pool.
fn start_vc_bind(
    server: &Arc<Server>,
    client: &Arc<Connection>,
    operation: &Arc<Operation>,
    envelope: &Envelope,
    dn: &str,
) -> Result<(), OperationError> {
    let auth_choice = parser::bind_auth_choice(envelope.op).map_err(OperationError::Protocol)?;
    match server.select(false) {
        Ok((upstream, backend)) => {
            let msgid = upstream.alloc_msgid();
            let pdu = codec::verify_credentials_request(msgid, dn, auth_choice);
            operation::attach_upstream(operation, &upstream, msgid, backend.clone());
            backend.operation_started();
            if let Err(e) = upstream.write(&pdu) {
                warn!("upstream#{} lost mid-vc: {e}", upstream.id);
                server.teardown_upstream(&upstream);
                return Ok(());
            }
            client
                .counters
                .forwarded
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            reject_selection(server, operation, e);
            Ok(())
        }
    }
}

fn reject_selection(server: &Arc<Server>, operation: &Arc<Operation>, error: BackendError) {
    let (code, diagnostic) = match error {
        BackendError::Busy => (ResultCode::Busy, "all backends are at capacity"),
        _ => (ResultCode::Unavailable, "no backends are available"),
    };
    fail_bind(server, operation, code, diagnostic);
}

/// A response to a client bind arrived from an upstream. `envelope` is either
/// a BindResponse or, on the `vc` path, an ExtendedResponse.
pub fn handle_upstream_bind_response(
    server: &Arc<Server>,
    upstream: &Arc<Connection>,
    operation: &Arc<Operation>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let result = parser::parse_result(envelope.op).map_err(OperationError::Protocol)?;
    operation.lock_link().last_response = Some(Instant::now());

    if envelope.tag == tag::EXTENDED_RESPONSE {
        return finish_vc_bind(server, operation, &result);
    }

    match result.code {
        code if code == ResultCode::SaslBindInProgress.as_u32() => {
            sasl_step_received(server, upstream, operation, envelope)
        }
        0 => bind_succeeded(server, upstream, operation, envelope),
        _ => {
            let (client, msgid) = {
                let link = operation.lock_link();
                (link.client.clone(), link.client_msgid)
            };
            set_binding_done(upstream);
            if let Some(client) = client {
                restore_client(&client, None);
                let pdu = codec::reframe(envelope, msgid, None);
                let _ = client.write(&pdu);
            }
            operation::retire(server, operation, OperationOutcome::Failed);
            incr!("binds.failed");
            Ok(())
        }
    }
}

/// saslBindInProgress: allocate the pin on the first step and forward the
/// challenge. Client and upstream both stay in `Binding`.
fn sasl_step_received(
    server: &Arc<Server>,
    upstream: &Arc<Connection>,
    operation: &Arc<Operation>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let (client, client_msgid, pin) = {
        let link = operation.lock_link();
        (link.client.clone(), link.client_msgid, link.pin)
    };
    let Some(client) = client else {
        return Ok(());
    };

    if pin == 0 {
        let pin = server.next_pin();
        {
            let mut core = client.lock_core();
            if let Some(op) = core.ops.remove(&OperationKey::Msgid(client_msgid)) {
                core.ops.insert(OperationKey::Pin(pin), op);
            }
            core.pin = pin;
        }
        upstream.lock_core().pin = pin;
        operation.lock_link().pin = pin;
        trace!(
            "client#{} pinned to upstream#{} (pin {pin})",
            client.id,
            upstream.id
        );
    }

    let pdu = codec::reframe(envelope, client_msgid, None);
    client.write(&pdu).map_err(OperationError::Connection)?;
    Ok(())
}

fn bind_succeeded(
    server: &Arc<Server>,
    upstream: &Arc<Connection>,
    operation: &Arc<Operation>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    // re-parse the original request for the bound identity
    let (identity, sasl) = match parser::parse_envelope(&operation.request, usize::MAX) {
        Ok(Some((request, _))) => match parser::parse_bind_request(request.op) {
            Ok(bind) => match bind.auth {
                BindAuth::Simple(_) => {
                    let dn = bind.dn.to_string();
                    ((!dn.is_empty()).then_some(dn), false)
                }
                BindAuth::Sasl { .. } => (None, true),
            },
            Err(_) => (None, false),
        },
        _ => (None, false),
    };

    let (client, client_msgid) = {
        let link = operation.lock_link();
        (link.client.clone(), link.client_msgid)
    };
    let Some(client) = client else {
        set_binding_done(upstream);
        operation::retire(server, operation, OperationOutcome::Completed);
        return Ok(());
    };

    // a SASL bind's authorization identity is only known to the backend;
    // ask it before releasing the response when we will need the identity
    if sasl && server.features().proxyauthz && !server.config.bindconf.identity_inferable()
    {
        let msgid = upstream.alloc_msgid();
        {
            let mut core = upstream.lock_core();
            let old = OperationKey::Msgid(operation.lock_link().upstream_msgid);
            if let Some(op) = core.ops.remove(&old) {
                core.ops.insert(OperationKey::Msgid(msgid), op);
            }
        }
        {
            let mut link = operation.lock_link();
            link.upstream_msgid = msgid;
            link.saved_response = Some(codec::reframe(envelope, client_msgid, None));
            link.awaiting_whoami = true;
        }
        let pdu = codec::extended_request(msgid, oid::WHOAMI, None);
        upstream.write(&pdu).map_err(OperationError::Connection)?;
        return Ok(());
    }

    set_binding_done(upstream);
    restore_client(&client, identity);
    let pdu = codec::reframe(envelope, client_msgid, None);
    client.write(&pdu).map_err(OperationError::Connection)?;
    operation::retire(server, operation, OperationOutcome::Completed);
    incr!("binds.completed");
    Ok(())
}

/// The Who Am I response that concludes a proxied SASL bind.
pub fn handle_whoami_response(
    server: &Arc<Server>,
    upstream: &Arc<Connection>,
    operation: &Arc<Operation>,
    envelope: &Envelope,
) -> Result<(), OperationError> {
    let result = parser::parse_result(envelope.op).map_err(OperationError::Protocol)?;
    set_binding_done(upstream);

    if result.code != 0 {
        warn!(
            "upstream#{}: whoami failed with {}",
            upstream.id, result.code
        );
        fail_bind(
            server,
            operation,
            ResultCode::Other,
            "unable to determine the authorization identity",
        );
        return Ok(());
    }

    let identity = result
        .extra
        .and_then(|(tag, value)| (tag == 0x8b).then_some(value))
        .and_then(|value| std::str::from_utf8(value).ok())
        .map(|authzid| authzid.strip_prefix("dn:").unwrap_or(authzid).to_string());

    let (client, saved) = {
        let mut link = operation.lock_link();
        link.awaiting_whoami = false;
        (link.client.clone(), link.saved_response.take())
    };
    if let Some(client) = client {
        restore_client(&client, identity);
        if let Some(saved) = saved {
            client.write(&saved).map_err(OperationError::Connection)?;
        }
    }
    operation::retire(server, operation, OperationOutcome::Completed);
    incr!("binds.completed");
    Ok(())
}

/// VerifyCredentials came back; synthesize the BindResponse the client is
/// waiting for. Multi-round VC is not attempted, any non-success is final.
fn finish_vc_bind(
    server: &Arc<Server>,
    operation: &Arc<Operation>,
    result: &parser::LdapResult,
) -> Result<(), OperationError> {
    let (client, client_msgid) = {
        let link = operation.lock_link();
        (link.client.clone(), link.client_msgid)
    };
    let success = result.code == 0;

    if let Some(client) = client {
        let identity = if success {
            match parser::parse_envelope(&operation.request, usize::MAX) {
                Ok(Some((request, _))) => parser::parse_bind_request(request.op)
                    .ok()
                    .map(|bind| bind.dn.to_string())
                    .filter(|dn| !dn.is_empty()),
                _ => None,
            }
        } else {
            None
        };
        restore_client(&client, identity);
        let diagnostic = std::str::from_utf8(result.diagnostic).unwrap_or("");
        let code = if success {
            ResultCode::Success
        } else {
            ResultCode::InvalidCredentials
        };
        let pdu = codec::bind_response(client_msgid, code, diagnostic, None);
        client.write(&pdu).map_err(OperationError::Connection)?;
    }

    let outcome = if success {
        incr!("binds.completed");
        OperationOutcome::Completed
    } else {
        incr!("binds.failed");
        OperationOutcome::Failed
    };
    operation::retire(server, operation, outcome);
    Ok(())
}

/// Resolve a bind operation with a synthesized failure. Also used by the
/// timeout sweep and by upstream teardown (severed).
pub fn fail_bind(server: &Server, operation: &Arc<Operation>, code: ResultCode, diagnostic: &str) {
    let (client, client_msgid, upstream) = {
        let link = operation.lock_link();
        (link.client.clone(), link.client_msgid, link.upstream.clone())
    };
    if let Some(upstream) = upstream {
        set_binding_done(&upstream);
    }
    if let Some(client) = client {
        restore_client(&client, None);
        let pdu = codec::bind_response(client_msgid, code, diagnostic, None);
        if let Err(e) = client.write(&pdu) {
            debug!("client#{} gone while failing bind: {e}", client.id);
        }
    }
    operation::retire(server, operation, OperationOutcome::Failed);
    incr!("binds.failed");
}

/// The pinned upstream of a bind in progress died.
pub fn pinned_upstream_died(server: &Server, operation: &Arc<Operation>) {
    fail_bind(server, operation, ResultCode::Other, protocol::SEVERED_MSG);
}

/// The client of a bind in progress went away; put the upstream it was
/// pinned to back into service.
pub(crate) fn release_binding_upstream(operation: &Arc<Operation>) {
    let upstream = operation.lock_link().upstream.clone();
    if let Some(upstream) = upstream {
        set_binding_done(&upstream);
    }
}

/// Put a client connection back into service after its bind concluded.
fn restore_client(client: &Arc<Connection>, identity: Option<String>) {
    let mut core = client.lock_core();
    core.pin = 0;
    core.identity = identity;
    if core.state == ConnectionState::Binding {
        core.state = ConnectionState::Ready;
    }
}

/// Release a bind-pool upstream from its exclusive `Binding` state.
fn set_binding_done(upstream: &Arc<Connection>) {
    let mut core = upstream.lock_core();
    core.pin = 0;
    if core.state == ConnectionState::Binding {
        core.state = ConnectionState::Ready;
    }
}
