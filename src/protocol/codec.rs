//! BER emission: message re-framing on the relay path and synthesis of the
//! responses and requests the proxy issues on its own behalf.

use super::{parser::Envelope, tag, ResultCode};

const SEQUENCE: u8 = 0x30;
const INTEGER: u8 = 0x02;
const ENUMERATED: u8 = 0x0a;
const OCTET_STRING: u8 = 0x04;
const BOOLEAN: u8 = 0x01;
const CONTROLS: u8 = 0xa0;

/// Small BER writer. Children are rendered into their own buffer so the
/// definite length can be emitted before the content; the PDUs built here are
/// control-plane sized, the extra allocation does not matter.
struct Ber {
    buf: Vec<u8>,
}

impl Ber {
    fn new() -> Ber {
        Ber { buf: Vec::new() }
    }

    fn element(&mut self, tag: u8, content: impl FnOnce(&mut Ber)) {
        let mut child = Ber::new();
        content(&mut child);
        self.header(tag, child.buf.len());
        self.buf.extend_from_slice(&child.buf);
    }

    fn header(&mut self, tag: u8, length: usize) {
        self.buf.push(tag);
        if length < 0x80 {
            self.buf.push(length as u8);
        } else {
            let bytes = length.to_be_bytes();
            let skip = bytes.iter().take_while(|&&b| b == 0).count();
            self.buf.push(0x80 | (bytes.len() - skip) as u8);
            self.buf.extend_from_slice(&bytes[skip..]);
        }
    }

    fn primitive(&mut self, tag: u8, value: &[u8]) {
        self.header(tag, value.len());
        self.buf.extend_from_slice(value);
    }

    fn integer(&mut self, tag: u8, value: i64) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 7
            && ((bytes[start] == 0 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0))
        {
            start += 1;
        }
        self.primitive(tag, &bytes[start..]);
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

fn message(msgid: i32, body: impl FnOnce(&mut Ber)) -> Vec<u8> {
    let mut ber = Ber::new();
    ber.element(SEQUENCE, |m| {
        m.integer(INTEGER, msgid as i64);
        body(m);
    });
    ber.buf
}

/// Re-emit a parsed message under a new message id, optionally appending one
/// extra control element (proxy authorization). The protocol op passes
/// through byte for byte.
pub fn reframe(envelope: &Envelope, msgid: i32, extra_control: Option<&[u8]>) -> Vec<u8> {
    message(msgid, |m| {
        m.raw(envelope.op);
        match (envelope.controls.is_empty(), extra_control) {
            (true, None) => {}
            (true, Some(control)) => m.element(CONTROLS, |c| c.raw(control)),
            (false, None) => m.raw(envelope.controls),
            (false, Some(control)) => {
                // rebuild the controls element with ours at the end
                m.element(CONTROLS, |c| {
                    c.raw(control_contents(envelope.controls));
                    c.raw(control);
                });
            }
        }
    })
}

/// Strip the header of a `[0] Controls` element, keeping the control list.
fn control_contents(controls: &[u8]) -> &[u8] {
    debug_assert!(!controls.is_empty());
    let mut offset = 1;
    let first = controls[offset];
    offset += 1;
    if first >= 0x80 {
        offset += (first & 0x7f) as usize;
    }
    &controls[offset..]
}

fn ldap_result(m: &mut Ber, code: ResultCode, matched_dn: &str, diagnostic: &str) {
    m.integer(ENUMERATED, code.as_u32() as i64);
    m.primitive(OCTET_STRING, matched_dn.as_bytes());
    m.primitive(OCTET_STRING, diagnostic.as_bytes());
}

/// A synthesized response of arbitrary kind, used for busy/unavailable/
/// timeout answers the proxy produces without consulting any upstream.
pub fn result_message(
    msgid: i32,
    response_tag: u8,
    code: ResultCode,
    diagnostic: &str,
) -> Vec<u8> {
    message(msgid, |m| {
        m.element(response_tag, |r| ldap_result(r, code, "", diagnostic))
    })
}

pub fn bind_response(
    msgid: i32,
    code: ResultCode,
    diagnostic: &str,
    server_sasl_creds: Option<&[u8]>,
) -> Vec<u8> {
    message(msgid, |m| {
        m.element(tag::BIND_RESPONSE, |r| {
            ldap_result(r, code, "", diagnostic);
            if let Some(creds) = server_sasl_creds {
                r.primitive(0x87, creds);
            }
        })
    })
}

pub fn bind_request_simple(msgid: i32, dn: &str, password: &[u8]) -> Vec<u8> {
    message(msgid, |m| {
        m.element(tag::BIND_REQUEST, |b| {
            b.integer(INTEGER, 3);
            b.primitive(OCTET_STRING, dn.as_bytes());
            b.primitive(0x80, password);
        })
    })
}

pub fn bind_request_sasl(
    msgid: i32,
    dn: &str,
    mechanism: &str,
    credentials: Option<&[u8]>,
) -> Vec<u8> {
    message(msgid, |m| {
        m.element(tag::BIND_REQUEST, |b| {
            b.integer(INTEGER, 3);
            b.primitive(OCTET_STRING, dn.as_bytes());
            b.element(0xa3, |s| {
                s.primitive(OCTET_STRING, mechanism.as_bytes());
                if let Some(creds) = credentials {
                    s.primitive(OCTET_STRING, creds);
                }
            });
        })
    })
}

pub fn unbind_request(msgid: i32) -> Vec<u8> {
    message(msgid, |m| m.primitive(tag::UNBIND_REQUEST, &[]))
}

pub fn abandon_request(msgid: i32, target: i32) -> Vec<u8> {
    message(msgid, |m| {
        let mut ber = Ber::new();
        ber.integer(tag::ABANDON_REQUEST, target as i64);
        m.raw(&ber.buf);
    })
}

pub fn extended_request(msgid: i32, oid: &str, value: Option<&[u8]>) -> Vec<u8> {
    message(msgid, |m| {
        m.element(tag::EXTENDED_REQUEST, |e| {
            e.primitive(0x80, oid.as_bytes());
            if let Some(value) = value {
                e.primitive(0x81, value);
            }
        })
    })
}

pub fn extended_response(
    msgid: i32,
    code: ResultCode,
    diagnostic: &str,
    value: Option<&[u8]>,
) -> Vec<u8> {
    message(msgid, |m| {
        m.element(tag::EXTENDED_RESPONSE, |e| {
            ldap_result(e, code, "", diagnostic);
            if let Some(value) = value {
                e.primitive(0x8b, value);
            }
        })
    })
}

/// Wrap a client bind into a VerifyCredentials request: the exop value
/// carries the bind's name and AuthenticationChoice so the upstream can
/// validate them without changing the connection's identity.
pub fn verify_credentials_request(msgid: i32, dn: &str, auth_choice: &[u8]) -> Vec<u8> {
    let mut value = Ber::new();
    value.element(SEQUENCE, |v| {
        v.primitive(OCTET_STRING, dn.as_bytes());
        v.raw(auth_choice);
    });
    extended_request(msgid, super::oid::VERIFY_CREDENTIALS, Some(&value.buf))
}

/// The proxy authorization control, critical, carrying `dn:<authzid>`.
pub fn proxy_authz_control(authzid: &str) -> Vec<u8> {
    let mut ber = Ber::new();
    ber.element(SEQUENCE, |c| {
        c.primitive(OCTET_STRING, super::oid::PROXY_AUTHZ.as_bytes());
        c.primitive(BOOLEAN, &[0xff]);
        c.primitive(OCTET_STRING, format!("dn:{authzid}").as_bytes());
    });
    ber.buf
}

/// Minimal baseObject search, enough for tests and health probes.
pub fn search_request(msgid: i32, base: &str) -> Vec<u8> {
    message(msgid, |m| {
        m.element(tag::SEARCH_REQUEST, |s| {
            s.primitive(OCTET_STRING, base.as_bytes());
            s.integer(ENUMERATED, 0); // baseObject
            s.integer(ENUMERATED, 3); // derefAlways
            s.integer(INTEGER, 0); // sizeLimit
            s.integer(INTEGER, 0); // timeLimit
            s.primitive(BOOLEAN, &[0x00]); // typesOnly
            s.primitive(0x87, b"objectClass"); // present filter
            s.element(SEQUENCE, |_| {}); // attributes
        })
    })
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_envelope;
    use super::*;

    const CAP: usize = 1 << 20;

    #[test]
    fn reframe_substitutes_msgid_only() {
        let original = search_request(41, "dc=example,dc=com");
        let (env, _) = parse_envelope(&original, CAP).unwrap().unwrap();
        let reframed = reframe(&env, 7, None);

        let (env2, _) = parse_envelope(&reframed, CAP).unwrap().unwrap();
        assert_eq!(env2.msgid, 7);
        assert_eq!(env2.op, env.op);
        assert_eq!(env2.controls, env.controls);
    }

    #[test]
    fn reframe_appends_control() {
        let original = search_request(5, "");
        let (env, _) = parse_envelope(&original, CAP).unwrap().unwrap();
        let control = proxy_authz_control("cn=a,dc=example,dc=com");
        let reframed = reframe(&env, 5, Some(&control));

        let (env2, _) = parse_envelope(&reframed, CAP).unwrap().unwrap();
        assert!(!env2.controls.is_empty());
        let haystack = env2.controls;
        let needle = super::super::oid::PROXY_AUTHZ.as_bytes();
        assert!(haystack
            .windows(needle.len())
            .any(|window| window == needle));
    }

    #[test]
    fn long_form_lengths() {
        let big_dn = "x".repeat(300);
        let pdu = bind_request_simple(1, &big_dn, b"pw");
        let (env, consumed) = parse_envelope(&pdu, CAP).unwrap().unwrap();
        assert_eq!(consumed, pdu.len());
        let bind = super::super::parser::parse_bind_request(env.op).unwrap();
        assert_eq!(bind.dn, big_dn);
    }

    #[test]
    fn synthesized_result_parses_back() {
        let pdu = result_message(9, tag::SEARCH_RESULT_DONE, ResultCode::Busy, "busy");
        let (env, _) = parse_envelope(&pdu, CAP).unwrap().unwrap();
        assert_eq!(env.tag, tag::SEARCH_RESULT_DONE);
        let result = super::super::parser::parse_result(env.op).unwrap();
        assert_eq!(result.code, ResultCode::Busy.as_u32());
        assert_eq!(result.diagnostic, b"busy");
    }
}
