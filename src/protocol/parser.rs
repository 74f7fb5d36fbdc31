//! BER parsing: the streaming outer envelope plus the few inner payloads the
//! proxy acts on. The envelope parser is incremental so a connection's read
//! buffer can hold a partial PDU between event-loop wakeups.

use std::str::from_utf8;

use nom::{
    bytes::streaming::take,
    number::streaming::be_u8,
    Err as NomErr, IResult, Needed,
};

use super::ProtocolError;

pub const SEQUENCE: u8 = 0x30;
const INTEGER: u8 = 0x02;
const ENUMERATED: u8 = 0x0a;
const OCTET_STRING: u8 = 0x04;
const CONTROLS: u8 = 0xa0;

/// One parsed LDAP message, borrowing from the connection's read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub msgid: i32,
    /// Application tag of the protocol op.
    pub tag: u8,
    /// The protocolOp element, header included.
    pub op: &'a [u8],
    /// The `[0] Controls` element if present, header included, else empty.
    pub controls: &'a [u8],
    /// The whole message as received.
    pub raw: &'a [u8],
}

fn ber_length(i: &[u8]) -> IResult<&[u8], usize> {
    let (i, first) = be_u8(i)?;
    if first < 0x80 {
        return Ok((i, first as usize));
    }
    let count = (first & 0x7f) as usize;
    if count == 0 || count > 4 {
        // indefinite or absurdly wide lengths are both rejected
        return Err(NomErr::Failure(nom::error::Error::new(
            i,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    let (i, bytes) = take(count)(i)?;
    let mut length = 0usize;
    for b in bytes {
        length = (length << 8) | *b as usize;
    }
    Ok((i, length))
}

/// Parse a full TLV, returning `(rest, tag, value, element_with_header)`.
fn ber_element(i: &[u8]) -> IResult<&[u8], (u8, &[u8], &[u8])> {
    let start = i;
    let (i, tag) = be_u8(i)?;
    let (i, length) = ber_length(i)?;
    let (rest, value) = take(length)(i)?;
    let consumed = start.len() - rest.len();
    Ok((rest, (tag, value, &start[..consumed])))
}

fn ber_integer(value: &[u8]) -> Result<i64, ProtocolError> {
    if value.is_empty() || value.len() > 8 {
        return Err(ProtocolError::Ber("integer with invalid width"));
    }
    let mut acc = if value[0] & 0x80 != 0 { -1i64 } else { 0i64 };
    for b in value {
        acc = (acc << 8) | *b as i64;
    }
    Ok(acc)
}

/// Try to parse one message from the front of `input`.
///
/// Returns `Ok(None)` when the buffer holds only a partial PDU, the number of
/// consumed bytes alongside the envelope otherwise. `max_incoming` caps the
/// advertised element length; a peer announcing more than that is treated as
/// a protocol violation rather than an invitation to buffer forever.
pub fn parse_envelope(
    input: &[u8],
    max_incoming: usize,
) -> Result<Option<(Envelope, usize)>, ProtocolError> {
    if input.is_empty() {
        return Ok(None);
    }

    let (rest, (tag, value, raw)) = match ber_element(input) {
        Ok(parsed) => parsed,
        Err(NomErr::Incomplete(needed)) => {
            if let Needed::Size(n) = needed {
                let announced = input.len() + n.get();
                if announced > max_incoming {
                    return Err(ProtocolError::Oversized(announced, max_incoming));
                }
            }
            return Ok(None);
        }
        Err(_) => return Err(ProtocolError::Ber("invalid message header")),
    };
    if tag != SEQUENCE {
        return Err(ProtocolError::UnexpectedTag {
            tag,
            expected: "LDAPMessage SEQUENCE",
        });
    }
    if raw.len() > max_incoming {
        return Err(ProtocolError::Oversized(raw.len(), max_incoming));
    }
    let consumed = input.len() - rest.len();

    let (after_msgid, (msgid_tag, msgid_value, _)) =
        ber_element(value).map_err(|_| ProtocolError::Ber("truncated messageID"))?;
    if msgid_tag != INTEGER {
        return Err(ProtocolError::UnexpectedTag {
            tag: msgid_tag,
            expected: "messageID INTEGER",
        });
    }
    let msgid = ber_integer(msgid_value)?;
    if !(0..=i32::MAX as i64).contains(&msgid) {
        return Err(ProtocolError::MsgIdRange(msgid));
    }

    let (after_op, (op_tag, _, op)) =
        ber_element(after_msgid).map_err(|_| ProtocolError::Ber("truncated protocolOp"))?;

    let controls = if after_op.is_empty() {
        &[][..]
    } else {
        let (_, (ctl_tag, _, ctl)) =
            ber_element(after_op).map_err(|_| ProtocolError::Ber("truncated controls"))?;
        if ctl_tag != CONTROLS {
            return Err(ProtocolError::UnexpectedTag {
                tag: ctl_tag,
                expected: "controls [0]",
            });
        }
        ctl
    };

    Ok(Some((
        Envelope {
            msgid: msgid as i32,
            tag: op_tag,
            op,
            controls,
            raw,
        },
        consumed,
    )))
}

/// Walks the fields of an already-delimited constructed value.
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(value: &'a [u8]) -> Self {
        Fields { rest: value }
    }

    fn next(&mut self) -> Result<(u8, &'a [u8]), ProtocolError> {
        let (rest, (tag, value, _)) =
            ber_element(self.rest).map_err(|_| ProtocolError::Ber("truncated field"))?;
        self.rest = rest;
        Ok((tag, value))
    }

    fn peek_tag(&self) -> Option<u8> {
        self.rest.first().copied()
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuth<'a> {
    Simple(&'a [u8]),
    Sasl {
        mechanism: &'a str,
        credentials: Option<&'a [u8]>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest<'a> {
    pub version: i64,
    pub dn: &'a str,
    pub auth: BindAuth<'a>,
}

/// `op` is the full BindRequest element (tag 0x60).
pub fn parse_bind_request(op: &[u8]) -> Result<BindRequest, ProtocolError> {
    let (_, (tag, value, _)) =
        ber_element(op).map_err(|_| ProtocolError::Ber("truncated bind request"))?;
    if tag != super::tag::BIND_REQUEST {
        return Err(ProtocolError::UnexpectedTag {
            tag,
            expected: "BindRequest",
        });
    }

    let mut fields = Fields::new(value);
    let (vtag, vval) = fields.next()?;
    if vtag != INTEGER {
        return Err(ProtocolError::Ber("bind version is not an INTEGER"));
    }
    let version = ber_integer(vval)?;

    let (ntag, nval) = fields.next()?;
    if ntag != OCTET_STRING {
        return Err(ProtocolError::Ber("bind name is not an OCTET STRING"));
    }
    let dn = from_utf8(nval).map_err(|_| ProtocolError::InvalidString)?;

    let (atag, aval) = fields.next()?;
    let auth = match atag {
        // [0] simple
        0x80 => BindAuth::Simple(aval),
        // [3] SaslCredentials ::= SEQUENCE { mechanism, credentials OPTIONAL }
        0xa3 => {
            let mut sasl = Fields::new(aval);
            let (mtag, mval) = sasl.next()?;
            if mtag != OCTET_STRING {
                return Err(ProtocolError::Ber("sasl mechanism is not an OCTET STRING"));
            }
            let mechanism = from_utf8(mval).map_err(|_| ProtocolError::InvalidString)?;
            let credentials = if sasl.is_empty() {
                None
            } else {
                let (ctag, cval) = sasl.next()?;
                if ctag != OCTET_STRING {
                    return Err(ProtocolError::Ber("sasl credentials are not an OCTET STRING"));
                }
                Some(cval)
            };
            BindAuth::Sasl {
                mechanism,
                credentials,
            }
        }
        tag => {
            return Err(ProtocolError::UnexpectedTag {
                tag,
                expected: "AuthenticationChoice",
            })
        }
    };

    Ok(BindRequest { version, dn, auth })
}

/// The raw AuthenticationChoice element of a BindRequest, header included;
/// re-emitted verbatim inside a VerifyCredentials request.
pub fn bind_auth_choice(op: &[u8]) -> Result<&[u8], ProtocolError> {
    let (_, (tag, value, _)) =
        ber_element(op).map_err(|_| ProtocolError::Ber("truncated bind request"))?;
    if tag != super::tag::BIND_REQUEST {
        return Err(ProtocolError::UnexpectedTag {
            tag,
            expected: "BindRequest",
        });
    }
    let (rest, _) = ber_element(value).map_err(|_| ProtocolError::Ber("truncated field"))?;
    let (rest, _) = ber_element(rest).map_err(|_| ProtocolError::Ber("truncated field"))?;
    let (_, (_, _, raw)) =
        ber_element(rest).map_err(|_| ProtocolError::Ber("truncated field"))?;
    Ok(raw)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult<'a> {
    pub code: u32,
    pub matched_dn: &'a [u8],
    pub diagnostic: &'a [u8],
    /// serverSaslCreds ([7]) on bind responses, responseValue ([11]) on
    /// extended responses; whatever trailing context element was found.
    pub extra: Option<(u8, &'a [u8])>,
}

/// Parse the LDAPResult prefix shared by every response op. `op` is the full
/// response element.
pub fn parse_result(op: &[u8]) -> Result<LdapResult, ProtocolError> {
    let (_, (_, value, _)) =
        ber_element(op).map_err(|_| ProtocolError::Ber("truncated response"))?;
    let mut fields = Fields::new(value);

    let (ctag, cval) = fields.next()?;
    if ctag != ENUMERATED {
        return Err(ProtocolError::Ber("resultCode is not an ENUMERATED"));
    }
    let code = ber_integer(cval)?;
    if !(0..=u32::MAX as i64).contains(&code) {
        return Err(ProtocolError::Ber("resultCode out of range"));
    }

    let (mtag, matched_dn) = fields.next()?;
    if mtag != OCTET_STRING {
        return Err(ProtocolError::Ber("matchedDN is not an OCTET STRING"));
    }
    let (dtag, diagnostic) = fields.next()?;
    if dtag != OCTET_STRING {
        return Err(ProtocolError::Ber("diagnosticMessage is not an OCTET STRING"));
    }

    let mut extra = None;
    while !fields.is_empty() {
        // referral ([3]) is skipped, the last context element wins
        let (tag, value) = fields.next()?;
        if tag != 0xa3 {
            extra = Some((tag, value));
        }
    }

    Ok(LdapResult {
        code: code as u32,
        matched_dn,
        diagnostic,
        extra,
    })
}

/// AbandonRequest is primitive: the element value *is* the message id.
pub fn parse_abandon(op: &[u8]) -> Result<i32, ProtocolError> {
    let (_, (tag, value, _)) =
        ber_element(op).map_err(|_| ProtocolError::Ber("truncated abandon"))?;
    if tag != super::tag::ABANDON_REQUEST {
        return Err(ProtocolError::UnexpectedTag {
            tag,
            expected: "AbandonRequest",
        });
    }
    let msgid = ber_integer(value)?;
    if !(0..=i32::MAX as i64).contains(&msgid) {
        return Err(ProtocolError::MsgIdRange(msgid));
    }
    Ok(msgid as i32)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest<'a> {
    pub oid: &'a str,
    pub value: Option<&'a [u8]>,
}

/// `op` is the full ExtendedRequest element (tag 0x77).
pub fn parse_extended_request(op: &[u8]) -> Result<ExtendedRequest, ProtocolError> {
    let (_, (tag, value, _)) =
        ber_element(op).map_err(|_| ProtocolError::Ber("truncated extended request"))?;
    if tag != super::tag::EXTENDED_REQUEST {
        return Err(ProtocolError::UnexpectedTag {
            tag,
            expected: "ExtendedRequest",
        });
    }
    let mut fields = Fields::new(value);
    let (otag, oval) = fields.next()?;
    if otag != 0x80 {
        return Err(ProtocolError::Ber("requestName is not [0]"));
    }
    let oid = from_utf8(oval).map_err(|_| ProtocolError::InvalidString)?;
    let value = if fields.peek_tag() == Some(0x81) {
        let (_, vval) = fields.next()?;
        Some(vval)
    } else {
        None
    };
    Ok(ExtendedRequest { oid, value })
}

#[cfg(test)]
mod tests {
    use super::super::{codec, tag, ResultCode};
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let pdu = codec::bind_request_simple(7, "cn=admin,dc=example,dc=com", b"secret");
        let (env, consumed) = parse_envelope(&pdu, 1 << 20)
            .expect("parse")
            .expect("complete");
        assert_eq!(consumed, pdu.len());
        assert_eq!(env.msgid, 7);
        assert_eq!(env.tag, tag::BIND_REQUEST);
        assert!(env.controls.is_empty());

        let bind = parse_bind_request(env.op).expect("bind");
        assert_eq!(bind.version, 3);
        assert_eq!(bind.dn, "cn=admin,dc=example,dc=com");
        assert_eq!(bind.auth, BindAuth::Simple(b"secret"));
    }

    #[test]
    fn partial_input_is_incomplete_not_an_error() {
        let pdu = codec::bind_request_simple(1, "cn=a", b"x");
        for cut in 1..pdu.len() {
            assert_eq!(parse_envelope(&pdu[..cut], 1 << 20).expect("no error"), None);
        }
    }

    #[test]
    fn two_pdus_in_one_buffer() {
        let mut buf = codec::unbind_request(3);
        let second = codec::abandon_request(4, 2);
        buf.extend_from_slice(&second);

        let (env, consumed) = parse_envelope(&buf, 1 << 20).unwrap().unwrap();
        assert_eq!(env.tag, tag::UNBIND_REQUEST);
        let (env2, consumed2) = parse_envelope(&buf[consumed..], 1 << 20).unwrap().unwrap();
        assert_eq!(env2.tag, tag::ABANDON_REQUEST);
        assert_eq!(consumed + consumed2, buf.len());
        assert_eq!(parse_abandon(env2.op).unwrap(), 2);
    }

    #[test]
    fn non_sequence_outer_tag_is_fatal() {
        let junk = [0x04, 0x02, 0x00, 0x00];
        assert!(matches!(
            parse_envelope(&junk, 1 << 20),
            Err(ProtocolError::UnexpectedTag { .. })
        ));
    }

    #[test]
    fn oversized_announcement_is_fatal() {
        // SEQUENCE announcing 0x0100_0000 bytes against a 1 MiB cap
        let huge = [0x30, 0x84, 0x01, 0x00, 0x00, 0x00];
        assert!(matches!(
            parse_envelope(&huge, 1 << 20),
            Err(ProtocolError::Oversized(..))
        ));
    }

    #[test]
    fn sasl_bind_request_fields() {
        let pdu = codec::bind_request_sasl(9, "", "SCRAM-SHA-256", Some(b"n,,n=user"));
        let (env, _) = parse_envelope(&pdu, 1 << 20).unwrap().unwrap();
        let bind = parse_bind_request(env.op).unwrap();
        match bind.auth {
            BindAuth::Sasl {
                mechanism,
                credentials,
            } => {
                assert_eq!(mechanism, "SCRAM-SHA-256");
                assert_eq!(credentials, Some(&b"n,,n=user"[..]));
            }
            other => panic!("unexpected auth {other:?}"),
        }
    }

    #[test]
    fn result_with_sasl_creds() {
        let pdu = codec::bind_response(
            2,
            ResultCode::SaslBindInProgress,
            "",
            Some(b"challenge"),
        );
        let (env, _) = parse_envelope(&pdu, 1 << 20).unwrap().unwrap();
        let result = parse_result(env.op).unwrap();
        assert_eq!(result.code, ResultCode::SaslBindInProgress.as_u32());
        assert_eq!(result.extra, Some((0x87, &b"challenge"[..])));
    }

    #[test]
    fn extended_request_oid() {
        let pdu = codec::extended_request(5, super::super::oid::WHOAMI, None);
        let (env, _) = parse_envelope(&pdu, 1 << 20).unwrap().unwrap();
        let exop = parse_extended_request(env.op).unwrap();
        assert_eq!(exop.oid, super::super::oid::WHOAMI);
        assert_eq!(exop.value, None);
    }
}
