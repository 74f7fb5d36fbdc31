//! The subset of LDAP the proxy understands.
//!
//! The engine is a PDU relay: it parses the outer
//! `{messageID, protocolOp, controls}` envelope, the handful of operations it
//! must act on itself (bind, abandon, unbind, a few extended operations) and
//! the result code of responses. Everything else passes through untouched.

pub mod codec;
pub mod parser;

use std::fmt;

/// Application tags of the protocol ops we need to tell apart.
pub mod tag {
    pub const BIND_REQUEST: u8 = 0x60;
    pub const BIND_RESPONSE: u8 = 0x61;
    pub const UNBIND_REQUEST: u8 = 0x42;
    pub const SEARCH_REQUEST: u8 = 0x63;
    pub const SEARCH_RESULT_ENTRY: u8 = 0x64;
    pub const SEARCH_RESULT_DONE: u8 = 0x65;
    pub const SEARCH_RESULT_REFERENCE: u8 = 0x73;
    pub const MODIFY_REQUEST: u8 = 0x66;
    pub const MODIFY_RESPONSE: u8 = 0x67;
    pub const ADD_REQUEST: u8 = 0x68;
    pub const ADD_RESPONSE: u8 = 0x69;
    pub const DEL_REQUEST: u8 = 0x4a;
    pub const DEL_RESPONSE: u8 = 0x6b;
    pub const MODDN_REQUEST: u8 = 0x6c;
    pub const MODDN_RESPONSE: u8 = 0x6d;
    pub const COMPARE_REQUEST: u8 = 0x6e;
    pub const COMPARE_RESPONSE: u8 = 0x6f;
    pub const ABANDON_REQUEST: u8 = 0x50;
    pub const EXTENDED_REQUEST: u8 = 0x77;
    pub const EXTENDED_RESPONSE: u8 = 0x78;
    pub const INTERMEDIATE_RESPONSE: u8 = 0x79;
}

pub mod oid {
    pub const STARTTLS: &str = "1.3.6.1.4.1.1466.20037";
    pub const WHOAMI: &str = "1.3.6.1.4.1.4203.1.11.3";
    pub const VERIFY_CREDENTIALS: &str = "1.3.6.1.4.1.4203.666.6.5";
    pub const PROXY_AUTHZ: &str = "2.16.840.1.113730.3.4.18";
}

/// Diagnostic sent to clients whose upstream disappeared mid-operation.
pub const SEVERED_MSG: &str = "connection to the remote server has been severed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    AdminLimitExceeded = 11,
    SaslBindInProgress = 14,
    InvalidCredentials = 49,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    Other = 80,
}

impl ResultCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// The response tag a synthesized answer to `request_tag` must carry.
/// `None` for operations that have no response (abandon, unbind) or that we
/// do not know how to answer.
pub fn response_tag(request_tag: u8) -> Option<u8> {
    match request_tag {
        tag::BIND_REQUEST => Some(tag::BIND_RESPONSE),
        tag::SEARCH_REQUEST => Some(tag::SEARCH_RESULT_DONE),
        tag::MODIFY_REQUEST => Some(tag::MODIFY_RESPONSE),
        tag::ADD_REQUEST => Some(tag::ADD_RESPONSE),
        tag::DEL_REQUEST => Some(tag::DEL_RESPONSE),
        tag::MODDN_REQUEST => Some(tag::MODDN_RESPONSE),
        tag::COMPARE_REQUEST => Some(tag::COMPARE_RESPONSE),
        tag::EXTENDED_REQUEST => Some(tag::EXTENDED_RESPONSE),
        _ => None,
    }
}

/// Search entries, references and intermediate responses keep the operation
/// alive; anything else concludes it.
pub fn is_final_response(response_tag: u8) -> bool {
    !matches!(
        response_tag,
        tag::SEARCH_RESULT_ENTRY | tag::SEARCH_RESULT_REFERENCE | tag::INTERMEDIATE_RESPONSE
    )
}

pub fn is_request(tag: u8) -> bool {
    matches!(
        tag,
        tag::BIND_REQUEST
            | tag::UNBIND_REQUEST
            | tag::SEARCH_REQUEST
            | tag::MODIFY_REQUEST
            | tag::ADD_REQUEST
            | tag::DEL_REQUEST
            | tag::MODDN_REQUEST
            | tag::COMPARE_REQUEST
            | tag::ABANDON_REQUEST
            | tag::EXTENDED_REQUEST
    )
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed BER element: {0}")]
    Ber(&'static str),
    #[error("indefinite lengths are not supported")]
    IndefiniteLength,
    #[error("element length {0} exceeds the incoming buffer cap {1}")]
    Oversized(usize, usize),
    #[error("unexpected tag {tag:#04x}, expected {expected}")]
    UnexpectedTag { tag: u8, expected: &'static str },
    #[error("message id {0} out of range")]
    MsgIdRange(i64),
    #[error("invalid UTF-8 where a string was required")]
    InvalidString,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::AdminLimitExceeded => "adminLimitExceeded",
            ResultCode::SaslBindInProgress => "saslBindInProgress",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::Other => "other",
        };
        write!(f, "{name}({})", self.as_u32())
    }
}
