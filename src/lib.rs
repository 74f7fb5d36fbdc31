//! # ldaplb: an LDAP load-balancing proxy engine
//!
//! This crate is the connection and operation routing core of an LDAP
//! load balancer. It accepts LDAP clients, maintains pools of pre-bound
//! connections toward a set of backend directory servers, and relays PDUs
//! between the two sides with message-id substitution, so any client
//! operation can run on any pooled upstream connection.
//!
//! The engine deliberately does not own an event loop: the embedding runtime
//! accepts sockets, polls for readiness and calls into [`client::readable`],
//! [`upstream::readable`], [`connection::Connection::flush`] and
//! [`timer::TimerService::run_expired`]. Everything above that line — backend
//! selection, bind pinning, operation bookkeeping, timeouts, teardown — lives
//! here and is shared-state safe: connections are reachable from several
//! indexes at once and reclaimed through an epoch scheme
//! ([`epoch::Reclaimer`]) instead of locks held across I/O.
//!
//! The highlights:
//!
//! - two-level round-robin backend selection with a `busy`(51) vs
//!   `unavailable`(52) distinction ([`server::Server::select`]);
//! - multi-step SASL binds pinned to one upstream connection while the
//!   exchange runs ([`bind`]);
//! - optional translation of client binds into VerifyCredentials exops
//!   (`feature vc`), and proxy-authorization control injection
//!   (`feature proxyauthz`);
//! - epoch-based deferred reclamation so teardown never races a relay path.

#[macro_use]
extern crate log;

#[macro_use]
pub mod metrics;

pub mod backends;
pub mod bind;
pub mod client;
pub mod config;
pub mod connection;
pub mod epoch;
pub mod mock;
pub mod operation;
pub mod protocol;
pub mod ready;
pub mod retry;
pub mod server;
pub mod socket;
pub mod timer;
pub mod upstream;

pub use crate::protocol::ProtocolError;

/// Errors surfaced to the runtime's listener loop.
#[derive(thiserror::Error, Debug)]
pub enum AcceptError {
    #[error("no connection ready to accept")]
    WouldBlock,
    #[error("accept failed: {0}")]
    Io(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("connection#{0}'s socket is gone")]
    SocketGone(u64),
}

/// Why backend selection produced no connection.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// Connections exist but every one is at capacity; retrying soon may
    /// succeed. Maps to LDAP `busy(51)`.
    #[error("all backend connections are at capacity")]
    Busy,
    /// Nothing usable at all. Maps to LDAP `unavailable(52)`.
    #[error("no backend connection is available")]
    Unavailable,
}

#[derive(thiserror::Error, Debug)]
pub enum OperationError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("the connection is closing")]
    ConnectionClosing,
    #[error("too many pending operations")]
    TooManyPending,
    #[error("message id {0} is already in use")]
    DuplicateMsgId(i32),
    #[error("unsupported sasl mechanism {0}")]
    UnsupportedSaslMechanism(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}
