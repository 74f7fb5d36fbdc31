//! Socket abstraction between the engine and the transports it relays over.
//!
//! The engine only ever talks to a [`SocketHandler`]; plain TCP is implemented
//! here on top of mio, a TLS transport can be slotted in by the runtime after
//! a StartTLS handshake, and tests use the scripted handler from
//! [`crate::mock`].

use std::{
    io::{ErrorKind, Read, Write},
    net::SocketAddr,
    os::fd::{AsRawFd, BorrowedFd},
    time::Duration,
};

use mio::net::TcpStream;
use socket2::{SockRef, TcpKeepalive};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketResult {
    Continue,
    Closed,
    WouldBlock,
    Error,
}

pub trait SocketHandler: Send {
    /// Read as much as fits in `buf`, reporting how the socket ended up.
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult);
    /// Write as much of `buf` as the socket accepts.
    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult);
    fn socket_close(&mut self);
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
    /// Whether a completed non-blocking connect actually failed.
    fn connect_error(&self) -> Option<std::io::Error> {
        None
    }
}

impl SocketHandler for TcpStream {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        let mut size = 0usize;
        loop {
            if size == buf.len() {
                return (size, SocketResult::Continue);
            }
            match self.read(&mut buf[size..]) {
                Ok(0) => return (size, SocketResult::Closed),
                Ok(n) => size += n,
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => return (size, SocketResult::WouldBlock),
                    ErrorKind::Interrupted => {}
                    ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::BrokenPipe => return (size, SocketResult::Closed),
                    _ => {
                        error!("socket_read error: {e:?}");
                        return (size, SocketResult::Error);
                    }
                },
            }
        }
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        let mut size = 0usize;
        loop {
            if size == buf.len() {
                return (size, SocketResult::Continue);
            }
            match self.write(&buf[size..]) {
                Ok(0) => return (size, SocketResult::Continue),
                Ok(n) => size += n,
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => return (size, SocketResult::WouldBlock),
                    ErrorKind::Interrupted => {}
                    ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::BrokenPipe => return (size, SocketResult::Closed),
                    _ => {
                        error!("socket_write error: {e:?}");
                        return (size, SocketResult::Error);
                    }
                },
            }
        }
    }

    fn socket_close(&mut self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn connect_error(&self) -> Option<std::io::Error> {
        connect_error(self)
    }
}

/// Open a non-blocking connect toward an upstream server and apply the
/// transport options every pooled connection gets: no Nagle delay, TCP
/// keepalive so a silent peer is eventually detected.
pub fn connect_upstream(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    configure_upstream(&stream)?;
    Ok(stream)
}

pub fn configure_upstream(stream: &TcpStream) -> std::io::Result<()> {
    // mio only hands out the raw fd; `stream` keeps it open for the whole
    // borrow, so scoping a BorrowedFd to this call is sound
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let sock = SockRef::from(&fd);
    sock.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Whether a completed non-blocking connect actually succeeded.
pub fn connect_error(stream: &TcpStream) -> Option<std::io::Error> {
    match stream.take_error() {
        Ok(Some(e)) => Some(e),
        Ok(None) => None,
        Err(e) => Some(e),
    }
}
