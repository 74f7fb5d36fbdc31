//! Scripted socket for tests: feed it PDUs, inspect what the engine wrote.
//!
//! Cloning a `MockSocket` shares its state, so a test can keep a handle to a
//! socket it boxed into a connection and script both directions from outside.

use std::{
    collections::VecDeque,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::socket::{SocketHandler, SocketResult};

#[derive(Default)]
struct MockState {
    input: VecDeque<u8>,
    output: Vec<u8>,
    write_limit: Option<usize>,
    /// Reads past the scripted input report `Closed` instead of `WouldBlock`.
    input_closed: bool,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct MockSocket {
    state: Arc<Mutex<MockState>>,
}

impl MockSocket {
    pub fn new() -> MockSocket {
        MockSocket::default()
    }

    /// A socket that accepts at most `limit` bytes per write call, to
    /// exercise the short-write buffering path.
    pub fn with_write_limit(limit: usize) -> MockSocket {
        let socket = MockSocket::new();
        socket.state.lock().write_limit = Some(limit);
        socket
    }

    /// Queue bytes the engine will read next.
    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().input.extend(bytes.iter().copied());
    }

    /// The peer hangs up once the queued input is consumed.
    pub fn close_input(&self) {
        self.state.lock().input_closed = true;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().output.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().output)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl SocketHandler for MockSocket {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        let mut state = self.state.lock();
        let mut size = 0;
        while size < buf.len() {
            match state.input.pop_front() {
                Some(byte) => {
                    buf[size] = byte;
                    size += 1;
                }
                None => {
                    let result = if state.input_closed {
                        SocketResult::Closed
                    } else {
                        SocketResult::WouldBlock
                    };
                    return (size, result);
                }
            }
        }
        (size, SocketResult::Continue)
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        let mut state = self.state.lock();
        if state.closed {
            return (0, SocketResult::Closed);
        }
        let size = match state.write_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        state.output.extend_from_slice(&buf[..size]);
        if size < buf.len() {
            (size, SocketResult::WouldBlock)
        } else {
            (size, SocketResult::Continue)
        }
    }

    fn socket_close(&mut self) {
        self.state.lock().closed = true;
    }
}
