//! Socket readiness probe
//!
//! The drivers drain a socket while the OS buffer has data; the selector is
//! the zero-timeout readiness check guarding that loop.

use crate::socket::Socket;

/// Readiness probe over one socket
pub struct Selector<'a> {
    socket: &'a Socket,
}

impl<'a> Selector<'a> {
    pub fn new(socket: &'a Socket) -> Self {
        Self { socket }
    }

    /// Whether a datagram is waiting to be read
    #[cfg(unix)]
    pub fn is_ready(&self) -> bool {
        use std::os::fd::AsRawFd;

        let mut fds = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut fds, 1, 0) };
        ready > 0 && fds.revents & libc::POLLIN != 0
    }

    /// Without a poll primitive the drain loop relies on the socket
    /// reporting `Discard` when empty.
    #[cfg(not(unix))]
    pub fn is_ready(&self) -> bool {
        let _ = &self.socket;
        true
    }
}
