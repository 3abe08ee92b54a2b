//! Mock communication sink for testing
//!
//! Captures every datagram a connection hands to the transport so tests
//! can inspect, reorder, duplicate, or tamper with them before feeding
//! them to the other side. Can also be switched to reject sends to
//! exercise failure paths.

use std::cell::{Cell, RefCell};

use crate::connection::Communication;
use crate::endpoint::Endpoint;

/// Capturing [`Communication`] implementation
#[derive(Debug)]
pub struct MockCommunication {
    sent: RefCell<Vec<(Endpoint, Vec<u8>)>>,
    accept: Cell<bool>,
}

impl Default for MockCommunication {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCommunication {
    /// Create a sink that accepts and records every send
    pub fn new() -> Self {
        Self {
            sent: RefCell::new(Vec::new()),
            accept: Cell::new(true),
        }
    }

    /// Toggle whether sends succeed
    pub fn set_accept(&self, accept: bool) {
        self.accept.set(accept);
    }

    /// Number of captured datagrams
    pub fn sent_count(&self) -> usize {
        self.sent.borrow().len()
    }

    /// Drain and return every captured `(destination, datagram)` pair
    pub fn take_sent(&self) -> Vec<(Endpoint, Vec<u8>)> {
        self.sent.borrow_mut().drain(..).collect()
    }

    /// The most recent captured datagram, without draining
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.sent.borrow().last().map(|(_, payload)| payload.clone())
    }
}

impl Communication for MockCommunication {
    fn send(&self, remote: &Endpoint, payload: &[u8]) -> bool {
        if !self.accept.get() {
            return false;
        }
        self.sent.borrow_mut().push((*remote, payload.to_vec()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_drain() {
        let mock = MockCommunication::new();
        let remote: Endpoint = "127.0.0.1:1000".parse().unwrap();

        assert!(mock.send(&remote, b"one"));
        assert!(mock.send(&remote, b"two"));
        assert_eq!(mock.sent_count(), 2);
        assert_eq!(mock.last_sent().unwrap(), b"two");

        let sent = mock.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, b"one");
        assert_eq!(mock.sent_count(), 0);
    }

    #[test]
    fn test_rejecting_sink() {
        let mock = MockCommunication::new();
        mock.set_accept(false);
        let remote: Endpoint = "127.0.0.1:1000".parse().unwrap();
        assert!(!mock.send(&remote, b"dropped"));
        assert_eq!(mock.sent_count(), 0);
    }
}
