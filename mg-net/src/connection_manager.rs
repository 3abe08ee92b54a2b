//! Connection table
//!
//! Fixed-capacity map from remote endpoint to connection. The server
//! routes datagrams through it and ticks it once per update; connections
//! that reach the closed state are evicted with a disconnect callback.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::debug;

use crate::connection::{Communication, Connection, ConnectionState};
use crate::endpoint::Endpoint;
use crate::{Error, Result};

/// Fixed-capacity store of live connections keyed by remote endpoint
pub struct ConnectionManager {
    capacity: usize,
    connections: HashMap<Endpoint, Connection>,
}

impl ConnectionManager {
    /// Create a manager admitting at most `capacity` peers
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            connections: HashMap::with_capacity(capacity),
        }
    }

    /// Look up the connection owning `remote`
    pub fn find_mut(&mut self, remote: &Endpoint) -> Option<&mut Connection> {
        self.connections.get_mut(remote)
    }

    /// Whether `remote` has a connection
    pub fn contains(&self, remote: &Endpoint) -> bool {
        self.connections.contains_key(remote)
    }

    /// Admit a connection keyed by its remote endpoint.
    ///
    /// Fails when the table is full or the endpoint is already present;
    /// neither case mutates the table.
    pub fn add(&mut self, connection: Connection) -> Result<&mut Connection> {
        if self.connections.len() >= self.capacity {
            return Err(Error::AtCapacity);
        }
        match self.connections.entry(connection.remote()) {
            Entry::Occupied(_) => Err(Error::DuplicateEndpoint),
            Entry::Vacant(entry) => Ok(entry.insert(connection)),
        }
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Advance every connection and evict the ones that died, invoking
    /// `on_disconnect` exactly once per eviction. Visitation order within
    /// a tick is unspecified.
    pub fn update(
        &mut self,
        elapsed_ms: u64,
        comm: &dyn Communication,
        mut on_disconnect: impl FnMut(&Endpoint),
    ) {
        for connection in self.connections.values_mut() {
            connection.update(elapsed_ms, comm);
        }

        self.connections.retain(|endpoint, connection| {
            if connection.state() == ConnectionState::Closed {
                debug!(remote = %endpoint, "evicting connection");
                on_disconnect(endpoint);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DEFAULT_IDLE_TIMEOUT_MS;
    use crate::mock::MockCommunication;

    fn endpoint(port: u16) -> Endpoint {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn connection(port: u16) -> Connection {
        Connection::new_server(endpoint(port), DEFAULT_IDLE_TIMEOUT_MS)
    }

    #[test]
    fn test_admission_cap() {
        let mut manager = ConnectionManager::new(2);
        manager.add(connection(1)).unwrap();
        manager.add(connection(2)).unwrap();
        assert!(manager.is_full());

        // the third attempt fails without mutating the table
        assert!(matches!(manager.add(connection(3)), Err(Error::AtCapacity)));
        assert_eq!(manager.len(), 2);
        assert!(manager.find_mut(&endpoint(3)).is_none());
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let mut manager = ConnectionManager::new(4);
        manager.add(connection(1)).unwrap();
        assert!(matches!(
            manager.add(connection(1)),
            Err(Error::DuplicateEndpoint)
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_find() {
        let mut manager = ConnectionManager::new(4);
        manager.add(connection(7)).unwrap();
        assert!(manager.find_mut(&endpoint(7)).is_some());
        assert!(manager.find_mut(&endpoint(8)).is_none());
    }

    #[test]
    fn test_idle_eviction_fires_callback_once() {
        let comm = MockCommunication::new();
        let mut manager = ConnectionManager::new(4);
        manager.add(connection(1)).unwrap();
        manager.add(connection(2)).unwrap();

        let mut evicted = Vec::new();
        // sixteen seconds of silence kills both connections
        for _ in 0..16 {
            manager.update(1000, &comm, |remote| evicted.push(*remote));
        }
        assert_eq!(manager.len(), 0);
        assert_eq!(evicted.len(), 2);
        assert!(evicted.contains(&endpoint(1)));
        assert!(evicted.contains(&endpoint(2)));

        // no further callbacks after eviction
        manager.update(1000, &comm, |_| panic!("unexpected eviction"));
    }

    #[test]
    fn test_readmission_after_eviction() {
        let comm = MockCommunication::new();
        let mut manager = ConnectionManager::new(1);
        manager.add(connection(1)).unwrap();

        for _ in 0..16 {
            manager.update(1000, &comm, |_| {});
        }
        assert!(manager.is_empty());

        // the slot is free again
        manager.add(connection(2)).unwrap();
        assert_eq!(manager.len(), 1);
    }
}
