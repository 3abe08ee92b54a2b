//! Server driver
//!
//! Owns one listener per address family and the connection table. The
//! embedding application ticks [`Server::update`]; each tick drains both
//! sockets, routes datagrams to their connections, and advances every
//! connection's state machine. New peers are admitted while the table has
//! room; at capacity their datagrams are dropped silently and they retry
//! on their next negotiation tick.

use tracing::{debug, trace, warn};

use mg_protocol::{Message, PacketKind};

use crate::config::Config;
use crate::connection::{Communication, Connection};
use crate::connection_manager::ConnectionManager;
use crate::endpoint::{Endpoint, Family};
use crate::selector::Selector;
use crate::socket::{Packet, Socket};
use crate::{Error, Result};

/// Callbacks the embedding application implements
pub trait ServerEvents {
    /// A peer completed the handshake
    fn on_client_connected(&mut self, remote: &Endpoint);

    /// A peer was evicted (disconnect, handshake failure, or idle timeout)
    fn on_client_disconnected(&mut self, remote: &Endpoint);

    /// A complete message arrived from a connected peer
    fn on_message_received(&mut self, remote: &Endpoint, message: Message);
}

/// Both listeners, routing outgoing datagrams by address family
struct SocketPair {
    v4: Socket,
    v6: Option<Socket>,
}

impl Communication for SocketPair {
    fn send(&self, remote: &Endpoint, payload: &[u8]) -> bool {
        match remote.family() {
            Family::V4 => self.v4.send(remote, payload),
            Family::V6 => self
                .v6
                .as_ref()
                .map(|socket| socket.send(remote, payload))
                .unwrap_or(false),
        }
    }
}

/// Accepts and serves many peers over dual-stack UDP
pub struct Server {
    config: Config,
    sockets: Option<SocketPair>,
    connections: ConnectionManager,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let connections = ConnectionManager::new(config.max_connections);
        Self {
            config,
            sockets: None,
            connections,
        }
    }

    /// Bind the IPv4 listener on `port` (0 lets the OS pick) and the IPv6
    /// listener on the resolved port, so both families share one port
    /// number. A host without IPv6 degrades to IPv4-only.
    pub fn start(&mut self, port: u16) -> Result<()> {
        if self.sockets.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let v4 = Socket::bind(Family::V4, port)?;
        let v6 = if self.config.bind_ipv6 {
            match Socket::bind(Family::V6, v4.port()) {
                Ok(socket) => Some(socket),
                Err(error) => {
                    warn!(%error, "IPv6 listener unavailable, continuing IPv4-only");
                    None
                }
            }
        } else {
            None
        };

        debug!(port = v4.port(), "server started");
        self.sockets = Some(SocketPair { v4, v6 });
        Ok(())
    }

    /// Port the listeners are bound to, 0 before `start`
    pub fn port(&self) -> u16 {
        self.sockets.as_ref().map(|pair| pair.v4.port()).unwrap_or(0)
    }

    /// Live connections, in any state
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drain both sockets, advance every connection, and fire callbacks.
    ///
    /// Returns the number of successfully processed datagrams; dropped
    /// ones (bad header, unknown dead peer, table full) do not count.
    pub fn update(&mut self, elapsed_ms: u64, events: &mut dyn ServerEvents) -> u32 {
        let Some(sockets) = self.sockets.as_ref() else {
            return 0;
        };

        let mut processed = 0;
        let listeners = [Some(&sockets.v4), sockets.v6.as_ref()];
        for socket in listeners.into_iter().flatten() {
            let selector = Selector::new(socket);
            while selector.is_ready() {
                match socket.receive() {
                    Ok(packet) => {
                        let routed = Self::route_packet(
                            &mut self.connections,
                            sockets,
                            &self.config,
                            &packet,
                            events,
                        );
                        if routed.is_ok() {
                            processed += 1;
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        self.connections.update(elapsed_ms, sockets, |remote| {
            events.on_client_disconnected(remote)
        });

        processed
    }

    fn route_packet(
        connections: &mut ConnectionManager,
        comm: &SocketPair,
        config: &Config,
        packet: &Packet,
        events: &mut dyn ServerEvents,
    ) -> Result<()> {
        let remote = packet.remote;
        let mut reader = packet.payload.reader();

        if !connections.contains(&remote) {
            if connections.is_full() {
                trace!(remote = %remote, "connection table full, dropping datagram");
                return Err(Error::AtCapacity);
            }
            let connection =
                connections.add(Connection::new_server(remote, config.idle_timeout_ms))?;
            connection.process_packet(&mut reader, comm)?;
            return Ok(());
        }

        let connection = connections
            .find_mut(&remote)
            .ok_or(Error::UnknownEndpoint)?;

        if connection.is_negotiating() {
            connection.process_packet(&mut reader, comm)?;
            if connection.is_connected() {
                debug!(remote = %remote, "client connected");
                events.on_client_connected(&remote);
            }
            Ok(())
        } else if connection.is_connected() {
            let header = connection.process_packet(&mut reader, comm)?;
            if header.kind == PacketKind::Payload {
                for message in connection.process_payload(&mut reader, header.length)? {
                    events.on_message_received(&remote, message);
                }
            }
            Ok(())
        } else {
            // dead connection awaiting eviction
            Err(Error::NotConnected)
        }
    }

    /// Send a raw, pre-framed datagram. The caller owns the framing.
    pub fn send(&self, remote: &Endpoint, payload: &[u8]) -> bool {
        self.sockets
            .as_ref()
            .map(|sockets| sockets.send(remote, payload))
            .unwrap_or(false)
    }

    /// Frame, fragment, and send `data` to a connected peer
    pub fn send_payload(&mut self, remote: &Endpoint, data: &[u8]) -> Result<()> {
        let sockets = self.sockets.as_ref().ok_or(Error::NotStarted)?;
        let connection = self
            .connections
            .find_mut(remote)
            .ok_or(Error::UnknownEndpoint)?;
        connection.send_payload(data, sockets)
    }

    /// Tear down the connection to `remote`; the disconnect callback fires
    /// at the next update
    pub fn disconnect(&mut self, remote: &Endpoint) {
        if let Some(sockets) = self.sockets.as_ref() {
            if let Some(connection) = self.connections.find_mut(remote) {
                connection.disconnect(sockets);
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}
