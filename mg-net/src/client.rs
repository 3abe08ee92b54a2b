//! Client driver
//!
//! A simplified server: one socket in the remote's address family and a
//! single non-authenticating connection. Each update tick drives the
//! connection (negotiation retransmit, idle timeout) and drains the
//! socket, then reports state edges to the embedding application exactly
//! once each.

use tracing::trace;

use mg_protocol::{Message, PacketKind};

use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::endpoint::Endpoint;
use crate::selector::Selector;
use crate::socket::{Packet, Socket};
use crate::{Error, Result};

/// Callbacks the embedding application implements
pub trait ClientEvents {
    /// The handshake completed
    fn on_connected(&mut self, remote: &Endpoint);

    /// The connection died (disconnect, rejection, or idle timeout)
    fn on_disconnected(&mut self, remote: &Endpoint);

    /// A complete message arrived from the server
    fn on_message_received(&mut self, remote: &Endpoint, message: Message);
}

/// Connects to a single server endpoint
pub struct Client {
    socket: Socket,
    connection: Connection,
    remote: Endpoint,
    last_state: ConnectionState,
}

impl Client {
    /// Bind an ephemeral socket and start negotiating with `remote`
    pub fn connect(remote: Endpoint) -> Result<Self> {
        Self::with_config(remote, Config::default())
    }

    pub fn with_config(remote: Endpoint, config: Config) -> Result<Self> {
        let socket = Socket::bind(remote.family(), 0)?;
        Ok(Self {
            socket,
            connection: Connection::new_client(remote, config.idle_timeout_ms),
            remote,
            last_state: ConnectionState::Negotiating,
        })
    }

    /// The server endpoint
    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    /// Local port of the client socket
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Drive the connection and drain the socket.
    ///
    /// Returns the number of successfully processed datagrams.
    pub fn update(&mut self, elapsed_ms: u64, events: &mut dyn ClientEvents) -> u32 {
        self.connection.update(elapsed_ms, &self.socket);

        let mut processed = 0;
        let selector = Selector::new(&self.socket);
        while selector.is_ready() {
            match self.socket.receive() {
                Ok(packet) => {
                    let handled = Self::handle_packet(
                        &mut self.connection,
                        &self.socket,
                        &self.remote,
                        &packet,
                        events,
                    );
                    if handled.is_ok() {
                        processed += 1;
                    }
                }
                Err(_) => break,
            }
        }

        self.report_edges(events);
        processed
    }

    fn handle_packet(
        connection: &mut Connection,
        socket: &Socket,
        remote: &Endpoint,
        packet: &Packet,
        events: &mut dyn ClientEvents,
    ) -> Result<()> {
        if packet.remote != *remote {
            trace!(from = %packet.remote, "ignoring datagram from foreign endpoint");
            return Err(Error::UnknownEndpoint);
        }

        let mut reader = packet.payload.reader();
        if connection.is_negotiating() {
            connection.process_packet(&mut reader, socket)?;
            Ok(())
        } else if connection.is_connected() {
            let header = connection.process_packet(&mut reader, socket)?;
            if header.kind == PacketKind::Payload {
                for message in connection.process_payload(&mut reader, header.length)? {
                    events.on_message_received(remote, message);
                }
            }
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Surface Connected/Closed transitions exactly once each
    fn report_edges(&mut self, events: &mut dyn ClientEvents) {
        let state = self.connection.state();
        if state == self.last_state {
            return;
        }
        match state {
            ConnectionState::Connected => events.on_connected(&self.remote),
            ConnectionState::Closed => events.on_disconnected(&self.remote),
            ConnectionState::Negotiating => {}
        }
        self.last_state = state;
    }

    /// Frame, fragment, and send `data`; fails while still negotiating
    pub fn send_payload(&mut self, data: &[u8]) -> Result<()> {
        self.connection.send_payload(data, &self.socket)
    }

    /// Send a raw, pre-framed datagram to the server
    pub fn send(&self, payload: &[u8]) -> bool {
        self.socket.send(&self.remote, payload)
    }

    /// Tear the connection down; `on_disconnected` fires on the next update
    pub fn disconnect(&mut self) {
        self.connection.disconnect(&self.socket);
    }
}
