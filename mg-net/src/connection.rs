//! Per-peer connection state machine
//!
//! A connection starts negotiating, retransmits its negotiation packet on
//! every update tick until the handshake completes, and dies after the idle
//! timeout or a disconnect. The server side challenges peers with a random
//! authentication code; the client side adopts the code it receives and
//! echoes it back. Payload bodies run through the connection's crypto
//! filter and feed the per-sequence reassembly table.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, trace, warn};

use mg_protocol::{
    Buffer, BufferReader, DhChachaFilter, Header, Message, PacketKind, MAX_PACKET_SIZE,
    MESSAGE_HEADER_BYTES,
};

use crate::endpoint::Endpoint;
use crate::{Error, Result};

/// Idle window after which a silent connection is dropped
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 15_000;

/// In-flight inbound messages a single connection will track
const MAX_INFLIGHT_MESSAGES: usize = 64;

/// Wire size of the authentication code
const AUTH_CODE_BYTES: usize = 4;

/// Whole body bytes that fit a datagram after the bit-packed header
const BODY_CAPACITY: usize = MAX_PACKET_SIZE - 5;

/// Outgoing sink a connection hands its datagrams to.
///
/// Implemented by sockets, the server's listener pair, and test mocks. The
/// sink is passed into the methods that send rather than stored, so a
/// connection has a single owner and no back-references.
pub trait Communication {
    /// Hand one datagram to the transport. False means dropped.
    fn send(&self, remote: &Endpoint, payload: &[u8]) -> bool;
}

/// Sink that drops everything; keeps dead or detached connections benign
pub struct NullCommunication;

impl Communication for NullCommunication {
    fn send(&self, _remote: &Endpoint, _payload: &[u8]) -> bool {
        false
    }
}

impl Communication for crate::socket::Socket {
    fn send(&self, remote: &Endpoint, payload: &[u8]) -> bool {
        crate::socket::Socket::send(self, remote, payload)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dead: accepts no packets, evicted at the next manager update
    Closed,
    /// Handshake in progress
    Negotiating,
    /// Handshake and authentication complete
    Connected,
}

/// State machine for one remote peer
pub struct Connection {
    remote: Endpoint,
    state: ConnectionState,
    time_since_last_event: u64,
    idle_timeout_ms: u64,
    filter: DhChachaFilter,
    needs_authentication: bool,
    auth_code: u32,
    next_message_seq: u32,
    inbound: HashMap<u32, Message>,
}

impl Connection {
    /// Server-side connection: challenges the peer with a random code
    pub fn new_server(remote: Endpoint, idle_timeout_ms: u64) -> Self {
        Self::new(remote, true, idle_timeout_ms)
    }

    /// Client-side connection: adopts and echoes the server's code
    pub fn new_client(remote: Endpoint, idle_timeout_ms: u64) -> Self {
        Self::new(remote, false, idle_timeout_ms)
    }

    fn new(remote: Endpoint, needs_authentication: bool, idle_timeout_ms: u64) -> Self {
        let auth_code = if needs_authentication {
            Self::random_auth_code()
        } else {
            0
        };

        Self {
            remote,
            state: ConnectionState::Negotiating,
            time_since_last_event: 0,
            idle_timeout_ms,
            filter: DhChachaFilter::new(),
            needs_authentication,
            auth_code,
            next_message_seq: 0,
            inbound: HashMap::new(),
        }
    }

    /// Zero is the "no code" sentinel on the wire, so reroll it
    fn random_auth_code() -> u32 {
        loop {
            let code: u32 = rand::random();
            if code != 0 {
                return code;
            }
        }
    }

    /// Endpoint of the peer
    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_negotiating(&self) -> bool {
        self.state == ConnectionState::Negotiating
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Process one incoming datagram positioned at its header.
    ///
    /// Negotiation packets are handled here in any live state, since the
    /// peer may still be waiting for our confirmation after this side
    /// already considers itself connected. Payload and disconnect packets
    /// reset the idle timer and are returned to the caller, which decodes
    /// payload bodies via [`Connection::process_payload`].
    pub fn process_packet(
        &mut self,
        reader: &mut BufferReader<'_>,
        comm: &dyn Communication,
    ) -> Result<Header> {
        if self.state == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }

        let header = Header::decode(reader)?;
        match header.kind {
            PacketKind::Negotiation => self.process_negotiation(&header, reader, comm)?,
            PacketKind::Payload => self.touch(),
            PacketKind::Disconnect => {
                debug!(remote = %self.remote, "peer disconnected");
                self.state = ConnectionState::Closed;
            }
        }

        Ok(header)
    }

    fn process_negotiation(
        &mut self,
        header: &Header,
        reader: &mut BufferReader<'_>,
        comm: &dyn Communication,
    ) -> Result<()> {
        if let Err(error) = self.filter.receive_connect(reader) {
            // key not accepted, drop the connection
            debug!(remote = %self.remote, %error, "handshake rejected");
            self.state = ConnectionState::Closed;
            return Err(error.into());
        }

        if self.needs_authentication {
            if header.length < AUTH_CODE_BYTES {
                // no challenge echo yet; keep retransmitting ours
                return Ok(());
            }
            let other_code = Self::read_auth_code(reader)?;
            if other_code != self.auth_code {
                warn!(remote = %self.remote, "wrong auth code, dropping connection");
                self.state = ConnectionState::Closed;
                return Err(Error::AuthRejected);
            }
            self.state = ConnectionState::Connected;
            self.touch();
        } else if header.length >= AUTH_CODE_BYTES {
            let code = Self::read_auth_code(reader)?;
            if code != 0 {
                self.auth_code = code;
                self.state = ConnectionState::Connected;
                self.touch();
                // echo right away so the server can finish its side
                self.send_negotiation(comm);
            }
        }

        Ok(())
    }

    fn read_auth_code(reader: &mut BufferReader<'_>) -> Result<u32> {
        let mut code = [0u8; AUTH_CODE_BYTES];
        reader.read_bytes(&mut code)?;
        Ok(u32::from_be_bytes(code))
    }

    /// Send one negotiation packet: header, key material, and the auth
    /// code as 4 raw bytes once there is one.
    pub fn send_negotiation(&self, comm: &dyn Communication) {
        if let Err(error) = self.try_send_negotiation(comm) {
            trace!(remote = %self.remote, %error, "negotiation send skipped");
        }
    }

    fn try_send_negotiation(&self, comm: &dyn Communication) -> Result<()> {
        let mut buffer = Buffer::new(MAX_PACKET_SIZE);
        let mut writer = buffer.writer();

        let with_code = self.auth_code != 0;
        let length = if with_code { AUTH_CODE_BYTES } else { 0 };
        Header::new(PacketKind::Negotiation, length).encode(&mut writer)?;
        self.filter.pre_connect(&mut writer)?;
        if with_code {
            writer.write_bytes(&self.auth_code.to_be_bytes())?;
        }

        let used = writer.bytes_written();
        drop(writer);
        if !comm.send(&self.remote, &buffer.as_slice()[..used]) {
            return Err(Error::SendFailed);
        }
        Ok(())
    }

    /// Decode the payload body of a datagram whose header was just
    /// processed, returning every message the body completed.
    pub fn process_payload(
        &mut self,
        reader: &mut BufferReader<'_>,
        body_len: usize,
    ) -> Result<Vec<Message>> {
        let take = reader.remaining_bytes().min(body_len);
        let mut body = vec![0u8; take];
        reader.read_bytes(&mut body)?;
        self.filter.decrypt(&mut body)?;

        let mut completed = Vec::new();
        let mut fragments = BufferReader::new(&body);
        while fragments.remaining_bytes() > MESSAGE_HEADER_BYTES {
            let fragment = match Message::from_reader(&mut fragments) {
                Ok(fragment) => fragment,
                Err(error) => {
                    trace!(remote = %self.remote, %error, "stopping fragment scan");
                    break;
                }
            };

            let seq = fragment.seq();
            if fragment.is_complete() {
                self.inbound.remove(&seq);
                completed.push(fragment);
                continue;
            }

            if !self.inbound.contains_key(&seq) && self.inbound.len() >= MAX_INFLIGHT_MESSAGES {
                warn!(remote = %self.remote, seq, "reassembly table full, dropping fragment");
                continue;
            }

            match self.inbound.entry(seq) {
                Entry::Occupied(mut entry) => {
                    if let Err(error) = entry.get_mut().merge(fragment) {
                        // duplicate or stale fragment, drop it silently
                        trace!(remote = %self.remote, seq, %error, "fragment dropped");
                    }
                    if entry.get().is_complete() {
                        completed.push(entry.remove());
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(fragment);
                }
            }
        }

        Ok(completed)
    }

    /// Fragment `data` across as many datagrams as needed and send them.
    ///
    /// Fails unless the connection is established; a send while still
    /// negotiating is refused.
    pub fn send_payload(&mut self, data: &[u8], comm: &dyn Communication) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let message = Message::new(self.next_message_seq, data)?;
        self.next_message_seq = self.next_message_seq.wrapping_add(1);

        let mut body = Buffer::new(BODY_CAPACITY);
        let mut datagram = Buffer::new(MAX_PACKET_SIZE);
        let mut offset = 0;
        while offset < message.len() {
            // bodies are built and transformed before framing because the
            // bit-packed header ends mid-byte
            let mut body_writer = body.writer();
            let written = message.write(&mut body_writer, offset)?;
            let body_len = body_writer.bytes_written();
            drop(body_writer);
            self.filter.encrypt(&mut body.as_mut_slice()[..body_len])?;

            let mut writer = datagram.writer();
            Header::new(PacketKind::Payload, body_len).encode(&mut writer)?;
            writer.write_bytes(&body.as_slice()[..body_len])?;
            let total = writer.bytes_written();
            drop(writer);

            if !comm.send(&self.remote, &datagram.as_slice()[..total]) {
                return Err(Error::SendFailed);
            }
            offset += written;
        }

        Ok(())
    }

    /// Advance the idle timer and retransmit the negotiation while the
    /// handshake is incomplete. The retransmit-on-tick is the protocol's
    /// only retry mechanism.
    pub fn update(&mut self, elapsed_ms: u64, comm: &dyn Communication) {
        if self.state == ConnectionState::Closed {
            return;
        }

        self.time_since_last_event += elapsed_ms;
        if self.time_since_last_event > self.idle_timeout_ms {
            debug!(remote = %self.remote, "connection timed out");
            self.state = ConnectionState::Closed;
            return;
        }

        if self.state == ConnectionState::Negotiating {
            self.send_negotiation(comm);
        }
    }

    /// Tear the connection down, telling the peer once.
    ///
    /// Eviction and the disconnect callback happen at the next manager
    /// update.
    pub fn disconnect(&mut self, comm: &dyn Communication) {
        if self.state == ConnectionState::Closed {
            return;
        }

        let mut buffer = Buffer::new(8);
        let mut writer = buffer.writer();
        if Header::new(PacketKind::Disconnect, 0)
            .encode(&mut writer)
            .is_ok()
        {
            let used = writer.bytes_written();
            drop(writer);
            comm.send(&self.remote, &buffer.as_slice()[..used]);
        }

        debug!(remote = %self.remote, "disconnecting");
        self.state = ConnectionState::Closed;
    }

    fn touch(&mut self) {
        self.time_since_last_event = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCommunication;

    fn pair() -> (Connection, Connection, MockCommunication, MockCommunication) {
        let client_remote: Endpoint = "127.0.0.1:4096".parse().unwrap();
        let server_remote: Endpoint = "127.0.0.1:5555".parse().unwrap();
        let server = Connection::new_server(server_remote, DEFAULT_IDLE_TIMEOUT_MS);
        let client = Connection::new_client(client_remote, DEFAULT_IDLE_TIMEOUT_MS);
        (server, client, MockCommunication::new(), MockCommunication::new())
    }

    fn feed(
        connection: &mut Connection,
        datagram: &[u8],
        comm: &MockCommunication,
    ) -> Result<Header> {
        connection.process_packet(&mut BufferReader::new(datagram), comm)
    }

    /// Drive the three-way negotiation through captured datagrams
    fn handshake(
        server: &mut Connection,
        client: &mut Connection,
        server_comm: &MockCommunication,
        client_comm: &MockCommunication,
    ) {
        client.update(16, client_comm);
        let hello = client_comm.take_sent().pop().unwrap().1;
        feed(server, &hello, server_comm).unwrap();

        server.update(16, server_comm);
        let challenge = server_comm.take_sent().pop().unwrap().1;
        feed(client, &challenge, client_comm).unwrap();

        let echo = client_comm.take_sent().pop().unwrap().1;
        feed(server, &echo, server_comm).unwrap();

        assert!(server.is_connected());
        assert!(client.is_connected());
    }

    #[test]
    fn test_handshake_completes() {
        let (mut server, mut client, server_comm, client_comm) = pair();
        handshake(&mut server, &mut client, &server_comm, &client_comm);
    }

    #[test]
    fn test_negotiation_retransmits_every_tick() {
        let (_, mut client, _, client_comm) = pair();
        for _ in 0..5 {
            client.update(16, &client_comm);
        }
        let sent = client_comm.take_sent();
        assert_eq!(sent.len(), 5);
        // same ephemeral key behind every retransmit
        assert!(sent.windows(2).all(|pair| pair[0].1 == pair[1].1));
    }

    #[test]
    fn test_wrong_auth_code_drops_connection() {
        let (mut server, mut client, server_comm, client_comm) = pair();

        client.update(16, &client_comm);
        let hello = client_comm.take_sent().pop().unwrap().1;
        feed(&mut server, &hello, &server_comm).unwrap();

        server.update(16, &server_comm);
        let challenge = server_comm.take_sent().pop().unwrap().1;
        feed(&mut client, &challenge, &client_comm).unwrap();

        // flip bits inside the echoed code; the last datagram byte holds
        // the code's trailing bits
        let mut echo = client_comm.take_sent().pop().unwrap().1;
        let last = echo.len() - 1;
        echo[last] ^= 0xF0;

        assert!(matches!(
            feed(&mut server, &echo, &server_comm),
            Err(Error::AuthRejected)
        ));
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_idle_timeout() {
        let (mut server, _, server_comm, _) = pair();
        for _ in 0..15 {
            server.update(1000, &server_comm);
        }
        assert!(!matches!(server.state(), ConnectionState::Closed));
        server.update(1000, &server_comm);
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_send_payload_while_negotiating_fails() {
        let (mut server, _, server_comm, _) = pair();
        assert!(matches!(
            server.send_payload(b"too early", &server_comm),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_closed_connection_accepts_nothing() {
        let (mut server, mut client, server_comm, client_comm) = pair();
        handshake(&mut server, &mut client, &server_comm, &client_comm);

        client.send_payload(b"after close", &client_comm).unwrap();
        let datagram = client_comm.take_sent().pop().unwrap().1;

        server.disconnect(&server_comm);
        assert!(feed(&mut server, &datagram, &server_comm).is_err());
    }

    #[test]
    fn test_payload_roundtrip() {
        let (mut server, mut client, server_comm, client_comm) = pair();
        handshake(&mut server, &mut client, &server_comm, &client_comm);

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        client.send_payload(&payload, &client_comm).unwrap();
        let sent = client_comm.take_sent();
        assert_eq!(sent.len(), 1);

        let mut reader = BufferReader::new(&sent[0].1);
        let header = server.process_packet(&mut reader, &server_comm).unwrap();
        assert_eq!(header.kind, PacketKind::Payload);
        let messages = server.process_payload(&mut reader, header.length).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload().unwrap(), &payload[..]);
    }

    #[test]
    fn test_fragmented_payload_out_of_order() {
        let (mut server, mut client, server_comm, client_comm) = pair();
        handshake(&mut server, &mut client, &server_comm, &client_comm);

        let payload: Vec<u8> = (0..3500u32).map(|i| (i % 247) as u8).collect();
        client.send_payload(&payload, &client_comm).unwrap();
        let sent = client_comm.take_sent();
        assert_eq!(sent.len(), 3);

        // deliver third, first, second
        let mut messages = Vec::new();
        for index in [2, 0, 1] {
            let mut reader = BufferReader::new(&sent[index].1);
            let header = server.process_packet(&mut reader, &server_comm).unwrap();
            messages.extend(server.process_payload(&mut reader, header.length).unwrap());
        }

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].seq(), 0);
        assert_eq!(messages[0].payload().unwrap(), &payload[..]);
    }

    #[test]
    fn test_duplicate_fragment_delivers_once() {
        let (mut server, mut client, server_comm, client_comm) = pair();
        handshake(&mut server, &mut client, &server_comm, &client_comm);

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 239) as u8).collect();
        client.send_payload(&payload, &client_comm).unwrap();
        let sent = client_comm.take_sent();
        assert_eq!(sent.len(), 3);

        // fragment #2 twice
        let mut messages = Vec::new();
        for index in [0, 1, 1, 2] {
            let mut reader = BufferReader::new(&sent[index].1);
            let header = server.process_packet(&mut reader, &server_comm).unwrap();
            messages.extend(server.process_payload(&mut reader, header.length).unwrap());
        }

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload().unwrap(), &payload[..]);
    }

    #[test]
    fn test_message_seq_increments() {
        let (mut server, mut client, server_comm, client_comm) = pair();
        handshake(&mut server, &mut client, &server_comm, &client_comm);

        for expected_seq in 0..3u32 {
            client.send_payload(b"tick", &client_comm).unwrap();
            let datagram = client_comm.take_sent().pop().unwrap().1;
            let mut reader = BufferReader::new(&datagram);
            let header = server.process_packet(&mut reader, &server_comm).unwrap();
            let messages = server.process_payload(&mut reader, header.length).unwrap();
            assert_eq!(messages[0].seq(), expected_seq);
        }
    }

    #[test]
    fn test_send_failure_reported() {
        let (mut server, mut client, server_comm, client_comm) = pair();
        handshake(&mut server, &mut client, &server_comm, &client_comm);

        client_comm.set_accept(false);
        assert!(matches!(
            client.send_payload(b"dropped", &client_comm),
            Err(Error::SendFailed)
        ));
    }

    #[test]
    fn test_disconnect_notifies_peer() {
        let (mut server, mut client, server_comm, client_comm) = pair();
        handshake(&mut server, &mut client, &server_comm, &client_comm);

        client.disconnect(&client_comm);
        assert_eq!(client.state(), ConnectionState::Closed);

        let datagram = client_comm.take_sent().pop().unwrap().1;
        let header = feed(&mut server, &datagram, &server_comm).unwrap();
        assert_eq!(header.kind, PacketKind::Disconnect);
        assert_eq!(server.state(), ConnectionState::Closed);
    }
}
