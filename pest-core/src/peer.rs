//! Per-connection state: read buffer, handshake, role filtering.
//! The peer never touches site state; it hands decoded messages back to the server.

use std::fmt;

use tracing::{debug, warn};

use crate::protocol::{Message, MessageKind, ProtocolError, PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::wire::{self, Frame, FrameDecodeError};

/// Host-assigned handle for one duplex byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the service this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted field client; sends SiteVisit.
    Client,
    /// Outbound connection to the authority for one site.
    Authority { site: u32 },
}

impl Role {
    fn accepts(self, kind: MessageKind) -> bool {
        match self {
            Role::Client => kind == MessageKind::SiteVisit,
            Role::Authority { .. } => matches!(
                kind,
                MessageKind::TargetPopulations | MessageKind::PolicyResult
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Outbound dial in flight; writes are held until it completes.
    Connecting,
    AwaitingHello,
    Active,
    /// Fatal error sent; no more frames are read, close once flushed.
    Closing,
    Closed,
}

/// Outcome of one decode attempt.
#[derive(Debug, PartialEq)]
pub enum Step {
    /// Not enough buffered bytes for a frame (or the peer stopped reading).
    Incomplete,
    /// Frame handled by the peer itself (Hello, OK, Error).
    Consumed,
    /// Role-specific message for the server.
    Deliver(Message),
    /// Answer with an Error frame. Fatal errors have already moved the peer to `Closing`.
    Failed(ProtocolError),
}

pub struct Peer {
    conn: ConnId,
    role: Role,
    state: PeerState,
    read_buf: Vec<u8>,
    held: Vec<Vec<u8>>,
}

impl Peer {
    pub fn client(conn: ConnId) -> Self {
        Self::new(conn, Role::Client, PeerState::AwaitingHello)
    }

    /// Authority peer for a dial that has just been issued.
    pub fn authority(conn: ConnId, site: u32) -> Self {
        Self::new(conn, Role::Authority { site }, PeerState::Connecting)
    }

    fn new(conn: ConnId, role: Role, state: PeerState) -> Self {
        Self {
            conn,
            role,
            state,
            read_buf: Vec::new(),
            held: Vec::new(),
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn site(&self) -> Option<u32> {
        match self.role {
            Role::Authority { site } => Some(site),
            Role::Client => None,
        }
    }

    pub fn handshake_done(&self) -> bool {
        self.state == PeerState::Active
    }

    pub fn is_connecting(&self) -> bool {
        self.state == PeerState::Connecting
    }

    /// Hold a frame until the dial completes.
    pub fn hold(&mut self, frame: Vec<u8>) {
        self.held.push(frame);
    }

    /// Dial succeeded. Returns the held frames in order.
    pub fn connected(&mut self) -> Vec<Vec<u8>> {
        if self.state == PeerState::Connecting {
            self.state = PeerState::AwaitingHello;
        }
        std::mem::take(&mut self.held)
    }

    pub fn close(&mut self) {
        self.state = PeerState::Closed;
        self.read_buf.clear();
        self.held.clear();
    }

    /// Append an inbound chunk. Ignored once the peer has stopped reading.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if self.is_reading() {
            self.read_buf.extend_from_slice(bytes);
        }
    }

    fn is_reading(&self) -> bool {
        matches!(self.state, PeerState::AwaitingHello | PeerState::Active)
    }

    /// Try to decode and interpret one frame from the read buffer.
    pub fn poll(&mut self) -> Step {
        if !self.is_reading() {
            return Step::Incomplete;
        }
        let (role, handshake_done) = (self.role, self.handshake_done());
        let decoded = wire::decode_frame(&self.read_buf).map(|(frame, n)| {
            debug!(conn = %self.conn, "<- {}", wire::hex_dump(&self.read_buf[..n]));
            (interpret(role, handshake_done, frame), n)
        });
        let (outcome, consumed) = match decoded {
            Err(FrameDecodeError::NeedMore) => return Step::Incomplete,
            Err(e) => {
                warn!(conn = %self.conn, error = %e, "framing error");
                self.state = PeerState::Closing;
                self.read_buf.clear();
                return Step::Failed(e.into());
            }
            Ok(v) => v,
        };
        self.read_buf.drain(..consumed);
        match outcome {
            Ok(Inbound::Hello) => {
                self.state = PeerState::Active;
                Step::Consumed
            }
            Ok(Inbound::Remote(message)) => {
                warn!(conn = %self.conn, %message, "peer reported error");
                Step::Consumed
            }
            Ok(Inbound::Ok) => Step::Consumed,
            Ok(Inbound::Deliver(msg)) => Step::Deliver(msg),
            Err(e) => {
                if e.is_fatal() {
                    self.state = PeerState::Closing;
                    self.read_buf.clear();
                }
                Step::Failed(e)
            }
        }
    }
}

enum Inbound {
    Hello,
    Ok,
    Remote(String),
    Deliver(Message),
}

fn interpret(role: Role, handshake_done: bool, frame: Frame<'_>) -> Result<Inbound, ProtocolError> {
    let kind = MessageKind::from_byte(frame.kind);
    if kind == Some(MessageKind::Hello) {
        return match Message::decode(frame)? {
            Message::Hello { protocol, version }
                if protocol == PROTOCOL_NAME && version == PROTOCOL_VERSION =>
            {
                Ok(Inbound::Hello)
            }
            Message::Hello { protocol, version } => {
                Err(ProtocolError::UnexpectedHelloFields { protocol, version })
            }
            _ => Err(ProtocolError::UnexpectedMessageType(frame.kind)),
        };
    }
    if !handshake_done {
        return Err(ProtocolError::HelloNotReceived);
    }
    match kind {
        Some(MessageKind::Error) => match Message::decode(frame)? {
            Message::Error { message } => Ok(Inbound::Remote(message)),
            _ => Err(ProtocolError::UnexpectedMessageType(frame.kind)),
        },
        Some(MessageKind::Ok) => Message::decode(frame).map(|_| Inbound::Ok),
        Some(k) if role.accepts(k) => Message::decode(frame).map(Inbound::Deliver),
        _ => Err(ProtocolError::UnexpectedMessageType(frame.kind)),
    }
}
