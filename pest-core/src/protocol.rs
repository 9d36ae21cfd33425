//! Pest control wire protocol: message kinds, payload codec and protocol errors.

use crate::wire::{self, Frame, FrameDecodeError, FrameEncodeError};

/// Protocol literal carried in every Hello.
pub const PROTOCOL_NAME: &str = "pestcontrol";
/// Current protocol version. Used in Hello.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 0x50,
    Error = 0x51,
    Ok = 0x52,
    DialAuthority = 0x53,
    TargetPopulations = 0x54,
    CreatePolicy = 0x55,
    DeletePolicy = 0x56,
    PolicyResult = 0x57,
    SiteVisit = 0x58,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x50 => Self::Hello,
            0x51 => Self::Error,
            0x52 => Self::Ok,
            0x53 => Self::DialAuthority,
            0x54 => Self::TargetPopulations,
            0x55 => Self::CreatePolicy,
            0x56 => Self::DeletePolicy,
            0x57 => Self::PolicyResult,
            0x58 => Self::SiteVisit,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Enforcement action of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyAction {
    Cull,
    Conserve,
}

impl PolicyAction {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Cull => 0x90,
            Self::Conserve => 0xa0,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x90 => Some(Self::Cull),
            0xa0 => Some(Self::Conserve),
            _ => None,
        }
    }
}

/// Authority-declared acceptable range for one species.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPopulation {
    pub species: String,
    pub min: u32,
    pub max: u32,
}

/// Client-observed count for one species.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPopulation {
    pub species: String,
    pub count: u32,
}

/// All wire messages. Lists keep wire order; duplicate handling is up to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        protocol: String,
        version: u32,
    },
    Error {
        message: String,
    },
    Ok,
    DialAuthority {
        site: u32,
    },
    TargetPopulations {
        site: u32,
        populations: Vec<TargetPopulation>,
    },
    CreatePolicy {
        species: String,
        action: PolicyAction,
    },
    DeletePolicy {
        policy_id: u32,
    },
    PolicyResult {
        policy_id: u32,
    },
    SiteVisit {
        site: u32,
        populations: Vec<ObservedPopulation>,
    },
}

impl Message {
    /// Our own Hello.
    pub fn hello() -> Self {
        Message::Hello {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        Message::Error {
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Error { .. } => MessageKind::Error,
            Message::Ok => MessageKind::Ok,
            Message::DialAuthority { .. } => MessageKind::DialAuthority,
            Message::TargetPopulations { .. } => MessageKind::TargetPopulations,
            Message::CreatePolicy { .. } => MessageKind::CreatePolicy,
            Message::DeletePolicy { .. } => MessageKind::DeletePolicy,
            Message::PolicyResult { .. } => MessageKind::PolicyResult,
            Message::SiteVisit { .. } => MessageKind::SiteVisit,
        }
    }

    /// Encode into a complete frame ready for the socket.
    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let mut w = PayloadWriter::default();
        match self {
            Message::Hello { protocol, version } => {
                w.put_str(protocol)?;
                w.put_u32(*version);
            }
            Message::Error { message } => w.put_str(message)?,
            Message::Ok => {}
            Message::DialAuthority { site } => w.put_u32(*site),
            Message::TargetPopulations { site, populations } => {
                w.put_u32(*site);
                w.put_u32(populations.len() as u32);
                for p in populations {
                    w.put_str(&p.species)?;
                    w.put_u32(p.min);
                    w.put_u32(p.max);
                }
            }
            Message::CreatePolicy { species, action } => {
                w.put_str(species)?;
                w.put_u8(action.as_byte());
            }
            Message::DeletePolicy { policy_id } | Message::PolicyResult { policy_id } => {
                w.put_u32(*policy_id)
            }
            Message::SiteVisit { site, populations } => {
                w.put_u32(*site);
                w.put_u32(populations.len() as u32);
                for p in populations {
                    w.put_str(&p.species)?;
                    w.put_u32(p.count);
                }
            }
        }
        wire::encode_frame(self.kind().as_byte(), &w.buf)
    }

    /// Parse a frame's payload. Every field must be present and nothing may be left over.
    pub fn decode(frame: Frame<'_>) -> Result<Message, ProtocolError> {
        let kind = MessageKind::from_byte(frame.kind)
            .ok_or(ProtocolError::UnexpectedMessageType(frame.kind))?;
        let mut r = PayloadReader::new(frame.payload);
        let msg = match kind {
            MessageKind::Hello => Message::Hello {
                protocol: r.read_str()?,
                version: r.read_u32()?,
            },
            MessageKind::Error => Message::Error {
                message: r.read_str()?,
            },
            MessageKind::Ok => Message::Ok,
            MessageKind::DialAuthority => Message::DialAuthority {
                site: r.read_u32()?,
            },
            MessageKind::TargetPopulations => {
                let site = r.read_u32()?;
                let count = r.read_u32()?;
                let mut populations = Vec::new();
                for _ in 0..count {
                    populations.push(TargetPopulation {
                        species: r.read_str()?,
                        min: r.read_u32()?,
                        max: r.read_u32()?,
                    });
                }
                Message::TargetPopulations { site, populations }
            }
            MessageKind::CreatePolicy => {
                let species = r.read_str()?;
                let b = r.read_u8()?;
                let action = PolicyAction::from_byte(b).ok_or(ProtocolError::UnknownAction(b))?;
                Message::CreatePolicy { species, action }
            }
            MessageKind::DeletePolicy => Message::DeletePolicy {
                policy_id: r.read_u32()?,
            },
            MessageKind::PolicyResult => Message::PolicyResult {
                policy_id: r.read_u32()?,
            },
            MessageKind::SiteVisit => {
                let site = r.read_u32()?;
                let count = r.read_u32()?;
                let mut populations = Vec::new();
                for _ in 0..count {
                    populations.push(ObservedPopulation {
                        species: r.read_str()?,
                        count: r.read_u32()?,
                    });
                }
                Message::SiteVisit { site, populations }
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Sequential, bounds-checked reads over one payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::ContentExceedsLength);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        let b = self.take(len)?;
        if !b.is_ascii() {
            return Err(ProtocolError::InvalidString);
        }
        Ok(b.iter().map(|&c| c as char).collect())
    }

    /// Fails if any bytes were left unread.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::UnusedBytes);
        }
        Ok(())
    }
}

#[derive(Default)]
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn put_u8(&mut self, n: u8) {
        self.buf.push(n);
    }

    fn put_u32(&mut self, n: u32) {
        self.buf.extend_from_slice(&n.to_be_bytes());
    }

    fn put_str(&mut self, s: &str) -> Result<(), FrameEncodeError> {
        if !s.is_ascii() {
            return Err(FrameEncodeError::NonAscii);
        }
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// Anything that makes us answer with an Error frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Framing(#[from] FrameDecodeError),
    #[error("did not get Hello")]
    HelloNotReceived,
    #[error("unexpected protocol or version: {protocol:?} v{version}")]
    UnexpectedHelloFields { protocol: String, version: u32 },
    #[error("content exceeds declared length")]
    ContentExceedsLength,
    #[error("unused bytes in message")]
    UnusedBytes,
    #[error("string is not ascii")]
    InvalidString,
    #[error("unknown policy action {0:02x}")]
    UnknownAction(u8),
    #[error("unexpected message type {0:02x}")]
    UnexpectedMessageType(u8),
    #[error("conflicting target for species '{species}'")]
    ConflictingTarget { species: String },
    #[error("conflicting counts for species '{species}'")]
    ConflictingCounts { species: String },
    #[error("authority site mismatch: connection is for site {expected}, message names site {actual}")]
    SiteMismatch { expected: u32, actual: u32 },
}

impl ProtocolError {
    /// Fatal errors close the connection after the Error frame is flushed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Framing(_)
                | ProtocolError::HelloNotReceived
                | ProtocolError::UnexpectedHelloFields { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_frame;

    fn roundtrip(msg: Message) {
        let frame = msg.encode().unwrap();
        let (f, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(Message::decode(f).unwrap(), msg);
    }

    fn frame_with(kind: u8, payload: &[u8]) -> Vec<u8> {
        wire::encode_frame(kind, payload).unwrap()
    }

    fn decode_bytes(bytes: &[u8]) -> Result<Message, ProtocolError> {
        let (f, _) = decode_frame(bytes).unwrap();
        Message::decode(f)
    }

    #[test]
    fn roundtrip_every_kind() {
        roundtrip(Message::hello());
        roundtrip(Message::error("bad"));
        roundtrip(Message::Ok);
        roundtrip(Message::DialAuthority { site: 12345 });
        roundtrip(Message::TargetPopulations {
            site: 12345,
            populations: vec![
                TargetPopulation {
                    species: "dog".into(),
                    min: 1,
                    max: 3,
                },
                TargetPopulation {
                    species: "rat".into(),
                    min: 0,
                    max: 10,
                },
            ],
        });
        roundtrip(Message::CreatePolicy {
            species: "dog".into(),
            action: PolicyAction::Conserve,
        });
        roundtrip(Message::DeletePolicy { policy_id: 123 });
        roundtrip(Message::PolicyResult { policy_id: 123 });
        roundtrip(Message::SiteVisit {
            site: 12345,
            populations: vec![ObservedPopulation {
                species: "long-tailed rat".into(),
                count: 20,
            }],
        });
    }

    #[test]
    fn create_policy_wire_bytes() {
        let frame = Message::CreatePolicy {
            species: "dog".into(),
            action: PolicyAction::Conserve,
        }
        .encode()
        .unwrap();
        assert_eq!(
            frame,
            [0x55, 0x00, 0x00, 0x00, 0x0e, 0x00, 0x00, 0x00, 0x03, 0x64, 0x6f, 0x67, 0xa0, 0xc0]
        );
    }

    #[test]
    fn truncated_payload() {
        // Declares a 10-byte string but carries 2.
        let bytes = frame_with(0x51, &[0, 0, 0, 10, b'h', b'i']);
        assert_eq!(decode_bytes(&bytes), Err(ProtocolError::ContentExceedsLength));
    }

    #[test]
    fn trailing_bytes() {
        let bytes = frame_with(0x57, &[0, 0, 0, 1, 0xff]);
        assert_eq!(decode_bytes(&bytes), Err(ProtocolError::UnusedBytes));
    }

    #[test]
    fn ok_with_payload_is_unused_bytes() {
        let bytes = frame_with(0x52, &[0]);
        assert_eq!(decode_bytes(&bytes), Err(ProtocolError::UnusedBytes));
    }

    #[test]
    fn unknown_kind() {
        let bytes = frame_with(0x99, &[]);
        assert_eq!(
            decode_bytes(&bytes),
            Err(ProtocolError::UnexpectedMessageType(0x99))
        );
    }

    #[test]
    fn unknown_action() {
        let bytes = frame_with(0x55, &[0, 0, 0, 1, b'x', 0x01]);
        assert_eq!(decode_bytes(&bytes), Err(ProtocolError::UnknownAction(0x01)));
    }

    #[test]
    fn non_ascii_string() {
        let bytes = frame_with(0x51, &[0, 0, 0, 1, 0xc3]);
        assert_eq!(decode_bytes(&bytes), Err(ProtocolError::InvalidString));
        assert_eq!(
            Message::error("caf\u{e9}").encode(),
            Err(FrameEncodeError::NonAscii)
        );
    }

    #[test]
    fn huge_count_fails_cleanly() {
        let bytes = frame_with(0x58, &[0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(decode_bytes(&bytes), Err(ProtocolError::ContentExceedsLength));
    }

    #[test]
    fn fatality() {
        assert!(ProtocolError::Framing(FrameDecodeError::InvalidChecksum).is_fatal());
        assert!(ProtocolError::HelloNotReceived.is_fatal());
        assert!(!ProtocolError::UnusedBytes.is_fatal());
        assert!(!ProtocolError::ConflictingCounts {
            species: "rat".into()
        }
        .is_fatal());
        assert!(!ProtocolError::SiteMismatch {
            expected: 1,
            actual: 2
        }
        .is_fatal());
    }
}
