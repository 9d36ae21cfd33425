//! Pest control protocol core.
//! Host-driven: no I/O; host passes connection events and receives actions.

pub mod peer;
pub mod policy;
pub mod protocol;
pub mod server;
pub mod wire;

pub use peer::{ConnId, Peer, PeerState, Role};
pub use policy::{Policy, PolicyState};
pub use protocol::{Message, MessageKind, PolicyAction, ProtocolError, PROTOCOL_NAME, PROTOCOL_VERSION};
pub use server::{OutboundAction, Server, TargetRange};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
