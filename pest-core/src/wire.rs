//! Framing: type byte + 4 bytes BE total length + payload + checksum byte.
//! A frame is valid when all of its bytes sum to 0 mod 256.

/// Type byte, length prefix and trailing checksum.
pub const WRAPPER_SIZE: usize = 6;
/// Frames declaring this total length or more are rejected.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

const LEN_OFFSET: usize = 1;
const PAYLOAD_OFFSET: usize = 5;

/// One decoded frame, borrowed from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: u8,
    pub payload: &'a [u8],
}

/// Wrap `payload` into a single frame: type, BE total length, payload, checksum.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let total = WRAPPER_SIZE + payload.len();
    if total >= MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(total);
    out.push(kind);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.push(checksum_for(&out));
    Ok(out)
}

/// Byte that brings the sum of `bytes` to 0 mod 256.
pub fn checksum_for(bytes: &[u8]) -> u8 {
    byte_sum(bytes).wrapping_neg()
}

fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Error encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("string is not ascii")]
    NonAscii,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame<'_>, usize), FrameDecodeError> {
    if bytes.len() < WRAPPER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let declared = u32::from_be_bytes([
        bytes[LEN_OFFSET],
        bytes[LEN_OFFSET + 1],
        bytes[LEN_OFFSET + 2],
        bytes[LEN_OFFSET + 3],
    ]);
    if declared >= MAX_FRAME_LEN {
        return Err(FrameDecodeError::MessageTooLong(declared));
    }
    let len = declared as usize;
    // A declared length shorter than the wrapper cannot hold a checksum.
    if len < WRAPPER_SIZE {
        return Err(FrameDecodeError::InvalidChecksum);
    }
    if bytes.len() < len {
        return Err(FrameDecodeError::NeedMore);
    }
    if byte_sum(&bytes[..len]) != 0 {
        return Err(FrameDecodeError::InvalidChecksum);
    }
    let frame = Frame {
        kind: bytes[0],
        payload: &bytes[PAYLOAD_OFFSET..len - 1],
    };
    Ok((frame, len))
}

/// Error decoding a frame. Everything except `NeedMore` is fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("message is too long ({0} bytes)")]
    MessageTooLong(u32),
    #[error("invalid checksum")]
    InvalidChecksum,
}

/// Render bytes for debug logs: printable ASCII as characters, everything else as hex.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if (0x41..=0x7e).contains(&b) {
                (b as char).to_string()
            } else {
                format!("{:02x}", b)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
