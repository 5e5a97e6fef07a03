//! Binary frame-update codec.
//!
//! The layout is imposed by the backend, all integers big-endian:
//!
//! ```text
//! 0        4        8   9          9+L        24
//! +--------+--------+---+-----------+----------+-------------------+
//! | type   | index  | L | key (L)   | padding  | encoded image ... |
//! +--------+--------+---+-----------+----------+-------------------+
//! ```
//!
//! The key must fit inside the 24-byte header, so it is at most 15 bytes.
//! Everything from offset 24 onward is the image payload.

use std::fmt;

use super::session_key::{SessionKey, SessionKeyError};

/// Total header size; payload starts here
pub const HEADER_LEN: usize = 24;
const INDEX_OFFSET: usize = 4;
const KEY_LEN_OFFSET: usize = 8;
const KEY_OFFSET: usize = 9;
/// Longest key that fits in the header
pub const MAX_KEY_LEN: usize = HEADER_LEN - KEY_OFFSET;

/// Wire decode/encode errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Message shorter than the fixed header
    TooShort(usize),
    /// Declared key length runs past the header
    KeyOverrun(usize),
    KeyNotUtf8,
    Key(SessionKeyError),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::TooShort(n) => write!(f, "Frame update too short: {} bytes (header is {})", n, HEADER_LEN),
            WireError::KeyOverrun(n) => write!(f, "Key length {} exceeds header (max {})", n, MAX_KEY_LEN),
            WireError::KeyNotUtf8 => write!(f, "Key is not valid UTF-8"),
            WireError::Key(e) => write!(f, "Invalid key: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

/// One decoded frame update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameUpdate {
    /// Leading type/version word, carried through but not interpreted
    pub message_type: u32,
    pub frame_index: u32,
    pub key: SessionKey,
    pub payload: Vec<u8>,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(word)
}

/// Parse a frame update message
pub fn decode_frame_update(bytes: &[u8]) -> Result<FrameUpdate, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::TooShort(bytes.len()));
    }

    let message_type = read_u32(bytes, 0);
    let frame_index = read_u32(bytes, INDEX_OFFSET);
    let key_len = bytes[KEY_LEN_OFFSET] as usize;
    if key_len > MAX_KEY_LEN {
        return Err(WireError::KeyOverrun(key_len));
    }

    let key_bytes = &bytes[KEY_OFFSET..KEY_OFFSET + key_len];
    let key_str = std::str::from_utf8(key_bytes).map_err(|_| WireError::KeyNotUtf8)?;
    let key = SessionKey::parse(key_str).map_err(WireError::Key)?;

    Ok(FrameUpdate {
        message_type,
        frame_index,
        key,
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

/// Build a frame update message (padding is zero-filled)
pub fn encode_frame_update(message_type: u32, frame_index: u32, key: &SessionKey, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let key_bytes = key.as_str().as_bytes();
    if key_bytes.len() > MAX_KEY_LEN {
        return Err(WireError::KeyOverrun(key_bytes.len()));
    }

    let mut out = vec![0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&message_type.to_be_bytes());
    out[INDEX_OFFSET..INDEX_OFFSET + 4].copy_from_slice(&frame_index.to_be_bytes());
    out[KEY_LEN_OFFSET] = key_bytes.len() as u8;
    out[KEY_OFFSET..KEY_OFFSET + key_bytes.len()].copy_from_slice(key_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}
