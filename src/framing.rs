//! Length-prefixed framing for the client socket.
//!
//! Every message in either direction is a 4-byte big-endian payload length
//! followed by that many bytes of UTF-8 JSON.

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Prepend the big-endian length prefix to a payload.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Decode the length prefix read from the wire.
pub fn payload_length(prefix: [u8; LENGTH_PREFIX]) -> usize {
    u32::from_be_bytes(prefix) as usize
}
