//! Length-prefix framing: `u32` big-endian length, then UTF-8 JSON.

use pathspace_types::{Error, Expected};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default cap on a single frame's JSON payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Frame a serialized envelope for the wire.
pub fn encode_frame(json: &str, max_frame_len: usize) -> Expected<Vec<u8>> {
    if json.is_empty() {
        return Err(Error::MalformedInput("frame payload empty".into()));
    }
    if json.len() > max_frame_len {
        return Err(Error::MalformedInput(format!(
            "frame length {} exceeds maximum {max_frame_len}",
            json.len()
        )));
    }
    let size = u32::try_from(json.len())
        .map_err(|_| Error::MalformedInput("frame too large for 4-byte length prefix".into()))?;
    let mut framed = Vec::with_capacity(HEADER_LEN + json.len());
    framed.extend_from_slice(&size.to_be_bytes());
    framed.extend_from_slice(json.as_bytes());
    Ok(framed)
}

/// Parse and bounds-check a length prefix.
pub fn decode_header(header: [u8; HEADER_LEN], max_frame_len: usize) -> Expected<usize> {
    let size = u32::from_be_bytes(header) as usize;
    if size == 0 {
        return Err(Error::MalformedInput("frame payload empty".into()));
    }
    if size > max_frame_len {
        return Err(Error::MalformedInput(format!(
            "frame length {size} exceeds maximum {max_frame_len}"
        )));
    }
    Ok(size)
}

/// Interpret a received frame body as UTF-8 JSON text.
pub fn decode_body(body: Vec<u8>) -> Expected<String> {
    String::from_utf8(body)
        .map_err(|_| Error::MalformedInput("frame payload is not valid UTF-8".into()))
}
