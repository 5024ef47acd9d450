//! Length-prefixed frame I/O over a byte stream.

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use pathspace_types::{Error, Expected};
use pathspace_wire::framing::{self, HEADER_LEN};
use pathspace_wire::{deserialize_frame, serialize_frame, RemoteFrame};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Stamp, serialize, and write one frame.
///
/// I/O failures surface as [`Error::Unknown`]; they never panic or
/// propagate as anything else.
pub fn write_frame<S: Write>(
    stream: &mut S,
    mut frame: RemoteFrame,
    max_frame_len: usize,
) -> Expected<()> {
    frame.sent_at_ms = now_ms();
    let json = serialize_frame(&frame)?;
    let bytes = framing::encode_frame(&json, max_frame_len)?;
    stream
        .write_all(&bytes)
        .map_err(|e| Error::Unknown(format!("frame write failed: {e}")))?;
    stream
        .flush()
        .map_err(|e| Error::Unknown(format!("frame flush failed: {e}")))
}

/// Read and parse one frame.
pub fn read_frame<S: Read>(stream: &mut S, max_frame_len: usize) -> Expected<RemoteFrame> {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .map_err(|e| Error::Unknown(format!("frame header read failed: {e}")))?;
    let size = framing::decode_header(header, max_frame_len)?;
    let mut body = vec![0u8; size];
    stream
        .read_exact(&mut body)
        .map_err(|e| Error::Unknown(format!("frame body read failed: {e}")))?;
    let text = framing::decode_body(body)?;
    deserialize_frame(&text)
}
