//! Typed value codec: 4-byte little-endian size header + CBOR body.
//!
//! The round-trip law holds for every registered type: decoding an encoded
//! value yields an equal value, and re-encoding yields byte-identical
//! output. A blob whose header disagrees with the available bytes is
//! reported as [`Error::UnserializableType`].

use pathspace_types::{Error, Expected};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::sliding::SlidingBuffer;

/// Size of the length header preceding every encoded value.
pub const HEADER_LEN: usize = 4;

/// Encode a value into a fresh header-framed blob.
pub fn serialize_value<T: Serialize>(value: &T) -> Expected<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(value, &mut body)
        .map_err(|e| Error::UnserializableType(format!("value encoding failed: {e}")))?;
    let size = u32::try_from(body.len())
        .map_err(|_| Error::UnserializableType("value exceeds 4-byte length header".into()))?;
    let mut framed = Vec::with_capacity(HEADER_LEN + body.len());
    framed.extend_from_slice(&size.to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Encode a value and append the framed blob to a buffer.
pub fn serialize_into<T: Serialize>(value: &T, buffer: &mut SlidingBuffer) -> Expected<()> {
    let framed = serialize_value(value)?;
    buffer.append(&framed);
    Ok(())
}

/// Length of the framed blob at the front of `bytes` (header + body).
pub fn framed_len(bytes: &[u8]) -> Expected<usize> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::MalformedInput("buffer too small for header".into()));
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    let size = u32::from_le_bytes(header) as usize;
    if bytes.len() < HEADER_LEN + size {
        return Err(Error::UnserializableType(
            "buffer too small for encoded value".into(),
        ));
    }
    Ok(HEADER_LEN + size)
}

/// Decode the framed value at the front of `bytes`.
///
/// Trailing bytes beyond the framed value are permitted; queues concatenate
/// framed blobs back to back.
pub fn deserialize_value<T: DeserializeOwned>(bytes: &[u8]) -> Expected<T> {
    let framed = framed_len(bytes)?;
    ciborium::from_reader(&bytes[HEADER_LEN..framed])
        .map_err(|e| Error::UnserializableType(format!("value decoding failed: {e}")))
}

/// Decode the front value of a buffer and consume it.
pub fn deserialize_pop<T: DeserializeOwned>(buffer: &mut SlidingBuffer) -> Expected<T> {
    let framed = framed_len(buffer.data())?;
    let value = deserialize_value(buffer.data())?;
    buffer.advance(framed);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_equals() {
        let value = "hello".to_string();
        let bytes = serialize_value(&value).expect("serialize");
        let restored: String = deserialize_value(&bytes).expect("deserialize");
        assert_eq!(restored, value);
        let again = serialize_value(&restored).expect("serialize");
        assert_eq!(again, bytes);
    }

    #[test]
    fn test_header_is_little_endian_body_length() {
        let bytes = serialize_value(&42u32).expect("serialize");
        let mut header = [0u8; 4];
        header.copy_from_slice(&bytes[..4]);
        assert_eq!(u32::from_le_bytes(header) as usize, bytes.len() - 4);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let result: Expected<u32> = deserialize_value(&[1, 2]);
        assert!(matches!(result, Err(Error::MalformedInput(_))));

        // Header claims more bytes than are present.
        let mut bytes = serialize_value(&7u64).expect("serialize");
        bytes.truncate(bytes.len() - 1);
        let result: Expected<u64> = deserialize_value(&bytes);
        assert!(matches!(result, Err(Error::UnserializableType(_))));
    }

    #[test]
    fn test_pop_consumes_exactly_one_value() {
        let mut buffer = SlidingBuffer::new();
        serialize_into(&1u32, &mut buffer).expect("serialize");
        serialize_into(&2u32, &mut buffer).expect("serialize");
        let first: u32 = deserialize_pop(&mut buffer).expect("pop");
        let second: u32 = deserialize_pop(&mut buffer).expect("pop");
        assert_eq!((first, second), (1, 2));
        assert!(buffer.is_empty());
        let empty: Expected<u32> = deserialize_pop(&mut buffer);
        assert!(empty.is_err());
    }

    #[test]
    fn test_trailing_bytes_allowed() {
        let mut bytes = serialize_value(&"front".to_string()).expect("serialize");
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let value: String = deserialize_value(&bytes).expect("deserialize");
        assert_eq!(value, "front");
    }
}
