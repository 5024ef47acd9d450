//! Base64 codec for value bytes at the JSON boundary.
//!
//! Encoding is standard `A-Za-z0-9+/` with `=` padding. Decoding is
//! deliberately lenient: whitespace and any non-alphabet characters are
//! skipped rather than rejected, since the encoder is the authoritative
//! producer and transports may fold lines.

use ::base64::engine::general_purpose::GeneralPurposeConfig;
use ::base64::engine::{DecodePaddingMode, Engine, GeneralPurpose};
use pathspace_types::{Error, Expected};

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &::base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes with standard alphabet and padding.
pub fn encode(bytes: &[u8]) -> String {
    LENIENT.encode(bytes)
}

/// Decode, skipping whitespace and any character outside the alphabet.
pub fn decode(input: &str) -> Expected<Vec<u8>> {
    let mut filtered: Vec<u8> = input
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/'))
        .collect();
    // A lone trailing character cannot carry a full byte; drop it the way
    // the chunked decoder would.
    if filtered.len() % 4 == 1 {
        filtered.pop();
    }
    LENIENT
        .decode(&filtered)
        .map_err(|e| Error::MalformedInput(format!("base64 decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_bytes() {
        for bytes in [
            Vec::new(),
            vec![0u8],
            vec![0u8, 1, 2],
            vec![255u8; 7],
            b"hello world".to_vec(),
        ] {
            let encoded = encode(&bytes);
            let decoded = decode(&encoded).expect("decode");
            assert_eq!(decoded, bytes);
        }
    }

    #[test]
    fn test_known_vector() {
        assert_eq!(encode(b"hello"), "aGVsbG8=");
        assert_eq!(decode("aGVsbG8=").expect("decode"), b"hello");
    }

    #[test]
    fn test_whitespace_ignored() {
        assert_eq!(decode("aGVs\nbG8=\t ").expect("decode"), b"hello");
    }

    #[test]
    fn test_non_alphabet_characters_skipped() {
        assert_eq!(decode("aG#Vs*bG8=").expect("decode"), b"hello");
    }

    #[test]
    fn test_unpadded_input_accepted() {
        assert_eq!(decode("aGVsbG8").expect("decode"), b"hello");
    }

    #[test]
    fn test_empty_input_decodes_empty() {
        assert!(decode("").expect("decode").is_empty());
        assert!(decode("!!").expect("decode").is_empty());
    }
}
