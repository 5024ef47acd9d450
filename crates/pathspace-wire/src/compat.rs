//! Legacy payload compatibility switch.
//!
//! The `PATHSPACE_REMOTE_TYPED_PAYLOADS` environment variable controls
//! whether legacy `string/base64` payloads may be decoded. Both the mount
//! client and server read the flag at construction time.

/// Whether legacy payload encodings are decodable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PayloadCompatibility {
    /// Only `typed/slidingbuffer` (and void sentinels); legacy string
    /// payloads fail with `InvalidType`.
    #[default]
    TypedOnly,
    /// Accept both typed and legacy string payloads.
    LegacyCompatible,
}

impl PayloadCompatibility {
    /// True when legacy `string/base64` payloads may be decoded.
    pub fn allows_legacy(self) -> bool {
        matches!(self, Self::LegacyCompatible)
    }
}

/// Environment variable selecting the compatibility mode.
pub const PAYLOAD_COMPAT_ENV: &str = "PATHSPACE_REMOTE_TYPED_PAYLOADS";

/// Resolve the process-wide default mode from the environment.
///
/// Unset, `1`, `true`, and `typed` select [`PayloadCompatibility::TypedOnly`];
/// `0`, `false`, `legacy`, `compat`, and `compatibility` select
/// [`PayloadCompatibility::LegacyCompatible`]. Anything else falls back to
/// typed-only.
pub fn default_payload_compatibility() -> PayloadCompatibility {
    match std::env::var(PAYLOAD_COMPAT_ENV) {
        Ok(raw) => parse_flag(&raw),
        Err(_) => PayloadCompatibility::TypedOnly,
    }
}

/// Parse a flag value, ignoring case and whitespace.
pub fn parse_flag(raw: &str) -> PayloadCompatibility {
    let normalized: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match normalized.as_str() {
        "0" | "false" | "legacy" | "compat" | "compatibility" => {
            PayloadCompatibility::LegacyCompatible
        }
        _ => PayloadCompatibility::TypedOnly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_values() {
        for raw in ["", "1", "true", "typed", "TRUE", " 1 ", "surprise"] {
            assert_eq!(parse_flag(raw), PayloadCompatibility::TypedOnly, "{raw:?}");
        }
    }

    #[test]
    fn test_legacy_values() {
        for raw in ["0", "false", "legacy", "compat", "compatibility", " Compat "] {
            assert_eq!(
                parse_flag(raw),
                PayloadCompatibility::LegacyCompatible,
                "{raw:?}"
            );
        }
    }

    #[test]
    fn test_allows_legacy() {
        assert!(!PayloadCompatibility::TypedOnly.allows_legacy());
        assert!(PayloadCompatibility::LegacyCompatible.allows_legacy());
    }
}
