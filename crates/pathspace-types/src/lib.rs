//! # pathspace-types
//!
//! Shared foundation types for the PathSpace remote mount subsystem:
//!
//! - The uniform [`Error`] kind enum and the [`Expected`] result alias used
//!   by every layer (registry, wire protocol, server, client).
//! - Absolute path validation, canonicalization, and glob matching via
//!   [`path`].
//!
//! Every fallible operation in the workspace returns `Expected<T>`; errors
//! carry a stable wire `code()` string so they can cross the mount protocol
//! and be mapped back on the far side.

pub mod path;

use serde::{Deserialize, Serialize};

/// Uniform error kind for all PathSpace operations.
///
/// Each variant corresponds to one row of the recovery table in the design:
/// transport failures map to [`Error::Unknown`], capability refusals to
/// [`Error::InvalidPermissions`], backpressure to [`Error::CapacityExceeded`],
/// and so on. The payload is a human-readable message; the machine-readable
/// identity is the variant itself (see [`Error::code`]).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    /// Wire validation failure: bad JSON, missing/ill-typed field, bad alias
    /// or identifier syntax, negative duration.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Path failed the absolute-path validator or escaped an export root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Type registry miss, codec failure, or a payload encoding the peer is
    /// not allowed to decode.
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// Capability not granted, unknown session, or a stopped mount.
    #[error("invalid permissions: {0}")]
    InvalidPermissions(String),

    /// Unknown alias, unknown session, or a remote `no_such_path` report.
    #[error("no such path: {0}")]
    NoSuchPath(String),

    /// A read or take found the node empty.
    #[error("no object found: {0}")]
    NoObjectFound(String),

    /// Deadline elapsed or a lease expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Notification backpressure or the per-session waiter limit.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Value failed the serialization round-trip law.
    #[error("unserializable type: {0}")]
    UnserializableType(String),

    /// Operation not available on this space (e.g. visiting a remote leaf).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Transport or I/O failure, or anything unclassified.
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Result alias used across the workspace.
pub type Expected<T> = Result<T, Error>;

impl Error {
    /// Stable string code used when the error crosses the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedInput(_) => "malformed_input",
            Self::InvalidPath(_) => "invalid_path",
            Self::InvalidType(_) => "invalid_type",
            Self::InvalidPermissions(_) => "invalid_permissions",
            Self::NoSuchPath(_) => "no_such_path",
            Self::NoObjectFound(_) => "no_object_found",
            Self::Timeout(_) => "timeout",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::UnserializableType(_) => "unserializable_type",
            Self::NotSupported(_) => "not_supported",
            Self::Unknown(_) => "unknown_error",
        }
    }

    /// Map a wire error code back to a local error kind.
    ///
    /// Codes minted by [`Error::code`] round-trip exactly; anything else
    /// (including future codes from newer peers) lands on [`Error::Unknown`].
    pub fn from_wire(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "malformed_input" => Self::MalformedInput(message),
            "invalid_path" => Self::InvalidPath(message),
            "invalid_type" => Self::InvalidType(message),
            "invalid_permissions" => Self::InvalidPermissions(message),
            "no_such_path" => Self::NoSuchPath(message),
            "no_object_found" => Self::NoObjectFound(message),
            "timeout" => Self::Timeout(message),
            "capacity_exceeded" => Self::CapacityExceeded(message),
            "unserializable_type" => Self::UnserializableType(message),
            "not_supported" => Self::NotSupported(message),
            _ => Self::Unknown(message),
        }
    }

    /// The message payload without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::MalformedInput(m)
            | Self::InvalidPath(m)
            | Self::InvalidType(m)
            | Self::InvalidPermissions(m)
            | Self::NoSuchPath(m)
            | Self::NoObjectFound(m)
            | Self::Timeout(m)
            | Self::CapacityExceeded(m)
            | Self::UnserializableType(m)
            | Self::NotSupported(m)
            | Self::Unknown(m) => m,
        }
    }

    /// `"<code>:<message>"` summary used in wire error payloads.
    pub fn summary(&self) -> String {
        if self.message().is_empty() {
            self.code().to_string()
        } else {
            format!("{}:{}", self.code(), self.message())
        }
    }
}
