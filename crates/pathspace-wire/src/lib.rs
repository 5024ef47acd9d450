//! # pathspace-wire
//!
//! Wire protocol for the PathSpace remote mount subsystem.
//!
//! Frames travel over a mutually-authenticated TLS byte stream as a 4-byte
//! **big-endian** length prefix followed by exactly that many bytes of UTF-8
//! JSON. The JSON envelope is always
//!
//! ```text
//! {"type": "<FrameKind>", "sent_at_ms": <u64>, "payload": { ... }}
//! ```
//!
//! - **[`frames`]** — frame kinds and every typed request/response struct.
//! - **[`json`]** — strict, field-by-field envelope (de)serialization.
//!   Missing required fields, wrong JSON types, empty required strings,
//!   malformed identifiers, non-absolute paths, and negative durations all
//!   fail with `MalformedInput` naming the offending field.
//! - **[`base64`]** — the codec used at the JSON boundary for value bytes.
//! - **[`framing`]** — length-prefix helpers shared by both transports.
//! - **[`compat`]** — the `PATHSPACE_REMOTE_TYPED_PAYLOADS` legacy-payload
//!   switch.

pub mod base64;
pub mod compat;
pub mod frames;
pub mod framing;
pub mod json;

pub use compat::{default_payload_compatibility, PayloadCompatibility};
pub use frames::*;
pub use json::{deserialize_frame, serialize_frame};

/// Encoding tag for registry-typed, codec-framed value bytes.
pub const ENCODING_TYPED: &str = "typed/slidingbuffer";

/// Encoding tag for legacy raw string payloads.
pub const ENCODING_STRING: &str = "string/base64";

/// Encoding tag for execution sentinels carrying no value bytes.
pub const ENCODING_VOID: &str = "void/sentinel";

/// Upper bound on `max_items` in a take request; larger values are clamped.
pub const MAX_TAKE_BATCH: u32 = 64;
