//! Frame kinds and typed payload structs for the mount protocol.
//!
//! Struct fields mirror the JSON payloads one to one; see [`crate::json`]
//! for the exact field names and validation rules. All durations are
//! carried on the wire as non-negative millisecond integers.

use std::time::Duration;

use pathspace_types::{Error, Expected};

/// Protocol version carried on handshake frames only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self { major: 1, minor: 1 }
    }
}

/// How the peer authenticated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthKind {
    /// Mutual TLS; `proof` and `fingerprint` carry the peer certificate's
    /// SHA-256, `subject` its subject DN.
    #[default]
    MutualTls,
    /// Bearer token in `proof`.
    BearerToken,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MutualTls => "mtls",
            Self::BearerToken => "bearer",
        }
    }

    pub fn parse(value: &str) -> Expected<Self> {
        match value {
            "mtls" => Ok(Self::MutualTls),
            "bearer" => Ok(Self::BearerToken),
            _ => Err(Error::MalformedInput("auth.kind: unknown kind".into())),
        }
    }
}

/// Peer identity presented with a mount-open request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub kind: AuthKind,
    pub subject: String,
    pub audience: String,
    pub proof: String,
    pub fingerprint: String,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
}

/// One requested capability with optional parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub name: String,
    pub parameters: Vec<String>,
}

impl CapabilityRequest {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
        }
    }
}

/// Wire error payload embedded in responses or sent as an `Error` frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub retry_after: Duration,
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable,
            retry_after: Duration::ZERO,
        }
    }

    /// Build the payload for a local error using its stable wire code.
    pub fn from_error(error: &Error) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.message().to_string(),
            retryable: matches!(error, Error::Timeout(_) | Error::CapacityExceeded(_)),
            retry_after: Duration::ZERO,
        }
    }
}

/// A typed value crossing the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValuePayload {
    /// One of the `ENCODING_*` tags.
    pub encoding: String,
    /// Registry type name; required for typed and string encodings.
    pub type_name: String,
    /// Optional schema annotation.
    pub schema_hint: Option<String>,
    /// Base64 of the value bytes; empty for void sentinels.
    pub data: String,
}

impl Default for ValuePayload {
    fn default() -> Self {
        Self {
            encoding: crate::ENCODING_TYPED.to_string(),
            type_name: String::new(),
            schema_hint: None,
            data: String::new(),
        }
    }
}

/// Read consistency selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadConsistencyMode {
    #[default]
    Latest,
    AtLeastVersion,
}

impl ReadConsistencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::AtLeastVersion => "at_least_version",
        }
    }

    pub fn parse(value: &str) -> Expected<Self> {
        match value {
            "latest" => Ok(Self::Latest),
            "at_least_version" => Ok(Self::AtLeastVersion),
            _ => Err(Error::MalformedInput(
                "consistency.mode: unknown mode".into(),
            )),
        }
    }
}

/// Read consistency requirement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadConsistency {
    pub mode: ReadConsistencyMode,
    pub at_least_version: Option<u64>,
}

/// Session handshake request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountOpenRequest {
    pub version: ProtocolVersion,
    pub request_id: String,
    pub client_id: String,
    pub alias: String,
    pub export_root: String,
    pub capabilities: Vec<CapabilityRequest>,
    pub auth: AuthContext,
}

/// Session handshake response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountOpenResponse {
    pub version: ProtocolVersion,
    pub request_id: String,
    pub accepted: bool,
    pub session_id: String,
    pub granted_capabilities: Vec<String>,
    pub lease_expires_ms: u64,
    pub heartbeat_interval: Duration,
    pub error: Option<ErrorPayload>,
}

/// Read a node, optionally with value and children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub request_id: String,
    pub session_id: String,
    pub path: String,
    pub include_value: bool,
    pub include_children: bool,
    pub include_diagnostics: bool,
    pub consistency: Option<ReadConsistency>,
    pub type_name: Option<String>,
}

impl Default for ReadRequest {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            session_id: String::new(),
            path: String::new(),
            include_value: true,
            include_children: false,
            include_diagnostics: false,
            consistency: None,
            type_name: None,
        }
    }
}

/// Result of a read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadResponse {
    pub request_id: String,
    pub path: String,
    pub version: u64,
    pub value: Option<ValuePayload>,
    pub children: Vec<String>,
    pub children_included: bool,
    pub error: Option<ErrorPayload>,
}

/// Insert a value at a path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertRequest {
    pub request_id: String,
    pub session_id: String,
    pub path: String,
    pub type_name: String,
    pub value: ValuePayload,
}

/// Result of an insert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertResponse {
    pub request_id: String,
    pub success: bool,
    pub values_inserted: u32,
    pub spaces_inserted: u32,
    pub tasks_inserted: u32,
    pub error: Option<ErrorPayload>,
}

/// Destructively pop up to `max_items` values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TakeRequest {
    pub request_id: String,
    pub session_id: String,
    pub path: String,
    pub type_name: Option<String>,
    pub max_items: u32,
    pub do_block: bool,
    pub timeout: Duration,
}

impl Default for TakeRequest {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            session_id: String::new(),
            path: String::new(),
            type_name: None,
            max_items: 1,
            do_block: false,
            timeout: Duration::ZERO,
        }
    }
}

/// Result of a take.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TakeResponse {
    pub request_id: String,
    pub success: bool,
    pub values: Vec<ValuePayload>,
    pub error: Option<ErrorPayload>,
}

/// Subscribe for exactly one notification on a path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WaitSubscribeRequest {
    pub request_id: String,
    pub session_id: String,
    pub subscription_id: String,
    pub path: String,
    pub include_value: bool,
    pub include_children: bool,
    pub after_version: Option<u64>,
}

/// Acceptance or rejection of a wait subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WaitSubscribeAck {
    pub subscription_id: String,
    pub accepted: bool,
    pub error: Option<ErrorPayload>,
}

/// One delivered path mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Notification {
    pub subscription_id: String,
    pub path: String,
    pub version: u64,
    pub deleted: bool,
    pub type_name: Option<String>,
    pub value: Option<ValuePayload>,
}

/// Lease renewal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub session_id: String,
    pub sequence: u64,
}

/// Batched notification poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationStreamRequest {
    pub request_id: String,
    pub session_id: String,
    pub timeout: Duration,
    pub max_batch: usize,
}

impl Default for NotificationStreamRequest {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            session_id: String::new(),
            timeout: Duration::ZERO,
            max_batch: 32,
        }
    }
}

/// Batched notification poll result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotificationStreamResponse {
    pub request_id: String,
    pub session_id: String,
    pub notifications: Vec<Notification>,
    pub error: Option<ErrorPayload>,
}

/// Discriminant of a wire frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    MountOpenRequest,
    MountOpenResponse,
    ReadRequest,
    ReadResponse,
    InsertRequest,
    InsertResponse,
    TakeRequest,
    TakeResponse,
    WaitSubscribeRequest,
    WaitSubscribeAck,
    Notification,
    NotificationStreamRequest,
    NotificationStreamResponse,
    Heartbeat,
    Error,
}

impl FrameKind {
    /// The wire name of this frame kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MountOpenRequest => "MountOpenRequest",
            Self::MountOpenResponse => "MountOpenResponse",
            Self::ReadRequest => "ReadRequest",
            Self::ReadResponse => "ReadResponse",
            Self::InsertRequest => "InsertRequest",
            Self::InsertResponse => "InsertResponse",
            Self::TakeRequest => "TakeRequest",
            Self::TakeResponse => "TakeResponse",
            Self::WaitSubscribeRequest => "WaitSubscribeRequest",
            Self::WaitSubscribeAck => "WaitSubscribeAck",
            Self::Notification => "Notification",
            Self::NotificationStreamRequest => "NotificationStreamRequest",
            Self::NotificationStreamResponse => "NotificationStreamResponse",
            Self::Heartbeat => "Heartbeat",
            Self::Error => "Error",
        }
    }

    /// Parse a wire frame name.
    pub fn parse(name: &str) -> Expected<Self> {
        match name {
            "MountOpenRequest" => Ok(Self::MountOpenRequest),
            "MountOpenResponse" => Ok(Self::MountOpenResponse),
            "ReadRequest" => Ok(Self::ReadRequest),
            "ReadResponse" => Ok(Self::ReadResponse),
            "InsertRequest" => Ok(Self::InsertRequest),
            "InsertResponse" => Ok(Self::InsertResponse),
            "TakeRequest" => Ok(Self::TakeRequest),
            "TakeResponse" => Ok(Self::TakeResponse),
            "WaitSubscribeRequest" => Ok(Self::WaitSubscribeRequest),
            "WaitSubscribeAck" => Ok(Self::WaitSubscribeAck),
            "Notification" => Ok(Self::Notification),
            "NotificationStreamRequest" => Ok(Self::NotificationStreamRequest),
            "NotificationStreamResponse" => Ok(Self::NotificationStreamResponse),
            "Heartbeat" => Ok(Self::Heartbeat),
            "Error" => Ok(Self::Error),
            _ => Err(Error::MalformedInput("type: unknown frame type".into())),
        }
    }
}

/// A complete wire frame: envelope timestamp plus typed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFrame {
    /// Sender wall-clock milliseconds; refreshed by the transport on send.
    pub sent_at_ms: u64,
    pub payload: FramePayload,
}

/// The typed payload of a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FramePayload {
    MountOpenRequest(MountOpenRequest),
    MountOpenResponse(MountOpenResponse),
    ReadRequest(ReadRequest),
    ReadResponse(ReadResponse),
    InsertRequest(InsertRequest),
    InsertResponse(InsertResponse),
    TakeRequest(TakeRequest),
    TakeResponse(TakeResponse),
    WaitSubscribeRequest(WaitSubscribeRequest),
    WaitSubscribeAck(WaitSubscribeAck),
    Notification(Notification),
    NotificationStreamRequest(NotificationStreamRequest),
    NotificationStreamResponse(NotificationStreamResponse),
    Heartbeat(Heartbeat),
    Error(ErrorPayload),
}

impl FramePayload {
    /// The frame kind this payload serializes under.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::MountOpenRequest(_) => FrameKind::MountOpenRequest,
            Self::MountOpenResponse(_) => FrameKind::MountOpenResponse,
            Self::ReadRequest(_) => FrameKind::ReadRequest,
            Self::ReadResponse(_) => FrameKind::ReadResponse,
            Self::InsertRequest(_) => FrameKind::InsertRequest,
            Self::InsertResponse(_) => FrameKind::InsertResponse,
            Self::TakeRequest(_) => FrameKind::TakeRequest,
            Self::TakeResponse(_) => FrameKind::TakeResponse,
            Self::WaitSubscribeRequest(_) => FrameKind::WaitSubscribeRequest,
            Self::WaitSubscribeAck(_) => FrameKind::WaitSubscribeAck,
            Self::Notification(_) => FrameKind::Notification,
            Self::NotificationStreamRequest(_) => FrameKind::NotificationStreamRequest,
            Self::NotificationStreamResponse(_) => FrameKind::NotificationStreamResponse,
            Self::Heartbeat(_) => FrameKind::Heartbeat,
            Self::Error(_) => FrameKind::Error,
        }
    }
}

impl RemoteFrame {
    /// Wrap a payload with a zero timestamp; the transport stamps it on
    /// send.
    pub fn new(payload: FramePayload) -> Self {
        Self {
            sent_at_ms: 0,
            payload,
        }
    }
}
