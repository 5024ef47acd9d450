//! Strict JSON envelope (de)serialization for wire frames.
//!
//! Serialization and parsing are field-by-field rather than derived: every
//! failure names the offending field, and both directions enforce the same
//! rules, so a frame that serializes will parse on a conforming peer.
//!
//! Validation rules:
//! - required fields must be present and of the right JSON type;
//! - required strings must be non-empty;
//! - identifiers (`request_id`, `session_id`, `subscription_id`) are limited
//!   to `[A-Za-z0-9_:.-]`;
//! - aliases are limited to `[A-Za-z0-9_-]`;
//! - paths must pass the absolute-path validator;
//! - all durations are non-negative millisecond integers.

use std::time::Duration;

use pathspace_types::{path as path_util, Error, Expected};
use serde_json::{json, Map, Value};

use crate::frames::*;

type Object = Map<String, Value>;

/// Serialize a frame into the JSON envelope text.
pub fn serialize_frame(frame: &RemoteFrame) -> Expected<String> {
    let payload = payload_to_json(&frame.payload)?;
    let envelope = json!({
        "type": frame.payload.kind().as_str(),
        "sent_at_ms": frame.sent_at_ms,
        "payload": payload,
    });
    serde_json::to_string(&envelope)
        .map_err(|e| Error::MalformedInput(format!("frame: serialization failed: {e}")))
}

/// Parse the JSON envelope text into a frame.
pub fn deserialize_frame(text: &str) -> Expected<RemoteFrame> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::MalformedInput(format!("frame: invalid JSON: {e}")))?;
    let envelope = ensure_object(&value, "frame")?;
    let kind = FrameKind::parse(&read_string(envelope, "type")?)?;
    let sent_at_ms = read_u64(envelope, "sent_at_ms")?;
    let payload_value = envelope
        .get("payload")
        .ok_or_else(|| required("payload"))?;
    let payload_obj = ensure_object(payload_value, "payload")?;
    let payload = payload_from_json(kind, payload_obj)?;
    Ok(RemoteFrame {
        sent_at_ms,
        payload,
    })
}

fn payload_to_json(payload: &FramePayload) -> Expected<Value> {
    match payload {
        FramePayload::MountOpenRequest(p) => mount_open_request_to_json(p),
        FramePayload::MountOpenResponse(p) => mount_open_response_to_json(p),
        FramePayload::ReadRequest(p) => read_request_to_json(p),
        FramePayload::ReadResponse(p) => read_response_to_json(p),
        FramePayload::InsertRequest(p) => insert_request_to_json(p),
        FramePayload::InsertResponse(p) => insert_response_to_json(p),
        FramePayload::TakeRequest(p) => take_request_to_json(p),
        FramePayload::TakeResponse(p) => take_response_to_json(p),
        FramePayload::WaitSubscribeRequest(p) => wait_subscribe_request_to_json(p),
        FramePayload::WaitSubscribeAck(p) => wait_subscribe_ack_to_json(p),
        FramePayload::Notification(p) => notification_to_json(p),
        FramePayload::NotificationStreamRequest(p) => stream_request_to_json(p),
        FramePayload::NotificationStreamResponse(p) => stream_response_to_json(p),
        FramePayload::Heartbeat(p) => heartbeat_to_json(p),
        FramePayload::Error(p) => Ok(error_payload_to_json(p)),
    }
}

fn payload_from_json(kind: FrameKind, obj: &Object) -> Expected<FramePayload> {
    Ok(match kind {
        FrameKind::MountOpenRequest => {
            FramePayload::MountOpenRequest(mount_open_request_from_json(obj)?)
        }
        FrameKind::MountOpenResponse => {
            FramePayload::MountOpenResponse(mount_open_response_from_json(obj)?)
        }
        FrameKind::ReadRequest => FramePayload::ReadRequest(read_request_from_json(obj)?),
        FrameKind::ReadResponse => FramePayload::ReadResponse(read_response_from_json(obj)?),
        FrameKind::InsertRequest => FramePayload::InsertRequest(insert_request_from_json(obj)?),
        FrameKind::InsertResponse => {
            FramePayload::InsertResponse(insert_response_from_json(obj)?)
        }
        FrameKind::TakeRequest => FramePayload::TakeRequest(take_request_from_json(obj)?),
        FrameKind::TakeResponse => FramePayload::TakeResponse(take_response_from_json(obj)?),
        FrameKind::WaitSubscribeRequest => {
            FramePayload::WaitSubscribeRequest(wait_subscribe_request_from_json(obj)?)
        }
        FrameKind::WaitSubscribeAck => {
            FramePayload::WaitSubscribeAck(wait_subscribe_ack_from_json(obj)?)
        }
        FrameKind::Notification => FramePayload::Notification(notification_from_json(obj)?),
        FrameKind::NotificationStreamRequest => {
            FramePayload::NotificationStreamRequest(stream_request_from_json(obj)?)
        }
        FrameKind::NotificationStreamResponse => {
            FramePayload::NotificationStreamResponse(stream_response_from_json(obj)?)
        }
        FrameKind::Heartbeat => FramePayload::Heartbeat(heartbeat_from_json(obj)?),
        FrameKind::Error => FramePayload::Error(error_payload_from_json(obj)?),
    })
}

// ---------------------------------------------------------------------------
// Per-struct codecs
// ---------------------------------------------------------------------------

fn version_to_json(version: &ProtocolVersion) -> Value {
    json!({"major": version.major, "minor": version.minor})
}

fn version_from_json(obj: &Object, field: &str) -> Expected<ProtocolVersion> {
    let value = obj.get(field).ok_or_else(|| required(field))?;
    let version = ensure_object(value, field)?;
    Ok(ProtocolVersion {
        major: read_u16(version, "major")?,
        minor: read_u16(version, "minor")?,
    })
}

fn auth_to_json(auth: &AuthContext) -> Expected<Value> {
    ensure_non_empty(&auth.subject, "auth.subject")?;
    ensure_non_empty(&auth.proof, "auth.proof")?;
    let mut obj = Map::new();
    obj.insert("kind".into(), auth.kind.as_str().into());
    obj.insert("subject".into(), auth.subject.clone().into());
    obj.insert("proof".into(), auth.proof.clone().into());
    obj.insert("issued_at_ms".into(), auth.issued_at_ms.into());
    obj.insert("expires_at_ms".into(), auth.expires_at_ms.into());
    if !auth.audience.is_empty() {
        obj.insert("audience".into(), auth.audience.clone().into());
    }
    if !auth.fingerprint.is_empty() {
        obj.insert("fingerprint".into(), auth.fingerprint.clone().into());
    }
    Ok(Value::Object(obj))
}

fn auth_from_json(obj: &Object) -> Expected<AuthContext> {
    let value = obj.get("auth").ok_or_else(|| required("auth"))?;
    let auth = ensure_object(value, "auth")?;
    let context = AuthContext {
        kind: AuthKind::parse(&read_string(auth, "kind")?)?,
        subject: read_string(auth, "subject")?,
        audience: read_opt_string(auth, "audience")?.unwrap_or_default(),
        proof: read_string(auth, "proof")?,
        fingerprint: read_opt_string(auth, "fingerprint")?.unwrap_or_default(),
        issued_at_ms: read_u64(auth, "issued_at_ms")?,
        expires_at_ms: read_u64(auth, "expires_at_ms")?,
    };
    ensure_non_empty(&context.subject, "auth.subject")?;
    ensure_non_empty(&context.proof, "auth.proof")?;
    Ok(context)
}

fn capability_to_json(capability: &CapabilityRequest) -> Expected<Value> {
    ensure_non_empty(&capability.name, "capabilities.name")?;
    Ok(json!({
        "name": capability.name,
        "parameters": capability.parameters,
    }))
}

fn capabilities_from_json(obj: &Object) -> Expected<Vec<CapabilityRequest>> {
    let value = obj
        .get("capabilities")
        .ok_or_else(|| required("capabilities"))?;
    let entries = value
        .as_array()
        .ok_or_else(|| wrong_type("capabilities", "an array"))?;
    let mut capabilities = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = ensure_object(entry, "capabilities")?;
        let capability = CapabilityRequest {
            name: read_string(entry, "name")?,
            parameters: read_string_array(entry, "parameters")?,
        };
        ensure_non_empty(&capability.name, "capabilities.name")?;
        capabilities.push(capability);
    }
    Ok(capabilities)
}

fn error_payload_to_json(error: &ErrorPayload) -> Value {
    let mut obj = Map::new();
    obj.insert("code".into(), error.code.clone().into());
    obj.insert("message".into(), error.message.clone().into());
    obj.insert("retryable".into(), error.retryable.into());
    if !error.retry_after.is_zero() {
        obj.insert(
            "retry_after_ms".into(),
            (error.retry_after.as_millis() as u64).into(),
        );
    }
    Value::Object(obj)
}

fn error_payload_from_json(obj: &Object) -> Expected<ErrorPayload> {
    Ok(ErrorPayload {
        code: read_string(obj, "code")?,
        message: read_string(obj, "message")?,
        retryable: read_bool_or(obj, "retryable", false)?,
        retry_after: Duration::from_millis(read_opt_u64(obj, "retry_after_ms")?.unwrap_or(0)),
    })
}

fn opt_error_to_json(obj: &mut Object, error: &Option<ErrorPayload>) {
    if let Some(error) = error {
        obj.insert("error".into(), error_payload_to_json(error));
    }
}

fn opt_error_from_json(obj: &Object) -> Expected<Option<ErrorPayload>> {
    match obj.get("error") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let error = ensure_object(value, "error")?;
            Ok(Some(error_payload_from_json(error)?))
        }
    }
}

fn value_payload_to_json(payload: &ValuePayload, field: &str) -> Expected<Value> {
    if payload.encoding.is_empty() {
        return Err(Error::MalformedInput(format!(
            "{field}.encoding: must not be empty"
        )));
    }
    if payload.encoding != crate::ENCODING_VOID && payload.type_name.is_empty() {
        return Err(Error::MalformedInput(format!(
            "{field}.type_name: must not be empty"
        )));
    }
    let mut obj = Map::new();
    obj.insert("encoding".into(), payload.encoding.clone().into());
    obj.insert("type_name".into(), payload.type_name.clone().into());
    obj.insert("data".into(), payload.data.clone().into());
    if let Some(hint) = &payload.schema_hint {
        obj.insert("schema_hint".into(), hint.clone().into());
    }
    Ok(Value::Object(obj))
}

fn value_payload_from_json(value: &Value, field: &str) -> Expected<ValuePayload> {
    let obj = ensure_object(value, field)?;
    let payload = ValuePayload {
        encoding: read_string(obj, "encoding")?,
        type_name: read_string_allow_empty(obj, "type_name")?,
        schema_hint: read_opt_string(obj, "schema_hint")?,
        data: read_string_allow_empty(obj, "data")?,
    };
    if payload.encoding.is_empty() {
        return Err(Error::MalformedInput(format!(
            "{field}.encoding: must not be empty"
        )));
    }
    if payload.encoding != crate::ENCODING_VOID && payload.type_name.is_empty() {
        return Err(Error::MalformedInput(format!(
            "{field}.type_name: must not be empty"
        )));
    }
    Ok(payload)
}

fn opt_value_from_json(obj: &Object, field: &str) -> Expected<Option<ValuePayload>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(value_payload_from_json(value, field)?)),
    }
}

fn consistency_to_json(consistency: &ReadConsistency) -> Value {
    let mut obj = Map::new();
    obj.insert("mode".into(), consistency.mode.as_str().into());
    if consistency.mode == ReadConsistencyMode::AtLeastVersion {
        if let Some(version) = consistency.at_least_version {
            obj.insert("version".into(), version.into());
        }
    }
    Value::Object(obj)
}

fn consistency_from_json(obj: &Object) -> Expected<Option<ReadConsistency>> {
    match obj.get("consistency") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let consistency = ensure_object(value, "consistency")?;
            Ok(Some(ReadConsistency {
                mode: ReadConsistencyMode::parse(&read_string(consistency, "mode")?)?,
                at_least_version: read_opt_u64(consistency, "version")?,
            }))
        }
    }
}

fn mount_open_request_to_json(request: &MountOpenRequest) -> Expected<Value> {
    path_util::validate_alias(&request.alias)?;
    path_util::validate_absolute(&request.export_root)?;
    ensure_non_empty(&request.client_id, "client_id")?;
    path_util::validate_identifier(&request.request_id, "request_id")?;
    let mut obj = Map::new();
    obj.insert("version".into(), version_to_json(&request.version));
    obj.insert("request_id".into(), request.request_id.clone().into());
    obj.insert("client_id".into(), request.client_id.clone().into());
    obj.insert("mount_alias".into(), request.alias.clone().into());
    obj.insert("export_root".into(), request.export_root.clone().into());
    let mut capabilities = Vec::with_capacity(request.capabilities.len());
    for capability in &request.capabilities {
        capabilities.push(capability_to_json(capability)?);
    }
    obj.insert("capabilities".into(), Value::Array(capabilities));
    obj.insert("auth".into(), auth_to_json(&request.auth)?);
    Ok(Value::Object(obj))
}

fn mount_open_request_from_json(obj: &Object) -> Expected<MountOpenRequest> {
    let request = MountOpenRequest {
        version: version_from_json(obj, "version")?,
        request_id: read_string(obj, "request_id")?,
        client_id: read_string(obj, "client_id")?,
        alias: read_string(obj, "mount_alias")?,
        export_root: read_string(obj, "export_root")?,
        capabilities: capabilities_from_json(obj)?,
        auth: auth_from_json(obj)?,
    };
    path_util::validate_alias(&request.alias)?;
    path_util::validate_absolute(&request.export_root)?;
    ensure_non_empty(&request.client_id, "client_id")?;
    path_util::validate_identifier(&request.request_id, "request_id")?;
    Ok(request)
}

fn mount_open_response_to_json(response: &MountOpenResponse) -> Expected<Value> {
    path_util::validate_identifier(&response.request_id, "request_id")?;
    let mut obj = Map::new();
    obj.insert("version".into(), version_to_json(&response.version));
    obj.insert("request_id".into(), response.request_id.clone().into());
    obj.insert("accepted".into(), response.accepted.into());
    obj.insert("session_id".into(), response.session_id.clone().into());
    obj.insert(
        "granted_capabilities".into(),
        response.granted_capabilities.clone().into(),
    );
    obj.insert("lease_expires_ms".into(), response.lease_expires_ms.into());
    obj.insert(
        "heartbeat_interval_ms".into(),
        (response.heartbeat_interval.as_millis() as u64).into(),
    );
    opt_error_to_json(&mut obj, &response.error);
    Ok(Value::Object(obj))
}

fn mount_open_response_from_json(obj: &Object) -> Expected<MountOpenResponse> {
    let response = MountOpenResponse {
        version: version_from_json(obj, "version")?,
        request_id: read_string(obj, "request_id")?,
        accepted: read_bool(obj, "accepted")?,
        session_id: read_string_allow_empty(obj, "session_id")?,
        granted_capabilities: read_string_array(obj, "granted_capabilities")?,
        lease_expires_ms: read_u64(obj, "lease_expires_ms")?,
        heartbeat_interval: Duration::from_millis(read_u64(obj, "heartbeat_interval_ms")?),
        error: opt_error_from_json(obj)?,
    };
    path_util::validate_identifier(&response.request_id, "request_id")?;
    if response.accepted {
        path_util::validate_identifier(&response.session_id, "session_id")?;
    }
    Ok(response)
}

fn read_request_to_json(request: &ReadRequest) -> Expected<Value> {
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    path_util::validate_absolute(&request.path)?;
    let mut obj = Map::new();
    obj.insert("request_id".into(), request.request_id.clone().into());
    obj.insert("session_id".into(), request.session_id.clone().into());
    obj.insert("path".into(), request.path.clone().into());
    obj.insert("include_value".into(), request.include_value.into());
    obj.insert("include_children".into(), request.include_children.into());
    obj.insert(
        "include_diagnostics".into(),
        request.include_diagnostics.into(),
    );
    if let Some(consistency) = &request.consistency {
        obj.insert("consistency".into(), consistency_to_json(consistency));
    }
    if let Some(type_name) = &request.type_name {
        obj.insert("type_name".into(), type_name.clone().into());
    }
    Ok(Value::Object(obj))
}

fn read_request_from_json(obj: &Object) -> Expected<ReadRequest> {
    let request = ReadRequest {
        request_id: read_string(obj, "request_id")?,
        session_id: read_string(obj, "session_id")?,
        path: read_string(obj, "path")?,
        include_value: read_bool_or(obj, "include_value", true)?,
        include_children: read_bool_or(obj, "include_children", false)?,
        include_diagnostics: read_bool_or(obj, "include_diagnostics", false)?,
        consistency: consistency_from_json(obj)?,
        type_name: read_opt_string(obj, "type_name")?,
    };
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    path_util::validate_absolute(&request.path)?;
    Ok(request)
}

fn read_response_to_json(response: &ReadResponse) -> Expected<Value> {
    path_util::validate_identifier(&response.request_id, "request_id")?;
    path_util::validate_absolute(&response.path)?;
    let mut obj = Map::new();
    obj.insert("request_id".into(), response.request_id.clone().into());
    obj.insert("path".into(), response.path.clone().into());
    obj.insert("version".into(), response.version.into());
    if let Some(value) = &response.value {
        obj.insert("value".into(), value_payload_to_json(value, "value")?);
    }
    obj.insert("children".into(), response.children.clone().into());
    obj.insert(
        "children_included".into(),
        response.children_included.into(),
    );
    opt_error_to_json(&mut obj, &response.error);
    Ok(Value::Object(obj))
}

fn read_response_from_json(obj: &Object) -> Expected<ReadResponse> {
    let response = ReadResponse {
        request_id: read_string(obj, "request_id")?,
        path: read_string(obj, "path")?,
        version: read_u64(obj, "version")?,
        value: opt_value_from_json(obj, "value")?,
        children: read_string_array(obj, "children")?,
        children_included: read_bool_or(obj, "children_included", false)?,
        error: opt_error_from_json(obj)?,
    };
    path_util::validate_identifier(&response.request_id, "request_id")?;
    path_util::validate_absolute(&response.path)?;
    Ok(response)
}

fn insert_request_to_json(request: &InsertRequest) -> Expected<Value> {
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    path_util::validate_absolute(&request.path)?;
    ensure_non_empty(&request.type_name, "type_name")?;
    let mut obj = Map::new();
    obj.insert("request_id".into(), request.request_id.clone().into());
    obj.insert("session_id".into(), request.session_id.clone().into());
    obj.insert("path".into(), request.path.clone().into());
    obj.insert("type_name".into(), request.type_name.clone().into());
    obj.insert("value".into(), value_payload_to_json(&request.value, "value")?);
    Ok(Value::Object(obj))
}

fn insert_request_from_json(obj: &Object) -> Expected<InsertRequest> {
    let value = obj.get("value").ok_or_else(|| required("value"))?;
    let request = InsertRequest {
        request_id: read_string(obj, "request_id")?,
        session_id: read_string(obj, "session_id")?,
        path: read_string(obj, "path")?,
        type_name: read_string(obj, "type_name")?,
        value: value_payload_from_json(value, "value")?,
    };
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    path_util::validate_absolute(&request.path)?;
    Ok(request)
}

fn insert_response_to_json(response: &InsertResponse) -> Expected<Value> {
    path_util::validate_identifier(&response.request_id, "request_id")?;
    let mut obj = Map::new();
    obj.insert("request_id".into(), response.request_id.clone().into());
    obj.insert("success".into(), response.success.into());
    obj.insert("values_inserted".into(), response.values_inserted.into());
    obj.insert("spaces_inserted".into(), response.spaces_inserted.into());
    obj.insert("tasks_inserted".into(), response.tasks_inserted.into());
    opt_error_to_json(&mut obj, &response.error);
    Ok(Value::Object(obj))
}

fn insert_response_from_json(obj: &Object) -> Expected<InsertResponse> {
    let response = InsertResponse {
        request_id: read_string(obj, "request_id")?,
        success: read_bool(obj, "success")?,
        values_inserted: read_u32(obj, "values_inserted")?,
        spaces_inserted: read_u32(obj, "spaces_inserted")?,
        tasks_inserted: read_u32(obj, "tasks_inserted")?,
        error: opt_error_from_json(obj)?,
    };
    path_util::validate_identifier(&response.request_id, "request_id")?;
    Ok(response)
}

fn take_request_to_json(request: &TakeRequest) -> Expected<Value> {
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    path_util::validate_absolute(&request.path)?;
    let mut obj = Map::new();
    obj.insert("request_id".into(), request.request_id.clone().into());
    obj.insert("session_id".into(), request.session_id.clone().into());
    obj.insert("path".into(), request.path.clone().into());
    if let Some(type_name) = &request.type_name {
        obj.insert("type_name".into(), type_name.clone().into());
    }
    obj.insert("max_items".into(), request.max_items.into());
    obj.insert("do_block".into(), request.do_block.into());
    obj.insert(
        "timeout_ms".into(),
        (request.timeout.as_millis().min(u128::from(u64::MAX)) as u64).into(),
    );
    Ok(Value::Object(obj))
}

fn take_request_from_json(obj: &Object) -> Expected<TakeRequest> {
    let request = TakeRequest {
        request_id: read_string(obj, "request_id")?,
        session_id: read_string(obj, "session_id")?,
        path: read_string(obj, "path")?,
        type_name: read_opt_string(obj, "type_name")?,
        max_items: read_u32(obj, "max_items")?,
        do_block: read_bool_or(obj, "do_block", false)?,
        timeout: Duration::from_millis(read_u64(obj, "timeout_ms")?),
    };
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    path_util::validate_absolute(&request.path)?;
    Ok(request)
}

fn take_response_to_json(response: &TakeResponse) -> Expected<Value> {
    path_util::validate_identifier(&response.request_id, "request_id")?;
    let mut obj = Map::new();
    obj.insert("request_id".into(), response.request_id.clone().into());
    obj.insert("success".into(), response.success.into());
    let mut values = Vec::with_capacity(response.values.len());
    for value in &response.values {
        values.push(value_payload_to_json(value, "values")?);
    }
    obj.insert("values".into(), Value::Array(values));
    opt_error_to_json(&mut obj, &response.error);
    Ok(Value::Object(obj))
}

fn take_response_from_json(obj: &Object) -> Expected<TakeResponse> {
    let entries = obj
        .get("values")
        .ok_or_else(|| required("values"))?
        .as_array()
        .ok_or_else(|| wrong_type("values", "an array"))?;
    let mut values = Vec::with_capacity(entries.len());
    for entry in entries {
        values.push(value_payload_from_json(entry, "values")?);
    }
    let response = TakeResponse {
        request_id: read_string(obj, "request_id")?,
        success: read_bool(obj, "success")?,
        values,
        error: opt_error_from_json(obj)?,
    };
    path_util::validate_identifier(&response.request_id, "request_id")?;
    Ok(response)
}

fn wait_subscribe_request_to_json(request: &WaitSubscribeRequest) -> Expected<Value> {
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    path_util::validate_identifier(&request.subscription_id, "subscription_id")?;
    path_util::validate_absolute(&request.path)?;
    let mut obj = Map::new();
    obj.insert("request_id".into(), request.request_id.clone().into());
    obj.insert("session_id".into(), request.session_id.clone().into());
    obj.insert(
        "subscription_id".into(),
        request.subscription_id.clone().into(),
    );
    obj.insert("path".into(), request.path.clone().into());
    obj.insert("include_value".into(), request.include_value.into());
    obj.insert("include_children".into(), request.include_children.into());
    if let Some(after) = request.after_version {
        obj.insert("after_version".into(), after.into());
    }
    Ok(Value::Object(obj))
}

fn wait_subscribe_request_from_json(obj: &Object) -> Expected<WaitSubscribeRequest> {
    let request = WaitSubscribeRequest {
        request_id: read_string(obj, "request_id")?,
        session_id: read_string(obj, "session_id")?,
        subscription_id: read_string(obj, "subscription_id")?,
        path: read_string(obj, "path")?,
        include_value: read_bool_or(obj, "include_value", false)?,
        include_children: read_bool_or(obj, "include_children", false)?,
        after_version: read_opt_u64(obj, "after_version")?,
    };
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    path_util::validate_identifier(&request.subscription_id, "subscription_id")?;
    path_util::validate_absolute(&request.path)?;
    Ok(request)
}

fn wait_subscribe_ack_to_json(ack: &WaitSubscribeAck) -> Expected<Value> {
    path_util::validate_identifier(&ack.subscription_id, "subscription_id")?;
    let mut obj = Map::new();
    obj.insert("subscription_id".into(), ack.subscription_id.clone().into());
    obj.insert("accepted".into(), ack.accepted.into());
    opt_error_to_json(&mut obj, &ack.error);
    Ok(Value::Object(obj))
}

fn wait_subscribe_ack_from_json(obj: &Object) -> Expected<WaitSubscribeAck> {
    let ack = WaitSubscribeAck {
        subscription_id: read_string(obj, "subscription_id")?,
        accepted: read_bool(obj, "accepted")?,
        error: opt_error_from_json(obj)?,
    };
    path_util::validate_identifier(&ack.subscription_id, "subscription_id")?;
    Ok(ack)
}

fn notification_to_json(notification: &Notification) -> Expected<Value> {
    path_util::validate_identifier(&notification.subscription_id, "subscription_id")?;
    path_util::validate_absolute(&notification.path)?;
    let mut obj = Map::new();
    obj.insert(
        "subscription_id".into(),
        notification.subscription_id.clone().into(),
    );
    obj.insert("path".into(), notification.path.clone().into());
    obj.insert("version".into(), notification.version.into());
    obj.insert("deleted".into(), notification.deleted.into());
    if let Some(type_name) = &notification.type_name {
        obj.insert("type_name".into(), type_name.clone().into());
    }
    if let Some(value) = &notification.value {
        obj.insert("value".into(), value_payload_to_json(value, "value")?);
    }
    Ok(Value::Object(obj))
}

fn notification_from_json(obj: &Object) -> Expected<Notification> {
    let notification = Notification {
        subscription_id: read_string(obj, "subscription_id")?,
        path: read_string(obj, "path")?,
        version: read_u64(obj, "version")?,
        deleted: read_bool_or(obj, "deleted", false)?,
        type_name: read_opt_string(obj, "type_name")?,
        value: opt_value_from_json(obj, "value")?,
    };
    path_util::validate_identifier(&notification.subscription_id, "subscription_id")?;
    path_util::validate_absolute(&notification.path)?;
    Ok(notification)
}

fn heartbeat_to_json(heartbeat: &Heartbeat) -> Expected<Value> {
    path_util::validate_identifier(&heartbeat.session_id, "session_id")?;
    Ok(json!({
        "session_id": heartbeat.session_id,
        "sequence": heartbeat.sequence,
    }))
}

fn heartbeat_from_json(obj: &Object) -> Expected<Heartbeat> {
    let heartbeat = Heartbeat {
        session_id: read_string(obj, "session_id")?,
        sequence: read_u64(obj, "sequence")?,
    };
    path_util::validate_identifier(&heartbeat.session_id, "session_id")?;
    Ok(heartbeat)
}

fn stream_request_to_json(request: &NotificationStreamRequest) -> Expected<Value> {
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    Ok(json!({
        "request_id": request.request_id,
        "session_id": request.session_id,
        "timeout_ms": request.timeout.as_millis().min(u128::from(u64::MAX)) as u64,
        "max_batch": request.max_batch as u64,
    }))
}

fn stream_request_from_json(obj: &Object) -> Expected<NotificationStreamRequest> {
    let request = NotificationStreamRequest {
        request_id: read_string(obj, "request_id")?,
        session_id: read_string(obj, "session_id")?,
        timeout: Duration::from_millis(read_u64(obj, "timeout_ms")?),
        max_batch: read_u64(obj, "max_batch")? as usize,
    };
    path_util::validate_identifier(&request.request_id, "request_id")?;
    path_util::validate_identifier(&request.session_id, "session_id")?;
    Ok(request)
}

fn stream_response_to_json(response: &NotificationStreamResponse) -> Expected<Value> {
    path_util::validate_identifier(&response.request_id, "request_id")?;
    let mut obj = Map::new();
    obj.insert("request_id".into(), response.request_id.clone().into());
    obj.insert("session_id".into(), response.session_id.clone().into());
    let mut notifications = Vec::with_capacity(response.notifications.len());
    for notification in &response.notifications {
        notifications.push(notification_to_json(notification)?);
    }
    obj.insert("notifications".into(), Value::Array(notifications));
    opt_error_to_json(&mut obj, &response.error);
    Ok(Value::Object(obj))
}

fn stream_response_from_json(obj: &Object) -> Expected<NotificationStreamResponse> {
    let entries = obj
        .get("notifications")
        .ok_or_else(|| required("notifications"))?
        .as_array()
        .ok_or_else(|| wrong_type("notifications", "an array"))?;
    let mut notifications = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = ensure_object(entry, "notifications")?;
        notifications.push(notification_from_json(entry)?);
    }
    let response = NotificationStreamResponse {
        request_id: read_string(obj, "request_id")?,
        session_id: read_string_allow_empty(obj, "session_id")?,
        notifications,
        error: opt_error_from_json(obj)?,
    };
    path_util::validate_identifier(&response.request_id, "request_id")?;
    Ok(response)
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn required(field: &str) -> Error {
    Error::MalformedInput(format!("{field}: is required"))
}

fn wrong_type(field: &str, expected: &str) -> Error {
    Error::MalformedInput(format!("{field}: must be {expected}"))
}

fn ensure_non_empty(value: &str, field: &str) -> Expected<()> {
    if value.is_empty() {
        return Err(Error::MalformedInput(format!("{field}: must not be empty")));
    }
    Ok(())
}

fn ensure_object<'a>(value: &'a Value, field: &str) -> Expected<&'a Object> {
    value
        .as_object()
        .ok_or_else(|| wrong_type(field, "a JSON object"))
}

fn read_string(obj: &Object, field: &str) -> Expected<String> {
    let value = read_string_allow_empty(obj, field)?;
    ensure_non_empty(&value, field)?;
    Ok(value)
}

fn read_string_allow_empty(obj: &Object, field: &str) -> Expected<String> {
    match obj.get(field) {
        None => Err(required(field)),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(wrong_type(field, "a string")),
    }
}

fn read_opt_string(obj: &Object, field: &str) -> Expected<Option<String>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(wrong_type(field, "a string")),
    }
}

fn read_u64(obj: &Object, field: &str) -> Expected<u64> {
    match obj.get(field) {
        None => Err(required(field)),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| wrong_type(field, "a non-negative integer")),
    }
}

fn read_opt_u64(obj: &Object, field: &str) -> Expected<Option<u64>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| wrong_type(field, "a non-negative integer")),
    }
}

fn read_u32(obj: &Object, field: &str) -> Expected<u32> {
    let value = read_u64(obj, field)?;
    u32::try_from(value).map_err(|_| wrong_type(field, "a 32-bit non-negative integer"))
}

fn read_u16(obj: &Object, field: &str) -> Expected<u16> {
    let value = read_u64(obj, field)?;
    u16::try_from(value).map_err(|_| wrong_type(field, "a 16-bit non-negative integer"))
}

fn read_bool(obj: &Object, field: &str) -> Expected<bool> {
    match obj.get(field) {
        None => Err(required(field)),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(wrong_type(field, "a boolean")),
    }
}

fn read_bool_or(obj: &Object, field: &str, default: bool) -> Expected<bool> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(wrong_type(field, "a boolean")),
    }
}

fn read_string_array(obj: &Object, field: &str) -> Expected<Vec<String>> {
    match obj.get(field) {
        None => Err(required(field)),
        Some(value) => {
            let entries = value.as_array().ok_or_else(|| wrong_type(field, "an array"))?;
            let mut out = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    Value::String(value) => out.push(value.clone()),
                    _ => return Err(wrong_type(field, "an array of strings")),
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_auth() -> AuthContext {
        AuthContext {
            kind: AuthKind::MutualTls,
            subject: "C=US/CN=client".into(),
            audience: String::new(),
            proof: "sha256:abc".into(),
            fingerprint: "sha256:abc".into(),
            issued_at_ms: 1,
            expires_at_ms: 2,
        }
    }

    fn roundtrip(payload: FramePayload) -> RemoteFrame {
        let frame = RemoteFrame {
            sent_at_ms: 1234,
            payload,
        };
        let text = serialize_frame(&frame).expect("serialize");
        deserialize_frame(&text).expect("deserialize")
    }

    #[test]
    fn test_mount_open_roundtrip() {
        let request = MountOpenRequest {
            request_id: "open-1".into(),
            client_id: "pathspace-client".into(),
            alias: "demo".into(),
            export_root: "/data".into(),
            capabilities: vec![
                CapabilityRequest::named("read"),
                CapabilityRequest::named("wait"),
            ],
            auth: sample_auth(),
            ..MountOpenRequest::default()
        };
        let restored = roundtrip(FramePayload::MountOpenRequest(request.clone()));
        assert_eq!(restored.sent_at_ms, 1234);
        assert_eq!(restored.payload, FramePayload::MountOpenRequest(request));
    }

    #[test]
    fn test_mount_open_response_roundtrip() {
        let response = MountOpenResponse {
            request_id: "open-1".into(),
            accepted: true,
            session_id: "sess-1".into(),
            granted_capabilities: vec!["read".into(), "wait".into()],
            lease_expires_ms: 111,
            heartbeat_interval: Duration::from_millis(2500),
            ..MountOpenResponse::default()
        };
        let restored = roundtrip(FramePayload::MountOpenResponse(response.clone()));
        assert_eq!(restored.payload, FramePayload::MountOpenResponse(response));
    }

    #[test]
    fn test_read_roundtrip_with_consistency() {
        let request = ReadRequest {
            request_id: "read-1".into(),
            session_id: "sess-1".into(),
            path: "/data/x".into(),
            consistency: Some(ReadConsistency {
                mode: ReadConsistencyMode::AtLeastVersion,
                at_least_version: Some(2),
            }),
            ..ReadRequest::default()
        };
        let restored = roundtrip(FramePayload::ReadRequest(request.clone()));
        assert_eq!(restored.payload, FramePayload::ReadRequest(request));
    }

    #[test]
    fn test_insert_take_roundtrip() {
        let insert = InsertRequest {
            request_id: "insert-1".into(),
            session_id: "sess-1".into(),
            path: "/data/x".into(),
            type_name: "alloc::string::String".into(),
            value: ValuePayload {
                type_name: "alloc::string::String".into(),
                data: "aGVsbG8=".into(),
                ..ValuePayload::default()
            },
        };
        let restored = roundtrip(FramePayload::InsertRequest(insert.clone()));
        assert_eq!(restored.payload, FramePayload::InsertRequest(insert));

        let take = TakeRequest {
            request_id: "take-1".into(),
            session_id: "sess-1".into(),
            path: "/data/x".into(),
            type_name: Some("alloc::string::String".into()),
            max_items: 4,
            do_block: true,
            timeout: Duration::from_millis(250),
        };
        let restored = roundtrip(FramePayload::TakeRequest(take.clone()));
        assert_eq!(restored.payload, FramePayload::TakeRequest(take));
    }

    #[test]
    fn test_notification_stream_roundtrip() {
        let response = NotificationStreamResponse {
            request_id: "notif-1".into(),
            session_id: "sess-1".into(),
            notifications: vec![Notification {
                subscription_id: "wait-1-demo".into(),
                path: "/data/x".into(),
                version: 2,
                deleted: false,
                type_name: Some("alloc::string::String".into()),
                value: Some(ValuePayload {
                    type_name: "alloc::string::String".into(),
                    data: "d29ybGQ=".into(),
                    ..ValuePayload::default()
                }),
            }],
            error: None,
        };
        let restored = roundtrip(FramePayload::NotificationStreamResponse(response.clone()));
        assert_eq!(
            restored.payload,
            FramePayload::NotificationStreamResponse(response)
        );
    }

    #[test]
    fn test_heartbeat_and_error_roundtrip() {
        let heartbeat = Heartbeat {
            session_id: "sess-9".into(),
            sequence: 42,
        };
        let restored = roundtrip(FramePayload::Heartbeat(heartbeat.clone()));
        assert_eq!(restored.payload, FramePayload::Heartbeat(heartbeat));

        let error = ErrorPayload {
            code: "too_many_waiters".into(),
            message: "session exceeded waiter limit".into(),
            retryable: true,
            retry_after: Duration::from_millis(500),
        };
        let restored = roundtrip(FramePayload::Error(error.clone()));
        assert_eq!(restored.payload, FramePayload::Error(error));
    }

    #[test]
    fn test_unknown_frame_kind_rejected() {
        let text = r#"{"type":"Mystery","sent_at_ms":1,"payload":{}}"#;
        let error = deserialize_frame(text).expect_err("rejected");
        assert!(matches!(error, Error::MalformedInput(_)));
    }

    #[test]
    fn test_missing_required_field_names_field() {
        let text = r#"{"type":"Heartbeat","sent_at_ms":1,"payload":{"sequence":3}}"#;
        let error = deserialize_frame(text).expect_err("rejected");
        assert!(error.message().contains("session_id"));
    }

    #[test]
    fn test_wrong_type_names_field() {
        let text = r#"{"type":"Heartbeat","sent_at_ms":1,"payload":{"session_id":"s","sequence":"x"}}"#;
        let error = deserialize_frame(text).expect_err("rejected");
        assert!(error.message().contains("sequence"));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let text = r#"{"type":"NotificationStreamRequest","sent_at_ms":1,"payload":{"request_id":"r-1","session_id":"s-1","timeout_ms":-5,"max_batch":4}}"#;
        let error = deserialize_frame(text).expect_err("rejected");
        assert!(error.message().contains("timeout_ms"));
    }

    #[test]
    fn test_relative_path_rejected() {
        let request = ReadRequest {
            request_id: "read-1".into(),
            session_id: "sess-1".into(),
            path: "data/x".into(),
            ..ReadRequest::default()
        };
        let frame = RemoteFrame::new(FramePayload::ReadRequest(request));
        assert!(serialize_frame(&frame).is_err());
    }

    #[test]
    fn test_bad_identifier_rejected() {
        let heartbeat = Heartbeat {
            session_id: "sess 1".into(),
            sequence: 1,
        };
        let frame = RemoteFrame::new(FramePayload::Heartbeat(heartbeat));
        let error = serialize_frame(&frame).expect_err("rejected");
        assert!(error.message().contains("session_id"));
    }

    #[test]
    fn test_auth_requires_subject_and_proof() {
        let mut request = MountOpenRequest {
            request_id: "open-1".into(),
            client_id: "client".into(),
            alias: "demo".into(),
            export_root: "/data".into(),
            auth: sample_auth(),
            ..MountOpenRequest::default()
        };
        request.auth.proof.clear();
        let frame = RemoteFrame::new(FramePayload::MountOpenRequest(request));
        let error = serialize_frame(&frame).expect_err("rejected");
        assert!(error.message().contains("auth.proof"));
    }

    #[test]
    fn test_typed_value_requires_type_name() {
        let text = r#"{"type":"InsertRequest","sent_at_ms":1,"payload":{"request_id":"i-1","session_id":"s-1","path":"/x","type_name":"t","value":{"encoding":"typed/slidingbuffer","type_name":"","data":""}}}"#;
        let error = deserialize_frame(text).expect_err("rejected");
        assert!(error.message().contains("value.type_name"));
    }

    #[test]
    fn test_void_value_allows_empty_type_name() {
        let text = r#"{"type":"InsertRequest","sent_at_ms":1,"payload":{"request_id":"i-1","session_id":"s-1","path":"/x","type_name":"t","value":{"encoding":"void/sentinel","type_name":"","data":""}}}"#;
        let frame = deserialize_frame(text).expect("accepted");
        match frame.payload {
            FramePayload::InsertRequest(request) => {
                assert_eq!(request.value.encoding, crate::ENCODING_VOID);
            }
            other => unreachable!("unexpected payload {other:?}"),
        }
    }
}
