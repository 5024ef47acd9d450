//! The mount server: session, subscription, and stream bookkeeping plus
//! the request handlers the transport dispatches into.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, Weak};
use std::time::{Duration, Instant};

use pathspace_space::registry::{insert_typed_bytes, take_typed_bytes};
use pathspace_space::{
    NodeData, NotificationSink, OutOptions, PathSpace, SpaceContext, VisitControl, VisitOptions,
};
use pathspace_types::{path as path_util, Error, Expected};
use pathspace_wire::{
    base64, default_payload_compatibility, ErrorPayload, Heartbeat, InsertRequest, InsertResponse,
    MountOpenRequest, MountOpenResponse, Notification, PayloadCompatibility, ReadConsistencyMode,
    ReadRequest, ReadResponse, TakeRequest, TakeResponse, ValuePayload, WaitSubscribeAck,
    WaitSubscribeRequest, ENCODING_STRING, ENCODING_TYPED, ENCODING_VOID, MAX_TAKE_BATCH,
};

use crate::diag::{current_time_ms, publish_metric, record_diagnostic};
use crate::stream::{SessionStream, THROTTLE_WINDOW};
use crate::{ServerOptions, ThrottleOptions, CAP_INSERT, CAP_READ, CAP_TAKE, CAP_WAIT};

struct ExportEntry {
    canonical_root: String,
    space: Arc<PathSpace>,
    capability_set: HashSet<String>,
    throttle: ThrottleOptions,
}

#[derive(Default)]
struct ExportCounters {
    active_sessions: u64,
    total_sessions: u64,
    waiter_count: u64,
    throttle_hits: u64,
    waiter_rejections: u64,
}

struct ThrottleInner {
    next_allowed: Instant,
    active_waiters: u32,
}

/// Throttle state shared by a session and its subscriptions.
struct SessionThrottleState {
    options: ThrottleOptions,
    inner: Mutex<ThrottleInner>,
}

#[derive(Clone)]
struct Session {
    session_id: String,
    alias: String,
    lease_expires_ms: u64,
    deadline: Instant,
    capabilities: Vec<String>,
    throttle: Option<Arc<SessionThrottleState>>,
}

struct Subscription {
    session_id: String,
    alias: String,
    path: String,
    include_value: bool,
    min_version: Option<u64>,
    pending: VecDeque<Notification>,
    throttle: Weak<SessionThrottleState>,
}

struct NotificationAttachment {
    context: Weak<SpaceContext>,
    downstream: Option<Arc<dyn NotificationSink>>,
}

struct ServerSink {
    server: Weak<MountServer>,
    alias: String,
    downstream: Option<Arc<dyn NotificationSink>>,
}

impl NotificationSink for ServerSink {
    fn notify(&self, path: &str) {
        if let Some(server) = self.server.upgrade() {
            server.handle_local_notification(&self.alias, path);
        }
        if let Some(downstream) = &self.downstream {
            downstream.notify(path);
        }
    }
}

/// Server side of the remote mount protocol.
///
/// Construct with [`MountServer::new`]; the returned `Arc` is what the
/// transport layer dispatches frames into. Dropping the server restores
/// every exported space's previous notification sink.
pub struct MountServer {
    options: ServerOptions,
    payload_mode: PayloadCompatibility,
    exports: HashMap<String, ExportEntry>,
    sessions: Mutex<HashMap<String, Session>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    path_versions: Mutex<HashMap<String, u64>>,
    session_streams: Mutex<HashMap<String, Arc<SessionStream>>>,
    metrics: Mutex<HashMap<String, ExportCounters>>,
    attachments: Mutex<Vec<NotificationAttachment>>,
    sinks_once: Once,
    session_counter: AtomicU64,
    weak_self: Weak<MountServer>,
}

impl MountServer {
    /// Validate exports and build the server.
    ///
    /// Exports with a missing space, invalid alias, or invalid root are
    /// skipped with a warning rather than failing construction.
    pub fn new(options: ServerOptions) -> Arc<Self> {
        let payload_mode = options
            .payload_compatibility
            .unwrap_or_else(default_payload_compatibility);
        if payload_mode.allows_legacy() {
            tracing::warn!(
                "allowing legacy remote payload encodings (set PATHSPACE_REMOTE_TYPED_PAYLOADS=1 to re-disable)"
            );
        }
        let mut exports = HashMap::new();
        for export in &options.exports {
            let Some(space) = &export.space else {
                tracing::warn!(alias = %export.alias, "skipping export with no space");
                continue;
            };
            if path_util::validate_alias(&export.alias).is_err() {
                tracing::warn!(alias = %export.alias, "skipping export with invalid alias");
                continue;
            }
            let Ok(canonical_root) = path_util::canonicalize(&export.export_root) else {
                tracing::warn!(alias = %export.alias, "skipping export with invalid root");
                continue;
            };
            let mut capability_set: HashSet<String> =
                export.capabilities.iter().cloned().collect();
            if capability_set.is_empty() {
                capability_set.insert(CAP_READ.to_string());
                capability_set.insert(CAP_WAIT.to_string());
            }
            exports.insert(
                export.alias.clone(),
                ExportEntry {
                    canonical_root,
                    space: Arc::clone(space),
                    capability_set,
                    throttle: export.throttle.clone(),
                },
            );
        }
        Arc::new_cyclic(|weak| Self {
            options,
            payload_mode,
            exports,
            sessions: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            path_versions: Mutex::new(HashMap::new()),
            session_streams: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
            attachments: Mutex::new(Vec::new()),
            sinks_once: Once::new(),
            session_counter: AtomicU64::new(1),
            weak_self: weak.clone(),
        })
    }

    // -----------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------

    /// Accept or reject a session handshake.
    pub fn handle_mount_open(&self, request: &MountOpenRequest) -> Expected<MountOpenResponse> {
        self.ensure_sinks_attached();
        self.expire_sessions();

        let fail = |diag_code: &str, error: Error| -> Expected<MountOpenResponse> {
            record_diagnostic(
                &self.options,
                &request.alias,
                diag_code,
                error.message(),
                &request.auth,
            );
            Err(error)
        };

        let canonical_root = match path_util::canonicalize(&request.export_root) {
            Ok(root) => root,
            Err(error) => {
                return fail(
                    "invalid_root",
                    Error::InvalidPath(format!(
                        "failed to canonicalize export root: {}",
                        error.message()
                    )),
                )
            }
        };
        let Some(export) = self.exports.get(&request.alias) else {
            return fail("invalid_alias", Error::NoSuchPath("unknown mount alias".into()));
        };
        if canonical_root != export.canonical_root {
            return fail("root_mismatch", Error::InvalidPath("export root mismatch".into()));
        }
        if request.auth.subject.is_empty() || request.auth.proof.is_empty() {
            return fail(
                "auth_missing",
                Error::InvalidPermissions("auth subject/proof required".into()),
            );
        }

        let mut granted: Vec<String> = request
            .capabilities
            .iter()
            .filter(|capability| export.capability_set.contains(&capability.name))
            .map(|capability| capability.name.clone())
            .collect();
        if granted.is_empty() {
            granted.push(CAP_READ.to_string());
        }

        let needs_throttle =
            export.throttle.enabled || export.throttle.max_waiters_per_session > 0;
        let throttle = needs_throttle.then(|| {
            Arc::new(SessionThrottleState {
                options: export.throttle.clone(),
                inner: Mutex::new(ThrottleInner {
                    next_allowed: Instant::now(),
                    active_waiters: 0,
                }),
            })
        });

        let session = Session {
            session_id: format!("sess-{}", self.session_counter.fetch_add(1, Ordering::SeqCst)),
            alias: request.alias.clone(),
            lease_expires_ms: current_time_ms()
                + self.options.lease_duration.as_millis() as u64,
            deadline: Instant::now() + self.options.lease_duration,
            capabilities: granted,
            throttle,
        };

        lock(&self.sessions).insert(session.session_id.clone(), session.clone());
        lock(&self.session_streams).insert(
            session.session_id.clone(),
            Arc::new(SessionStream::new(&session.alias)),
        );

        {
            let mut metrics = lock(&self.metrics);
            let counters = metrics.entry(session.alias.clone()).or_default();
            counters.active_sessions += 1;
            counters.total_sessions += 1;
            let (active, total) = (counters.active_sessions, counters.total_sessions);
            drop(metrics);
            publish_metric(&self.options, &session.alias, "server/sessions/active", &(active as i64));
            publish_metric(&self.options, &session.alias, "server/sessions/total", &(total as i64));
            publish_metric(
                &self.options,
                &session.alias,
                "status/lease_expires_ms",
                &(session.lease_expires_ms as i64),
            );
            publish_metric(
                &self.options,
                &session.alias,
                "status/last_subject",
                &request.auth.subject,
            );
            if !request.auth.fingerprint.is_empty() {
                publish_metric(
                    &self.options,
                    &session.alias,
                    "status/last_fingerprint",
                    &request.auth.fingerprint,
                );
            }
        }

        record_diagnostic(
            &self.options,
            &session.alias,
            "mount_open",
            "session accepted",
            &request.auth,
        );
        tracing::info!(
            alias = %session.alias,
            session_id = %session.session_id,
            subject = %request.auth.subject,
            "mount session accepted"
        );

        Ok(MountOpenResponse {
            version: request.version,
            request_id: request.request_id.clone(),
            accepted: true,
            session_id: session.session_id,
            granted_capabilities: session.capabilities,
            lease_expires_ms: session.lease_expires_ms,
            heartbeat_interval: self.options.heartbeat_interval,
            error: None,
        })
    }

    /// Renew a session's lease.
    pub fn handle_heartbeat(&self, heartbeat: &Heartbeat) -> Expected<()> {
        let (alias, lease_expires_ms) = {
            let mut sessions = lock(&self.sessions);
            let Some(session) = sessions.get_mut(&heartbeat.session_id) else {
                return Err(Error::NoSuchPath("unknown session".into()));
            };
            session.deadline = Instant::now() + self.options.lease_duration;
            session.lease_expires_ms =
                current_time_ms() + self.options.lease_duration.as_millis() as u64;
            (session.alias.clone(), session.lease_expires_ms)
        };
        publish_metric(
            &self.options,
            &alias,
            "status/lease_expires_ms",
            &(lease_expires_ms as i64),
        );
        Ok(())
    }

    /// Drain a session's notification stream, parking up to `timeout`.
    pub fn handle_notification_stream(
        &self,
        session_id: &str,
        timeout: Duration,
        max_batch: usize,
    ) -> Expected<Vec<Notification>> {
        self.expire_sessions();
        let Some(stream) = self.find_session_stream(session_id) else {
            return Err(Error::NoSuchPath("unknown session".into()));
        };
        let outcome = stream.drain(timeout, max_batch)?;
        if outcome.cleared_throttle {
            publish_metric(&self.options, stream.alias(), "server/notifications/throttled", &0i64);
            publish_metric(
                &self.options,
                stream.alias(),
                "server/notifications/retry_after_ms",
                &0i64,
            );
        }
        publish_metric(
            &self.options,
            stream.alias(),
            "server/notifications/pending",
            &(outcome.pending as i64),
        );
        Ok(outcome.notifications)
    }

    /// Read a node, with optional value, children, and consistency gate.
    pub fn handle_read(&self, request: &ReadRequest) -> Expected<ReadResponse> {
        self.expire_sessions();
        let session = self.find_session(&request.session_id)?;
        let export = self.find_export(&session.alias)?;
        let canonical = path_util::canonicalize(&request.path)?;
        if !path_util::path_within(&canonical, &export.canonical_root) {
            return Err(Error::InvalidPath("path outside export".into()));
        }
        self.apply_request_throttle(&session);

        let mut exists = false;
        let mut deleted = false;
        let mut value: Option<ValuePayload> = None;
        let mut encode_error: Option<Error> = None;

        let visit_result = export.space.visit(
            &VisitOptions {
                root: canonical.clone(),
                max_depth: 1,
                include_values: request.include_value,
                ..VisitOptions::default()
            },
            |entry| {
                if entry.path != canonical {
                    return VisitControl::Continue;
                }
                exists = true;
                if let Some(snapshot) = &entry.snapshot {
                    match encode_node_value(snapshot, request.type_name.as_deref()) {
                        Ok(payload) => value = Some(payload),
                        Err(error) => {
                            encode_error = Some(error);
                        }
                    }
                }
                VisitControl::Stop
            },
        );
        if let Some(error) = encode_error {
            return Err(error);
        }
        if let Err(error) = visit_result {
            match error {
                Error::NoSuchPath(_) => deleted = true,
                other => return Err(other),
            }
        }

        let mut response = ReadResponse {
            request_id: request.request_id.clone(),
            path: canonical.clone(),
            children_included: request.include_children,
            ..ReadResponse::default()
        };

        {
            let mut versions = lock(&self.path_versions);
            let version = versions.entry(canonical.clone()).or_insert(0);
            if *version == 0 {
                *version = 1;
            }
            response.version = *version;
            if let Some(consistency) = &request.consistency {
                if consistency.mode == ReadConsistencyMode::AtLeastVersion {
                    if let Some(threshold) = consistency.at_least_version {
                        if response.version < threshold {
                            response.error = Some(ErrorPayload::new(
                                "consistency_not_met",
                                "requested version not yet available",
                                true,
                            ));
                            return Ok(response);
                        }
                    }
                }
            }
        }

        if request.include_children {
            response.children = export.space.list_children(&canonical);
        }

        if !exists && !deleted {
            response.error = Some(ErrorPayload::new("not_found", "path missing", false));
            return Ok(response);
        }
        response.value = value;
        if deleted {
            response.error = Some(ErrorPayload::new("deleted", "path has been removed", false));
        }
        Ok(response)
    }

    /// Insert a value through the export's space.
    pub fn handle_insert(&self, request: &InsertRequest) -> Expected<InsertResponse> {
        self.expire_sessions();
        let session = self.find_session(&request.session_id)?;
        let export = self.find_export(&session.alias)?;
        let canonical = path_util::canonicalize(&request.path)?;
        if !path_util::path_within(&canonical, &export.canonical_root) {
            return Err(Error::InvalidPath("path outside export".into()));
        }
        if !session.capabilities.iter().any(|c| c == CAP_INSERT) {
            return Err(Error::InvalidPermissions("insert not permitted".into()));
        }
        self.apply_request_throttle(&session);

        if request.value.encoding == ENCODING_VOID {
            return Ok(InsertResponse {
                request_id: request.request_id.clone(),
                success: true,
                tasks_inserted: 1,
                ..InsertResponse::default()
            });
        }

        let insert_ret = if request.value.encoding == ENCODING_STRING {
            if !self.payload_mode.allows_legacy() {
                return Err(legacy_disabled());
            }
            let decoded = base64::decode(&request.value.data)?;
            let value = String::from_utf8_lossy(&decoded).into_owned();
            export.space.insert(&canonical, &value)
        } else if request.value.encoding == ENCODING_TYPED {
            let payload_type = if request.value.type_name.is_empty() {
                &request.type_name
            } else {
                &request.value.type_name
            };
            if payload_type.is_empty() {
                return Err(Error::InvalidType("typed payload missing type name".into()));
            }
            let decoded = base64::decode(&request.value.data)?;
            insert_typed_bytes(&export.space, &canonical, payload_type, &decoded)?
        } else {
            return Err(Error::InvalidType(
                "unsupported remote payload encoding".into(),
            ));
        };

        let mut response = InsertResponse {
            request_id: request.request_id.clone(),
            success: insert_ret.is_ok(),
            values_inserted: insert_ret.values_inserted,
            spaces_inserted: insert_ret.spaces_inserted,
            tasks_inserted: insert_ret.tasks_inserted,
            error: None,
        };
        if let Some(error) = insert_ret.errors.first() {
            response.error = Some(ErrorPayload::new("insert_failed", error.summary(), false));
        }
        Ok(response)
    }

    /// Pop up to `max_items` values of the requested type.
    pub fn handle_take(&self, request: &TakeRequest) -> Expected<TakeResponse> {
        self.expire_sessions();
        let session = self.find_session(&request.session_id)?;
        let export = self.find_export(&session.alias)?;
        let canonical = path_util::canonicalize(&request.path)?;
        if !path_util::path_within(&canonical, &export.canonical_root) {
            return Err(Error::InvalidPath("path outside export".into()));
        }
        if !session.capabilities.iter().any(|c| c == CAP_TAKE) {
            return Err(Error::InvalidPermissions("take not permitted".into()));
        }
        self.apply_request_throttle(&session);

        let mut response = TakeResponse {
            request_id: request.request_id.clone(),
            ..TakeResponse::default()
        };
        let Some(type_name) = request.type_name.as_deref().filter(|t| !t.is_empty()) else {
            response.error = Some(ErrorPayload::new(
                "type_required",
                "type_name is required",
                false,
            ));
            return Ok(response);
        };
        let batch_size = request.max_items.max(1).min(MAX_TAKE_BATCH);

        for index in 0..batch_size {
            let options = if index == 0 && request.do_block {
                OutOptions::take_blocking(request.timeout)
            } else {
                OutOptions::take()
            };
            match take_typed_bytes(&export.space, &canonical, type_name, &options) {
                Ok(bytes) => {
                    response.values.push(ValuePayload {
                        encoding: ENCODING_TYPED.to_string(),
                        type_name: type_name.to_string(),
                        schema_hint: None,
                        data: base64::encode(&bytes),
                    });
                }
                Err(error) => {
                    let exhausted =
                        matches!(error, Error::NoObjectFound(_) | Error::NoSuchPath(_));
                    if response.values.is_empty() || !exhausted {
                        response.success = false;
                        response.error =
                            Some(ErrorPayload::new("take_failed", error.summary(), false));
                        return Ok(response);
                    }
                    break;
                }
            }
        }

        if response.values.is_empty() {
            response.error = Some(ErrorPayload::new(
                "take_failed",
                "no values available",
                false,
            ));
            return Ok(response);
        }
        response.success = true;
        Ok(response)
    }

    /// Register a one-shot wait subscription.
    pub fn handle_wait_subscribe(
        &self,
        request: &WaitSubscribeRequest,
    ) -> Expected<WaitSubscribeAck> {
        self.ensure_sinks_attached();
        self.expire_sessions();

        let session = self.find_session(&request.session_id)?;
        let export = self.find_export(&session.alias)?;
        let canonical = path_util::canonicalize(&request.path)?;
        if !path_util::path_within(&canonical, &export.canonical_root) {
            return Err(Error::InvalidPath("path outside export".into()));
        }

        if let Some(stream) = self.find_session_stream(&session.session_id) {
            if let Some(retry_after) = stream.throttle_retry_after() {
                let mut error =
                    ErrorPayload::new("notify_backpressure", "notification backlog high", true);
                error.retry_after = retry_after;
                publish_metric(
                    &self.options,
                    &session.alias,
                    "server/notifications/throttled",
                    &1i64,
                );
                publish_metric(
                    &self.options,
                    &session.alias,
                    "server/notifications/retry_after_ms",
                    &(retry_after.as_millis() as i64),
                );
                return Ok(WaitSubscribeAck {
                    subscription_id: request.subscription_id.clone(),
                    accepted: false,
                    error: Some(error),
                });
            }
        }

        if let Err(retry_after) = self.reserve_waiter(&session) {
            let mut error =
                ErrorPayload::new("too_many_waiters", "session exceeded waiter limit", true);
            error.retry_after = retry_after;
            return Ok(WaitSubscribeAck {
                subscription_id: request.subscription_id.clone(),
                accepted: false,
                error: Some(error),
            });
        }

        {
            let mut subscriptions = lock(&self.subscriptions);
            if subscriptions.contains_key(&request.subscription_id) {
                drop(subscriptions);
                release_waiter(session.throttle.as_ref().map(Arc::downgrade));
                return Err(Error::InvalidPath("duplicate subscription".into()));
            }
            subscriptions.insert(
                request.subscription_id.clone(),
                Subscription {
                    session_id: session.session_id.clone(),
                    alias: session.alias.clone(),
                    path: canonical,
                    include_value: request.include_value,
                    min_version: request.after_version,
                    pending: VecDeque::new(),
                    throttle: session
                        .throttle
                        .as_ref()
                        .map(Arc::downgrade)
                        .unwrap_or_default(),
                },
            );
        }

        let waiter_count = {
            let mut metrics = lock(&self.metrics);
            let counters = metrics.entry(session.alias.clone()).or_default();
            counters.waiter_count += 1;
            counters.waiter_count
        };
        publish_metric(
            &self.options,
            &session.alias,
            "waiters/current",
            &(waiter_count as i64),
        );

        Ok(WaitSubscribeAck {
            subscription_id: request.subscription_id.clone(),
            accepted: true,
            error: None,
        })
    }

    /// Pop the next pending notification of a subscription, if any.
    pub fn next_notification(&self, subscription_id: &str) -> Option<Notification> {
        let mut subscriptions = lock(&self.subscriptions);
        let subscription = subscriptions.get_mut(subscription_id)?;
        subscription.pending.pop_front()
    }

    /// Cancel a subscription and release its waiter slot.
    pub fn drop_subscription(&self, subscription_id: &str) {
        let removed = lock(&self.subscriptions).remove(subscription_id);
        let Some(removed) = removed else {
            return;
        };
        release_waiter(Some(removed.throttle));
        let waiter_count = {
            let mut metrics = lock(&self.metrics);
            let counters = metrics.entry(removed.alias.clone()).or_default();
            counters.waiter_count = counters.waiter_count.saturating_sub(1);
            counters.waiter_count
        };
        publish_metric(
            &self.options,
            &removed.alias,
            "waiters/current",
            &(waiter_count as i64),
        );
    }

    /// Drop every session whose lease deadline has passed.
    pub fn expire_sessions(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let sessions = lock(&self.sessions);
            sessions
                .iter()
                .filter(|(_, session)| now >= session.deadline)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for session_id in expired {
            self.drop_session(&session_id);
        }
    }

    /// Remove a session, close its stream, and cancel its subscriptions.
    pub fn drop_session(&self, session_id: &str) {
        let Some(removed) = lock(&self.sessions).remove(session_id) else {
            return;
        };
        self.close_session_stream(session_id);

        let mut removed_waiters: HashMap<String, u64> = HashMap::new();
        {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions.retain(|_, subscription| {
                if subscription.session_id == session_id {
                    release_waiter(Some(subscription.throttle.clone()));
                    *removed_waiters.entry(subscription.alias.clone()).or_default() += 1;
                    false
                } else {
                    true
                }
            });
        }

        let active = {
            let mut metrics = lock(&self.metrics);
            let counters = metrics.entry(removed.alias.clone()).or_default();
            counters.active_sessions = counters.active_sessions.saturating_sub(1);
            counters.active_sessions
        };
        publish_metric(
            &self.options,
            &removed.alias,
            "server/sessions/active",
            &(active as i64),
        );

        for (alias, count) in removed_waiters {
            let waiter_count = {
                let mut metrics = lock(&self.metrics);
                let counters = metrics.entry(alias.clone()).or_default();
                counters.waiter_count = counters.waiter_count.saturating_sub(count);
                counters.waiter_count
            };
            publish_metric(&self.options, &alias, "waiters/current", &(waiter_count as i64));
        }
        tracing::debug!(session_id, alias = %removed.alias, "session dropped");
    }

    // -----------------------------------------------------------------
    // Local notification interposition
    // -----------------------------------------------------------------

    fn ensure_sinks_attached(&self) {
        self.sinks_once.call_once(|| {
            let mut attachments = lock(&self.attachments);
            for (alias, export) in &self.exports {
                let context = export.space.shared_context();
                let downstream = context.sink();
                let sink = Arc::new(ServerSink {
                    server: self.weak_self.clone(),
                    alias: alias.clone(),
                    downstream: downstream.clone(),
                });
                context.set_sink(Some(sink));
                attachments.push(NotificationAttachment {
                    context: Arc::downgrade(&context),
                    downstream,
                });
            }
        });
    }

    fn detach_notification_sinks(&self) {
        let mut attachments = lock(&self.attachments);
        for attachment in attachments.drain(..) {
            if let Some(context) = attachment.context.upgrade() {
                context.set_sink(attachment.downstream);
            }
        }
    }

    fn handle_local_notification(&self, alias: &str, absolute_path: &str) {
        let Some(export) = self.exports.get(alias) else {
            return;
        };
        if !path_util::path_within(absolute_path, &export.canonical_root) {
            return;
        }

        let (targets, needs_value) = {
            let subscriptions = lock(&self.subscriptions);
            let mut targets = Vec::new();
            let mut needs_value = false;
            for (id, subscription) in subscriptions.iter() {
                if subscription.alias == alias && subscription.path == absolute_path {
                    targets.push(id.clone());
                    needs_value = needs_value || subscription.include_value;
                }
            }
            (targets, needs_value)
        };
        if targets.is_empty() {
            return;
        }

        let mut cached: Option<NodeData> = None;
        let mut deleted = false;
        let visit_result = export.space.visit(
            &VisitOptions {
                root: absolute_path.to_string(),
                max_depth: 1,
                include_values: true,
                ..VisitOptions::default()
            },
            |entry| {
                if entry.path == absolute_path {
                    cached = entry.snapshot.clone();
                    return VisitControl::Stop;
                }
                VisitControl::Continue
            },
        );
        if let Err(error) = visit_result {
            match error {
                Error::NoSuchPath(_) => deleted = true,
                _ => return,
            }
        }

        let mut payload: Option<ValuePayload> = None;
        let mut cached_type_name: Option<String> =
            cached.as_ref().and_then(|node| node.front_type_name().map(str::to_string));
        if needs_value {
            if let Some(node) = &cached {
                match encode_node_value(node, None) {
                    Ok(encoded) => {
                        cached_type_name = Some(encoded.type_name.clone());
                        payload = Some(encoded);
                    }
                    Err(_) => return,
                }
            }
        }

        let version = {
            let mut versions = lock(&self.path_versions);
            let entry = versions.entry(absolute_path.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let mut deliveries: Vec<(String, Notification)> = Vec::new();
        {
            let mut subscriptions = lock(&self.subscriptions);
            for id in &targets {
                let Some(subscription) = subscriptions.get_mut(id) else {
                    continue;
                };
                if let Some(min_version) = subscription.min_version {
                    if version <= min_version {
                        continue;
                    }
                }
                let notification = Notification {
                    subscription_id: id.clone(),
                    path: absolute_path.to_string(),
                    version,
                    deleted,
                    type_name: cached_type_name.clone(),
                    value: if subscription.include_value {
                        payload.clone()
                    } else {
                        None
                    },
                };
                subscription.pending.push_back(notification.clone());
                subscription.min_version = Some(version);
                deliveries.push((subscription.session_id.clone(), notification));
            }
        }
        for (session_id, notification) in deliveries {
            self.enqueue_session_notification(&session_id, notification);
        }
    }

    fn enqueue_session_notification(&self, session_id: &str, notification: Notification) {
        let Some(stream) = self.find_session_stream(session_id) else {
            return;
        };
        let Some(outcome) = stream.enqueue(notification) else {
            return;
        };
        if outcome.throttled {
            publish_metric(
                &self.options,
                stream.alias(),
                "server/notifications/throttled",
                &1i64,
            );
            publish_metric(
                &self.options,
                stream.alias(),
                "server/notifications/retry_after_ms",
                &(THROTTLE_WINDOW.as_millis() as i64),
            );
        }
        publish_metric(
            &self.options,
            stream.alias(),
            "server/notifications/pending",
            &(outcome.pending as i64),
        );
        publish_metric(
            &self.options,
            stream.alias(),
            "server/notifications/dropped",
            &(outcome.dropped as i64),
        );
    }

    // -----------------------------------------------------------------
    // Throttling
    // -----------------------------------------------------------------

    fn apply_request_throttle(&self, session: &Session) {
        let Some(throttle) = &session.throttle else {
            return;
        };
        let options = &throttle.options;
        if !options.enabled
            || options.max_requests_per_window == 0
            || options.request_window.is_zero()
        {
            return;
        }
        let mut per_request = options.request_window / options.max_requests_per_window;
        if per_request.is_zero() {
            per_request = Duration::from_millis(1);
        }

        let now = Instant::now();
        let wake_time = {
            let mut inner = lock(&throttle.inner);
            if inner.next_allowed <= now {
                inner.next_allowed = now + per_request;
                return;
            }
            let wake_time = inner.next_allowed;
            inner.next_allowed += per_request;
            wake_time
        };

        let mut sleep = wake_time - now;
        if !options.penalty_increment.is_zero() && sleep < options.penalty_increment {
            sleep = options.penalty_increment;
        }
        if !options.penalty_cap.is_zero() && sleep > options.penalty_cap {
            sleep = options.penalty_cap;
        }
        if sleep.is_zero() {
            return;
        }
        std::thread::sleep(sleep);
        publish_metric(
            &self.options,
            &session.alias,
            "server/throttle/last_sleep_ms",
            &(sleep.as_millis() as i64),
        );
        let hits = {
            let mut metrics = lock(&self.metrics);
            let counters = metrics.entry(session.alias.clone()).or_default();
            counters.throttle_hits += 1;
            counters.throttle_hits
        };
        publish_metric(
            &self.options,
            &session.alias,
            "server/throttle/hits_total",
            &(hits as i64),
        );
    }

    /// Reserve a waiter slot; on refusal returns the retry hint.
    fn reserve_waiter(&self, session: &Session) -> Result<(), Duration> {
        let Some(throttle) = &session.throttle else {
            return Ok(());
        };
        if throttle.options.max_waiters_per_session == 0 {
            return Ok(());
        }
        {
            let mut inner = lock(&throttle.inner);
            if inner.active_waiters < throttle.options.max_waiters_per_session {
                inner.active_waiters += 1;
                return Ok(());
            }
        }
        let retry_after = if throttle.options.wait_retry_after.is_zero() {
            Duration::from_millis(250)
        } else {
            throttle.options.wait_retry_after
        };
        let rejections = {
            let mut metrics = lock(&self.metrics);
            let counters = metrics.entry(session.alias.clone()).or_default();
            counters.waiter_rejections += 1;
            counters.waiter_rejections
        };
        publish_metric(
            &self.options,
            &session.alias,
            "server/throttle/waiters_rejected",
            &(rejections as i64),
        );
        publish_metric(
            &self.options,
            &session.alias,
            "server/throttle/retry_after_ms",
            &(retry_after.as_millis() as i64),
        );
        Err(retry_after)
    }

    // -----------------------------------------------------------------
    // Lookup helpers
    // -----------------------------------------------------------------

    fn find_session(&self, session_id: &str) -> Expected<Session> {
        lock(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchPath("unknown session".into()))
    }

    fn find_export(&self, alias: &str) -> Expected<&ExportEntry> {
        self.exports
            .get(alias)
            .ok_or_else(|| Error::NoSuchPath("unknown alias".into()))
    }

    fn find_session_stream(&self, session_id: &str) -> Option<Arc<SessionStream>> {
        lock(&self.session_streams).get(session_id).cloned()
    }

    fn close_session_stream(&self, session_id: &str) {
        let stream = lock(&self.session_streams).remove(session_id);
        if let Some(stream) = stream {
            stream.close();
        }
    }
}

impl Drop for MountServer {
    fn drop(&mut self) {
        self.detach_notification_sinks();
    }
}

fn release_waiter(throttle: Option<Weak<SessionThrottleState>>) {
    let Some(state) = throttle.and_then(|weak| weak.upgrade()) else {
        return;
    };
    let mut inner = lock(&state.inner);
    inner.active_waiters = inner.active_waiters.saturating_sub(1);
}

fn legacy_disabled() -> Error {
    Error::InvalidType(
        "legacy remote payload encodings are disabled (set PATHSPACE_REMOTE_TYPED_PAYLOADS=0 to re-enable temporarily)"
            .into(),
    )
}

/// Encode the front value of a node snapshot as a wire payload.
///
/// The payload data is the base64 of a single-record snapshot so the far
/// side can restore it with `NodeData::deserialize_snapshot`.
fn encode_node_value(node: &NodeData, type_hint: Option<&str>) -> Expected<ValuePayload> {
    let record = node
        .front_record()
        .map_err(|_| Error::InvalidType("unable to encode value payload".into()))?;
    if let Some(hint) = type_hint {
        if !hint.is_empty() && record.type_name != hint {
            return Err(Error::InvalidType("type mismatch".into()));
        }
    }
    let mut single = NodeData::new();
    let type_name = record.type_name.clone();
    single.push_record(record);
    let snapshot = single.serialize_snapshot()?;
    Ok(ValuePayload {
        encoding: ENCODING_TYPED.to_string(),
        type_name,
        schema_hint: None,
        data: base64::encode(&snapshot),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
