//! Mount manager: session lifecycle, worker loops, and request dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use pathspace_space::node::{NodeData, ValueRecord};
use pathspace_space::space::DEFAULT_TIMEOUT;
use pathspace_space::{codec, type_name_of, InsertPayload, InsertReturn, OutOptions, SpaceLeaf};
use pathspace_types::{path as path_util, Error, Expected};
use pathspace_wire::{
    base64, default_payload_compatibility, ErrorPayload, Heartbeat, InsertRequest,
    MountOpenRequest, Notification, PayloadCompatibility, ProtocolVersion, ReadRequest,
    TakeRequest, ValuePayload, WaitSubscribeRequest, ENCODING_STRING, ENCODING_TYPED,
    ENCODING_VOID, MAX_TAKE_BATCH,
};

use crate::mirror;
use crate::state::{MountState, MountStatus, PendingWaiter, WaitVerdict};
use crate::{ManagerOptions, MountOptions, RemoteSession, SessionFactory};

pub(crate) const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(2500);
pub(crate) const NOTIFICATION_POLL: Duration = Duration::from_millis(25);
const NOTIFICATION_STREAM_TIMEOUT: Duration = Duration::from_millis(250);
const NOTIFICATION_BATCH: usize = 32;
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Shared core handed to worker threads and the grafted leaves.
pub(crate) struct ManagerShared {
    pub options: ManagerOptions,
    pub factory: Arc<dyn SessionFactory>,
    pub payload_mode: PayloadCompatibility,
    pub request_counter: AtomicU64,
}

impl ManagerShared {
    pub fn next_request_id(&self, prefix: &str) -> String {
        format!(
            "{prefix}-{}",
            self.request_counter.fetch_add(1, Ordering::SeqCst)
        )
    }
}

/// Client-side manager of remote mounts.
///
/// [`MountManager::start`] grafts one remote-mount leaf per configured
/// mount into the root space and spins up the per-mount worker threads;
/// [`MountManager::stop`] tears everything down and releases pending
/// waiters promptly.
pub struct MountManager {
    shared: Arc<ManagerShared>,
    mounts: Mutex<Vec<Arc<MountState>>>,
    running: AtomicBool,
}

impl MountManager {
    /// Build a manager over a session factory.
    pub fn new(options: ManagerOptions, factory: Arc<dyn SessionFactory>) -> Self {
        let payload_mode = options
            .payload_compatibility
            .unwrap_or_else(default_payload_compatibility);
        if payload_mode.allows_legacy() {
            tracing::warn!(
                "allowing legacy remote payload decoding (set PATHSPACE_REMOTE_TYPED_PAYLOADS=1 to disable)"
            );
        }
        Self {
            shared: Arc::new(ManagerShared {
                options,
                factory,
                payload_mode,
                request_counter: AtomicU64::new(1),
            }),
            mounts: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Graft mounts and start worker threads. Idempotent while running.
    pub fn start(&self) {
        let Some(root_space) = self.shared.options.root_space.clone() else {
            tracing::warn!("mount manager start skipped (missing root space)");
            return;
        };
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut mounts = Vec::with_capacity(self.shared.options.mounts.len());
        for mount in self.shared.options.mounts.clone() {
            let state = Arc::new(prepare_state(mount));
            if !state.status_message().is_empty() {
                mounts.push(state);
                continue;
            }

            let leaf = Arc::new(RemoteLeaf {
                shared: Arc::downgrade(&self.shared),
                state: Arc::downgrade(&state),
            });
            let grafted = root_space.insert_leaf(&state.mount_path, leaf);
            if let Some(error) = grafted.errors.first() {
                state.set_status_message(&error.to_string());
            } else {
                state.mounted.store(true, Ordering::SeqCst);
            }

            mirror::configure_mirrors(&self.shared, &state);
            mounts.push(state);
        }

        for state in &mounts {
            if !state.mounted.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(error) = ensure_session(&self.shared, state) {
                state.set_status_message(&error.to_string());
            }
            mirror::start_mirror_thread(&self.shared, state);
            start_notification_thread(&self.shared, state);
        }

        *lock(&self.mounts) = mounts;
    }

    /// Stop worker threads, fail pending waiters, and drop sessions.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mounts = lock(&self.mounts).clone();
        for state in &mounts {
            state.stop_requested.store(true, Ordering::SeqCst);
            let handles = {
                let mut threads = lock(&state.threads);
                (
                    threads.heartbeat.take(),
                    threads.notification.take(),
                    threads.mirror.take(),
                )
            };
            for handle in [handles.0, handles.1, handles.2].into_iter().flatten() {
                let _ = handle.join();
            }
            fail_pending_waiters(
                &self.shared,
                state,
                &Error::Timeout("Remote mount stopping".into()),
            );
            {
                let mut session = lock(&state.session);
                session.session = None;
                session.session_id.clear();
            }
            {
                let mut status = lock(&state.status);
                status.status.connected = false;
            }
            lock(&state.cached_takes).clear();
            state.mounted.store(false, Ordering::SeqCst);
        }
    }

    /// Status snapshot of every configured mount.
    pub fn statuses(&self) -> Vec<MountStatus> {
        lock(&self.mounts)
            .iter()
            .map(|state| lock(&state.status).status.clone())
            .collect()
    }

    /// True between `start` and `stop`.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn prepare_state(mount: MountOptions) -> MountState {
    let mut state = MountState::new(mount);
    if let Err(error) = path_util::validate_alias(&state.options.alias) {
        state.set_status_message_mut(&error.to_string());
        return state;
    }
    match path_util::normalize_absolute(&state.options.export_root) {
        Ok(normalized) => state.normalized_export_root = normalized,
        Err(error) => {
            state.set_status_message_mut(&error.to_string());
            return state;
        }
    }
    if state.options.mount_path.is_empty() {
        state.mount_path = format!("/remote/{}", state.options.alias);
    } else {
        match path_util::normalize_absolute(&state.options.mount_path) {
            Ok(normalized) => state.mount_path = normalized,
            Err(error) => {
                state.set_status_message_mut(&error.to_string());
                return state;
            }
        }
    }
    state
}

impl MountState {
    fn status_message(&self) -> String {
        lock(&self.status).status.message.clone()
    }

    pub(crate) fn set_status_message(&self, message: &str) {
        lock(&self.status).status.message = message.to_string();
    }

    fn set_status_message_mut(&mut self, message: &str) {
        self.set_status_message(message);
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

pub(crate) fn ensure_session(shared: &Arc<ManagerShared>, state: &Arc<MountState>) -> Expected<()> {
    {
        let session = lock(&state.session);
        let connected = lock(&state.status).status.connected;
        if session.session.is_some() && connected {
            return Ok(());
        }
    }
    open_session(shared, state)
}

fn open_session(shared: &Arc<ManagerShared>, state: &Arc<MountState>) -> Expected<()> {
    let session = shared.factory.create(&state.options)?;

    let request = MountOpenRequest {
        version: ProtocolVersion { major: 1, minor: 0 },
        request_id: shared.next_request_id("open"),
        client_id: if state.options.client_id.is_empty() {
            "pathspace-client".to_string()
        } else {
            state.options.client_id.clone()
        },
        alias: state.options.alias.clone(),
        export_root: state.normalized_export_root.clone(),
        capabilities: state.options.capabilities.clone(),
        auth: state.options.auth.clone(),
    };

    let response = session.open(&request)?;
    if !response.accepted {
        if let Some(error) = &response.error {
            return Err(convert_error_payload(error));
        }
        return Err(Error::InvalidPermissions("Mount rejected".into()));
    }

    {
        let mut handle = lock(&state.session);
        handle.session = Some(session);
        handle.session_id = response.session_id.clone();
        handle.heartbeat_interval = if response.heartbeat_interval.is_zero() {
            DEFAULT_HEARTBEAT
        } else {
            response.heartbeat_interval
        };
        handle.lease_expires_ms = response.lease_expires_ms;
    }
    {
        let mut status = lock(&state.status);
        status.status.connected = true;
        status.status.message.clear();
    }
    tracing::info!(
        alias = %state.options.alias,
        session_id = %response.session_id,
        "remote mount session opened"
    );

    if !state.stop_requested.load(Ordering::SeqCst) {
        start_heartbeat_thread(shared, state);
    }
    Ok(())
}

fn current_session(state: &MountState) -> Option<(Arc<dyn RemoteSession>, String)> {
    let handle = lock(&state.session);
    let session = handle.session.clone()?;
    if handle.session_id.is_empty() {
        return None;
    }
    Some((session, handle.session_id.clone()))
}

fn drop_session_handle(state: &MountState) {
    let mut handle = lock(&state.session);
    handle.session = None;
    handle.session_id.clear();
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

fn start_heartbeat_thread(shared: &Arc<ManagerShared>, state: &Arc<MountState>) {
    let mut threads = lock(&state.threads);
    if threads.heartbeat.is_some() {
        return;
    }
    let shared = Arc::clone(shared);
    let state_ref = Arc::clone(state);
    threads.heartbeat = Some(std::thread::spawn(move || {
        heartbeat_loop(&shared, &state_ref);
    }));
}

fn start_notification_thread(shared: &Arc<ManagerShared>, state: &Arc<MountState>) {
    if state.stop_requested.load(Ordering::SeqCst) {
        return;
    }
    let mut threads = lock(&state.threads);
    if threads.notification.is_some() {
        return;
    }
    let shared = Arc::clone(shared);
    let state_ref = Arc::clone(state);
    threads.notification = Some(std::thread::spawn(move || {
        notification_loop(&shared, &state_ref);
    }));
}

fn heartbeat_loop(shared: &Arc<ManagerShared>, state: &Arc<MountState>) {
    while !state.stop_requested.load(Ordering::SeqCst) {
        let interval = {
            let handle = lock(&state.session);
            if handle.heartbeat_interval.is_zero() {
                DEFAULT_HEARTBEAT
            } else {
                handle.heartbeat_interval
            }
        };
        let mut elapsed = Duration::ZERO;
        while elapsed < interval {
            if state.stop_requested.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(NOTIFICATION_POLL);
            elapsed += NOTIFICATION_POLL;
        }
        if state.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        if let Err(error) = send_heartbeat(shared, state) {
            tracing::debug!(alias = %state.options.alias, %error, "heartbeat failed");
            {
                let mut status = lock(&state.status);
                status.status.message = error.to_string();
                status.status.connected = false;
            }
            drop_session_handle(state);
        }
    }
}

fn send_heartbeat(shared: &Arc<ManagerShared>, state: &Arc<MountState>) -> Expected<()> {
    ensure_session(shared, state)?;
    let Some((session, session_id)) = current_session(state) else {
        return Err(Error::InvalidPermissions("Remote mount not connected".into()));
    };
    let sequence = {
        let mut status = lock(&state.status);
        status.heartbeat_sequence += 1;
        status.heartbeat_sequence
    };
    session.heartbeat(&Heartbeat {
        session_id,
        sequence,
    })?;
    lock(&state.status).status.connected = true;
    Ok(())
}

fn notification_loop(shared: &Arc<ManagerShared>, state: &Arc<MountState>) {
    while !state.stop_requested.load(Ordering::SeqCst) {
        if let Err(error) = ensure_session(shared, state) {
            record_error(shared, state, &error, true);
            std::thread::sleep(ERROR_BACKOFF);
            continue;
        }
        let Some((session, session_id)) = current_session(state) else {
            std::thread::sleep(ERROR_BACKOFF);
            continue;
        };
        match session.stream_notifications(&session_id, NOTIFICATION_STREAM_TIMEOUT, NOTIFICATION_BATCH)
        {
            Err(error) => {
                record_error(shared, state, &error, true);
                fail_pending_waiters(shared, state, &error);
                std::thread::sleep(ERROR_BACKOFF);
            }
            Ok(notifications) => {
                for notification in notifications {
                    deliver_notification(shared, state, notification);
                    if state.stop_requested.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
    }
}

fn deliver_notification(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    notification: Notification,
) {
    let waiter: Option<Arc<PendingWaiter>> = {
        let mut waiters = lock(&state.waiters);
        let waiter = waiters.remove(&notification.subscription_id);
        let mut status = lock(&state.status);
        if waiter.is_none() {
            status.status.dropped_notifications += 1;
        }
        status.status.queued_notifications = waiters.len() as u64;
        waiter
    };
    if let Some(waiter) = waiter {
        waiter.complete(notification);
    }
    publish_metrics(shared, state);
}

pub(crate) fn fail_pending_waiters(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    error: &Error,
) {
    {
        let mut waiters = lock(&state.waiters);
        for waiter in waiters.values() {
            waiter.fail(error.clone());
        }
        waiters.clear();
        lock(&state.status).status.queued_notifications = 0;
    }
    publish_metrics(shared, state);
}

// ---------------------------------------------------------------------------
// Request paths
// ---------------------------------------------------------------------------

pub(crate) fn perform_insert(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    relative: &str,
    payload: InsertPayload,
) -> InsertReturn {
    let mut ret = InsertReturn::default();
    if let Err(error) = ensure_session(shared, state) {
        record_error(shared, state, &error, true);
        ret.errors.push(error);
        return ret;
    }
    let Some((session, session_id)) = current_session(state) else {
        ret.errors
            .push(Error::InvalidPermissions("Remote mount unavailable".into()));
        return ret;
    };

    let mut request = InsertRequest {
        request_id: shared.next_request_id("insert"),
        session_id,
        path: remote_path(state, relative),
        ..InsertRequest::default()
    };
    match payload {
        InsertPayload::Typed { type_name, bytes } => {
            if type_name.is_empty() {
                ret.errors
                    .push(Error::InvalidType("Remote insert missing type metadata".into()));
                return ret;
            }
            request.value = ValuePayload {
                encoding: ENCODING_TYPED.to_string(),
                type_name: type_name.clone(),
                schema_hint: None,
                data: base64::encode(&bytes),
            };
            request.type_name = type_name;
        }
        InsertPayload::Void { type_name } => {
            if type_name.is_empty() {
                ret.errors
                    .push(Error::InvalidType("Remote insert missing type metadata".into()));
                return ret;
            }
            request.value = ValuePayload {
                encoding: ENCODING_VOID.to_string(),
                type_name: type_name.clone(),
                schema_hint: None,
                data: String::new(),
            };
            request.type_name = type_name;
            ret.tasks_inserted = 1;
        }
    }

    let start = Instant::now();
    let response = match session.insert(&request) {
        Ok(response) => response,
        Err(error) => {
            record_error(shared, state, &error, true);
            ret.errors.push(error);
            return ret;
        }
    };
    if !response.success {
        let error = response
            .error
            .as_ref()
            .map(convert_error_payload)
            .unwrap_or_else(|| Error::Unknown("Remote insert rejected".into()));
        record_error(shared, state, &error, false);
        ret.errors.push(error);
        return ret;
    }

    ret.values_inserted = response.values_inserted;
    ret.spaces_inserted = response.spaces_inserted;
    if ret.tasks_inserted == 0 {
        ret.tasks_inserted = response.tasks_inserted;
    }
    record_success(shared, state, start.elapsed());
    ret
}

pub(crate) fn perform_read(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    relative: &str,
    expected_type: &str,
) -> Expected<ValueRecord> {
    if let Err(error) = ensure_session(shared, state) {
        record_error(shared, state, &error, true);
        return Err(error);
    }
    let Some((session, session_id)) = current_session(state) else {
        let error = Error::InvalidPermissions("Remote mount unavailable".into());
        record_error(shared, state, &error, true);
        return Err(error);
    };

    let request = ReadRequest {
        request_id: shared.next_request_id("read"),
        session_id,
        path: remote_path(state, relative),
        include_value: true,
        include_children: false,
        ..ReadRequest::default()
    };

    let start = Instant::now();
    let reply = match session.read(&request) {
        Ok(reply) => reply,
        Err(error) => {
            record_error(shared, state, &error, true);
            return Err(error);
        }
    };
    if let Some(error) = &reply.error {
        let error = convert_error_payload(error);
        record_error(shared, state, &error, false);
        return Err(error);
    }
    let Some(value) = &reply.value else {
        let error = Error::NoObjectFound("Remote path has no value".into());
        record_error(shared, state, &error, false);
        return Err(error);
    };

    match decode_snapshot_record(value, expected_type, shared.payload_mode) {
        Ok(record) => {
            record_success(shared, state, start.elapsed());
            Ok(record)
        }
        Err(error) => {
            record_error(shared, state, &error, false);
            Err(error)
        }
    }
}

pub(crate) fn perform_take(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    relative: &str,
    expected_type: &str,
    options: &OutOptions,
) -> Expected<ValueRecord> {
    if expected_type.is_empty() {
        return Err(Error::InvalidType(
            "Remote take requires concrete destination metadata".into(),
        ));
    }
    let remote = remote_path(state, relative);

    if let Some(cached) = pop_cached_value(state, &remote) {
        return match apply_value_payload(&cached, expected_type, shared.payload_mode) {
            Ok(record) => Ok(record),
            Err(error) => {
                record_error(shared, state, &error, false);
                Err(error)
            }
        };
    }

    if let Err(error) = ensure_session(shared, state) {
        record_error(shared, state, &error, true);
        return Err(error);
    }
    let Some((session, session_id)) = current_session(state) else {
        let error = Error::InvalidPermissions("Remote mount unavailable".into());
        record_error(shared, state, &error, true);
        return Err(error);
    };

    let batch = state.options.take_batch_size.max(1).min(MAX_TAKE_BATCH);
    let request = TakeRequest {
        request_id: shared.next_request_id("take"),
        session_id,
        path: remote.clone(),
        type_name: Some(expected_type.to_string()),
        max_items: batch,
        do_block: options.block.is_some(),
        timeout: options.block.unwrap_or(Duration::ZERO),
    };

    let track_waiter = request.do_block;
    if track_waiter {
        bump_waiter_depth(state, 1);
        publish_metrics(shared, state);
    }
    let start = Instant::now();
    let response = session.take(&request);
    if track_waiter {
        bump_waiter_depth(state, -1);
        publish_metrics(shared, state);
    }

    let response = match response {
        Ok(response) => response,
        Err(error) => {
            record_error(shared, state, &error, true);
            return Err(error);
        }
    };
    if !response.success || response.values.is_empty() {
        let error = response
            .error
            .as_ref()
            .map(convert_error_payload)
            .unwrap_or_else(|| Error::Unknown("Remote take failed".into()));
        record_error(shared, state, &error, false);
        return Err(error);
    }

    let mut values = response.values;
    let first = values.remove(0);
    if !values.is_empty() {
        cache_values(state, &remote, values);
    }

    match apply_value_payload(&first, expected_type, shared.payload_mode) {
        Ok(record) => {
            record_success(shared, state, start.elapsed());
            Ok(record)
        }
        Err(error) => {
            record_error(shared, state, &error, false);
            Err(error)
        }
    }
}

pub(crate) fn perform_wait(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    relative: &str,
    expected_type: &str,
    options: &OutOptions,
) -> Expected<ValueRecord> {
    if let Err(error) = ensure_session(shared, state) {
        record_error(shared, state, &error, true);
        return Err(error);
    }
    let Some((session, session_id)) = current_session(state) else {
        let error = Error::InvalidPermissions("Remote mount unavailable".into());
        record_error(shared, state, &error, true);
        return Err(error);
    };

    let start = Instant::now();
    bump_waiter_depth(state, 1);
    publish_metrics(shared, state);

    let request_id = shared.next_request_id("wait");
    let request = WaitSubscribeRequest {
        request_id: request_id.clone(),
        session_id,
        subscription_id: format!("{request_id}-{}", state.options.alias),
        path: remote_path(state, relative),
        include_value: true,
        ..WaitSubscribeRequest::default()
    };

    let ack = match session.wait_subscribe(&request) {
        Ok(ack) => ack,
        Err(error) => {
            bump_waiter_depth(state, -1);
            publish_metrics(shared, state);
            record_error(shared, state, &error, true);
            return Err(error);
        }
    };
    if !ack.accepted {
        bump_waiter_depth(state, -1);
        if let Some(error) = &ack.error {
            if error.code == "notify_backpressure" {
                let mut status = lock(&state.status);
                status.status.throttled = true;
                status.status.retry_after_hint = error.retry_after;
            }
        }
        publish_metrics(shared, state);
        let error = ack
            .error
            .as_ref()
            .map(convert_error_payload)
            .unwrap_or_else(|| Error::InvalidPermissions("Remote wait rejected".into()));
        record_error(shared, state, &error, false);
        return Err(error);
    }

    let deadline = options.block.and_then(|timeout| {
        if timeout >= DEFAULT_TIMEOUT {
            None
        } else {
            Instant::now().checked_add(timeout)
        }
    });

    let waiter = Arc::new(PendingWaiter::new());
    {
        let mut waiters = lock(&state.waiters);
        waiters.insert(request.subscription_id.clone(), Arc::clone(&waiter));
        lock(&state.status).status.queued_notifications = waiters.len() as u64;
    }
    {
        let mut status = lock(&state.status);
        status.status.throttled = false;
        status.status.retry_after_hint = Duration::ZERO;
    }
    publish_metrics(shared, state);

    let verdict = waiter.wait(deadline, &state.stop_requested);

    {
        let mut waiters = lock(&state.waiters);
        waiters.remove(&request.subscription_id);
        lock(&state.status).status.queued_notifications = waiters.len() as u64;
    }
    bump_waiter_depth(state, -1);
    publish_metrics(shared, state);

    let notification = match verdict {
        WaitVerdict::Completed(notification) => notification,
        WaitVerdict::TimedOut => {
            let error = Error::Timeout("Remote wait timed out".into());
            record_error(shared, state, &error, false);
            return Err(error);
        }
        WaitVerdict::Failed(error) => {
            record_error(shared, state, &error, false);
            return Err(error);
        }
        WaitVerdict::Empty => {
            let error = Error::NoObjectFound("Remote notification missing value".into());
            record_error(shared, state, &error, false);
            return Err(error);
        }
    };

    let Some(value) = &notification.value else {
        let error = Error::NoObjectFound("Remote notification missing value".into());
        record_error(shared, state, &error, false);
        return Err(error);
    };
    match decode_snapshot_record(value, expected_type, shared.payload_mode) {
        Ok(record) => {
            record_success(shared, state, start.elapsed());
            Ok(record)
        }
        Err(error) => {
            record_error(shared, state, &error, false);
            Err(error)
        }
    }
}

// ---------------------------------------------------------------------------
// The grafted leaf
// ---------------------------------------------------------------------------

pub(crate) struct RemoteLeaf {
    pub shared: Weak<ManagerShared>,
    pub state: Weak<MountState>,
}

impl RemoteLeaf {
    fn upgrade(&self) -> Expected<(Arc<ManagerShared>, Arc<MountState>)> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| Error::InvalidPermissions("Remote mount unavailable".into()))?;
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| Error::InvalidPermissions("Remote mount unavailable".into()))?;
        if state.stop_requested.load(Ordering::SeqCst) {
            return Err(Error::InvalidPermissions("Remote mount unavailable".into()));
        }
        Ok((shared, state))
    }
}

impl SpaceLeaf for RemoteLeaf {
    fn insert(&self, relative: &str, payload: InsertPayload) -> InsertReturn {
        match self.upgrade() {
            Ok((shared, state)) => perform_insert(&shared, &state, relative, payload),
            Err(error) => InsertReturn::from_error(error),
        }
    }

    fn out(
        &self,
        relative: &str,
        expected_type: &str,
        options: &OutOptions,
    ) -> Expected<ValueRecord> {
        let (shared, state) = self.upgrade()?;
        if options.pop {
            perform_take(&shared, &state, relative, expected_type, options)
        } else if options.block.is_some() {
            perform_wait(&shared, &state, relative, expected_type, options)
        } else {
            perform_read(&shared, &state, relative, expected_type)
        }
    }

    fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

fn legacy_disabled() -> Error {
    Error::InvalidType(
        "legacy remote payload encodings are disabled (set PATHSPACE_REMOTE_TYPED_PAYLOADS=0 to re-enable temporarily)"
            .into(),
    )
}

fn decode_value_data(data: &str) -> Expected<Vec<u8>> {
    let decoded = base64::decode(data)?;
    if decoded.is_empty() {
        return Err(Error::MalformedInput("base64 payload empty".into()));
    }
    Ok(decoded)
}

/// Decode a read/notification payload: a base64 node snapshot whose front
/// record is the value.
pub(crate) fn decode_snapshot_record(
    payload: &ValuePayload,
    expected_type: &str,
    mode: PayloadCompatibility,
) -> Expected<ValueRecord> {
    if payload.encoding == ENCODING_TYPED {
        let raw = decode_value_data(&payload.data)?;
        let snapshot = NodeData::deserialize_snapshot(&raw)
            .map_err(|_| Error::InvalidType("Failed to decode remote value".into()))?;
        let record = snapshot
            .front_record()
            .map_err(|_| Error::InvalidType("Remote snapshot has no value".into()))?;
        check_record_type(&record, expected_type)?;
        return Ok(record);
    }
    legacy_or_void_record(payload, expected_type, mode)
}

/// Decode a take payload: raw codec-framed value bytes.
pub(crate) fn apply_value_payload(
    payload: &ValuePayload,
    expected_type: &str,
    mode: PayloadCompatibility,
) -> Expected<ValueRecord> {
    if payload.encoding == ENCODING_TYPED {
        let raw = decode_value_data(&payload.data)?;
        if payload.type_name.is_empty() {
            return Err(Error::InvalidType("Typed payload missing type name".into()));
        }
        let record = ValueRecord {
            type_name: payload.type_name.clone(),
            bytes: raw,
        };
        check_record_type(&record, expected_type)?;
        return Ok(record);
    }
    legacy_or_void_record(payload, expected_type, mode)
}

fn legacy_or_void_record(
    payload: &ValuePayload,
    expected_type: &str,
    mode: PayloadCompatibility,
) -> Expected<ValueRecord> {
    if payload.encoding == ENCODING_STRING {
        if !mode.allows_legacy() {
            return Err(legacy_disabled());
        }
        if !expected_type.is_empty() && expected_type != type_name_of::<String>() {
            return Err(Error::InvalidType(
                "String payload cannot be applied to non-string destination".into(),
            ));
        }
        let raw = decode_value_data(&payload.data)?;
        let value = String::from_utf8_lossy(&raw).into_owned();
        return Ok(ValueRecord {
            type_name: type_name_of::<String>().to_string(),
            bytes: codec::serialize_value(&value)?,
        });
    }
    if payload.encoding == ENCODING_VOID {
        return Err(Error::InvalidType("Void payload carries no value".into()));
    }
    Err(Error::InvalidType(
        "Unsupported remote payload encoding".into(),
    ))
}

fn check_record_type(record: &ValueRecord, expected_type: &str) -> Expected<()> {
    if !expected_type.is_empty() && record.type_name != expected_type {
        return Err(Error::InvalidType("Typed payload type mismatch".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

pub(crate) fn remote_path(state: &MountState, relative: &str) -> String {
    path_util::join(&state.normalized_export_root, relative)
}

fn pop_cached_value(state: &MountState, remote: &str) -> Option<ValuePayload> {
    let mut cache = lock(&state.cached_takes);
    let queue = cache.get_mut(remote)?;
    let payload = queue.pop_front();
    if queue.is_empty() {
        cache.remove(remote);
    }
    payload
}

fn cache_values(state: &MountState, remote: &str, payloads: Vec<ValuePayload>) {
    if payloads.is_empty() {
        return;
    }
    let mut cache = lock(&state.cached_takes);
    cache.entry(remote.to_string()).or_default().extend(payloads);
}

fn bump_waiter_depth(state: &MountState, delta: i64) {
    let mut status = lock(&state.status);
    if delta > 0 {
        status.status.waiter_depth += delta as u64;
        if status.status.waiter_depth > status.status.max_waiter_depth {
            status.status.max_waiter_depth = status.status.waiter_depth;
        }
    } else {
        status.status.waiter_depth = status
            .status
            .waiter_depth
            .saturating_sub(delta.unsigned_abs());
    }
}

pub(crate) fn convert_error_payload(payload: &ErrorPayload) -> Error {
    match payload.code.as_str() {
        "no_such_path" => Error::NoSuchPath(payload.message.clone()),
        "invalid_credentials" | "permission_denied" => {
            Error::InvalidPermissions(payload.message.clone())
        }
        "lease_expired" => Error::Timeout(payload.message.clone()),
        "notify_backpressure" | "too_many_waiters" => {
            Error::CapacityExceeded(payload.message.clone())
        }
        _ => Error::Unknown(payload.message.clone()),
    }
}

pub(crate) fn record_success(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    latency: Duration,
) {
    {
        let mut inner = lock(&state.status);
        inner.status.connected = true;
        inner.status.last_latency = latency;
        inner.status.success_count += 1;
        inner.total_latency_ms += latency.as_millis() as u64;
        if inner.status.success_count > 0 {
            inner.status.average_latency =
                Duration::from_millis(inner.total_latency_ms / inner.status.success_count);
        }
        if latency > inner.status.max_latency {
            inner.status.max_latency = latency;
        }
        inner.status.consecutive_errors = 0;
        inner.status.message.clear();
        inner.status.throttled = false;
        inner.status.retry_after_hint = Duration::ZERO;
    }
    publish_metrics(shared, state);
}

pub(crate) fn record_error(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    error: &Error,
    connection_issue: bool,
) {
    {
        let mut inner = lock(&state.status);
        inner.status.error_count += 1;
        inner.status.message = error.to_string();
        if connection_issue {
            inner.status.connected = false;
            inner.status.consecutive_errors += 1;
        }
    }
    if connection_issue {
        drop_session_handle(state);
    }
    publish_metrics(shared, state);
}

pub(crate) fn publish_metrics(shared: &ManagerShared, state: &MountState) {
    let Some(metrics_space) = &shared.options.metrics_space else {
        return;
    };
    let status = lock(&state.status).status.clone();
    let mut base = if shared.options.metrics_root.is_empty() {
        "/inspector/metrics/remotes".to_string()
    } else {
        shared.options.metrics_root.clone()
    };
    if !base.ends_with('/') {
        base.push('/');
    }
    base.push_str(&status.alias);

    metrics_space.replace(&format!("{base}/client/connected"), &i64::from(status.connected));
    metrics_space.replace(&format!("{base}/client/message"), &status.message);
    metrics_space.replace(
        &format!("{base}/latency/last_ms"),
        &(status.last_latency.as_millis() as i64),
    );
    metrics_space.replace(
        &format!("{base}/latency/max_ms"),
        &(status.max_latency.as_millis() as i64),
    );
    metrics_space.replace(
        &format!("{base}/latency/avg_ms"),
        &(status.average_latency.as_millis() as i64),
    );
    metrics_space.replace(
        &format!("{base}/requests/success"),
        &(status.success_count as i64),
    );
    metrics_space.replace(
        &format!("{base}/requests/errors"),
        &(status.error_count as i64),
    );
    metrics_space.replace(
        &format!("{base}/waiters/current"),
        &(status.waiter_depth as i64),
    );
    metrics_space.replace(
        &format!("{base}/notifications/pending"),
        &(status.queued_notifications as i64),
    );
    metrics_space.replace(
        &format!("{base}/notifications/dropped"),
        &(status.dropped_notifications as i64),
    );
    metrics_space.replace(
        &format!("{base}/notifications/throttled"),
        &i64::from(status.throttled),
    );
    metrics_space.replace(
        &format!("{base}/notifications/retry_after_ms"),
        &(status.retry_after_hint.as_millis() as i64),
    );
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
