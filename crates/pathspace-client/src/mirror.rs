//! Mirror loops: background copies of remote subtrees into local spaces.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pathspace_space::registry::TypeRegistry;
use pathspace_space::space::{DEFAULT_MAX_CHILDREN, UNLIMITED_DEPTH};
use pathspace_space::{NodeData, PathSpace};
use pathspace_types::{path as path_util, Error, Expected};
use pathspace_wire::{
    base64, ErrorPayload, ReadRequest, ValuePayload, ENCODING_STRING, ENCODING_TYPED,
    ENCODING_VOID,
};

use crate::manager::{
    convert_error_payload, ensure_session, lock, record_error, ManagerShared,
};
use crate::state::{MirrorAssignment, MountState};
use crate::{MirrorMode, MirrorOptions, MirrorTarget, RemoteSession};

const MIRROR_SLEEP: Duration = Duration::from_millis(50);

/// Build the mirror assignments for a mount, adding the default
/// diagnostics (append-only) and metrics (tree-snapshot) mirrors when the
/// configuration does not provide them.
pub(crate) fn configure_mirrors(shared: &Arc<ManagerShared>, state: &Arc<MountState>) {
    let mut configured = state.options.mirrors.clone();

    let has_mirror = |list: &[MirrorOptions], target: MirrorTarget, mode: MirrorMode| {
        list.iter()
            .any(|mirror| mirror.enabled && mirror.target == target && mirror.mode == mode)
    };

    if !has_mirror(&configured, MirrorTarget::RootSpace, MirrorMode::AppendOnly)
        && shared.options.root_space.is_some()
    {
        let local_root = path_util::join(
            if shared.options.diagnostics_root.is_empty() {
                "/diagnostics/errors/live/remotes"
            } else {
                &shared.options.diagnostics_root
            },
            &state.options.alias,
        );
        configured.push(MirrorOptions {
            mode: MirrorMode::AppendOnly,
            target: MirrorTarget::RootSpace,
            remote_root: "/diagnostics/errors/live".to_string(),
            local_root,
            max_depth: 1,
            max_children: DEFAULT_MAX_CHILDREN,
            max_nodes: DEFAULT_MAX_CHILDREN,
            interval: Duration::from_millis(750),
            enabled: true,
        });
    }

    if !has_mirror(&configured, MirrorTarget::MetricsSpace, MirrorMode::TreeSnapshot)
        && shared.options.metrics_space.is_some()
    {
        configured.push(MirrorOptions {
            mode: MirrorMode::TreeSnapshot,
            target: MirrorTarget::MetricsSpace,
            remote_root: format!("/inspector/metrics/remotes/{}/server", state.options.alias),
            local_root: path_util::join(
                &shared.options.metrics_root,
                &format!("{}/server", state.options.alias),
            ),
            max_depth: UNLIMITED_DEPTH,
            max_children: DEFAULT_MAX_CHILDREN,
            max_nodes: 512,
            interval: Duration::from_millis(1000),
            enabled: true,
        });
    }

    let mut assignments = Vec::new();
    for mirror in configured {
        if !mirror.enabled {
            continue;
        }
        let target_space = match mirror.target {
            MirrorTarget::RootSpace => shared.options.root_space.clone(),
            MirrorTarget::MetricsSpace => shared.options.metrics_space.clone(),
        };
        let Some(target_space) = target_space else {
            tracing::debug!(alias = %state.options.alias, "mirror skipped (target space unavailable)");
            continue;
        };

        let remote = substitute_alias(&mirror.remote_root, &state.options.alias);
        if remote.is_empty() {
            tracing::debug!(alias = %state.options.alias, "mirror skipped (empty remote root)");
            continue;
        }
        let Ok(remote_root) = path_util::normalize_absolute(&remote) else {
            tracing::debug!(alias = %state.options.alias, "mirror skipped (invalid remote root)");
            continue;
        };
        let local_pattern = if mirror.local_root.is_empty() {
            remote_root.clone()
        } else {
            substitute_alias(&mirror.local_root, &state.options.alias)
        };
        let Ok(local_root) = path_util::normalize_absolute(&local_pattern) else {
            tracing::debug!(alias = %state.options.alias, "mirror skipped (invalid local root)");
            continue;
        };

        assignments.push(MirrorAssignment {
            mode: mirror.mode,
            target: mirror.target,
            target_space,
            remote_root,
            local_root,
            max_depth: if mirror.max_depth == 0 {
                UNLIMITED_DEPTH
            } else {
                mirror.max_depth
            },
            max_children: if mirror.max_children == 0 {
                DEFAULT_MAX_CHILDREN
            } else {
                mirror.max_children
            },
            max_nodes: if mirror.max_nodes == 0 { 256 } else { mirror.max_nodes },
            interval: if mirror.interval.is_zero() {
                Duration::from_millis(500)
            } else {
                mirror.interval
            },
            last_child: String::new(),
            next_run: Instant::now(),
        });
    }
    *lock(&state.mirrors) = assignments;
}

pub(crate) fn start_mirror_thread(shared: &Arc<ManagerShared>, state: &Arc<MountState>) {
    if lock(&state.mirrors).is_empty() {
        return;
    }
    let mut threads = lock(&state.threads);
    if threads.mirror.is_some() {
        return;
    }
    let shared = Arc::clone(shared);
    let state_ref = Arc::clone(state);
    threads.mirror = Some(std::thread::spawn(move || {
        mirror_loop(&shared, &state_ref);
    }));
}

fn mirror_loop(shared: &Arc<ManagerShared>, state: &Arc<MountState>) {
    while !state.stop_requested.load(Ordering::SeqCst) {
        let now = Instant::now();
        let due: Vec<usize> = {
            let mirrors = lock(&state.mirrors);
            mirrors
                .iter()
                .enumerate()
                .filter(|(_, assignment)| assignment.next_run <= now)
                .map(|(index, _)| index)
                .collect()
        };
        for index in due {
            run_assignment(shared, state, index);
            let mut mirrors = lock(&state.mirrors);
            if let Some(assignment) = mirrors.get_mut(index) {
                assignment.next_run = Instant::now() + assignment.interval;
            }
        }
        std::thread::sleep(MIRROR_SLEEP);
    }
}

fn run_assignment(shared: &Arc<ManagerShared>, state: &Arc<MountState>, index: usize) {
    if let Err(error) = ensure_session(shared, state) {
        record_error(shared, state, &error, true);
        return;
    }
    let session_info = {
        let handle = lock(&state.session);
        handle
            .session
            .clone()
            .filter(|_| !handle.session_id.is_empty())
            .map(|session| (session, handle.session_id.clone()))
    };
    let Some((session, session_id)) = session_info else {
        record_error(
            shared,
            state,
            &Error::InvalidPermissions("Remote session unavailable".into()),
            false,
        );
        return;
    };

    let mode = {
        let mirrors = lock(&state.mirrors);
        mirrors.get(index).map(|assignment| assignment.mode)
    };
    let result = match mode {
        Some(MirrorMode::AppendOnly) => {
            mirror_append_only(shared, state, index, &session, &session_id)
        }
        Some(MirrorMode::TreeSnapshot) => {
            mirror_tree_snapshot(shared, state, index, &session, &session_id)
        }
        None => return,
    };
    if let Err(error) = result {
        record_error(shared, state, &error, false);
    }
}

fn mirror_append_only(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    index: usize,
    session: &Arc<dyn RemoteSession>,
    session_id: &str,
) -> Expected<()> {
    let (remote_root, local_root, max_children, max_nodes, last_child, target_space) = {
        let mirrors = lock(&state.mirrors);
        let Some(assignment) = mirrors.get(index) else {
            return Ok(());
        };
        (
            assignment.remote_root.clone(),
            assignment.local_root.clone(),
            assignment.max_children,
            assignment.max_nodes,
            assignment.last_child.clone(),
            Arc::clone(&assignment.target_space),
        )
    };

    let request = ReadRequest {
        request_id: shared.next_request_id("mirror-list"),
        session_id: session_id.to_string(),
        path: remote_root.clone(),
        include_value: false,
        include_children: true,
        ..ReadRequest::default()
    };
    let response = session.read(&request)?;
    if let Some(error) = &response.error {
        if node_gone(error) {
            return Ok(());
        }
        return Err(convert_error_payload(error));
    }

    let mut children = response.children;
    children.sort();
    if max_children != 0 && children.len() > max_children {
        children.truncate(max_children);
    }

    let mut cursor = last_child;
    let mut mirrored = 0usize;
    for child in children {
        if !cursor.is_empty() && child <= cursor {
            continue;
        }
        let remote_child = path_util::join(&remote_root, &child);
        let local_child = path_util::join(&local_root, &child);
        copy_remote_node(
            shared,
            &target_space,
            session,
            session_id,
            &remote_child,
            &local_child,
        )?;
        cursor = child;
        {
            let mut mirrors = lock(&state.mirrors);
            if let Some(assignment) = mirrors.get_mut(index) {
                assignment.last_child = cursor.clone();
            }
        }
        mirrored += 1;
        if max_nodes != 0 && mirrored >= max_nodes {
            break;
        }
    }
    Ok(())
}

fn mirror_tree_snapshot(
    shared: &Arc<ManagerShared>,
    state: &Arc<MountState>,
    index: usize,
    session: &Arc<dyn RemoteSession>,
    session_id: &str,
) -> Expected<()> {
    let (remote_root, local_root, max_depth, max_children, max_nodes, target_space) = {
        let mirrors = lock(&state.mirrors);
        let Some(assignment) = mirrors.get(index) else {
            return Ok(());
        };
        (
            assignment.remote_root.clone(),
            assignment.local_root.clone(),
            assignment.max_depth,
            assignment.max_children,
            assignment.max_nodes,
            Arc::clone(&assignment.target_space),
        )
    };

    struct QueueEntry {
        remote_path: String,
        local_path: String,
        depth: usize,
    }
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(QueueEntry {
        remote_path: remote_root,
        local_path: local_root,
        depth: 0,
    });

    let mut processed = 0usize;
    while let Some(entry) = queue.pop_front() {
        if state.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        let include_children = max_depth == UNLIMITED_DEPTH || entry.depth + 1 < max_depth;

        let request = ReadRequest {
            request_id: shared.next_request_id("mirror-node"),
            session_id: session_id.to_string(),
            path: entry.remote_path.clone(),
            include_value: true,
            include_children,
            ..ReadRequest::default()
        };
        let response = session.read(&request)?;
        if let Some(error) = &response.error {
            if node_gone(error) {
                continue;
            }
            return Err(convert_error_payload(error));
        }

        if let Some(value) = &response.value {
            mirror_single_node(shared, &target_space, &entry.local_path, value, true)?;
        }

        if include_children {
            let mut children = response.children;
            if max_children != 0 && children.len() > max_children {
                children.truncate(max_children);
            }
            for child in children {
                queue.push_back(QueueEntry {
                    remote_path: path_util::join(&entry.remote_path, &child),
                    local_path: path_util::join(&entry.local_path, &child),
                    depth: entry.depth + 1,
                });
            }
        }

        processed += 1;
        if max_nodes != 0 && processed >= max_nodes {
            break;
        }
    }
    Ok(())
}

fn copy_remote_node(
    shared: &Arc<ManagerShared>,
    target_space: &Arc<PathSpace>,
    session: &Arc<dyn RemoteSession>,
    session_id: &str,
    remote_path: &str,
    local_path: &str,
) -> Expected<()> {
    let request = ReadRequest {
        request_id: shared.next_request_id("mirror-value"),
        session_id: session_id.to_string(),
        path: remote_path.to_string(),
        include_value: true,
        include_children: false,
        ..ReadRequest::default()
    };
    let response = session.read(&request)?;
    if let Some(error) = &response.error {
        if node_gone(error) {
            return Ok(());
        }
        return Err(convert_error_payload(error));
    }
    let Some(value) = &response.value else {
        return Ok(());
    };
    mirror_single_node(shared, target_space, local_path, value, false)
}

/// True for read errors meaning the remote node does not (or no longer)
/// exist; mirrors skip such nodes instead of failing the cycle.
fn node_gone(error: &ErrorPayload) -> bool {
    matches!(error.code.as_str(), "no_such_path" | "not_found" | "deleted")
}

/// Write one mirrored payload into the local target space.
///
/// Tree snapshots overwrite the destination; append-only mirrors append.
fn mirror_single_node(
    shared: &Arc<ManagerShared>,
    space: &Arc<PathSpace>,
    local_path: &str,
    payload: &ValuePayload,
    overwrite: bool,
) -> Expected<()> {
    if payload.encoding == ENCODING_TYPED {
        if payload.type_name.is_empty() {
            return Err(Error::InvalidType("Mirrored payload missing type".into()));
        }
        let raw = base64::decode(&payload.data)?;
        let snapshot = NodeData::deserialize_snapshot(&raw)
            .map_err(|_| Error::InvalidType("Failed to decode mirrored value".into()))?;
        let record = snapshot
            .front_record()
            .map_err(|_| Error::InvalidType("Mirrored snapshot has no value".into()))?;
        if TypeRegistry::global().find_by_name(&record.type_name).is_none() {
            return Err(Error::InvalidType(format!(
                "unregistered type {}",
                record.type_name
            )));
        }
        let result = if overwrite {
            space.replace_serialized(local_path, record)
        } else {
            space.insert_serialized(local_path, record)
        };
        if let Some(error) = result.errors.first() {
            return Err(error.clone());
        }
        return Ok(());
    }
    if payload.encoding == ENCODING_STRING {
        if !shared.payload_mode.allows_legacy() {
            return Err(Error::InvalidType(
                "legacy remote payload encodings are disabled (set PATHSPACE_REMOTE_TYPED_PAYLOADS=0 to re-enable temporarily)"
                    .into(),
            ));
        }
        let raw = base64::decode(&payload.data)?;
        let value = String::from_utf8_lossy(&raw).into_owned();
        let result = if overwrite {
            space.replace(local_path, &value)
        } else {
            space.insert(local_path, &value)
        };
        if let Some(error) = result.errors.first() {
            return Err(error.clone());
        }
        return Ok(());
    }
    if payload.encoding == ENCODING_VOID {
        return Ok(());
    }
    Err(Error::InvalidType(
        "Unsupported mirrored payload encoding".into(),
    ))
}

fn substitute_alias(pattern: &str, alias: &str) -> String {
    pattern.replace("{alias}", alias)
}
