//! Integration test: mirror loops.
//!
//! Uses an export rooted at `/` so mirror reads stay inside the export:
//! 1. A tree-snapshot mirror copies a remote subtree into the metrics
//!    space and refreshes values on later cycles.
//! 2. An append-only mirror copies only children that sort after the last
//!    mirrored child.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pathspace_client::{
    ManagerOptions, MirrorMode, MirrorOptions, MirrorTarget, MountManager, MountOptions,
    SessionFactory,
};
use pathspace_integration_tests::{full_capabilities, test_auth};
use pathspace_server::{ExportOptions, MountServer, ServerOptions};
use pathspace_space::PathSpace;
use pathspace_transport::LoopbackSessionFactory;

struct MirrorHarness {
    server_space: Arc<PathSpace>,
    client_space: Arc<PathSpace>,
    metrics_space: Arc<PathSpace>,
    manager: MountManager,
}

fn start_with_mirror(mirror: MirrorOptions) -> MirrorHarness {
    let server_space = PathSpace::new();
    let client_space = PathSpace::new();
    let metrics_space = PathSpace::new();

    let server = MountServer::new(ServerOptions {
        exports: vec![ExportOptions {
            alias: "demo".into(),
            export_root: "/".into(),
            space: Some(Arc::clone(&server_space)),
            capabilities: vec!["read".into(), "wait".into(), "insert".into(), "take".into()],
            ..ExportOptions::default()
        }],
        ..ServerOptions::default()
    });

    let factory: Arc<dyn SessionFactory> = Arc::new(LoopbackSessionFactory::new(server));
    let manager = MountManager::new(
        ManagerOptions {
            root_space: Some(Arc::clone(&client_space)),
            metrics_space: Some(Arc::clone(&metrics_space)),
            mounts: vec![MountOptions {
                alias: "demo".into(),
                export_root: "/".into(),
                capabilities: full_capabilities(),
                auth: test_auth(),
                use_tls: false,
                mirrors: vec![mirror],
                ..MountOptions::default()
            }],
            ..ManagerOptions::default()
        },
        factory,
    );
    manager.start();
    MirrorHarness {
        server_space,
        client_space,
        metrics_space,
        manager,
    }
}

fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn test_tree_snapshot_mirror_copies_and_refreshes() {
    let harness = start_with_mirror(MirrorOptions {
        mode: MirrorMode::TreeSnapshot,
        target: MirrorTarget::MetricsSpace,
        remote_root: "/stats/{alias}".into(),
        local_root: "/mirrored/{alias}".into(),
        max_depth: 4,
        max_nodes: 64,
        interval: Duration::from_millis(100),
        ..MirrorOptions::default()
    });

    harness.server_space.insert("/stats/demo/alpha", &1i64);
    harness.server_space.insert("/stats/demo/beta/gamma", &2i64);

    let alpha = wait_for(
        || harness.metrics_space.read::<i64>("/mirrored/demo/alpha").ok(),
        Duration::from_secs(5),
    );
    assert_eq!(alpha, Some(1));
    let gamma = wait_for(
        || {
            harness
                .metrics_space
                .read::<i64>("/mirrored/demo/beta/gamma")
                .ok()
        },
        Duration::from_secs(5),
    );
    assert_eq!(gamma, Some(2));

    // Snapshots overwrite: a changed remote value replaces the copy.
    harness.server_space.replace("/stats/demo/alpha", &9i64);
    let refreshed = wait_for(
        || {
            harness
                .metrics_space
                .read::<i64>("/mirrored/demo/alpha")
                .ok()
                .filter(|value| *value == 9)
        },
        Duration::from_secs(5),
    );
    assert_eq!(refreshed, Some(9));

    harness.manager.stop();
}

#[test]
fn test_append_only_mirror_advances_past_last_child() {
    let harness = start_with_mirror(MirrorOptions {
        mode: MirrorMode::AppendOnly,
        target: MirrorTarget::RootSpace,
        remote_root: "/events".into(),
        local_root: "/copied/events".into(),
        max_depth: 1,
        max_nodes: 16,
        interval: Duration::from_millis(100),
        ..MirrorOptions::default()
    });

    harness
        .server_space
        .insert("/events/0001", &"first".to_string());
    harness
        .server_space
        .insert("/events/0002", &"second".to_string());

    let copied = wait_for(
        || {
            harness
                .client_space
                .read::<String>("/copied/events/0002")
                .ok()
        },
        Duration::from_secs(5),
    );
    assert_eq!(copied.as_deref(), Some("second"));
    let first: String = harness
        .client_space
        .read("/copied/events/0001")
        .expect("first copy");
    assert_eq!(first, "first");

    // A child sorting after the cursor is picked up; the older ones are
    // not copied twice (append-only queues would grow otherwise).
    harness
        .server_space
        .insert("/events/0003", &"third".to_string());
    let third = wait_for(
        || {
            harness
                .client_space
                .read::<String>("/copied/events/0003")
                .ok()
        },
        Duration::from_secs(5),
    );
    assert_eq!(third.as_deref(), Some("third"));

    // Each copied node still holds exactly one value.
    let record = harness
        .client_space
        .read_serialized("/copied/events/0001")
        .expect("record");
    assert!(!record.bytes.is_empty());

    harness.manager.stop();
}
