//! Integration test: typed traffic through a mounted subtree.
//!
//! 1. Insert a `String` through the client's mounted leaf and read it back:
//!    the server stores it under `/data/x`, reports `values_inserted = 1`,
//!    and the first read sees version 1.
//! 2. The read-consistency gate: `AtLeastVersion(2)` against version 1
//!    returns `consistency_not_met` with `retryable = true`.
//! 3. Take batching: the first remote take drains the server queue and
//!    caches the surplus client-side.
//! 4. Legacy payload decoding obeys the compatibility mode.

use std::sync::Arc;

use pathspace_client::{MountOptions, RemoteSession as _, SessionFactory};
use pathspace_integration_tests::{full_capabilities, test_auth, Harness};
use pathspace_server::ThrottleOptions;
use pathspace_space::{type_name_of, OutOptions};
use pathspace_transport::LoopbackSessionFactory;
use pathspace_types::Error;
use pathspace_wire::{
    base64, InsertRequest, MountOpenRequest, PayloadCompatibility, ProtocolVersion,
    ReadConsistency, ReadConsistencyMode, ReadRequest, ValuePayload, ENCODING_STRING,
};

#[test]
fn test_insert_and_read_roundtrip() {
    let harness = Harness::start(ThrottleOptions::default());

    let inserted = harness
        .client_space
        .insert("/remote/demo/x", &"hello".to_string());
    assert!(inserted.is_ok(), "insert failed: {:?}", inserted.errors);
    assert_eq!(inserted.values_inserted, 1);

    // The value landed on the server side of the mount.
    let on_server: String = harness.server_space.read("/data/x").expect("server read");
    assert_eq!(on_server, "hello");

    // And reads through the mount see it too.
    let through_mount: String = harness.client_space.read("/remote/demo/x").expect("read");
    assert_eq!(through_mount, "hello");

    harness.manager.stop();
}

#[test]
fn test_version_gate() {
    let harness = Harness::start(ThrottleOptions::default());
    let factory = LoopbackSessionFactory::new(Arc::clone(&harness.server));
    let session = factory.create(&MountOptions::default()).expect("session");

    let open = session
        .open(&MountOpenRequest {
            version: ProtocolVersion { major: 1, minor: 0 },
            request_id: "open-gate".into(),
            client_id: "pathspace-client".into(),
            alias: "demo".into(),
            export_root: "/data".into(),
            capabilities: full_capabilities(),
            auth: test_auth(),
        })
        .expect("open");
    assert!(open.accepted);

    harness.server_space.insert("/data/x", &7u64);

    let read = session
        .read(&ReadRequest {
            request_id: "read-1".into(),
            session_id: open.session_id.clone(),
            path: "/data/x".into(),
            ..ReadRequest::default()
        })
        .expect("read");
    assert_eq!(read.version, 1);
    assert!(read.error.is_none());

    let gated = session
        .read(&ReadRequest {
            request_id: "read-2".into(),
            session_id: open.session_id,
            path: "/data/x".into(),
            consistency: Some(ReadConsistency {
                mode: ReadConsistencyMode::AtLeastVersion,
                at_least_version: Some(2),
            }),
            ..ReadRequest::default()
        })
        .expect("read");
    assert_eq!(gated.version, 1);
    let error = gated.error.expect("gate error");
    assert_eq!(error.code, "consistency_not_met");
    assert!(error.retryable);

    harness.manager.stop();
}

#[test]
fn test_take_batch_caches_surplus() {
    let harness = Harness::start(ThrottleOptions::default());
    for value in [1u32, 2, 3] {
        harness.server_space.insert("/data/queue", &value);
    }

    let first: u32 = harness
        .client_space
        .take("/remote/demo/queue", &OutOptions::take())
        .expect("take");
    assert_eq!(first, 1);

    // The whole batch left the server on the first request.
    assert!(matches!(
        harness.server_space.read_serialized("/data/queue"),
        Err(Error::NoObjectFound(_))
    ));

    // The surplus is served from the client-side cache.
    let second: u32 = harness
        .client_space
        .take("/remote/demo/queue", &OutOptions::take())
        .expect("take");
    let third: u32 = harness
        .client_space
        .take("/remote/demo/queue", &OutOptions::take())
        .expect("take");
    assert_eq!((second, third), (2, 3));

    // Exhausted on both sides now.
    let empty: Result<u32, Error> = harness
        .client_space
        .take("/remote/demo/queue", &OutOptions::take());
    assert!(empty.is_err());

    harness.manager.stop();
}

#[test]
fn test_version_increments_by_one_per_notification() {
    let harness = Harness::start(ThrottleOptions::default());
    let factory = LoopbackSessionFactory::new(Arc::clone(&harness.server));
    let session = factory.create(&MountOptions::default()).expect("session");
    let open = session
        .open(&MountOpenRequest {
            version: ProtocolVersion::default(),
            request_id: "open-v".into(),
            client_id: "pathspace-client".into(),
            alias: "demo".into(),
            export_root: "/data".into(),
            capabilities: full_capabilities(),
            auth: test_auth(),
        })
        .expect("open");

    let mut last_version = 0u64;
    for round in 0..3 {
        harness
            .server
            .handle_wait_subscribe(&pathspace_wire::WaitSubscribeRequest {
                request_id: format!("wait-{round}"),
                session_id: open.session_id.clone(),
                subscription_id: format!("ver-{round}"),
                path: "/data/versioned".into(),
                ..pathspace_wire::WaitSubscribeRequest::default()
            })
            .expect("subscribe");
        harness.server_space.insert("/data/versioned", &(round as u32));
        let notification = harness
            .server
            .next_notification(&format!("ver-{round}"))
            .expect("notification");
        assert_eq!(notification.version, last_version + 1);
        last_version = notification.version;
    }

    harness.manager.stop();
}

fn legacy_string_payload(text: &str) -> ValuePayload {
    ValuePayload {
        encoding: ENCODING_STRING.to_string(),
        type_name: type_name_of::<String>().to_string(),
        schema_hint: None,
        data: base64::encode(text.as_bytes()),
    }
}

#[test]
fn test_legacy_payload_rejected_when_typed_only() {
    let harness = Harness::start(ThrottleOptions::default());
    let factory = LoopbackSessionFactory::new(Arc::clone(&harness.server));
    let session = factory.create(&MountOptions::default()).expect("session");
    let open = session
        .open(&MountOpenRequest {
            version: ProtocolVersion::default(),
            request_id: "open-legacy".into(),
            client_id: "pathspace-client".into(),
            alias: "demo".into(),
            export_root: "/data".into(),
            capabilities: full_capabilities(),
            auth: test_auth(),
        })
        .expect("open");

    let result = session.insert(&InsertRequest {
        request_id: "insert-legacy".into(),
        session_id: open.session_id,
        path: "/data/legacy".into(),
        type_name: type_name_of::<String>().to_string(),
        value: legacy_string_payload("old"),
    });
    assert!(matches!(result, Err(Error::InvalidType(_))));

    harness.manager.stop();
}

#[test]
fn test_legacy_payload_accepted_in_compat_mode() {
    let harness = Harness::start_with(ThrottleOptions::default(), |options| {
        options.payload_compatibility = Some(PayloadCompatibility::LegacyCompatible);
    });
    let factory = LoopbackSessionFactory::new(Arc::clone(&harness.server));
    let session = factory.create(&MountOptions::default()).expect("session");
    let open = session
        .open(&MountOpenRequest {
            version: ProtocolVersion::default(),
            request_id: "open-compat".into(),
            client_id: "pathspace-client".into(),
            alias: "demo".into(),
            export_root: "/data".into(),
            capabilities: full_capabilities(),
            auth: test_auth(),
        })
        .expect("open");

    let response = session
        .insert(&InsertRequest {
            request_id: "insert-compat".into(),
            session_id: open.session_id,
            path: "/data/legacy".into(),
            type_name: type_name_of::<String>().to_string(),
            value: legacy_string_payload("old"),
        })
        .expect("insert");
    assert!(response.success);
    let stored: String = harness.server_space.read("/data/legacy").expect("read");
    assert_eq!(stored, "old");

    harness.manager.stop();
}
