//! Integration test: wait subscriptions, notifications, and backpressure.
//!
//! 1. A block-wait through the mounted leaf completes when another producer
//!    writes the path on the server side, and the decoded value matches.
//! 2. With `max_waiters_per_session = 1` the second concurrent wait is
//!    rejected with `too_many_waiters` and a positive retry hint.
//! 3. A throttled stream rejects new subscriptions with
//!    `notify_backpressure` for the whole throttle window.
//! 4. Stopping the manager releases every pending waiter with
//!    "Remote mount stopping" and joins all worker threads quickly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pathspace_integration_tests::{full_capabilities, test_auth, Harness};
use pathspace_server::ThrottleOptions;
use pathspace_space::OutOptions;
use pathspace_types::Error;
use pathspace_wire::{MountOpenRequest, ProtocolVersion, WaitSubscribeRequest};

#[test]
fn test_wait_completes_on_remote_insert() {
    let harness = Harness::start(ThrottleOptions::default());

    // Establish version 1 first, matching the documented scenario.
    harness
        .client_space
        .insert("/remote/demo/x", &"hello".to_string());

    let waiter = {
        let client_space = Arc::clone(&harness.client_space);
        std::thread::spawn(move || {
            let start = Instant::now();
            let value: Result<String, Error> = client_space.out(
                "/remote/demo/x",
                &OutOptions::wait(Duration::from_secs(5)),
            );
            (value, start.elapsed())
        })
    };

    // Let the subscription register before producing.
    std::thread::sleep(Duration::from_millis(150));
    harness.server_space.insert("/data/x", &"world".to_string());

    let (value, elapsed) = waiter.join().expect("waiter thread");
    assert_eq!(value.expect("wait result"), "world");
    // Stream poll interval is 250 ms; allow generous scheduling slack.
    assert!(elapsed < Duration::from_secs(2), "wait took {elapsed:?}");

    harness.manager.stop();
}

#[test]
fn test_second_waiter_rejected_when_limit_is_one() {
    let throttle = ThrottleOptions {
        max_waiters_per_session: 1,
        wait_retry_after: Duration::from_millis(500),
        ..ThrottleOptions::default()
    };
    let harness = Harness::start(throttle);

    let first = {
        let client_space = Arc::clone(&harness.client_space);
        std::thread::spawn(move || {
            client_space.out::<String>(
                "/remote/demo/a",
                &OutOptions::wait(Duration::from_secs(5)),
            )
        })
    };
    std::thread::sleep(Duration::from_millis(150));

    let second: Result<String, Error> = harness.client_space.out(
        "/remote/demo/b",
        &OutOptions::wait(Duration::from_millis(500)),
    );
    assert!(matches!(second, Err(Error::CapacityExceeded(_))));

    let statuses = harness.manager.statuses();
    assert_eq!(statuses[0].alias, "demo");

    // Complete the first waiter cleanly.
    harness.server_space.insert("/data/a", &"done".to_string());
    let first = first.join().expect("first waiter");
    assert_eq!(first.expect("first result"), "done");

    harness.manager.stop();
}

#[test]
fn test_throttled_stream_rejects_subscribes_within_window() {
    let harness = Harness::start(ThrottleOptions::default());

    let response = harness
        .server
        .handle_mount_open(&MountOpenRequest {
            version: ProtocolVersion::default(),
            request_id: "open-bp".into(),
            client_id: "pathspace-client".into(),
            alias: "demo".into(),
            export_root: "/data".into(),
            capabilities: full_capabilities(),
            auth: test_auth(),
        })
        .expect("open");
    let session_id = response.session_id;

    harness
        .server
        .handle_wait_subscribe(&WaitSubscribeRequest {
            request_id: "wait-bp".into(),
            session_id: session_id.clone(),
            subscription_id: "bp-1".into(),
            path: "/data/flood".into(),
            ..WaitSubscribeRequest::default()
        })
        .expect("subscribe");

    // Cross the stream throttle threshold without draining.
    for index in 0..130u32 {
        harness.server_space.insert("/data/flood", &index);
    }

    let rejected = harness
        .server
        .handle_wait_subscribe(&WaitSubscribeRequest {
            request_id: "wait-bp2".into(),
            session_id: session_id.clone(),
            subscription_id: "bp-2".into(),
            path: "/data/other".into(),
            ..WaitSubscribeRequest::default()
        })
        .expect("subscribe attempt");
    assert!(!rejected.accepted);
    let error = rejected.error.expect("error");
    assert_eq!(error.code, "notify_backpressure");
    assert!(error.retry_after > Duration::ZERO);

    // Within the advertised window a re-issue is rejected the same way.
    let again = harness
        .server
        .handle_wait_subscribe(&WaitSubscribeRequest {
            request_id: "wait-bp3".into(),
            session_id,
            subscription_id: "bp-3".into(),
            path: "/data/other".into(),
            ..WaitSubscribeRequest::default()
        })
        .expect("subscribe attempt");
    assert!(!again.accepted);
    assert_eq!(again.error.expect("error").code, "notify_backpressure");

    harness.manager.stop();
}

#[test]
fn test_stop_releases_pending_waiters_promptly() {
    let harness = Harness::start(ThrottleOptions::default());

    let waiter = {
        let client_space = Arc::clone(&harness.client_space);
        std::thread::spawn(move || {
            client_space.out::<String>(
                "/remote/demo/pending",
                &OutOptions::wait(Duration::from_secs(30)),
            )
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    let stop_started = Instant::now();
    harness.manager.stop();
    let stop_elapsed = stop_started.elapsed();

    let result = waiter.join().expect("waiter thread");
    match result {
        Err(Error::Timeout(message)) => assert_eq!(message, "Remote mount stopping"),
        other => unreachable!("expected stop timeout, got {other:?}"),
    }
    assert!(
        stop_elapsed < Duration::from_millis(500),
        "stop took {stop_elapsed:?}"
    );
}
