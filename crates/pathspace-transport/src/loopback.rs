//! In-process session factory that short-circuits RPCs into a server.
//!
//! No sockets, no TLS: every call lands directly on the
//! [`MountServer`](pathspace_server::MountServer) handlers. Hosts embedding
//! both sides in one process use this, and so do the end-to-end tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pathspace_client::{MountOptions, RemoteSession, SessionFactory};
use pathspace_server::MountServer;
use pathspace_types::Expected;
use pathspace_wire::{
    Heartbeat, InsertRequest, InsertResponse, MountOpenRequest, MountOpenResponse, Notification,
    ReadRequest, ReadResponse, TakeRequest, TakeResponse, WaitSubscribeAck, WaitSubscribeRequest,
};

const POLL_STEP: Duration = Duration::from_millis(5);

/// A session bound directly to a server instance.
pub struct LoopbackSession {
    server: Arc<MountServer>,
}

impl RemoteSession for LoopbackSession {
    fn open(&self, request: &MountOpenRequest) -> Expected<MountOpenResponse> {
        self.server.handle_mount_open(request)
    }

    fn read(&self, request: &ReadRequest) -> Expected<ReadResponse> {
        self.server.handle_read(request)
    }

    fn insert(&self, request: &InsertRequest) -> Expected<InsertResponse> {
        self.server.handle_insert(request)
    }

    fn take(&self, request: &TakeRequest) -> Expected<TakeResponse> {
        self.server.handle_take(request)
    }

    fn wait_subscribe(&self, request: &WaitSubscribeRequest) -> Expected<WaitSubscribeAck> {
        self.server.handle_wait_subscribe(request)
    }

    fn next_notification(
        &self,
        subscription_id: &str,
        timeout: Duration,
    ) -> Expected<Option<Notification>> {
        let start = Instant::now();
        loop {
            if let Some(notification) = self.server.next_notification(subscription_id) {
                return Ok(Some(notification));
            }
            if timeout.is_zero() || start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(POLL_STEP);
        }
    }

    fn stream_notifications(
        &self,
        session_id: &str,
        timeout: Duration,
        max_batch: usize,
    ) -> Expected<Vec<Notification>> {
        self.server
            .handle_notification_stream(session_id, timeout, max_batch)
    }

    fn heartbeat(&self, heartbeat: &Heartbeat) -> Expected<()> {
        self.server.handle_heartbeat(heartbeat)
    }
}

/// Hands out [`LoopbackSession`]s for every mount.
pub struct LoopbackSessionFactory {
    server: Arc<MountServer>,
}

impl LoopbackSessionFactory {
    pub fn new(server: Arc<MountServer>) -> Self {
        Self { server }
    }
}

impl SessionFactory for LoopbackSessionFactory {
    fn create(&self, _options: &MountOptions) -> Expected<Arc<dyn RemoteSession>> {
        Ok(Arc::new(LoopbackSession {
            server: Arc::clone(&self.server),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathspace_server::{ExportOptions, ServerOptions};
    use pathspace_space::PathSpace;
    use pathspace_wire::{AuthContext, CapabilityRequest};

    fn demo_server() -> (Arc<PathSpace>, Arc<MountServer>) {
        let space = PathSpace::new();
        let server = MountServer::new(ServerOptions {
            exports: vec![ExportOptions {
                alias: "demo".into(),
                export_root: "/data".into(),
                space: Some(Arc::clone(&space)),
                capabilities: vec!["read".into(), "wait".into()],
                ..ExportOptions::default()
            }],
            ..ServerOptions::default()
        });
        (space, server)
    }

    #[test]
    fn test_loopback_open_and_heartbeat() {
        let (_space, server) = demo_server();
        let factory = LoopbackSessionFactory::new(server);
        let session = factory.create(&MountOptions::default()).expect("session");

        let response = session
            .open(&MountOpenRequest {
                request_id: "open-1".into(),
                client_id: "pathspace-client".into(),
                alias: "demo".into(),
                export_root: "/data".into(),
                capabilities: vec![CapabilityRequest::named("read")],
                auth: AuthContext {
                    subject: "CN=test".into(),
                    proof: "sha256:aa".into(),
                    ..AuthContext::default()
                },
                ..MountOpenRequest::default()
            })
            .expect("open");
        assert!(response.accepted);

        session
            .heartbeat(&Heartbeat {
                session_id: response.session_id,
                sequence: 1,
            })
            .expect("heartbeat");
    }

    #[test]
    fn test_next_notification_polls_until_timeout() {
        let (_space, server) = demo_server();
        let factory = LoopbackSessionFactory::new(server);
        let session = factory.create(&MountOptions::default()).expect("session");

        let start = Instant::now();
        let polled = session
            .next_notification("no-such-sub", Duration::from_millis(30))
            .expect("poll");
        assert!(polled.is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
