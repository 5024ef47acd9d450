//! TLS server acceptor: one listener thread, one thread per connection.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use pathspace_server::MountServer;
use pathspace_types::{Error, Expected};
use pathspace_wire::framing::DEFAULT_MAX_FRAME_LEN;
use pathspace_wire::{
    AuthKind, ErrorPayload, FramePayload, NotificationStreamResponse, RemoteFrame,
};

use crate::framed;
use crate::tls;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Listener configuration for the TLS mount server.
#[derive(Clone, Debug)]
pub struct TlsServerConfig {
    /// Address to bind.
    pub bind_address: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Server certificate chain (PEM).
    pub certificate_path: String,
    /// Server private key (PEM).
    pub private_key_path: String,
    /// CA bundle for verifying client certificates.
    pub ca_cert_path: String,
    /// Reject connections without a client certificate.
    pub require_client_certificate: bool,
    /// Socket timeout applied around the TLS handshake and frame exchange.
    pub handshake_timeout: Duration,
}

impl Default for TlsServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 18443,
            certificate_path: String::new(),
            private_key_path: String::new(),
            ca_cert_path: String::new(),
            require_client_certificate: true,
            handshake_timeout: Duration::from_millis(5000),
        }
    }
}

/// TCP+TLS front end for a [`MountServer`].
///
/// The acceptor thread hands each connection to its own short-lived thread,
/// which completes the TLS handshake, reads one request frame, dispatches
/// it, writes the response (or an error frame), and closes.
pub struct TlsMountServer {
    config: TlsServerConfig,
    server: Arc<MountServer>,
    running: Arc<AtomicBool>,
    actual_port: AtomicU16,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TlsMountServer {
    pub fn new(config: TlsServerConfig, server: Arc<MountServer>) -> Self {
        Self {
            config,
            server,
            running: Arc::new(AtomicBool::new(false)),
            actual_port: AtomicU16::new(0),
            accept_thread: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting. Returns `false` when the TLS
    /// configuration or the bind fails.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return true;
        }
        let tls_config = match tls::build_server_config(
            &self.config.certificate_path,
            &self.config.private_key_path,
            &self.config.ca_cert_path,
            self.config.require_client_certificate,
        ) {
            Ok(config) => config,
            Err(error) => {
                self.running.store(false, Ordering::SeqCst);
                tracing::warn!(%error, "failed to configure server TLS context");
                return false;
            }
        };
        let listener =
            match TcpListener::bind((self.config.bind_address.as_str(), self.config.port)) {
                Ok(listener) => listener,
                Err(error) => {
                    self.running.store(false, Ordering::SeqCst);
                    tracing::warn!(%error, "failed to bind mount server listener");
                    return false;
                }
            };
        if listener.set_nonblocking(true).is_err() {
            self.running.store(false, Ordering::SeqCst);
            return false;
        }
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port);
        self.actual_port.store(port, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let server = Arc::clone(&self.server);
        let handshake_timeout = self.config.handshake_timeout;
        let handle = std::thread::spawn(move || {
            accept_loop(listener, running, server, tls_config, handshake_timeout);
        });
        if let Ok(mut slot) = self.accept_thread.lock() {
            *slot = Some(handle);
        }
        tracing::info!(port, "mount server listening");
        true
    }

    /// Stop accepting and join the listener thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self
            .accept_thread
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound port, once started.
    pub fn port(&self) -> u16 {
        self.actual_port.load(Ordering::SeqCst)
    }
}

impl Drop for TlsMountServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    server: Arc<MountServer>,
    tls_config: Arc<rustls::ServerConfig>,
    handshake_timeout: Duration,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((socket, _peer)) => {
                let server = Arc::clone(&server);
                let tls_config = Arc::clone(&tls_config);
                std::thread::spawn(move || {
                    handle_connection(socket, server, tls_config, handshake_timeout);
                });
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(_) => {
                if running.load(Ordering::SeqCst) {
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

fn handle_connection(
    socket: TcpStream,
    server: Arc<MountServer>,
    tls_config: Arc<rustls::ServerConfig>,
    handshake_timeout: Duration,
) {
    if socket.set_nonblocking(false).is_err() {
        return;
    }
    let _ = socket.set_read_timeout(Some(handshake_timeout));
    let _ = socket.set_write_timeout(Some(handshake_timeout));

    let Ok(connection) = rustls::ServerConnection::new(tls_config) else {
        return;
    };
    let mut stream = rustls::StreamOwned::new(connection, socket);
    while stream.conn.is_handshaking() {
        if stream.conn.complete_io(&mut stream.sock).is_err() {
            return;
        }
    }

    let (fingerprint, subject) = match stream.conn.peer_certificates() {
        Some(certs) if !certs.is_empty() => (
            tls::certificate_fingerprint(&certs[0]),
            tls::certificate_subject(&certs[0]),
        ),
        _ => (String::new(), String::new()),
    };

    let frame = match framed::read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN) {
        Ok(frame) => frame,
        Err(_) => return,
    };

    let response = dispatch_guarded(&server, frame, &fingerprint, &subject);
    let frame = match response {
        Ok(frame) => frame,
        Err(error) => RemoteFrame::new(FramePayload::Error(ErrorPayload::from_error(&error))),
    };
    let _ = framed::write_frame(&mut stream, frame, DEFAULT_MAX_FRAME_LEN);
}

/// Route a frame to the matching server handler, converting panics and
/// handler errors into error frames.
pub fn dispatch_guarded(
    server: &Arc<MountServer>,
    frame: RemoteFrame,
    fingerprint: &str,
    subject: &str,
) -> Expected<RemoteFrame> {
    let server = Arc::clone(server);
    let fingerprint = fingerprint.to_string();
    let subject = subject.to_string();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        dispatch(&server, frame, &fingerprint, &subject)
    }));
    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::Unknown("request handler panicked".into())),
    }
}

fn dispatch(
    server: &Arc<MountServer>,
    frame: RemoteFrame,
    fingerprint: &str,
    subject: &str,
) -> Expected<RemoteFrame> {
    match frame.payload {
        FramePayload::MountOpenRequest(mut request) => {
            request.auth.kind = AuthKind::MutualTls;
            if !fingerprint.is_empty() {
                request.auth.fingerprint = fingerprint.to_string();
                if request.auth.proof.is_empty() {
                    request.auth.proof = fingerprint.to_string();
                }
            }
            if request.auth.subject.is_empty() {
                request.auth.subject = subject.to_string();
            }
            let response = server.handle_mount_open(&request)?;
            Ok(RemoteFrame::new(FramePayload::MountOpenResponse(response)))
        }
        FramePayload::ReadRequest(request) => {
            let response = server.handle_read(&request)?;
            Ok(RemoteFrame::new(FramePayload::ReadResponse(response)))
        }
        FramePayload::InsertRequest(request) => {
            let response = server.handle_insert(&request)?;
            Ok(RemoteFrame::new(FramePayload::InsertResponse(response)))
        }
        FramePayload::TakeRequest(request) => {
            let response = server.handle_take(&request)?;
            Ok(RemoteFrame::new(FramePayload::TakeResponse(response)))
        }
        FramePayload::WaitSubscribeRequest(request) => {
            let ack = server.handle_wait_subscribe(&request)?;
            Ok(RemoteFrame::new(FramePayload::WaitSubscribeAck(ack)))
        }
        FramePayload::Heartbeat(heartbeat) => {
            server.handle_heartbeat(&heartbeat)?;
            Ok(RemoteFrame::new(FramePayload::Heartbeat(heartbeat)))
        }
        FramePayload::NotificationStreamRequest(request) => {
            let notifications = server.handle_notification_stream(
                &request.session_id,
                request.timeout,
                request.max_batch,
            )?;
            Ok(RemoteFrame::new(FramePayload::NotificationStreamResponse(
                NotificationStreamResponse {
                    request_id: request.request_id,
                    session_id: request.session_id,
                    notifications,
                    error: None,
                },
            )))
        }
        _ => Err(Error::MalformedInput("unexpected request frame".into())),
    }
}
