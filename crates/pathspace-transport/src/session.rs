//! TLS client session: one connection per RPC.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pathspace_client::{
    MountOptions, RemoteSession, SessionFactory, TlsClientConfig,
};
use pathspace_types::{Error, Expected};
use pathspace_wire::framing::DEFAULT_MAX_FRAME_LEN;
use pathspace_wire::{
    AuthKind, FrameKind, FramePayload, Heartbeat, InsertRequest, InsertResponse, MountOpenRequest,
    MountOpenResponse, Notification, NotificationStreamRequest, ReadRequest, ReadResponse,
    RemoteFrame, TakeRequest, TakeResponse, WaitSubscribeAck, WaitSubscribeRequest,
};

use crate::framed;
use crate::tls;

const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_millis(250);

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// A connection-scoped TLS session against one mount server.
///
/// Every RPC dials, performs the TLS handshake, exchanges one frame pair,
/// and drops the connection. The client certificate's fingerprint and
/// subject are injected into outbound mount-open requests when the caller
/// left those auth fields empty.
pub struct TlsSession {
    options: MountOptions,
    config: TlsClientConfig,
    tls_config: Arc<rustls::ClientConfig>,
    client_fingerprint: String,
    client_subject: String,
    session_id: Mutex<String>,
    request_counter: std::sync::atomic::AtomicU64,
}

impl TlsSession {
    /// Remember the session id for single-subscription notification polls.
    pub fn set_session_id(&self, session_id: &str) {
        if let Ok(mut slot) = self.session_id.lock() {
            *slot = session_id.to_string();
        }
    }

    fn invoke(&self, payload: FramePayload, expected: FrameKind) -> Expected<FramePayload> {
        let mut stream = self.connect()?;
        framed::write_frame(&mut stream, RemoteFrame::new(payload), DEFAULT_MAX_FRAME_LEN)?;
        let response = framed::read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN)?;
        if let FramePayload::Error(error) = &response.payload {
            return Err(Error::from_wire(&error.code, error.message.clone()));
        }
        if response.payload.kind() != expected {
            return Err(Error::Unknown("unexpected response frame kind".into()));
        }
        Ok(response.payload)
    }

    fn connect(&self) -> Expected<TlsStream> {
        let address = format!("{}:{}", self.options.host, self.options.port);
        let mut last_error = Error::Unknown(format!("unable to resolve {address}"));
        let addrs = address
            .to_socket_addrs()
            .map_err(|e| Error::Unknown(format!("resolve failed: {e}")))?;
        let mut socket = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(connected) => {
                    socket = Some(connected);
                    break;
                }
                Err(e) => last_error = Error::Unknown(format!("connect failed: {e}")),
            }
        }
        let socket = socket.ok_or(last_error)?;
        socket
            .set_nodelay(true)
            .map_err(|e| Error::Unknown(format!("socket config failed: {e}")))?;

        let sni = if self.config.sni_host.is_empty() {
            self.options.host.clone()
        } else {
            self.config.sni_host.clone()
        };
        let server_name = rustls::pki_types::ServerName::try_from(sni)
            .map_err(|e| Error::Unknown(format!("invalid SNI host: {e}")))?;
        let connection = rustls::ClientConnection::new(Arc::clone(&self.tls_config), server_name)
            .map_err(|e| Error::Unknown(format!("TLS connection failed: {e}")))?;
        let mut stream = rustls::StreamOwned::new(connection, socket);
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|e| Error::Unknown(format!("TLS handshake failed: {e}")))?;
        }
        Ok(stream)
    }

    fn next_request_id(&self) -> String {
        format!(
            "notif-{}",
            self.request_counter
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        )
    }
}

impl RemoteSession for TlsSession {
    fn open(&self, request: &MountOpenRequest) -> Expected<MountOpenResponse> {
        let mut adjusted = request.clone();
        if !self.client_fingerprint.is_empty() {
            adjusted.auth.fingerprint = self.client_fingerprint.clone();
            if adjusted.auth.proof.is_empty() {
                adjusted.auth.proof = self.client_fingerprint.clone();
            }
        }
        if adjusted.auth.subject.is_empty() && !self.client_subject.is_empty() {
            adjusted.auth.subject = self.client_subject.clone();
        }
        adjusted.auth.kind = AuthKind::MutualTls;
        match self.invoke(
            FramePayload::MountOpenRequest(adjusted),
            FrameKind::MountOpenResponse,
        )? {
            FramePayload::MountOpenResponse(response) => {
                if response.accepted {
                    self.set_session_id(&response.session_id);
                }
                Ok(response)
            }
            _ => Err(Error::Unknown("unexpected response frame kind".into())),
        }
    }

    fn read(&self, request: &ReadRequest) -> Expected<ReadResponse> {
        match self.invoke(
            FramePayload::ReadRequest(request.clone()),
            FrameKind::ReadResponse,
        )? {
            FramePayload::ReadResponse(response) => Ok(response),
            _ => Err(Error::Unknown("unexpected response frame kind".into())),
        }
    }

    fn insert(&self, request: &InsertRequest) -> Expected<InsertResponse> {
        match self.invoke(
            FramePayload::InsertRequest(request.clone()),
            FrameKind::InsertResponse,
        )? {
            FramePayload::InsertResponse(response) => Ok(response),
            _ => Err(Error::Unknown("unexpected response frame kind".into())),
        }
    }

    fn take(&self, request: &TakeRequest) -> Expected<TakeResponse> {
        match self.invoke(
            FramePayload::TakeRequest(request.clone()),
            FrameKind::TakeResponse,
        )? {
            FramePayload::TakeResponse(response) => Ok(response),
            _ => Err(Error::Unknown("unexpected response frame kind".into())),
        }
    }

    fn wait_subscribe(&self, request: &WaitSubscribeRequest) -> Expected<WaitSubscribeAck> {
        match self.invoke(
            FramePayload::WaitSubscribeRequest(request.clone()),
            FrameKind::WaitSubscribeAck,
        )? {
            FramePayload::WaitSubscribeAck(ack) => Ok(ack),
            _ => Err(Error::Unknown("unexpected response frame kind".into())),
        }
    }

    fn next_notification(
        &self,
        _subscription_id: &str,
        timeout: Duration,
    ) -> Expected<Option<Notification>> {
        // Single-item polls ride the streaming path with a batch of one.
        let session_id = self
            .session_id
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or_default();
        let timeout = if timeout.is_zero() {
            DEFAULT_NOTIFICATION_TIMEOUT
        } else {
            timeout
        };
        let mut batch = self.stream_notifications(&session_id, timeout, 1)?;
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch.remove(0)))
        }
    }

    fn stream_notifications(
        &self,
        session_id: &str,
        timeout: Duration,
        max_batch: usize,
    ) -> Expected<Vec<Notification>> {
        let request = NotificationStreamRequest {
            request_id: self.next_request_id(),
            session_id: session_id.to_string(),
            timeout: if timeout.is_zero() {
                DEFAULT_NOTIFICATION_TIMEOUT
            } else {
                timeout
            },
            max_batch: max_batch.max(1),
        };
        match self.invoke(
            FramePayload::NotificationStreamRequest(request),
            FrameKind::NotificationStreamResponse,
        )? {
            FramePayload::NotificationStreamResponse(response) => {
                if let Some(error) = response.error {
                    return Err(Error::from_wire(&error.code, error.message));
                }
                Ok(response.notifications)
            }
            _ => Err(Error::Unknown("unexpected response frame kind".into())),
        }
    }

    fn heartbeat(&self, heartbeat: &Heartbeat) -> Expected<()> {
        match self.invoke(
            FramePayload::Heartbeat(heartbeat.clone()),
            FrameKind::Heartbeat,
        )? {
            FramePayload::Heartbeat(_) => Ok(()),
            _ => Err(Error::Unknown("unexpected response frame kind".into())),
        }
    }
}

/// Creates [`TlsSession`]s from mount configurations.
pub struct TlsSessionFactory {
    default_config: Option<TlsClientConfig>,
}

impl TlsSessionFactory {
    /// Optionally supply a TLS configuration used by mounts that carry
    /// none of their own.
    pub fn new(default_config: Option<TlsClientConfig>) -> Self {
        Self { default_config }
    }
}

impl SessionFactory for TlsSessionFactory {
    fn create(&self, options: &MountOptions) -> Expected<Arc<dyn RemoteSession>> {
        let config = options
            .tls
            .clone()
            .or_else(|| self.default_config.clone())
            .unwrap_or_default();
        if config.client_cert_path.is_empty() || config.client_key_path.is_empty() {
            return Err(Error::Unknown(
                "client certificate and key required".into(),
            ));
        }
        let tls_config = tls::build_client_config(&config)?;
        let chain = tls::load_certificates(&config.client_cert_path)?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Unknown("client certificate chain empty".into()))?;
        let fingerprint = tls::certificate_fingerprint(leaf);
        let subject = tls::certificate_subject(leaf);
        Ok(Arc::new(TlsSession {
            options: options.clone(),
            config,
            tls_config,
            client_fingerprint: fingerprint,
            client_subject: subject,
            session_id: Mutex::new(String::new()),
            request_counter: std::sync::atomic::AtomicU64::new(1),
        }))
    }
}
