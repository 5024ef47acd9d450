//! # pathspace-transport
//!
//! Transports for the mount protocol.
//!
//! - **[`tls`]** — rustls configuration for both sides of the mutually
//!   authenticated connection, peer fingerprint and subject extraction.
//! - **[`session`]** — the TLS client session: every RPC dials a fresh
//!   connection, writes one request frame, reads one response frame, and
//!   closes. [`session::TlsSessionFactory`] plugs into the mount manager.
//! - **[`acceptor`]** — the TLS server: one listener thread, one short-lived
//!   thread per inbound connection, one frame dispatched per connection
//!   into a [`MountServer`](pathspace_server::MountServer).
//! - **[`loopback`]** — an in-process factory that short-circuits RPCs
//!   straight into a server instance, for hosts and tests that do not need
//!   a socket.
//! - **[`framed`]** — length-prefixed frame I/O shared by both sides.

pub mod acceptor;
pub mod framed;
pub mod loopback;
pub mod session;
pub mod tls;

pub use acceptor::{TlsMountServer, TlsServerConfig};
pub use loopback::LoopbackSessionFactory;
pub use session::TlsSessionFactory;
