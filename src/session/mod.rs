//! Sessions: the bootstrap, lifecycle, and reconnection policy that
//! give the multiplexer its carrier.
//!
//! The client resolves and connects a carrier, runs the externally
//! supplied handshake, fiberizes the socket, and starts the admin
//! client; attempts repeat with a configurable delay until the budget
//! runs out (a session that reached Running resets the budget). The
//! server accepts carriers and gives each one its own demux, registry,
//! and server-mode admin.

pub mod client;
pub mod server;

pub use client::{Client, ClientConfig};
pub use server::{Server, ServerConfig};

use std::sync::Arc;

/// Externally observable state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Session constructed, nothing attempted yet.
    Initialized,
    /// The endpoint query resolved to no usable address.
    EndpointNotResolvable,
    /// Every resolved address refused or timed out.
    ServerUnreachable,
    /// The carrier connected but the handshake failed.
    ServerNotSupported,
    /// The session lost (or never completed) its carrier.
    Disconnected,
    /// Carrier connected and handshaken.
    Connected,
    /// Demux and admin are up; forwarding services are starting.
    Running,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::EndpointNotResolvable => "endpoint not resolvable",
            Self::ServerUnreachable => "server unreachable",
            Self::ServerNotSupported => "server not supported",
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

/// Callback receiving every status transition of a client session.
pub type StatusCallback = Arc<dyn Fn(Status) + Send + Sync>;

/// A status callback that ignores everything.
pub fn noop_status_callback() -> StatusCallback {
    Arc::new(|_| {})
}
