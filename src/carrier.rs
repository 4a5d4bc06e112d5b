//! Carrier abstraction.
//!
//! The core is parametric over a reliable, ordered, byte-oriented
//! stream. A plain TCP connector is provided; TLS stacks and relay
//! chains implement the same traits and hand the core their innermost
//! stream socket. Credential loading and the handshake itself are
//! supplied externally; the core only invokes the hook between
//! connect/accept and fiberization.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};

/// A reliable ordered byte stream the demux can own.
pub trait Carrier: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Carrier for T {}

/// Boxed carrier handed to the demux after the handshake ran.
pub type BoxedCarrier = Box<dyn Carrier>;

/// Which side of the carrier the handshake runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    /// The connecting peer.
    Client,
    /// The accepting peer.
    Server,
}

/// Externally supplied carrier-level handshake, run after
/// connect/accept and before fiberization.
///
/// The default hook passes the carrier through untouched.
pub type CarrierHandshake = std::sync::Arc<
    dyn Fn(
            BoxedCarrier,
            HandshakeSide,
        ) -> futures_util::future::BoxFuture<'static, std::io::Result<BoxedCarrier>>
        + Send
        + Sync,
>;

/// A handshake that hands the carrier straight through.
pub fn passthrough_handshake() -> CarrierHandshake {
    std::sync::Arc::new(|carrier, _side| Box::pin(async move { Ok(carrier) }))
}

/// Why a carrier connection attempt failed.
#[derive(Debug)]
pub enum ConnectError {
    /// The endpoint query did not resolve to any address.
    NotResolvable(std::io::Error),
    /// Every resolved address refused or timed out.
    Unreachable(std::io::Error),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotResolvable(e) => write!(f, "endpoint not resolvable: {e}"),
            Self::Unreachable(e) => write!(f, "server unreachable: {e}"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Resolves and connects carriers for the client session.
#[async_trait]
pub trait CarrierConnector: Send + Sync {
    /// Open a fresh carrier toward the configured endpoint.
    async fn connect(&self) -> Result<BoxedCarrier, ConnectError>;

    /// Human-readable endpoint, for logging.
    fn endpoint(&self) -> String;
}

/// Plain TCP carrier connector.
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    /// Connector toward `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl CarrierConnector for TcpConnector {
    async fn connect(&self) -> Result<BoxedCarrier, ConnectError> {
        let query = format!("{}:{}", self.host, self.port);
        let mut addrs = lookup_host(&query)
            .await
            .map_err(ConnectError::NotResolvable)?
            .peekable();
        if addrs.peek().is_none() {
            return Err(ConnectError::NotResolvable(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {query}"),
            )));
        }
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(ConnectError::Unreachable(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connect failed")
        })))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
