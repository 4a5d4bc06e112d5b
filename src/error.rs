//! Error kinds surfaced by the fiber core.
//!
//! One enum covers the demux, the fiber facades, the admin protocol and
//! the service registry. Per-operation errors are returned through the
//! operation itself; fiber-wide errors fail every pending operation and
//! disconnect the fiber; demux-wide errors close the demux and cascade
//! to all fibers.

/// Errors that can occur on fiber, demux, and service operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation on a demux whose carrier is no longer usable.
    BrokenPipe,
    /// Bind/listen conflict, or a service that is already running.
    DeviceOrResourceBusy,
    /// Malformed frame or request, or listen without a prior bind.
    ProtocolError(String),
    /// The peer sent RST while the fiber was connecting.
    ConnectionRefused,
    /// The peer sent RST after the fiber was connected.
    ConnectionReset,
    /// The demux closed while the operation was pending.
    ConnectionAborted,
    /// Send or receive on a fiber that is not connected.
    NotConnected,
    /// Datagram payload exceeds the negotiated MTU.
    MessageTooLong,
    /// The operation was cancelled by `close()`.
    Interrupted,
    /// No constructor registered for the requested service id.
    ServiceNotFound,
    /// A registered service constructor failed to start its service.
    ServiceNotStarted,
    /// A user service aborted after a partial remote start.
    OperationCanceled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::DeviceOrResourceBusy => write!(f, "device or resource busy"),
            Self::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::ConnectionReset => write!(f, "connection reset"),
            Self::ConnectionAborted => write!(f, "connection aborted"),
            Self::NotConnected => write!(f, "not connected"),
            Self::MessageTooLong => write!(f, "message too long"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::ServiceNotFound => write!(f, "service not found"),
            Self::ServiceNotStarted => write!(f, "service not started"),
            Self::OperationCanceled => write!(f, "operation canceled"),
        }
    }
}

impl std::error::Error for Error {}

/// Result alias used throughout the fiber core.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Numeric code carried in `ServiceStatus` replies on the wire.
    ///
    /// The values follow the POSIX errno numbers the original protocol
    /// used; `4` (interrupted) doubles as "service stopped".
    pub fn wire_code(&self) -> u32 {
        match self {
            Self::Interrupted => 4,
            Self::DeviceOrResourceBusy => 16,
            Self::ServiceNotFound => 38,
            Self::ProtocolError(_) => 71,
            Self::ServiceNotStarted => 79,
            Self::BrokenPipe => 32,
            Self::ConnectionAborted => 103,
            Self::ConnectionReset => 104,
            Self::NotConnected => 107,
            Self::ConnectionRefused => 111,
            Self::MessageTooLong => 90,
            Self::OperationCanceled => 125,
        }
    }

    /// Inverse of [`wire_code`](Self::wire_code); `0` means success and
    /// maps to `None`.
    pub fn from_wire_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            4 => Some(Self::Interrupted),
            16 => Some(Self::DeviceOrResourceBusy),
            38 => Some(Self::ServiceNotFound),
            71 => Some(Self::ProtocolError(String::new())),
            79 => Some(Self::ServiceNotStarted),
            32 => Some(Self::BrokenPipe),
            103 => Some(Self::ConnectionAborted),
            104 => Some(Self::ConnectionReset),
            107 => Some(Self::NotConnected),
            111 => Some(Self::ConnectionRefused),
            90 => Some(Self::MessageTooLong),
            _ => Some(Self::OperationCanceled),
        }
    }
}
