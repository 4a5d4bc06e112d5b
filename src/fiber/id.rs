//! Fiber identifiers.
//!
//! A fiber is addressed by a `(local_port, remote_port)` pair of 32-bit
//! ports scoped to one carrier. The peer sees the same fiber under the
//! swapped pair, so routing an inbound frame means looking up the
//! returning form of the id it carries.

use crate::constants::{DYNAMIC_PORT_START, RESERVED_PORT_LIMIT};

/// A fiber port. Ports below [`RESERVED_PORT_LIMIT`] are reserved for
/// well-known services.
pub type FiberPort = u32;

/// Identifier of a fiber within one carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    /// Port on this side of the carrier.
    pub local_port: FiberPort,
    /// Port on the peer side of the carrier. Zero for acceptors and
    /// unconnected datagram fibers.
    pub remote_port: FiberPort,
}

impl FiberId {
    /// Create an id from both ports.
    pub fn new(local_port: FiberPort, remote_port: FiberPort) -> Self {
        Self {
            local_port,
            remote_port,
        }
    }

    /// The same fiber as seen from the peer: both ports swapped.
    pub fn returning(self) -> Self {
        Self {
            local_port: self.remote_port,
            remote_port: self.local_port,
        }
    }

    /// The acceptor-form id for this fiber's local port.
    pub fn acceptor(self) -> Self {
        Self {
            local_port: self.local_port,
            remote_port: 0,
        }
    }

    /// True when both ports are set.
    pub fn is_set(self) -> bool {
        self.local_port != 0 && self.remote_port != 0
    }

    /// True when the local port falls in the dynamically allocated range.
    pub fn has_dynamic_local_port(self) -> bool {
        self.local_port >= DYNAMIC_PORT_START
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returning_swaps_ports() {
        let id = FiberId::new(7, 9);
        assert_eq!(id.returning(), FiberId::new(9, 7));
        assert_eq!(id.returning().returning(), id);
    }

    #[test]
    fn test_acceptor_form_zeroes_remote() {
        let id = FiberId::new(7, 9);
        assert_eq!(id.acceptor(), FiberId::new(7, 0));
        assert!(!id.acceptor().is_set());
        assert!(id.is_set());
    }

    #[test]
    fn test_dynamic_range_starts_past_reserved_band() {
        assert!(DYNAMIC_PORT_START > RESERVED_PORT_LIMIT);
        assert!(!FiberId::new(RESERVED_PORT_LIMIT, 0).has_dynamic_local_port());
        assert!(FiberId::new(DYNAMIC_PORT_START, 0).has_dynamic_local_port());
    }
}
