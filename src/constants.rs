//! Application-wide constants for funnel.
//!
//! This module centralizes the wire-level and timing constants shared by
//! the fiber multiplexer, the admin control protocol, and the sessions.
//! Constants are grouped by domain with documentation explaining their
//! purpose.
//!
//! # Categories
//!
//! - **Wire**: frame layout and MTU limits
//! - **Ports**: the reserved fiber-port band and dynamic allocation range
//! - **Flow control**: receive-buffer thresholds and the send retry probe
//! - **Admin**: control-fiber timers and retry budgets

use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// Fiber protocol version carried in every frame header.
pub const FIBER_VERSION: u8 = 1;

/// Size in bytes of the packed frame header on the wire.
///
/// version (u8) + local_port (u32) + remote_port (u32) + flags (u8) +
/// payload_size (u16), all little-endian.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Default and maximum payload size of a single frame.
///
/// Stream payloads larger than the MTU are clipped; datagram payloads
/// larger than the MTU are rejected. A demux constructed with a larger
/// value is capped back to this.
pub const MAX_MTU: u16 = 60 * 1024;

// ============================================================================
// Ports
// ============================================================================

/// Fiber ports below this value are reserved for well-known services.
pub const RESERVED_PORT_LIMIT: u32 = 1 << 17;

/// First port of the dynamic allocation range.
pub const DYNAMIC_PORT_START: u32 = RESERVED_PORT_LIMIT + 1024;

/// How many random draws the dynamic port allocator makes before
/// giving up and reporting the demux as busy.
pub const DYNAMIC_PORT_ATTEMPTS: u32 = 100;

/// Reserved fiber port of the admin control fiber, first of the
/// service range.
pub const ADMIN_SERVICE_PORT: u32 = RESERVED_PORT_LIMIT + 1;

/// Reserved fiber port of the fiber-to-file copy service.
pub const FIBER_TO_FILE_PORT: u32 = ADMIN_SERVICE_PORT + 40;

/// Reserved fiber port of the file-to-fiber copy service.
pub const FILE_TO_FIBER_PORT: u32 = ADMIN_SERVICE_PORT + 41;

// ============================================================================
// Flow control
// ============================================================================

/// Receive-buffer size above which the reader tells its peer to stop
/// sending (one ACK toggle per crossing).
pub const RECEIVE_HIGH_WATER: usize = 60 * 1024 * 1024;

/// Receive-buffer size below which the reader re-enables its peer
/// (one ACK toggle per crossing).
pub const RECEIVE_LOW_WATER: usize = 40 * 1024 * 1024;

/// How long a sender waits before completing a deferred send with zero
/// bytes when the peer has switched it off.
///
/// Zero is a retry hint, never EOF: callers are expected to re-submit
/// the same buffer.
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(10);

// ============================================================================
// Admin
// ============================================================================

/// Interval between keepalive commands on the control fiber.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Interval between polls of the remote-service status table while a
/// user service waits for its peer-side creations.
pub const SERVICE_STATUS_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How many status polls a user service makes before giving up.
pub const SERVICE_STATUS_RETRY_COUNT: u32 = 500;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_are_ordered() {
        assert!(RECEIVE_LOW_WATER < RECEIVE_HIGH_WATER);
        // A single frame must never straddle the whole window.
        assert!((MAX_MTU as usize) < RECEIVE_HIGH_WATER - RECEIVE_LOW_WATER);
    }

    #[test]
    fn test_reserved_band_layout() {
        assert!(ADMIN_SERVICE_PORT > RESERVED_PORT_LIMIT);
        assert!(ADMIN_SERVICE_PORT < DYNAMIC_PORT_START);
        assert!(FIBER_TO_FILE_PORT < DYNAMIC_PORT_START);
        assert!(FILE_TO_FIBER_PORT < DYNAMIC_PORT_START);
    }
}
