//! funnel: multiplexed socket funnelling over one carrier connection.
//!
//! Applications connect to local listening endpoints; funnel forwards
//! their data as virtual connections ("fibers") multiplexed over a
//! single authenticated byte-oriented carrier, terminating on the
//! remote peer, which opens the matching outbound connection to the
//! real destination. A reserved control fiber carries the in-band
//! request/reply scheme that starts, stops, and reports forwarding
//! services on either peer.
//!
//! Layering, leaves first:
//!
//! - [`fiber`]: the multiplexer with framing, addressing, connection
//!   state machines, flow control, and the socket-like facades.
//! - [`admin`]: the control protocol on the reserved fiber.
//! - [`services`]: the registry plus the concrete forwarding
//!   microservices (TCP/UDP forwarders, SOCKS, file copy, shell).
//! - [`user_services`]: CLI-level forwarding intents expanded into
//!   microservice sets for both peers.
//! - [`session`]: client bootstrap/reconnection and the server
//!   accept loop.
//! - [`carrier`]: the byte-stream abstraction the whole stack rides
//!   on (plain TCP here; TLS stacks and relay chains plug in at the
//!   same seam).

pub mod admin;
pub mod carrier;
pub mod config;
pub mod constants;
pub mod error;
pub mod fiber;
pub mod services;
pub mod session;
pub mod user_services;

pub use config::Config;
pub use error::{Error, Result};
