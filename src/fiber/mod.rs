//! The fiber multiplexer.
//!
//! Multiplexes many independent virtual connections ("fibers") over one
//! reliable byte-oriented carrier:
//!
//! ```text
//! StreamFiber / DatagramFiber / FiberListener   (socket-like facades)
//!     │
//! FiberState        (per-connection record: state machine, queues)
//!     │
//! FiberDemux        (carrier owner: read pump, prioritized writer,
//!     │              frame dispatch, bind/listen tables)
//! carrier           (TCP, TLS, relay chain: anything byte-oriented)
//! ```
//!
//! Frames carry a 12-byte header addressing a `(local, remote)` port
//! pair; SYN/ACK/RST drive a TCP-like handshake and teardown, PUSH and
//! DATAGRAM carry payloads, and ACK doubles as the flow-control toggle
//! for the lazy end-to-end backpressure scheme.

pub mod datagram;
pub mod demux;
pub mod frame;
pub mod id;
pub mod state;
pub mod stream;

pub use datagram::DatagramFiber;
pub use demux::FiberDemux;
pub use frame::{Flag, Frame, FrameDecoder, FrameHeader};
pub use id::{FiberId, FiberPort};
pub use state::{ConnectionState, FiberState};
pub use stream::{FiberListener, FiberReader, StreamFiber};
