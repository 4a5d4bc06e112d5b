//! Per-fiber connection record.
//!
//! A [`FiberState`] holds everything the demux needs to route traffic to
//! one virtual connection: its id, the connection state machine, the
//! readiness flags used for lazy end-to-end backpressure, the received
//! byte buffer, and the FIFO queues of pending user operations. The
//! demux owns the only strong references in its bound table; facades
//! share the record via `Arc`.
//!
//! Lock discipline: operations touching both demux tables and a fiber
//! take the demux locks first. None of the mutexes here are held across
//! an await point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::fiber::id::{FiberId, FiberPort};

/// Connection state of a fiber.
///
/// Transitions are monotonic per call site and always taken under the
/// fiber's state lock:
///
/// ```text
/// Closed --bind-->        Closed        (still an uninitialized receiver)
/// Closed --connect-->     Connecting    (SYN sent)
/// Connecting --ACK-->     Connected     (connect completes Ok)
/// Connecting --RST-->     Disconnected  (connect completes ConnectionRefused)
/// (SYN matches listen) --ACK sent--> Connected
/// Connected --close()-->  Disconnecting (RST sent)
/// Disconnecting --RST-->  Disconnected
/// Connected --peer RST--> Disconnected  (return RST emitted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet part of any exchange.
    Closed,
    /// SYN sent, waiting for ACK or RST.
    Connecting,
    /// Both peers bound; data may flow.
    Connected,
    /// RST sent, waiting for the peer's RST.
    Disconnecting,
    /// Terminal. The fiber is unbound and its queues are drained.
    Disconnected,
}

/// A pending stream read: capacity wanted and the completion to fire.
pub(crate) struct ReadOp {
    pub max_len: usize,
    pub done: oneshot::Sender<Result<Vec<u8>>>,
}

/// A pending datagram read.
pub(crate) struct DatagramReadOp {
    pub max_len: usize,
    pub done: oneshot::Sender<Result<(Vec<u8>, FiberPort)>>,
}

/// A pending accept: completes with the freshly bound peer fiber.
pub(crate) struct AcceptOp {
    pub done: oneshot::Sender<Result<std::sync::Arc<FiberState>>>,
}

/// Per-virtual-connection record shared between the demux and a facade.
pub struct FiberState {
    id: Mutex<FiberId>,
    state: Mutex<ConnectionState>,
    /// Receive-side admission: false once we told the peer to stop.
    ready_in: AtomicBool,
    /// Send-side readiness: flipped by peer ACK toggles.
    ready_out: AtomicBool,
    /// Send priority; lower value is scheduled first.
    priority: u8,
    /// Whether DATAGRAM frames are delivered or silently dropped.
    accepts_datagrams: bool,

    /// Received stream bytes awaiting a reader.
    pub(crate) data_queue: Mutex<BytesMut>,
    /// FIFO of posted stream reads.
    pub(crate) pending_reads: Mutex<VecDeque<ReadOp>>,
    /// Received datagrams with their sender port.
    pub(crate) datagram_queue: Mutex<VecDeque<(Vec<u8>, FiberPort)>>,
    /// FIFO of posted datagram reads.
    pub(crate) pending_datagram_reads: Mutex<VecDeque<DatagramReadOp>>,
    /// FIFO of posted accepts (acceptors only).
    pub(crate) accept_queue: Mutex<VecDeque<AcceptOp>>,
    /// Incoming SYNs awaiting an accept (acceptors only).
    pub(crate) pending_remote_ports: Mutex<VecDeque<FiberPort>>,
    /// Completion of an in-flight connect.
    pub(crate) connect_waiter: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl FiberState {
    /// Create a stream fiber record toward `remote_port` (zero for
    /// acceptors).
    pub(crate) fn new_stream(remote_port: FiberPort, priority: u8) -> Self {
        Self::new(remote_port, priority, false)
    }

    /// Create a datagram fiber record.
    pub(crate) fn new_datagram(remote_port: FiberPort, priority: u8) -> Self {
        Self::new(remote_port, priority, true)
    }

    fn new(remote_port: FiberPort, priority: u8, accepts_datagrams: bool) -> Self {
        Self {
            id: Mutex::new(FiberId::new(0, remote_port)),
            state: Mutex::new(ConnectionState::Closed),
            ready_in: AtomicBool::new(true),
            ready_out: AtomicBool::new(true),
            priority,
            accepts_datagrams,
            data_queue: Mutex::new(BytesMut::new()),
            pending_reads: Mutex::new(VecDeque::new()),
            datagram_queue: Mutex::new(VecDeque::new()),
            pending_datagram_reads: Mutex::new(VecDeque::new()),
            accept_queue: Mutex::new(VecDeque::new()),
            pending_remote_ports: Mutex::new(VecDeque::new()),
            connect_waiter: Mutex::new(None),
        }
    }

    /// Current fiber id.
    pub fn id(&self) -> FiberId {
        *self.id.lock().expect("fiber id lock")
    }

    pub(crate) fn set_local_port(&self, port: FiberPort) {
        self.id.lock().expect("fiber id lock").local_port = port;
    }

    pub(crate) fn set_remote_port(&self, port: FiberPort) {
        self.id.lock().expect("fiber id lock").remote_port = port;
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock().expect("fiber state lock")
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("fiber state lock") = next;
    }

    /// Transition only if the current state matches `from`. Returns
    /// whether the transition happened.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock().expect("fiber state lock");
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub(crate) fn priority(&self) -> u8 {
        self.priority
    }

    pub(crate) fn accepts_datagrams(&self) -> bool {
        self.accepts_datagrams
    }

    pub(crate) fn ready_in(&self) -> bool {
        self.ready_in.load(Ordering::Acquire)
    }

    pub(crate) fn ready_out(&self) -> bool {
        self.ready_out.load(Ordering::Acquire)
    }

    pub(crate) fn toggle_ready_in(&self) -> bool {
        self.ready_in.fetch_xor(true, Ordering::AcqRel)
    }

    pub(crate) fn toggle_ready_out(&self) {
        self.ready_out.fetch_xor(true, Ordering::AcqRel);
    }

    /// Accepted fibers may send right away; the closed receive window
    /// makes their first posted read emit the toggle that un-throttles
    /// the connecting peer.
    pub(crate) fn init_accept_in_out(&self) {
        self.ready_in.store(false, Ordering::Release);
        self.ready_out.store(true, Ordering::Release);
    }

    /// Arm the connect completion. Only one connect may be outstanding.
    pub(crate) fn arm_connect(&self) -> Result<oneshot::Receiver<Result<()>>> {
        let mut waiter = self.connect_waiter.lock().expect("connect waiter lock");
        if waiter.is_some() {
            return Err(Error::DeviceOrResourceBusy);
        }
        let (tx, rx) = oneshot::channel();
        *waiter = Some(tx);
        Ok(rx)
    }

    /// Fire the connect completion, if armed.
    pub(crate) fn complete_connect(&self, result: Result<()>) {
        if let Some(tx) = self.connect_waiter.lock().expect("connect waiter lock").take() {
            let _ = tx.send(result);
        }
    }

    /// Fail every pending operation with `err` and drop buffered data.
    ///
    /// Invoked on disconnect and on demux teardown; receivers observe
    /// the error on their completions.
    pub(crate) fn cancel_operations(&self, err: &Error) {
        self.complete_connect(Err(err.clone()));
        for op in self.pending_reads.lock().expect("read queue lock").drain(..) {
            let _ = op.done.send(Err(err.clone()));
        }
        for op in self
            .pending_datagram_reads
            .lock()
            .expect("datagram read queue lock")
            .drain(..)
        {
            let _ = op.done.send(Err(err.clone()));
        }
        for op in self.accept_queue.lock().expect("accept queue lock").drain(..) {
            let _ = op.done.send(Err(err.clone()));
        }
        self.pending_remote_ports
            .lock()
            .expect("port queue lock")
            .clear();
        self.data_queue.lock().expect("data queue lock").clear();
        self.datagram_queue
            .lock()
            .expect("datagram queue lock")
            .clear();
    }

    /// Bytes currently buffered and not yet claimed by a reader.
    pub fn buffered_bytes(&self) -> usize {
        self.data_queue.lock().expect("data queue lock").len()
    }
}

impl std::fmt::Debug for FiberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberState")
            .field("id", &self.id())
            .field("state", &self.connection_state())
            .field("ready_in", &self.ready_in())
            .field("ready_out", &self.ready_out())
            .field("buffered", &self.buffered_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fiber_is_closed_and_ready() {
        let fib = FiberState::new_stream(9, 1);
        assert_eq!(fib.connection_state(), ConnectionState::Closed);
        assert_eq!(fib.id(), FiberId::new(0, 9));
        assert!(fib.ready_in());
        assert!(fib.ready_out());
        assert!(!fib.accepts_datagrams());
        assert!(FiberState::new_datagram(0, 1).accepts_datagrams());
    }

    #[test]
    fn test_transition_requires_predecessor() {
        let fib = FiberState::new_stream(9, 1);
        assert!(!fib.transition(ConnectionState::Connecting, ConnectionState::Connected));
        assert_eq!(fib.connection_state(), ConnectionState::Closed);

        assert!(fib.transition(ConnectionState::Closed, ConnectionState::Connecting));
        assert!(fib.transition(ConnectionState::Connecting, ConnectionState::Connected));
        assert!(fib.transition(ConnectionState::Connected, ConnectionState::Disconnecting));
        assert!(fib.transition(
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected
        ));
        // Terminal: no way back.
        assert!(!fib.transition(ConnectionState::Closed, ConnectionState::Connecting));
    }

    #[test]
    fn test_accept_init_flags() {
        let fib = FiberState::new_stream(0, 1);
        fib.init_accept_in_out();
        assert!(!fib.ready_in());
        assert!(fib.ready_out());
        assert!(!fib.toggle_ready_in());
        assert!(fib.ready_in());
    }

    #[test]
    fn test_only_one_outstanding_connect() {
        let fib = FiberState::new_stream(9, 1);
        let rx = fib.arm_connect().unwrap();
        assert_eq!(fib.arm_connect().unwrap_err(), Error::DeviceOrResourceBusy);
        fib.complete_connect(Ok(()));
        drop(rx);
        // Completion disarms; a fresh connect may be posted.
        assert!(fib.arm_connect().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_operations_fails_pending_reads() {
        let fib = FiberState::new_stream(9, 1);
        let (tx, rx) = oneshot::channel();
        fib.pending_reads
            .lock()
            .unwrap()
            .push_back(ReadOp { max_len: 16, done: tx });
        fib.data_queue.lock().unwrap().extend_from_slice(b"stale");

        fib.cancel_operations(&Error::Interrupted);

        assert_eq!(rx.await.unwrap(), Err(Error::Interrupted));
        assert_eq!(fib.buffered_bytes(), 0);
    }
}
