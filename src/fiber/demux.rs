//! The fiber demultiplexer.
//!
//! Owns the carrier exclusively and pumps frames in both directions:
//! one read loop parses inbound frames and routes them to the owning
//! fiber, one writer drains a prioritized send queue with at most one
//! carrier write in flight. All fiber state changes driven by inbound
//! control frames (SYN/ACK/RST) happen here.
//!
//! Fibers are indexed by their own `(local, remote)` id; an inbound
//! frame carries the sender's view, so routing looks up
//! `returning_id(header.id)`. A PUSH for an unbound id is answered with
//! exactly one RST so the peer can tear down its half.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, trace, warn};
use rand::Rng;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

use crate::carrier::BoxedCarrier;
use crate::constants::{
    DYNAMIC_PORT_ATTEMPTS, DYNAMIC_PORT_START, MAX_MTU, RECEIVE_HIGH_WATER, RECEIVE_LOW_WATER,
    SEND_RETRY_DELAY,
};
use crate::error::{Error, Result};
use crate::fiber::frame::{read_frame, Flag, Frame};
use crate::fiber::id::{FiberId, FiberPort};
use crate::fiber::state::{ConnectionState, FiberState};

/// Priority of SYN/ACK/RST frames. Control always jumps the data queue.
pub(crate) const CONTROL_PRIORITY: u8 = 0;

/// Default priority of user data frames.
pub(crate) const DATA_PRIORITY: u8 = 1;

/// The three routing tables of a demux, guarded together so bind,
/// listen, and unbind observe one consistent view.
#[derive(Default)]
struct Tables {
    bound: HashMap<FiberId, Arc<FiberState>>,
    listening: HashSet<FiberPort>,
    used_ports: HashSet<FiberPort>,
}

/// One outbound frame waiting in the send queue.
struct QueuedWrite {
    priority: u8,
    seq: u64,
    frame: Frame,
    done: Option<oneshot::Sender<Result<usize>>>,
}

impl QueuedWrite {
    fn complete(mut self, result: Result<usize>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

impl PartialEq for QueuedWrite {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedWrite {}
impl PartialOrd for QueuedWrite {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedWrite {
    // BinaryHeap is a max-heap: invert so the lowest (priority, seq)
    // pops first. Ties within a priority band stay FIFO via seq.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// The fiber demultiplexer. One per carrier; created by
/// [`FiberDemux::fiberize`] and shared via `Arc`.
pub struct FiberDemux {
    tables: Mutex<Tables>,
    send_queue: Mutex<BinaryHeap<QueuedWrite>>,
    send_seq: AtomicU64,
    send_notify: Notify,
    closing: AtomicBool,
    mtu: u16,
    closed_tx: watch::Sender<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl FiberDemux {
    /// Take ownership of a carrier and start demultiplexing over it.
    ///
    /// `mtu` is capped to [`MAX_MTU`].
    pub fn fiberize(carrier: BoxedCarrier, mtu: u16) -> Arc<Self> {
        let mtu = mtu.min(MAX_MTU);
        let (reader, writer) = tokio::io::split(carrier);
        let (closed_tx, _) = watch::channel(false);
        let demux = Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            send_queue: Mutex::new(BinaryHeap::new()),
            send_seq: AtomicU64::new(0),
            send_notify: Notify::new(),
            closing: AtomicBool::new(false),
            mtu,
            closed_tx,
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        });

        let read_handle = tokio::spawn(Arc::clone(&demux).read_pump(reader));
        let write_handle = tokio::spawn(Arc::clone(&demux).write_pump(writer));
        *demux.reader_task.lock().expect("reader task lock") = Some(read_handle);
        *demux.writer_task.lock().expect("writer task lock") = Some(write_handle);
        info!("[demux] fiberized carrier, mtu {mtu}");
        demux
    }

    /// Negotiated MTU of this demux.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Whether the demux is closing or closed.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// A receiver that flips to `true` when the demux has closed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Close the demux: drain every bound fiber, cancel in-flight
    /// carrier I/O, close the carrier. Idempotent.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[demux] closing");

        let fibers: Vec<Arc<FiberState>> = {
            let mut tables = self.tables.lock().expect("tables lock");
            tables.listening.clear();
            tables.used_ports.clear();
            tables.bound.drain().map(|(_, fib)| fib).collect()
        };
        for fib in fibers {
            fib.set_state(ConnectionState::Disconnected);
            fib.cancel_operations(&Error::ConnectionAborted);
        }

        // Aborting the pumps drops the carrier halves, which closes it.
        if let Some(handle) = self.reader_task.lock().expect("reader task lock").take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_task.lock().expect("writer task lock").take() {
            handle.abort();
        }

        let queued = {
            let mut queue = self.send_queue.lock().expect("send queue lock");
            std::mem::take(&mut *queue)
        };
        for write in queued {
            write.complete(Err(Error::ConnectionAborted));
        }
        self.send_notify.notify_one();
        let _ = self.closed_tx.send(true);
    }

    // ------------------------------------------------------------------
    // Binding and listening
    // ------------------------------------------------------------------

    /// Bind a fiber on `local_port`, or on a dynamically drawn port when
    /// `local_port` is zero.
    pub(crate) fn bind(&self, local_port: FiberPort, fib: &Arc<FiberState>) -> Result<()> {
        if self.is_closing() {
            return Err(Error::BrokenPipe);
        }
        let mut tables = self.tables.lock().expect("tables lock");
        let port = if local_port == 0 {
            Self::allocate_port(&tables)?
        } else {
            local_port
        };
        let id = FiberId::new(port, fib.id().remote_port);
        if tables.bound.contains_key(&id) {
            return Err(Error::DeviceOrResourceBusy);
        }
        fib.set_local_port(port);
        tables.bound.insert(id, Arc::clone(fib));
        tables.used_ports.insert(port);
        trace!("[demux] bound fiber {id}");
        Ok(())
    }

    /// Draw a free port from the dynamic range, up to
    /// [`DYNAMIC_PORT_ATTEMPTS`] uniform attempts.
    fn allocate_port(tables: &Tables) -> Result<FiberPort> {
        let mut rng = rand::rng();
        for _ in 0..DYNAMIC_PORT_ATTEMPTS {
            let candidate: FiberPort = rng.random_range(DYNAMIC_PORT_START..=u32::MAX);
            if !tables.used_ports.contains(&candidate) {
                return Ok(candidate);
            }
        }
        warn!("[demux] dynamic port range exhausted");
        Err(Error::DeviceOrResourceBusy)
    }

    /// Mark a bound acceptor port as listening.
    pub(crate) fn listen(&self, local_port: FiberPort) -> Result<()> {
        let mut tables = self.tables.lock().expect("tables lock");
        if !tables.bound.contains_key(&FiberId::new(local_port, 0)) {
            return Err(Error::ProtocolError(format!(
                "listen on {local_port} without bind"
            )));
        }
        if !tables.listening.insert(local_port) {
            return Err(Error::DeviceOrResourceBusy);
        }
        debug!("[demux] listening on fiber port {local_port}");
        Ok(())
    }

    /// Whether any fiber is bound under `id`.
    pub fn is_bound(&self, id: FiberId) -> bool {
        self.tables.lock().expect("tables lock").bound.contains_key(&id)
    }

    /// Whether `local_port` has a listening acceptor.
    pub fn is_listening(&self, local_port: FiberPort) -> bool {
        self.tables
            .lock()
            .expect("tables lock")
            .listening
            .contains(&local_port)
    }

    /// Whether `local_port` is used by at least one bound fiber.
    pub fn is_port_used(&self, local_port: FiberPort) -> bool {
        self.tables
            .lock()
            .expect("tables lock")
            .used_ports
            .contains(&local_port)
    }

    fn lookup(&self, id: FiberId) -> Option<Arc<FiberState>> {
        self.tables.lock().expect("tables lock").bound.get(&id).cloned()
    }

    /// Remove a fiber from the tables. The local port leaves
    /// `used_ports` only once no other fiber shares it.
    fn unbind(&self, fib: &Arc<FiberState>) {
        let id = fib.id();
        let mut tables = self.tables.lock().expect("tables lock");
        tables.bound.remove(&id);
        if id.remote_port == 0 {
            tables.listening.remove(&id.local_port);
        }
        if !tables.bound.keys().any(|k| k.local_port == id.local_port) {
            tables.used_ports.remove(&id.local_port);
        }
        trace!("[demux] unbound fiber {id}");
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    fn enqueue_frame(
        &self,
        frame: Frame,
        priority: u8,
        done: Option<oneshot::Sender<Result<usize>>>,
    ) {
        if self.is_closing() {
            if let Some(done) = done {
                let _ = done.send(Err(Error::ConnectionAborted));
            }
            return;
        }
        let seq = self.send_seq.fetch_add(1, Ordering::Relaxed);
        self.send_queue
            .lock()
            .expect("send queue lock")
            .push(QueuedWrite {
                priority,
                seq,
                frame,
                done,
            });
        self.send_notify.notify_one();
    }

    fn enqueue_control(&self, id: FiberId, flag: Flag) {
        self.enqueue_frame(Frame::control(id, flag), CONTROL_PRIORITY, None);
    }

    /// Send stream bytes on a connected fiber.
    ///
    /// A payload longer than the MTU is silently clipped; the returned
    /// count reports the clipped length. When the peer has switched this
    /// sender off, the call completes with `Ok(0)` after a short probe
    /// delay; zero is a retry hint, never EOF.
    pub(crate) async fn send_data(&self, fib: &Arc<FiberState>, buf: &[u8]) -> Result<usize> {
        if self.is_closing() {
            return Err(Error::ConnectionAborted);
        }
        if !fib.ready_out() {
            tokio::time::sleep(SEND_RETRY_DELAY).await;
            return Ok(0);
        }
        let clipped = buf.len().min(self.mtu as usize);
        let (tx, rx) = oneshot::channel();
        self.enqueue_frame(
            Frame::new(fib.id(), Flag::Push, buf[..clipped].to_vec()),
            fib.priority(),
            Some(tx),
        );
        rx.await.map_err(|_| Error::ConnectionAborted)?
    }

    /// Send one datagram toward `remote_port`.
    ///
    /// Oversize payloads are rejected with [`Error::MessageTooLong`]
    /// and nothing is sent.
    pub(crate) async fn send_datagram(
        &self,
        fib: &Arc<FiberState>,
        remote_port: FiberPort,
        buf: &[u8],
    ) -> Result<usize> {
        if self.is_closing() {
            return Err(Error::ConnectionAborted);
        }
        if buf.len() > self.mtu as usize {
            return Err(Error::MessageTooLong);
        }
        if !fib.ready_out() {
            tokio::time::sleep(SEND_RETRY_DELAY).await;
            return Ok(0);
        }
        let id = FiberId::new(fib.id().local_port, remote_port);
        let (tx, rx) = oneshot::channel();
        self.enqueue_frame(
            Frame::new(id, Flag::Datagram, buf.to_vec()),
            fib.priority(),
            Some(tx),
        );
        rx.await.map_err(|_| Error::ConnectionAborted)?
    }

    async fn write_pump(self: Arc<Self>, mut writer: WriteHalf<BoxedCarrier>) {
        loop {
            let next = self.send_queue.lock().expect("send queue lock").pop();
            let Some(write) = next else {
                if self.is_closing() {
                    break;
                }
                self.send_notify.notified().await;
                continue;
            };
            if self.is_closing() {
                write.complete(Err(Error::ConnectionAborted));
                continue;
            }
            let payload_len = write.frame.payload.len();
            let bytes = write.frame.encode();
            match writer.write_all(&bytes).await {
                Ok(()) => write.complete(Ok(payload_len)),
                Err(e) => {
                    debug!("[demux] carrier write failed: {e}");
                    write.complete(Err(Error::BrokenPipe));
                    self.close();
                    break;
                }
            }
        }
        // Anything still queued will never reach the wire.
        let queued = {
            let mut queue = self.send_queue.lock().expect("send queue lock");
            std::mem::take(&mut *queue)
        };
        for write in queued {
            write.complete(Err(Error::ConnectionAborted));
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    async fn read_pump(self: Arc<Self>, mut reader: ReadHalf<BoxedCarrier>) {
        loop {
            if self.is_closing() {
                break;
            }
            match read_frame(&mut reader, self.mtu).await {
                Ok(frame) => self.dispatch(frame),
                Err(e) => {
                    debug!("[demux] carrier read ended: {e}");
                    self.close();
                    break;
                }
            }
        }
    }

    /// Route one inbound frame. The header carries the sender's view of
    /// the id, so the local owner lives under its returning form.
    fn dispatch(self: &Arc<Self>, frame: Frame) {
        let route = frame.header.id.returning();
        match frame.header.flag {
            Flag::Push => self.handle_push(route, frame.payload),
            Flag::Datagram => self.handle_datagram(route, frame.payload),
            Flag::Syn => self.handle_syn(route),
            Flag::Ack => self.handle_ack(route),
            Flag::Rst => self.handle_rst(route),
        }
    }

    fn handle_push(self: &Arc<Self>, route: FiberId, payload: Vec<u8>) {
        match self.lookup(route) {
            Some(fib) => {
                fib.data_queue
                    .lock()
                    .expect("data queue lock")
                    .extend_from_slice(&payload);
                self.pump_reads(&fib);
            }
            None => {
                debug!("[demux] push for unbound fiber {route}, resetting");
                self.enqueue_control(route, Flag::Rst);
            }
        }
    }

    fn handle_datagram(self: &Arc<Self>, route: FiberId, payload: Vec<u8>) {
        let target = self
            .lookup(route)
            .or_else(|| self.lookup(route.acceptor()));
        match target {
            Some(fib) if fib.accepts_datagrams() => {
                fib.datagram_queue
                    .lock()
                    .expect("datagram queue lock")
                    .push_back((payload, route.remote_port));
                self.pump_datagram_reads(&fib);
            }
            // Dropped by design: the target is not a datagram receiver.
            Some(_) => trace!("[demux] datagram for stream fiber {route}, dropped"),
            None => trace!("[demux] datagram for unbound fiber {route}, dropped"),
        }
    }

    fn handle_syn(self: &Arc<Self>, route: FiberId) {
        let acceptor = if self.is_listening(route.local_port) {
            self.lookup(route.acceptor())
        } else {
            None
        };
        match acceptor {
            Some(acceptor) => {
                acceptor
                    .pending_remote_ports
                    .lock()
                    .expect("port queue lock")
                    .push_back(route.remote_port);
                self.pump_accepts(&acceptor);
            }
            None => {
                debug!(
                    "[demux] syn for non-listening port {}, resetting",
                    route.local_port
                );
                self.enqueue_control(route, Flag::Rst);
            }
        }
    }

    /// ACK always flips send readiness; for a connecting fiber it also
    /// completes the handshake. A fresh connection therefore starts
    /// throttled until the acceptor posts its first read, whose
    /// low-water crossing emits the enabling toggle.
    fn handle_ack(self: &Arc<Self>, route: FiberId) {
        let Some(fib) = self.lookup(route) else {
            trace!("[demux] ack for unbound fiber {route}, ignored");
            return;
        };
        fib.toggle_ready_out();
        if fib.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            debug!("[demux] fiber {route} connected");
            fib.complete_connect(Ok(()));
        }
    }

    fn handle_rst(self: &Arc<Self>, route: FiberId) {
        let Some(fib) = self.lookup(route) else {
            trace!("[demux] rst for unbound fiber {route}, ignored");
            return;
        };
        match fib.connection_state() {
            ConnectionState::Connecting => {
                fib.set_state(ConnectionState::Disconnected);
                self.unbind(&fib);
                fib.complete_connect(Err(Error::ConnectionRefused));
            }
            ConnectionState::Connected => {
                fib.set_state(ConnectionState::Disconnected);
                debug!("[demux] fiber {route} reset by peer");
                // Return the RST, then unbind once it is on the wire.
                let (tx, rx) = oneshot::channel();
                self.enqueue_frame(Frame::control(route, Flag::Rst), CONTROL_PRIORITY, Some(tx));
                let demux = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = rx.await;
                    if let Some(fib) = demux.lookup(route) {
                        // Bytes that beat the reset still reach posted reads.
                        demux.pump_reads(&fib);
                        demux.unbind(&fib);
                        fib.cancel_operations(&Error::ConnectionReset);
                    }
                });
            }
            ConnectionState::Disconnecting => {
                fib.set_state(ConnectionState::Disconnected);
                self.unbind(&fib);
                fib.cancel_operations(&Error::ConnectionReset);
            }
            ConnectionState::Closed | ConnectionState::Disconnected => {}
        }
    }

    // ------------------------------------------------------------------
    // Fiber-facing operations
    // ------------------------------------------------------------------

    /// Connect a fiber toward `remote_port`: auto-bind a dynamic local
    /// port, send SYN, resolve on the peer's ACK or RST.
    pub(crate) async fn connect_fiber(
        self: &Arc<Self>,
        fib: &Arc<FiberState>,
        remote_port: FiberPort,
    ) -> Result<()> {
        fib.set_remote_port(remote_port);
        self.bind(0, fib)?;
        let rx = fib.arm_connect()?;
        fib.set_state(ConnectionState::Connecting);
        self.enqueue_control(fib.id(), Flag::Syn);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionAborted),
        }
    }

    /// Close one fiber per the state machine. Idempotent.
    pub(crate) fn close_fiber(self: &Arc<Self>, fib: &Arc<FiberState>) {
        match fib.connection_state() {
            ConnectionState::Connected => {
                fib.set_state(ConnectionState::Disconnecting);
                debug!("[demux] closing fiber {}", fib.id());
                self.enqueue_control(fib.id(), Flag::Rst);
                fib.cancel_operations(&Error::Interrupted);
            }
            ConnectionState::Connecting => {
                fib.set_state(ConnectionState::Disconnected);
                self.unbind(fib);
                fib.cancel_operations(&Error::Interrupted);
            }
            ConnectionState::Closed => {
                self.unbind(fib);
                fib.set_state(ConnectionState::Disconnected);
                fib.cancel_operations(&Error::Interrupted);
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {}
        }
    }

    /// Drain the pair of (pending read, buffered data) queues and emit
    /// a flow-control toggle on every threshold crossing.
    pub(crate) fn pump_reads(&self, fib: &Arc<FiberState>) {
        let mut completions = Vec::new();
        let mut toggles = 0usize;
        {
            let mut reads = fib.pending_reads.lock().expect("read queue lock");
            let mut data = fib.data_queue.lock().expect("data queue lock");

            if data.len() > RECEIVE_HIGH_WATER && fib.ready_in() {
                fib.toggle_ready_in();
                toggles += 1;
            }
            while !reads.is_empty() && !data.is_empty() {
                let op = reads.pop_front().expect("checked non-empty");
                let take = op.max_len.min(data.len());
                let bytes = data.split_to(take).to_vec();
                completions.push((op.done, bytes));
            }
            if data.len() < RECEIVE_LOW_WATER && !fib.ready_in() {
                fib.toggle_ready_in();
                toggles += 1;
            }
        }
        for _ in 0..toggles {
            self.enqueue_control(fib.id(), Flag::Ack);
        }
        for (done, bytes) in completions {
            let _ = done.send(Ok(bytes));
        }
    }

    /// Drain the datagram read queues: an op, a payload, and its sender
    /// port are consumed together.
    pub(crate) fn pump_datagram_reads(&self, fib: &Arc<FiberState>) {
        let mut completions = Vec::new();
        {
            let mut reads = fib
                .pending_datagram_reads
                .lock()
                .expect("datagram read queue lock");
            let mut datagrams = fib.datagram_queue.lock().expect("datagram queue lock");
            while !reads.is_empty() && !datagrams.is_empty() {
                let op = reads.pop_front().expect("checked non-empty");
                let (mut payload, sender) = datagrams.pop_front().expect("checked non-empty");
                payload.truncate(op.max_len);
                completions.push((op.done, payload, sender));
            }
        }
        for (done, payload, sender) in completions {
            let _ = done.send(Ok((payload, sender)));
        }
    }

    /// Pair queued accepts with pending SYNs: bind a fresh Connected
    /// fiber for each pair and emit the handshake ACK.
    pub(crate) fn pump_accepts(self: &Arc<Self>, acceptor: &Arc<FiberState>) {
        loop {
            let pair = {
                let mut ops = acceptor.accept_queue.lock().expect("accept queue lock");
                let mut ports = acceptor
                    .pending_remote_ports
                    .lock()
                    .expect("port queue lock");
                if ops.is_empty() || ports.is_empty() {
                    break;
                }
                (
                    ops.pop_front().expect("checked non-empty"),
                    ports.pop_front().expect("checked non-empty"),
                )
            };
            let (op, remote_port) = pair;
            let local_port = acceptor.id().local_port;
            let id = FiberId::new(local_port, remote_port);

            let peer = Arc::new(FiberState::new_stream(remote_port, acceptor.priority()));
            peer.set_local_port(local_port);
            // The accepted side must wait for a flow-control ACK before
            // admitting more data than the peer's window allows.
            peer.init_accept_in_out();
            peer.set_state(ConnectionState::Connected);

            let bound = {
                let mut tables = self.tables.lock().expect("tables lock");
                if tables.bound.contains_key(&id) {
                    Err(Error::DeviceOrResourceBusy)
                } else {
                    tables.bound.insert(id, Arc::clone(&peer));
                    tables.used_ports.insert(local_port);
                    Ok(())
                }
            };
            match bound {
                Ok(()) => {
                    self.enqueue_control(id, Flag::Ack);
                    debug!("[demux] accepted fiber {id}");
                    let _ = op.done.send(Ok(peer));
                }
                Err(e) => {
                    warn!("[demux] accept collision on {id}");
                    let _ = op.done.send(Err(e));
                }
            }
        }
    }
}

impl std::fmt::Debug for FiberDemux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock().expect("tables lock");
        f.debug_struct("FiberDemux")
            .field("bound", &tables.bound.len())
            .field("listening", &tables.listening.len())
            .field("closing", &self.is_closing())
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demux_pair() -> (Arc<FiberDemux>, Arc<FiberDemux>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            FiberDemux::fiberize(Box::new(a), MAX_MTU),
            FiberDemux::fiberize(Box::new(b), MAX_MTU),
        )
    }

    #[tokio::test]
    async fn test_bind_conflict_is_busy() {
        let (demux, _peer) = demux_pair();
        let first = Arc::new(FiberState::new_stream(0, DATA_PRIORITY));
        let second = Arc::new(FiberState::new_stream(0, DATA_PRIORITY));
        demux.bind(7, &first).unwrap();
        assert_eq!(demux.bind(7, &second).unwrap_err(), Error::DeviceOrResourceBusy);
        assert!(demux.is_port_used(7));
    }

    #[tokio::test]
    async fn test_listen_requires_bind() {
        let (demux, _peer) = demux_pair();
        match demux.listen(9) {
            Err(Error::ProtocolError(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
        let acceptor = Arc::new(FiberState::new_stream(0, DATA_PRIORITY));
        demux.bind(9, &acceptor).unwrap();
        demux.listen(9).unwrap();
        assert_eq!(demux.listen(9).unwrap_err(), Error::DeviceOrResourceBusy);
    }

    #[tokio::test]
    async fn test_dynamic_bind_draws_from_range() {
        let (demux, _peer) = demux_pair();
        let fib = Arc::new(FiberState::new_stream(42, DATA_PRIORITY));
        demux.bind(0, &fib).unwrap();
        assert!(fib.id().local_port >= DYNAMIC_PORT_START);
        assert!(demux.is_port_used(fib.id().local_port));
    }

    #[tokio::test]
    async fn test_unbind_keeps_shared_port_used() {
        let (demux, _peer) = demux_pair();
        let acceptor = Arc::new(FiberState::new_stream(0, DATA_PRIORITY));
        demux.bind(5, &acceptor).unwrap();
        let peer_fib = Arc::new(FiberState::new_stream(77, DATA_PRIORITY));
        demux.bind(5, &peer_fib).unwrap();

        demux.unbind(&peer_fib);
        assert!(demux.is_port_used(5));
        demux.unbind(&acceptor);
        assert!(!demux.is_port_used(5));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels_ops() {
        let (demux, _peer) = demux_pair();
        let fib = Arc::new(FiberState::new_stream(11, DATA_PRIORITY));
        demux.bind(0, &fib).unwrap();
        demux.close();
        demux.close();
        assert!(demux.is_closing());
        assert!(!demux.is_bound(fib.id()));
        assert_eq!(fib.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            demux.send_data(&fib, b"late").await.unwrap_err(),
            Error::ConnectionAborted
        );
    }

    #[tokio::test]
    async fn test_queued_write_order_is_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        for (priority, seq) in [(1u8, 0u64), (0, 1), (1, 2), (0, 3)] {
            heap.push(QueuedWrite {
                priority,
                seq,
                frame: Frame::control(FiberId::new(1, 2), Flag::Ack),
                done: None,
            });
        }
        let order: Vec<(u8, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|w| (w.priority, w.seq))
            .collect();
        assert_eq!(order, vec![(0, 1), (0, 3), (1, 0), (1, 2)]);
    }
}
