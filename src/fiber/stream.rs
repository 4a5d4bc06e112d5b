//! Stream fiber facade.
//!
//! Presents a socket-like contract (connect/listen/accept/send/recv/
//! close) backed by a [`FiberState`] record and the demux. Sends may
//! complete with `Ok(0)` when the peer has throttled this side; that
//! zero is a retry hint, never EOF; [`StreamFiber::send_all`] hides the
//! retry loop.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::fiber::demux::{FiberDemux, DATA_PRIORITY};
use crate::fiber::id::{FiberId, FiberPort};
use crate::fiber::state::{AcceptOp, FiberState, ReadOp};

/// A bidirectional virtual stream over one carrier.
pub struct StreamFiber {
    demux: Arc<FiberDemux>,
    state: Arc<FiberState>,
}

impl StreamFiber {
    /// Open a fiber toward `remote_port` on the peer, auto-binding a
    /// dynamic local port.
    pub async fn connect(demux: &Arc<FiberDemux>, remote_port: FiberPort) -> Result<Self> {
        Self::connect_with_priority(demux, remote_port, DATA_PRIORITY).await
    }

    /// [`connect`](Self::connect) with an explicit send priority
    /// (lower value is scheduled first).
    pub async fn connect_with_priority(
        demux: &Arc<FiberDemux>,
        remote_port: FiberPort,
        priority: u8,
    ) -> Result<Self> {
        let state = Arc::new(FiberState::new_stream(remote_port, priority));
        demux.connect_fiber(&state, remote_port).await?;
        Ok(Self {
            demux: Arc::clone(demux),
            state,
        })
    }

    /// Fiber id of this stream.
    pub fn id(&self) -> FiberId {
        self.state.id()
    }

    /// Whether the fiber is currently connected.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Send up to one MTU of `buf`.
    ///
    /// Returns the number of bytes actually framed; a payload longer
    /// than the MTU is clipped to it. `Ok(0)` means the peer has
    /// throttled this sender. Retry after the returned hint, it is
    /// never EOF. An empty buffer completes immediately.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        if !self.state.is_connected() {
            return Err(Error::NotConnected);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.demux.send_data(&self.state, buf).await
    }

    /// Send all of `buf`, looping over clipping and retry hints.
    pub async fn send_all(&self, buf: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            offset += self.send(&buf[offset..]).await?;
        }
        Ok(())
    }

    /// Receive into `buf`, waiting until at least one byte is
    /// available. Returns the number of bytes copied.
    ///
    /// Overlapping receives are served strictly in submission order.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.state.is_connected() {
            return Err(Error::NotConnected);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let (tx, rx) = oneshot::channel();
        self.state
            .pending_reads
            .lock()
            .expect("read queue lock")
            .push_back(ReadOp {
                max_len: buf.len(),
                done: tx,
            });
        // A disconnect between the connected check and the enqueue
        // would strand the op; re-checking closes that window.
        if !self.state.is_connected() {
            self.state.cancel_operations(&Error::ConnectionReset);
        }
        self.demux.pump_reads(&self.state);
        let bytes = rx.await.map_err(|_| Error::ConnectionAborted)??;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Close the fiber. Pending operations complete with
    /// [`Error::Interrupted`]; closing twice is a no-op.
    pub fn close(&self) {
        self.demux.close_fiber(&self.state);
    }

    /// The demux this fiber runs on.
    pub fn demux(&self) -> &Arc<FiberDemux> {
        &self.demux
    }
}

impl Drop for StreamFiber {
    fn drop(&mut self) {
        self.demux.close_fiber(&self.state);
    }
}

impl std::fmt::Debug for StreamFiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFiber").field("id", &self.id()).finish()
    }
}

/// Acceptor for incoming stream fibers on one local port.
pub struct FiberListener {
    demux: Arc<FiberDemux>,
    state: Arc<FiberState>,
}

impl FiberListener {
    /// Bind an acceptor on `local_port` and start listening.
    pub fn bind(demux: &Arc<FiberDemux>, local_port: FiberPort) -> Result<Self> {
        Self::bind_with_priority(demux, local_port, DATA_PRIORITY)
    }

    /// [`bind`](Self::bind) with an explicit priority inherited by the
    /// accepted fibers.
    pub fn bind_with_priority(
        demux: &Arc<FiberDemux>,
        local_port: FiberPort,
        priority: u8,
    ) -> Result<Self> {
        let state = Arc::new(FiberState::new_stream(0, priority));
        demux.bind(local_port, &state)?;
        demux.listen(state.id().local_port)?;
        Ok(Self {
            demux: Arc::clone(demux),
            state,
        })
    }

    /// Local port this acceptor listens on.
    pub fn local_port(&self) -> FiberPort {
        self.state.id().local_port
    }

    /// Wait for the next incoming fiber and complete its handshake.
    pub async fn accept(&self) -> Result<StreamFiber> {
        let (tx, rx) = oneshot::channel();
        self.state
            .accept_queue
            .lock()
            .expect("accept queue lock")
            .push_back(AcceptOp { done: tx });
        self.demux.pump_accepts(&self.state);
        let peer = rx.await.map_err(|_| Error::ConnectionAborted)??;
        Ok(StreamFiber {
            demux: Arc::clone(&self.demux),
            state: peer,
        })
    }

    /// Stop listening and cancel pending accepts.
    pub fn close(&self) {
        self.demux.close_fiber(&self.state);
    }
}

impl Drop for FiberListener {
    fn drop(&mut self) {
        self.demux.close_fiber(&self.state);
    }
}

/// Buffered reader over a [`StreamFiber`] for protocols that consume
/// exact byte counts (the admin codec, SOCKS handshakes).
pub struct FiberReader {
    fiber: Arc<StreamFiber>,
    buf: bytes::BytesMut,
}

impl FiberReader {
    /// Wrap a fiber.
    pub fn new(fiber: Arc<StreamFiber>) -> Self {
        Self {
            fiber,
            buf: bytes::BytesMut::new(),
        }
    }

    /// The wrapped fiber.
    pub fn fiber(&self) -> &Arc<StreamFiber> {
        &self.fiber
    }

    /// Read exactly `len` bytes, waiting for more chunks as needed.
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 64 * 1024];
        while self.buf.len() < len {
            let n = self.fiber.recv(&mut chunk).await?;
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(self.buf.split_to(len).to_vec())
    }

    /// Read a single byte.
    pub async fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1).await?[0])
    }

    /// Read a little-endian `u32`.
    pub async fn read_u32_le(&mut self) -> Result<u32> {
        let bytes = self.read_exact(4).await?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Unwrap into the fiber and any bytes read past the last consumed
    /// message (pipelined data must not be dropped).
    pub fn into_parts(self) -> (Arc<StreamFiber>, Vec<u8>) {
        (self.fiber, self.buf.to_vec())
    }
}

impl std::fmt::Debug for FiberReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberReader")
            .field("id", &self.fiber.id())
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl std::fmt::Debug for FiberListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberListener")
            .field("local_port", &self.local_port())
            .finish()
    }
}
