//! Datagram fiber facade.
//!
//! Message-oriented counterpart of [`StreamFiber`](crate::fiber::stream::StreamFiber):
//! each send carries one datagram toward a remote fiber port, each
//! receive yields one datagram with its sender port. A fiber that has
//! never been bound locally is auto-bound on its first `send_to`.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::fiber::demux::{FiberDemux, DATA_PRIORITY};
use crate::fiber::id::{FiberId, FiberPort};
use crate::fiber::state::{DatagramReadOp, FiberState};

/// A datagram flow over one carrier.
pub struct DatagramFiber {
    demux: Arc<FiberDemux>,
    state: Arc<FiberState>,
}

impl DatagramFiber {
    /// Create an unbound datagram fiber; the local port is drawn on the
    /// first [`send_to`](Self::send_to).
    pub fn unbound(demux: &Arc<FiberDemux>) -> Self {
        Self {
            demux: Arc::clone(demux),
            state: Arc::new(FiberState::new_datagram(0, DATA_PRIORITY)),
        }
    }

    /// Bind a datagram fiber on `local_port` so peers can address it.
    pub fn bind(demux: &Arc<FiberDemux>, local_port: FiberPort) -> Result<Self> {
        let state = Arc::new(FiberState::new_datagram(0, DATA_PRIORITY));
        demux.bind(local_port, &state)?;
        Ok(Self {
            demux: Arc::clone(demux),
            state,
        })
    }

    /// Fiber id of this flow (remote port stays zero).
    pub fn id(&self) -> FiberId {
        self.state.id()
    }

    /// Send one datagram to `remote_port` on the peer.
    ///
    /// Auto-binds a dynamic local port on first use. Payloads above the
    /// MTU are rejected with [`Error::MessageTooLong`] and nothing is
    /// sent. `Ok(0)` with a non-empty payload is a throttle retry hint.
    pub async fn send_to(&self, buf: &[u8], remote_port: FiberPort) -> Result<usize> {
        if self.state.id().local_port == 0 {
            self.demux.bind(0, &self.state)?;
        }
        self.demux.send_datagram(&self.state, remote_port, buf).await
    }

    /// Receive one datagram. Returns the copied length and the sender's
    /// remote port. A datagram longer than `buf` is truncated.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, FiberPort)> {
        if self.state.id().local_port == 0 {
            return Err(Error::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.state
            .pending_datagram_reads
            .lock()
            .expect("datagram read queue lock")
            .push_back(DatagramReadOp {
                max_len: buf.len(),
                done: tx,
            });
        self.demux.pump_datagram_reads(&self.state);
        let (payload, sender) = rx.await.map_err(|_| Error::ConnectionAborted)??;
        buf[..payload.len()].copy_from_slice(&payload);
        Ok((payload.len(), sender))
    }

    /// Close the fiber; pending receives complete with
    /// [`Error::Interrupted`].
    pub fn close(&self) {
        self.demux.close_fiber(&self.state);
    }
}

impl Drop for DatagramFiber {
    fn drop(&mut self) {
        self.demux.close_fiber(&self.state);
    }
}

impl std::fmt::Debug for DatagramFiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramFiber").field("id", &self.id()).finish()
    }
}
