//! Server session: the carrier accept loop.
//!
//! Every accepted carrier gets its own demux, service registry, and
//! server-mode admin (which listens for the peer's control fiber). In
//! relay-only mode direct connections are rejected by closing the
//! carrier immediately after accept.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::Admin;
use crate::carrier::{CarrierHandshake, HandshakeSide};
use crate::config::ServicesConfig;
use crate::constants::MAX_MTU;
use crate::fiber::FiberDemux;
use crate::services::{ServiceManager, ServiceRegistry};

/// Server-side policy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Reject direct connections; only relaying is allowed.
    pub relay_only: bool,
    /// Frame MTU handed to each demux.
    pub mtu: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            relay_only: false,
            mtu: MAX_MTU,
        }
    }
}

/// The accepting side of funnel sessions.
pub struct Server {
    config: ServerConfig,
    services_config: ServicesConfig,
    handshake: CarrierHandshake,
    sessions: Arc<Mutex<Vec<(Arc<FiberDemux>, Arc<ServiceManager>)>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Construct a server. Nothing listens until [`run`](Self::run).
    pub fn new(
        config: ServerConfig,
        services_config: ServicesConfig,
        handshake: CarrierHandshake,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            services_config,
            handshake,
            sessions: Arc::new(Mutex::new(Vec::new())),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind the carrier endpoint and start the accept loop. Returns
    /// once listening; serving continues in the background.
    pub async fn run(self: &Arc<Self>, bind_addr: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((bind_addr, port))
            .await
            .with_context(|| format!("cannot listen on {bind_addr}:{port}"))?;
        let local_addr = listener.local_addr().context("listener has no local addr")?;
        *self.local_addr.lock().expect("local addr lock") = Some(local_addr);
        info!("[server] listening on {local_addr}");

        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("[server] accept failed: {e}");
                        break;
                    }
                };
                if server.config.relay_only {
                    info!("[server] relay-only mode, rejecting direct connection from {peer}");
                    drop(socket);
                    continue;
                }
                debug!("[server] carrier from {peer}");
                let _ = socket.set_nodelay(true);
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.serve_carrier(Box::new(socket)).await });
            }
        });
        *self.accept_task.lock().expect("accept task lock") = Some(task);
        Ok(())
    }

    /// The bound endpoint, once [`run`](Self::run) succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr lock")
    }

    /// Number of live carrier sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("sessions lock").len()
    }

    /// Fiberize one accepted carrier and serve it until its demux dies.
    async fn serve_carrier(self: Arc<Self>, carrier: crate::carrier::BoxedCarrier) {
        let carrier = match (self.handshake)(carrier, HandshakeSide::Server).await {
            Ok(carrier) => carrier,
            Err(e) => {
                warn!("[server] carrier handshake failed: {e}");
                return;
            }
        };
        let demux = FiberDemux::fiberize(carrier, self.config.mtu);
        let registry = ServiceRegistry::for_config(&self.services_config);
        let manager = ServiceManager::new(Arc::clone(&demux), registry);
        let admin = Admin::server(Arc::clone(&manager));
        if let Err(e) = admin.start_server() {
            warn!("[server] admin setup failed: {e}");
            demux.close();
            return;
        }
        self.sessions
            .lock()
            .expect("sessions lock")
            .push((Arc::clone(&demux), Arc::clone(&manager)));

        let mut closed = demux.closed();
        let _ = closed.wait_for(|c| *c).await;
        debug!("[server] carrier session ended");
        manager.stop_all().await;
        self.sessions
            .lock()
            .expect("sessions lock")
            .retain(|(live, _)| !Arc::ptr_eq(live, &demux));
    }

    /// Stop accepting and tear down every live session.
    pub async fn stop(&self) {
        info!("[server] stop");
        if let Some(task) = self.accept_task.lock().expect("accept task lock").take() {
            task.abort();
        }
        let sessions: Vec<(Arc<FiberDemux>, Arc<ServiceManager>)> = self
            .sessions
            .lock()
            .expect("sessions lock")
            .drain(..)
            .collect();
        for (demux, manager) in sessions {
            demux.close();
            manager.stop_all().await;
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("relay_only", &self.config.relay_only)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
