//! Datagram forwarder microservice (factory id 5).
//!
//! Receives datagrams on the fiber port `local_port` and relays them as
//! UDP to `(remote_ip, remote_port)`; UDP replies travel back to the
//! fiber port that spoke last. The remote half of a `-U` forward and
//! the local half of a `-V` forward are both instances of this service.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::admin::command::{CreateServiceRequest, Parameters};
use crate::error::{Error, Result};
use crate::fiber::{DatagramFiber, FiberDemux, FiberPort};
use crate::services::{
    require_param, require_port_param, require_socket_port_param, run_sessions_abort, Microservice,
    ServiceConstructor, DATAGRAM_FORWARDER_FACTORY_ID,
};

/// Fiber datagram receiver relaying payloads to a UDP endpoint.
pub struct DatagramForwarder {
    demux: Arc<FiberDemux>,
    local_port: FiberPort,
    remote_ip: String,
    remote_port: u16,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DatagramForwarder {
    /// Build from a parameter bag: `{ local_port, remote_ip, remote_port }`.
    pub fn from_params(demux: &Arc<FiberDemux>, params: Parameters) -> Result<Arc<Self>> {
        let local_port = require_port_param(&params, "local_port")?;
        let remote_ip = require_param(&params, "remote_ip")?.to_owned();
        let remote_port = require_socket_port_param(&params, "remote_port")?;
        Ok(Arc::new(Self {
            demux: Arc::clone(demux),
            local_port,
            remote_ip,
            remote_port,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    /// The create request a user-service adapter sends for this service.
    pub fn create_request(
        local_port: FiberPort,
        remote_addr: &str,
        remote_port: u16,
    ) -> CreateServiceRequest {
        CreateServiceRequest::new(DATAGRAM_FORWARDER_FACTORY_ID)
            .with_param("local_port", local_port.to_string())
            .with_param("remote_ip", remote_addr)
            .with_param("remote_port", remote_port.to_string())
    }
}

/// Registry constructor.
pub fn constructor() -> ServiceConstructor {
    Box::new(|demux, params| {
        Ok(DatagramForwarder::from_params(demux, params)? as Arc<dyn Microservice>)
    })
}

#[async_trait]
impl Microservice for DatagramForwarder {
    fn service_type_id(&self) -> u32 {
        DATAGRAM_FORWARDER_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let fiber = DatagramFiber::bind(&self.demux, self.local_port)?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(|e| {
            warn!("[microservice:datagram_forwarder] cannot bind udp socket: {e}");
            Error::ServiceNotStarted
        })?;
        socket
            .connect((self.remote_ip.as_str(), self.remote_port))
            .await
            .map_err(|e| {
                warn!(
                    "[microservice:datagram_forwarder] cannot reach {}:{}: {e}",
                    self.remote_ip, self.remote_port
                );
                Error::ServiceNotStarted
            })?;
        info!(
            "[microservice:datagram_forwarder] forwarding fiber {} -> {}:{}",
            self.local_port, self.remote_ip, self.remote_port
        );

        let fiber = Arc::new(fiber);
        let socket = Arc::new(socket);
        // Replies go to whichever fiber port spoke last; zero means
        // nobody has yet.
        let last_sender = Arc::new(AtomicU32::new(0));
        let mtu = self.demux.mtu() as usize;

        let fiber_to_udp = {
            let fiber = Arc::clone(&fiber);
            let socket = Arc::clone(&socket);
            let last_sender = Arc::clone(&last_sender);
            tokio::spawn(async move {
                let mut buf = vec![0u8; mtu];
                loop {
                    match fiber.recv_from(&mut buf).await {
                        Ok((n, sender)) => {
                            last_sender.store(sender, Ordering::Relaxed);
                            let _ = socket.send(&buf[..n]).await;
                        }
                        Err(e) => {
                            debug!("[microservice:datagram_forwarder] fiber receive ended: {e}");
                            break;
                        }
                    }
                }
            })
        };

        let udp_to_fiber = {
            let fiber = Arc::clone(&fiber);
            let socket = Arc::clone(&socket);
            let last_sender = Arc::clone(&last_sender);
            tokio::spawn(async move {
                let mut buf = vec![0u8; mtu];
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(n) => {
                            let sender = last_sender.load(Ordering::Relaxed);
                            if sender != 0 {
                                if let Err(e) = fiber.send_to(&buf[..n], sender).await {
                                    debug!(
                                        "[microservice:datagram_forwarder] fiber send failed: {e}"
                                    );
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            debug!("[microservice:datagram_forwarder] udp receive failed: {e}");
                            break;
                        }
                    }
                }
            })
        };

        let mut tasks = self.tasks.lock().expect("session tasks lock");
        tasks.push(fiber_to_udp);
        tasks.push(udp_to_fiber);
        Ok(())
    }

    async fn stop(&self) {
        run_sessions_abort(&self.tasks);
        debug!("[microservice:datagram_forwarder] stopped");
    }
}

impl std::fmt::Debug for DatagramForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramForwarder")
            .field("local_port", &self.local_port)
            .field("remote_ip", &self.remote_ip)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}
