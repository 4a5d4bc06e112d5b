//! Datagram listener microservice (factory id 6).
//!
//! Listens on a UDP endpoint `(local_addr, local_port)`. Datagrams
//! received there are forwarded to the fiber port `remote_port` on the
//! peer; datagrams coming back on the fiber are sent to the most recent
//! UDP sender. The client side of a `-U` forward and the server side of
//! a `-V` forward are both instances of this service.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::admin::command::{CreateServiceRequest, Parameters};
use crate::error::{Error, Result};
use crate::fiber::{DatagramFiber, FiberDemux, FiberPort};
use crate::services::{
    listener_bind_addr, require_port_param, require_socket_port_param, run_sessions_abort,
    Microservice, ServiceConstructor, DATAGRAM_LISTENER_FACTORY_ID,
};

/// UDP listener relaying datagrams into a fiber flow.
pub struct DatagramListener {
    demux: Arc<FiberDemux>,
    local_addr: String,
    local_port: u16,
    remote_port: FiberPort,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DatagramListener {
    /// Build from a parameter bag:
    /// `{ local_addr, local_port, remote_port }`.
    pub fn from_params(
        demux: &Arc<FiberDemux>,
        params: Parameters,
        gateway_ports: bool,
    ) -> Result<Arc<Self>> {
        let local_addr = listener_bind_addr(&params, gateway_ports, "datagram_listener");
        let local_port = require_socket_port_param(&params, "local_port")?;
        let remote_port = require_port_param(&params, "remote_port")?;
        Ok(Arc::new(Self {
            demux: Arc::clone(demux),
            local_addr,
            local_port,
            remote_port,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    /// The create request a user-service adapter sends for this service.
    pub fn create_request(
        local_addr: &str,
        local_port: u16,
        remote_port: FiberPort,
    ) -> CreateServiceRequest {
        CreateServiceRequest::new(DATAGRAM_LISTENER_FACTORY_ID)
            .with_param("local_addr", local_addr)
            .with_param("local_port", local_port.to_string())
            .with_param("remote_port", remote_port.to_string())
    }
}

/// Registry constructor closing over the gateway-ports policy.
pub fn constructor(gateway_ports: bool) -> ServiceConstructor {
    Box::new(move |demux, params| {
        Ok(DatagramListener::from_params(demux, params, gateway_ports)? as Arc<dyn Microservice>)
    })
}

#[async_trait]
impl Microservice for DatagramListener {
    fn service_type_id(&self) -> u32 {
        DATAGRAM_LISTENER_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let socket = UdpSocket::bind((self.local_addr.as_str(), self.local_port))
            .await
            .map_err(|e| {
                warn!(
                    "[microservice:datagram_listener] cannot bind {}:{}: {e}",
                    self.local_addr, self.local_port
                );
                Error::ServiceNotStarted
            })?;
        let fiber = DatagramFiber::bind(&self.demux, 0)?;
        info!(
            "[microservice:datagram_listener] forwarding {}:{} -> fiber {}",
            self.local_addr, self.local_port, self.remote_port
        );

        let socket = Arc::new(socket);
        let fiber = Arc::new(fiber);
        // Replies go to whichever endpoint spoke last.
        let last_peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
        let mtu = self.demux.mtu() as usize;
        let remote_port = self.remote_port;

        let udp_to_fiber = {
            let socket = Arc::clone(&socket);
            let fiber = Arc::clone(&fiber);
            let last_peer = Arc::clone(&last_peer);
            tokio::spawn(async move {
                let mut buf = vec![0u8; mtu];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, peer)) => {
                            *last_peer.lock().expect("peer lock") = Some(peer);
                            if let Err(e) = fiber.send_to(&buf[..n], remote_port).await {
                                debug!("[microservice:datagram_listener] fiber send failed: {e}");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("[microservice:datagram_listener] udp receive failed: {e}");
                            break;
                        }
                    }
                }
            })
        };

        let fiber_to_udp = {
            let socket = Arc::clone(&socket);
            let fiber = Arc::clone(&fiber);
            let last_peer = Arc::clone(&last_peer);
            tokio::spawn(async move {
                let mut buf = vec![0u8; mtu];
                loop {
                    match fiber.recv_from(&mut buf).await {
                        Ok((n, _sender)) => {
                            let peer = *last_peer.lock().expect("peer lock");
                            if let Some(peer) = peer {
                                let _ = socket.send_to(&buf[..n], peer).await;
                            }
                        }
                        Err(e) => {
                            debug!("[microservice:datagram_listener] fiber receive ended: {e}");
                            break;
                        }
                    }
                }
            })
        };

        let mut tasks = self.tasks.lock().expect("session tasks lock");
        tasks.push(udp_to_fiber);
        tasks.push(fiber_to_udp);
        Ok(())
    }

    async fn stop(&self) {
        run_sessions_abort(&self.tasks);
        debug!("[microservice:datagram_listener] stopped");
    }
}

impl std::fmt::Debug for DatagramListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramListener")
            .field("local_addr", &self.local_addr)
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_params_demotes_interface_without_gateway_ports() {
        let (a, _b) = tokio::io::duplex(64);
        let demux = FiberDemux::fiberize(Box::new(a), crate::constants::MAX_MTU);
        let mut params = Parameters::new();
        params.insert("local_addr".into(), "*".into());
        params.insert("local_port".into(), "15353".into());
        params.insert("remote_port".into(), "15353".into());
        let service = DatagramListener::from_params(&demux, params, false).unwrap();
        assert_eq!(service.local_addr, "127.0.0.1");
    }
}
