//! Stream listener microservice (factory id 4).
//!
//! Listens on a TCP endpoint `(local_addr, local_port)`. Each accepted
//! connection opens a fiber toward `remote_port` on the peer and
//! forwards I/O both ways. The client side of a `-L` forward and the
//! server side of a `-R` forward are both instances of this service.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::command::{CreateServiceRequest, Parameters};
use crate::error::{Error, Result};
use crate::fiber::{FiberDemux, FiberPort, StreamFiber};
use crate::services::link::run_stream_link;
use crate::services::{
    listener_bind_addr, require_port_param, require_socket_port_param, run_sessions_abort,
    Microservice, ServiceConstructor, STREAM_LISTENER_FACTORY_ID,
};

/// TCP listener forwarding each accepted socket into a fresh fiber.
pub struct StreamListener {
    demux: Arc<FiberDemux>,
    local_addr: String,
    local_port: u16,
    remote_port: FiberPort,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl StreamListener {
    /// Build from a parameter bag:
    /// `{ local_addr, local_port, remote_port }`.
    pub fn from_params(
        demux: &Arc<FiberDemux>,
        params: Parameters,
        gateway_ports: bool,
    ) -> Result<Arc<Self>> {
        let local_addr = listener_bind_addr(&params, gateway_ports, "stream_listener");
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
        CreateServiceRequest::new(STREAM_LISTENER_FACTORY_ID)
            .with_param("local_addr", local_addr)
            .with_param("local_port", local_port.to_string())
            .with_param("remote_port", remote_port.to_string())
    }
}

/// Registry constructor closing over the gateway-ports policy.
pub fn constructor(gateway_ports: bool) -> ServiceConstructor {
    Box::new(move |demux, params| {
        Ok(StreamListener::from_params(demux, params, gateway_ports)? as Arc<dyn Microservice>)
    })
}

#[async_trait]
impl Microservice for StreamListener {
    fn service_type_id(&self) -> u32 {
        STREAM_LISTENER_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind((self.local_addr.as_str(), self.local_port))
            .await
            .map_err(|e| {
                warn!(
                    "[microservice:stream_listener] cannot listen on {}:{}: {e}",
                    self.local_addr, self.local_port
                );
                Error::ServiceNotStarted
            })?;
        info!(
            "[microservice:stream_listener] forwarding {}:{} -> fiber {}",
            self.local_addr, self.local_port, self.remote_port
        );

        let demux = Arc::clone(&self.demux);
        let remote_port = self.remote_port;
        let tasks = Arc::clone(&self.tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("[microservice:stream_listener] accept failed: {e}");
                        break;
                    }
                };
                debug!("[microservice:stream_listener] connection from {peer}");
                let demux = Arc::clone(&demux);
                let session = tokio::spawn(async move {
                    match StreamFiber::connect(&demux, remote_port).await {
                        Ok(fiber) => run_stream_link(Arc::new(fiber), socket).await,
                        Err(e) => {
                            debug!(
                                "[microservice:stream_listener] fiber connect to {remote_port} failed: {e}"
                            );
                        }
                    }
                });
                tasks.lock().expect("session tasks lock").push(session);
            }
        });
        self.tasks
            .lock()
            .expect("session tasks lock")
            .push(accept_task);
        Ok(())
    }

    async fn stop(&self) {
        run_sessions_abort(&self.tasks);
        debug!("[microservice:stream_listener] stopped");
    }
}

impl std::fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamListener")
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
    async fn test_from_params_requires_ports() {
        let (a, _b) = tokio::io::duplex(64);
        let demux = FiberDemux::fiberize(Box::new(a), crate::constants::MAX_MTU);
        let mut params = Parameters::new();
        params.insert("local_addr".into(), "127.0.0.1".into());
        params.insert("local_port".into(), "13080".into());
        assert!(StreamListener::from_params(&demux, params.clone(), false).is_err());
        params.insert("remote_port".into(), "13080".into());
        assert!(StreamListener::from_params(&demux, params.clone(), false).is_ok());
        params.insert("local_port".into(), "70000".into());
        assert!(StreamListener::from_params(&demux, params, false).is_err());
    }

    #[test]
    fn test_create_request_parameter_bag() {
        let req = StreamListener::create_request("", 13080, 13080);
        assert_eq!(req.service_id, STREAM_LISTENER_FACTORY_ID);
        assert_eq!(req.params.get("local_port").unwrap(), "13080");
        assert_eq!(req.params.get("remote_port").unwrap(), "13080");
    }
}
