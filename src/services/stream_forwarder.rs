//! Stream forwarder microservice (factory id 3).
//!
//! Accepts fibers on `local_port` and opens the matching outbound TCP
//! connection to `(remote_ip, remote_port)` for each, forwarding I/O
//! both ways. The remote half of a `-L` forward and the local half of a
//! `-R` forward are both instances of this service.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::admin::command::{CreateServiceRequest, Parameters};
use crate::error::Result;
use crate::fiber::{FiberDemux, FiberListener, FiberPort};
use crate::services::link::run_stream_link;
use crate::services::{
    require_param, require_port_param, require_socket_port_param, run_sessions_abort, Microservice,
    ServiceConstructor, STREAM_FORWARDER_FACTORY_ID,
};

/// Fiber acceptor forwarding each accepted fiber to a TCP endpoint.
pub struct StreamForwarder {
    demux: Arc<FiberDemux>,
    local_port: FiberPort,
    remote_ip: String,
    remote_port: u16,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl StreamForwarder {
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
        CreateServiceRequest::new(STREAM_FORWARDER_FACTORY_ID)
            .with_param("local_port", local_port.to_string())
            .with_param("remote_ip", remote_addr)
            .with_param("remote_port", remote_port.to_string())
    }
}

/// Registry constructor.
pub fn constructor() -> ServiceConstructor {
    Box::new(|demux, params| {
        Ok(StreamForwarder::from_params(demux, params)? as Arc<dyn Microservice>)
    })
}

#[async_trait]
impl Microservice for StreamForwarder {
    fn service_type_id(&self) -> u32 {
        STREAM_FORWARDER_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let listener = FiberListener::bind(&self.demux, self.local_port).map_err(|e| {
            warn!(
                "[microservice:stream_forwarder] cannot listen on fiber port {}: {e}",
                self.local_port
            );
            e
        })?;
        info!(
            "[microservice:stream_forwarder] forwarding fiber {} -> {}:{}",
            self.local_port, self.remote_ip, self.remote_port
        );

        let remote_ip = self.remote_ip.clone();
        let remote_port = self.remote_port;
        let tasks = Arc::clone(&self.tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let fiber = match listener.accept().await {
                    Ok(fiber) => fiber,
                    Err(e) => {
                        debug!("[microservice:stream_forwarder] accept ended: {e}");
                        break;
                    }
                };
                let remote_ip = remote_ip.clone();
                let session = tokio::spawn(async move {
                    match TcpStream::connect((remote_ip.as_str(), remote_port)).await {
                        Ok(socket) => run_stream_link(Arc::new(fiber), socket).await,
                        Err(e) => {
                            debug!(
                                "[microservice:stream_forwarder] connect to {remote_ip}:{remote_port} failed: {e}"
                            );
                            fiber.close();
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
        debug!("[microservice:stream_forwarder] stopped");
    }
}

impl std::fmt::Debug for StreamForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamForwarder")
            .field("local_port", &self.local_port)
            .field("remote_ip", &self.remote_ip)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_from_params_requires_remote_ip() {
        let (a, _b) = tokio::io::duplex(64);
        let demux = FiberDemux::fiberize(Box::new(a), crate::constants::MAX_MTU);
        let mut params = Parameters::new();
        params.insert("local_port".into(), "13080".into());
        params.insert("remote_port".into(), "80".into());
        assert!(matches!(
            StreamForwarder::from_params(&demux, params.clone()),
            Err(Error::ProtocolError(_))
        ));
        params.insert("remote_ip".into(), "93.184.216.34".into());
        assert!(StreamForwarder::from_params(&demux, params).is_ok());
    }

    #[test]
    fn test_create_request_parameter_bag() {
        let req = StreamForwarder::create_request(13080, "93.184.216.34", 80);
        assert_eq!(req.service_id, STREAM_FORWARDER_FACTORY_ID);
        assert_eq!(req.params.get("remote_ip").unwrap(), "93.184.216.34");
        assert_eq!(req.params.get("remote_port").unwrap(), "80");
    }
}
