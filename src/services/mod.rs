//! Microservices and the per-session service registry.
//!
//! A microservice is a per-session forwarding component (TCP forwarder,
//! SOCKS server, shell server, file-copy half, …) constructed on demand
//! in response to a control-fiber `CreateServiceRequest` or started
//! locally by a user-service adapter. The registry maps well-known
//! factory ids to constructors; the manager assigns a unique id per
//! started instance and routes stop-by-id.
//!
//! Well-known factory ids are on the wire; never renumber:
//!
//! | id | service |
//! |----|---------|
//! | 1  | admin (always on, not registry-constructed) |
//! | 2  | SOCKS server |
//! | 3  | stream forwarder (fibers → sockets) |
//! | 4  | stream listener (sockets → fibers) |
//! | 5  | datagram forwarder (fibers → datagrams) |
//! | 6  | datagram listener (datagrams → fibers) |
//! | 7  | fiber → file |
//! | 8  | file → fiber |
//! | 9  | file enquirer |
//! | 10 | process/shell |
//!
//! Ids 7–10 may be disabled by configuration.

pub mod copy;
pub mod datagram_forwarder;
pub mod datagram_listener;
pub(crate) mod link;
pub mod shell;
pub mod socks;
pub mod stream_forwarder;
pub mod stream_listener;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::admin::command::Parameters;
use crate::config::ServicesConfig;
use crate::error::{Error, Result};
use crate::fiber::FiberDemux;

/// Factory id of the admin service.
pub const ADMIN_FACTORY_ID: u32 = 1;
/// Factory id of the SOCKS server.
pub const SOCKS_FACTORY_ID: u32 = 2;
/// Factory id of the stream forwarder (fibers → sockets).
pub const STREAM_FORWARDER_FACTORY_ID: u32 = 3;
/// Factory id of the stream listener (sockets → fibers).
pub const STREAM_LISTENER_FACTORY_ID: u32 = 4;
/// Factory id of the datagram forwarder (fibers → datagrams).
pub const DATAGRAM_FORWARDER_FACTORY_ID: u32 = 5;
/// Factory id of the datagram listener (datagrams → fibers).
pub const DATAGRAM_LISTENER_FACTORY_ID: u32 = 6;
/// Factory id of the fiber-to-file copy half.
pub const FIBER_TO_FILE_FACTORY_ID: u32 = 7;
/// Factory id of the file-to-fiber copy half.
pub const FILE_TO_FIBER_FACTORY_ID: u32 = 8;
/// Factory id of the file enquirer.
pub const FILE_ENQUIRER_FACTORY_ID: u32 = 9;
/// Factory id of the process/shell server.
pub const SHELL_FACTORY_ID: u32 = 10;

/// A per-session forwarding component.
#[async_trait]
pub trait Microservice: Send + Sync {
    /// The well-known factory id of this service.
    fn service_type_id(&self) -> u32;

    /// Bring the service up. Must be cheap to call once; failure means
    /// the service never ran.
    async fn start(&self) -> Result<()>;

    /// Tear the service down, aborting its sessions.
    async fn stop(&self);
}

/// Constructor registered per factory id: demux plus a parameter bag in,
/// an unstarted microservice out.
pub type ServiceConstructor =
    Box<dyn Fn(&Arc<FiberDemux>, Parameters) -> Result<Arc<dyn Microservice>> + Send + Sync>;

/// Map of factory id → constructor, assembled per session from the
/// configuration.
#[derive(Default)]
pub struct ServiceRegistry {
    constructors: HashMap<u32, ServiceConstructor>,
}

impl ServiceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a factory id.
    pub fn register(&mut self, service_id: u32, constructor: ServiceConstructor) {
        self.constructors.insert(service_id, constructor);
    }

    /// Registry with every service the configuration allows.
    pub fn for_config(config: &ServicesConfig) -> Self {
        let mut registry = Self::new();
        registry.register(SOCKS_FACTORY_ID, socks::constructor());
        registry.register(STREAM_FORWARDER_FACTORY_ID, stream_forwarder::constructor());
        registry.register(
            STREAM_LISTENER_FACTORY_ID,
            stream_listener::constructor(config.stream_listener.gateway_ports),
        );
        registry.register(
            DATAGRAM_FORWARDER_FACTORY_ID,
            datagram_forwarder::constructor(),
        );
        registry.register(
            DATAGRAM_LISTENER_FACTORY_ID,
            datagram_listener::constructor(config.datagram_listener.gateway_ports),
        );
        if config.file_copy.enable {
            registry.register(FIBER_TO_FILE_FACTORY_ID, copy::fiber_to_file_constructor());
            registry.register(FILE_TO_FIBER_FACTORY_ID, copy::file_to_fiber_constructor());
            registry.register(FILE_ENQUIRER_FACTORY_ID, copy::file_enquirer_constructor());
        }
        if config.shell.enable {
            registry.register(SHELL_FACTORY_ID, shell::constructor(config.shell.clone()));
        }
        registry
    }

    fn construct(
        &self,
        service_id: u32,
        demux: &Arc<FiberDemux>,
        params: Parameters,
    ) -> Result<Arc<dyn Microservice>> {
        let constructor = self
            .constructors
            .get(&service_id)
            .ok_or(Error::ServiceNotFound)?;
        constructor(demux, params)
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&u32> = self.constructors.keys().collect();
        ids.sort();
        f.debug_struct("ServiceRegistry").field("ids", &ids).finish()
    }
}

/// Per-demux manager of running microservices: assigns unique ids,
/// routes stop-by-id, and tears everything down at session end.
pub struct ServiceManager {
    demux: Arc<FiberDemux>,
    registry: ServiceRegistry,
    next_id: AtomicU32,
    running: Mutex<HashMap<u32, Arc<dyn Microservice>>>,
}

impl ServiceManager {
    /// Create a manager for one demux.
    pub fn new(demux: Arc<FiberDemux>, registry: ServiceRegistry) -> Arc<Self> {
        Arc::new(Self {
            demux,
            registry,
            next_id: AtomicU32::new(1),
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Construct, start, and track a new service. Returns its unique id.
    pub async fn create_run(&self, service_id: u32, params: Parameters) -> Result<u32> {
        let service = self.registry.construct(service_id, &self.demux, params)?;
        service.start().await.inspect_err(|e| {
            warn!("[services] service {service_id} failed to start: {e}");
        })?;
        let unique_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.running
            .lock()
            .expect("running services lock")
            .insert(unique_id, service);
        info!("[services] started service {service_id} as #{unique_id}");
        Ok(unique_id)
    }

    /// Stop and forget the service started under `unique_id`.
    pub async fn stop(&self, unique_id: u32) -> Result<()> {
        let service = self
            .running
            .lock()
            .expect("running services lock")
            .remove(&unique_id);
        match service {
            Some(service) => {
                service.stop().await;
                info!("[services] stopped service #{unique_id}");
                Ok(())
            }
            None => Err(Error::ServiceNotFound),
        }
    }

    /// Stop every running service (session teardown).
    pub async fn stop_all(&self) {
        let services: Vec<(u32, Arc<dyn Microservice>)> = self
            .running
            .lock()
            .expect("running services lock")
            .drain()
            .collect();
        for (unique_id, service) in services {
            debug!("[services] stopping service #{unique_id}");
            service.stop().await;
        }
    }

    /// Number of currently running services.
    pub fn running_count(&self) -> usize {
        self.running.lock().expect("running services lock").len()
    }

    /// The demux this manager's services run on.
    pub fn demux(&self) -> &Arc<FiberDemux> {
        &self.demux
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("running", &self.running_count())
            .finish_non_exhaustive()
    }
}

/// Read a required parameter from a bag.
pub(crate) fn require_param<'a>(params: &'a Parameters, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::ProtocolError(format!("missing parameter {key}")))
}

/// Parse a required numeric parameter.
pub(crate) fn require_port_param(params: &Parameters, key: &str) -> Result<u32> {
    require_param(params, key)?
        .parse()
        .map_err(|_| Error::ProtocolError(format!("invalid parameter {key}")))
}

/// Parse a required TCP/UDP port parameter (must fit in 16 bits).
pub(crate) fn require_socket_port_param(params: &Parameters, key: &str) -> Result<u16> {
    let port = require_port_param(params, key)?;
    u16::try_from(port).map_err(|_| Error::ProtocolError(format!("{key} out of range")))
}

/// Abort every tracked session task of a stopping service.
pub(crate) fn run_sessions_abort(tasks: &Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>) {
    for task in tasks.lock().expect("session tasks lock").drain(..) {
        task.abort();
    }
}

/// Resolve the bind address of a listener service under the
/// gateway-ports policy: without it, anything non-loopback is demoted
/// to 127.0.0.1; with it, "*" and "" mean every interface.
pub(crate) fn listener_bind_addr(params: &Parameters, gateway_ports: bool, tag: &str) -> String {
    let requested = params.get("local_addr").map(String::as_str).unwrap_or("");
    if !gateway_ports {
        if !requested.is_empty() && requested != "127.0.0.1" {
            warn!(
                "[microservice:{tag}] cannot listen on interface <{requested}> without gateway ports"
            );
        }
        return "127.0.0.1".to_owned();
    }
    match requested {
        "" | "*" => "0.0.0.0".to_owned(),
        addr => addr.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_MTU;

    struct NoopService {
        started: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Microservice for NoopService {
        fn service_type_id(&self) -> u32 {
            99
        }
        async fn start(&self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) {
            self.started.store(false, Ordering::SeqCst);
        }
    }

    fn test_manager() -> Arc<ServiceManager> {
        let (a, _b) = tokio::io::duplex(1024);
        let demux = FiberDemux::fiberize(Box::new(a), MAX_MTU);
        let mut registry = ServiceRegistry::new();
        registry.register(
            99,
            Box::new(|_, _| {
                Ok(Arc::new(NoopService {
                    started: std::sync::atomic::AtomicBool::new(false),
                }) as Arc<dyn Microservice>)
            }),
        );
        ServiceManager::new(demux, registry)
    }

    #[tokio::test]
    async fn test_create_then_stop_leaves_table_empty() {
        let manager = test_manager();
        let id = manager.create_run(99, Parameters::new()).await.unwrap();
        assert!(id > 0);
        assert_eq!(manager.running_count(), 1);
        manager.stop(id).await.unwrap();
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.stop(id).await.unwrap_err(), Error::ServiceNotFound);
    }

    #[tokio::test]
    async fn test_unknown_service_id_not_found() {
        let manager = test_manager();
        assert_eq!(
            manager
                .create_run(1234, Parameters::new())
                .await
                .unwrap_err(),
            Error::ServiceNotFound
        );
    }

    #[tokio::test]
    async fn test_unique_ids_are_distinct() {
        let manager = test_manager();
        let first = manager.create_run(99, Parameters::new()).await.unwrap();
        let second = manager.create_run(99, Parameters::new()).await.unwrap();
        assert_ne!(first, second);
        manager.stop_all().await;
        assert_eq!(manager.running_count(), 0);
    }

    #[test]
    fn test_registry_respects_config_toggles() {
        let mut config = ServicesConfig::default();
        let registry = ServiceRegistry::for_config(&config);
        assert!(!registry.constructors.contains_key(&SHELL_FACTORY_ID));
        assert!(!registry.constructors.contains_key(&FIBER_TO_FILE_FACTORY_ID));
        assert!(registry.constructors.contains_key(&SOCKS_FACTORY_ID));

        config.shell.enable = true;
        config.file_copy.enable = true;
        let registry = ServiceRegistry::for_config(&config);
        assert!(registry.constructors.contains_key(&SHELL_FACTORY_ID));
        assert!(registry.constructors.contains_key(&FILE_ENQUIRER_FACTORY_ID));
    }

    #[test]
    fn test_listener_bind_addr_policy() {
        let mut params = Parameters::new();
        params.insert("local_addr".into(), "*".into());
        assert_eq!(listener_bind_addr(&params, true, "t"), "0.0.0.0");
        assert_eq!(listener_bind_addr(&params, false, "t"), "127.0.0.1");
        params.insert("local_addr".into(), "10.0.0.8".into());
        assert_eq!(listener_bind_addr(&params, true, "t"), "10.0.0.8");
        assert_eq!(listener_bind_addr(&params, false, "t"), "127.0.0.1");
        params.remove("local_addr");
        assert_eq!(listener_bind_addr(&params, true, "t"), "0.0.0.0");
    }
}
