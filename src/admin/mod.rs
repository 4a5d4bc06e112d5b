//! Admin microservice (factory id 1).
//!
//! The always-on control endpoint of a session. One reserved fiber,
//! bound to port `(1<<17)+1` on both sides, carries a tiny
//! request/reply scheme: the server side accepts it, the client side
//! connects immediately on session start. Requests create and stop
//! microservices on the peer; `ServiceStatus` replies (matched to
//! requests by an echoed serial) maintain the per-session table of
//! remotely running services.
//!
//! The client role additionally drives user-service initialization:
//! send every remote create, wait until the peer confirms each one
//! running, then start the local halves, tearing partial starts back
//! down when anything fails.
//!
//! A keepalive (serial 0, command 0) flows every 120 s in each
//! direction; any write error on the control fiber terminates the
//! session.

pub mod command;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::admin::command::{
    AdminCommand, CreateServiceRequest, Parameters, ServiceStatus, StopServiceRequest,
    COMMAND_HEADER_SIZE,
};
use crate::constants::{
    ADMIN_SERVICE_PORT, KEEP_ALIVE_INTERVAL, SERVICE_STATUS_RETRY_COUNT,
    SERVICE_STATUS_RETRY_INTERVAL,
};
use crate::error::{Error, Result};
use crate::fiber::demux::CONTROL_PRIORITY;
use crate::fiber::{FiberListener, FiberReader, StreamFiber};
use crate::services::{ServiceManager, ADMIN_FACTORY_ID};
use crate::user_services::UserService;

/// Wire error code meaning "service stopped"; removes the table entry.
const STATUS_STOPPED: u32 = 4;

/// State of one remotely running service, keyed by its unique id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServiceState {
    /// Factory id of the service.
    pub service_id: u32,
    /// Last reported error code (0 = running).
    pub error_code: u32,
    /// Parameters it was created with.
    pub params: Parameters,
}

/// Outcome callback for user-service initialization, invoked once per
/// adapter with its name.
pub type UserServiceCallback = Arc<dyn Fn(&str, Result<()>) + Send + Sync>;

/// A user service whose halves are up, remembered for teardown.
struct StartedUserService {
    name: String,
    remote_ids: Vec<u32>,
    local_ids: Vec<u32>,
}

/// The admin control endpoint of one session.
pub struct Admin {
    manager: Arc<ServiceManager>,
    is_server: bool,
    next_serial: AtomicU32,
    reply_waiters: Mutex<HashMap<u32, oneshot::Sender<ServiceStatus>>>,
    remote_services: Mutex<HashMap<u32, RemoteServiceState>>,
    send_tx: Mutex<Option<mpsc::UnboundedSender<AdminCommand>>>,
    user_services: Vec<Arc<dyn UserService>>,
    callback: Option<UserServiceCallback>,
    started: Mutex<Vec<StartedUserService>>,
}

impl Admin {
    /// Server-side admin: accepts the control fiber.
    pub fn server(manager: Arc<ServiceManager>) -> Arc<Self> {
        Self::new(manager, true, Vec::new(), None)
    }

    /// Client-side admin: connects the control fiber and drives the
    /// given user services.
    pub fn client(
        manager: Arc<ServiceManager>,
        user_services: Vec<Arc<dyn UserService>>,
        callback: UserServiceCallback,
    ) -> Arc<Self> {
        Self::new(manager, false, user_services, Some(callback))
    }

    fn new(
        manager: Arc<ServiceManager>,
        is_server: bool,
        user_services: Vec<Arc<dyn UserService>>,
        callback: Option<UserServiceCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            is_server,
            // Client serials are odd, server serials even, so the two
            // request spaces never collide.
            next_serial: AtomicU32::new(if is_server { 2 } else { 1 }),
            reply_waiters: Mutex::new(HashMap::new()),
            remote_services: Mutex::new(HashMap::new()),
            send_tx: Mutex::new(None),
            user_services,
            callback,
            started: Mutex::new(Vec::new()),
        })
    }

    /// Factory id of the admin service.
    pub fn service_type_id(&self) -> u32 {
        ADMIN_FACTORY_ID
    }

    /// Server mode: listen on the reserved port and serve the first
    /// control fiber the peer opens.
    pub fn start_server(self: &Arc<Self>) -> Result<()> {
        let listener = FiberListener::bind_with_priority(
            self.manager.demux(),
            ADMIN_SERVICE_PORT,
            CONTROL_PRIORITY,
        )?;
        info!("[admin] listening on reserved port {ADMIN_SERVICE_PORT}");
        let admin = Arc::clone(self);
        tokio::spawn(async move {
            match listener.accept().await {
                Ok(fiber) => admin.run(fiber).await,
                Err(e) => debug!("[admin] control fiber accept failed: {e}"),
            }
        });
        Ok(())
    }

    /// Client mode: connect the control fiber, then initialize the user
    /// services in the background. Returns once the fiber is up.
    ///
    /// The first SYN can race the peer's admin binding its acceptor, so
    /// a refused connect is retried against the status budget.
    pub async fn start_client(self: &Arc<Self>) -> Result<()> {
        let mut fiber = None;
        for retry in 0..SERVICE_STATUS_RETRY_COUNT {
            match StreamFiber::connect_with_priority(
                self.manager.demux(),
                ADMIN_SERVICE_PORT,
                CONTROL_PRIORITY,
            )
            .await
            {
                Ok(connected) => {
                    fiber = Some(connected);
                    break;
                }
                Err(Error::ConnectionRefused) => {
                    if retry == 0 {
                        debug!("[admin] control acceptor not ready yet, retrying");
                    }
                    tokio::time::sleep(SERVICE_STATUS_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
        let Some(fiber) = fiber else {
            return Err(Error::ConnectionRefused);
        };
        info!("[admin] control fiber connected");
        let admin = Arc::clone(self);
        tokio::spawn(async move { admin.run(fiber).await });
        let admin = Arc::clone(self);
        tokio::spawn(async move { admin.initialize_user_services().await });
        Ok(())
    }

    /// Stop every service this side started for its user services:
    /// remote stops go out as requests, local halves stop in place.
    pub async fn shutdown_user_services(&self) {
        let started: Vec<StartedUserService> =
            self.started.lock().expect("started lock").drain(..).collect();
        for service in started {
            debug!("[admin] tearing down user service <{}>", service.name);
            for unique_id in service.remote_ids {
                let _ = self.stop_remote_service(unique_id).await;
            }
            for unique_id in service.local_ids {
                let _ = self.manager.stop(unique_id).await;
            }
        }
    }

    /// Snapshot of the remote-service status table.
    pub fn remote_services(&self) -> HashMap<u32, RemoteServiceState> {
        self.remote_services
            .lock()
            .expect("remote services lock")
            .clone()
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    fn next_serial(&self) -> u32 {
        self.next_serial.fetch_add(2, Ordering::Relaxed)
    }

    fn send(&self, command: AdminCommand) -> Result<()> {
        let tx = self.send_tx.lock().expect("send tx lock");
        match tx.as_ref() {
            Some(tx) if tx.send(command).is_ok() => Ok(()),
            _ => Err(Error::BrokenPipe),
        }
    }

    async fn request(&self, command_id: u32, arg: Vec<u8>) -> Result<ServiceStatus> {
        let serial = self.next_serial();
        let (tx, rx) = oneshot::channel();
        self.reply_waiters
            .lock()
            .expect("reply waiters lock")
            .insert(serial, tx);
        if let Err(e) = self.send(AdminCommand {
            serial,
            command: command_id,
            arg,
        }) {
            self.reply_waiters
                .lock()
                .expect("reply waiters lock")
                .remove(&serial);
            return Err(e);
        }
        rx.await.map_err(|_| Error::ConnectionAborted)
    }

    /// Ask the peer to create and start a service. The reply carries
    /// the unique id the peer assigned and the resulting error code.
    pub async fn create_remote_service(&self, request: CreateServiceRequest) -> Result<ServiceStatus> {
        self.request(CreateServiceRequest::COMMAND_ID, request.encode_arg())
            .await
    }

    /// Ask the peer to stop the service it runs under `unique_id`.
    pub async fn stop_remote_service(&self, unique_id: u32) -> Result<ServiceStatus> {
        let request = StopServiceRequest { unique_id };
        self.request(StopServiceRequest::COMMAND_ID, request.encode_arg())
            .await
    }

    /// Poll the status table until the remote service `unique_id`
    /// reports running, bounded by the retry budget.
    async fn wait_remote_running(&self, unique_id: u32) -> Result<()> {
        for _ in 0..SERVICE_STATUS_RETRY_COUNT {
            match self
                .remote_services
                .lock()
                .expect("remote services lock")
                .get(&unique_id)
            {
                Some(state) if state.error_code == 0 => return Ok(()),
                Some(state) => {
                    return Err(Error::from_wire_code(state.error_code)
                        .unwrap_or(Error::ServiceNotStarted))
                }
                None => {}
            }
            tokio::time::sleep(SERVICE_STATUS_RETRY_INTERVAL).await;
        }
        Err(Error::ServiceNotStarted)
    }

    // ------------------------------------------------------------------
    // User services (client role)
    // ------------------------------------------------------------------

    async fn initialize_user_services(self: &Arc<Self>) {
        for service in &self.user_services {
            let result = self.initialize_user_service(service.as_ref()).await;
            match &result {
                Ok(()) => info!("[admin] user service <{}> up", service.name()),
                Err(e) => warn!("[admin] user service <{}> failed: {e}", service.name()),
            }
            if let Some(callback) = &self.callback {
                callback(service.name(), result);
            }
        }
    }

    /// Bring one adapter up: all remote creates first, local halves
    /// only once every remote side runs. A failure stops everything
    /// this adapter already started and reports `OperationCanceled`.
    async fn initialize_user_service(&self, service: &dyn UserService) -> Result<()> {
        let mut remote_ids = Vec::new();
        let mut failure = None;

        for request in service.remote_create_requests() {
            match self.create_remote_service(request).await {
                Ok(status) if status.error_code == 0 => {
                    if let Err(e) = self.wait_remote_running(status.id).await {
                        failure = Some(e);
                        break;
                    }
                    remote_ids.push(status.id);
                }
                Ok(status) => {
                    failure = Some(
                        Error::from_wire_code(status.error_code)
                            .unwrap_or(Error::ServiceNotStarted),
                    );
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut local_ids = Vec::new();
        if failure.is_none() {
            for request in service.local_create_requests() {
                match self.manager.create_run(request.service_id, request.params).await {
                    Ok(unique_id) => local_ids.push(unique_id),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(e) = failure {
            for unique_id in local_ids {
                let _ = self.manager.stop(unique_id).await;
            }
            for unique_id in remote_ids {
                let _ = self.stop_remote_service(unique_id).await;
            }
            debug!("[admin] partial start rolled back: {e}");
            return Err(Error::OperationCanceled);
        }

        self.started
            .lock()
            .expect("started lock")
            .push(StartedUserService {
                name: service.name().to_owned(),
                remote_ids,
                local_ids,
            });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control fiber loop
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>, fiber: StreamFiber) {
        let fiber = Arc::new(fiber);
        let demux = Arc::clone(fiber.demux());
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<AdminCommand>();
        *self.send_tx.lock().expect("send tx lock") = Some(send_tx.clone());

        // Writer: one task owns the outbound half. Any write error on
        // the control fiber terminates the session.
        let writer = {
            let fiber = Arc::clone(&fiber);
            let demux = Arc::clone(&demux);
            tokio::spawn(async move {
                while let Some(command) = send_rx.recv().await {
                    if let Err(e) = fiber.send_all(&command.encode()).await {
                        warn!("[admin] control fiber write failed: {e}");
                        demux.close();
                        break;
                    }
                }
            })
        };

        // Keepalive every 120 s; skip the interval's immediate tick.
        let keep_alive = {
            let send_tx = send_tx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(KEEP_ALIVE_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if send_tx.send(AdminCommand::keep_alive()).is_err() {
                        break;
                    }
                }
            })
        };

        // Reader: this task consumes the control fiber until it dies.
        let mut reader = FiberReader::new(Arc::clone(&fiber));
        loop {
            let header = match reader.read_exact(COMMAND_HEADER_SIZE).await {
                Ok(bytes) => {
                    let mut buf = [0u8; COMMAND_HEADER_SIZE];
                    buf.copy_from_slice(&bytes);
                    buf
                }
                Err(e) => {
                    debug!("[admin] control fiber closed: {e}");
                    break;
                }
            };
            let (serial, command_id, arg_size) = AdminCommand::decode_header(&header);
            let arg = match reader.read_exact(arg_size as usize).await {
                Ok(arg) => arg,
                Err(e) => {
                    debug!("[admin] control fiber closed mid-command: {e}");
                    break;
                }
            };
            self.dispatch(serial, command_id, &arg).await;
        }

        keep_alive.abort();
        writer.abort();
        *self.send_tx.lock().expect("send tx lock") = None;
        // Waiters would hang forever otherwise.
        self.reply_waiters
            .lock()
            .expect("reply waiters lock")
            .clear();
        demux.close();
    }

    async fn dispatch(&self, serial: u32, command_id: u32, arg: &[u8]) {
        match command_id {
            0 => {} // keepalive
            CreateServiceRequest::COMMAND_ID => self.on_create_request(serial, arg).await,
            StopServiceRequest::COMMAND_ID => self.on_stop_request(serial, arg).await,
            ServiceStatus::COMMAND_ID => self.on_service_status(serial, arg),
            other => warn!("[admin] unknown command {other}, serial {serial}"),
        }
    }

    async fn on_create_request(&self, serial: u32, arg: &[u8]) {
        let Ok(request) = CreateServiceRequest::decode_arg(arg) else {
            warn!("[admin] malformed create request, serial {serial}");
            return;
        };
        let service_id = request.service_id;
        let (unique_id, error_code) = match self
            .manager
            .create_run(service_id, request.params.clone())
            .await
        {
            Ok(unique_id) => (unique_id, 0),
            Err(e) => (0, e.wire_code()),
        };
        debug!(
            "[admin] create service {service_id}: unique id {unique_id}, error code {error_code}"
        );
        let reply = ServiceStatus {
            id: unique_id,
            service_id,
            error_code,
            params: request.params,
        };
        let _ = self.send(AdminCommand {
            serial,
            command: ServiceStatus::COMMAND_ID,
            arg: reply.encode_arg(),
        });
    }

    async fn on_stop_request(&self, serial: u32, arg: &[u8]) {
        let Ok(request) = StopServiceRequest::decode_arg(arg) else {
            warn!("[admin] malformed stop request, serial {serial}");
            return;
        };
        let error_code = match self.manager.stop(request.unique_id).await {
            Ok(()) => STATUS_STOPPED,
            Err(e) => e.wire_code(),
        };
        debug!(
            "[admin] stop service #{}: error code {error_code}",
            request.unique_id
        );
        let reply = ServiceStatus {
            id: request.unique_id,
            service_id: 0,
            error_code,
            params: Parameters::new(),
        };
        let _ = self.send(AdminCommand {
            serial,
            command: ServiceStatus::COMMAND_ID,
            arg: reply.encode_arg(),
        });
    }

    fn on_service_status(&self, serial: u32, arg: &[u8]) {
        let Ok(status) = ServiceStatus::decode_arg(arg) else {
            warn!("[admin] malformed service status, serial {serial}");
            return;
        };
        debug!(
            "[admin] service status: unique id {} service {} error code {}",
            status.id, status.service_id, status.error_code
        );
        {
            let mut table = self.remote_services.lock().expect("remote services lock");
            if status.error_code == STATUS_STOPPED {
                table.remove(&status.id);
            } else if status.id != 0 {
                table.insert(
                    status.id,
                    RemoteServiceState {
                        service_id: status.service_id,
                        error_code: status.error_code,
                        params: status.params.clone(),
                    },
                );
            }
        }
        if let Some(waiter) = self
            .reply_waiters
            .lock()
            .expect("reply waiters lock")
            .remove(&serial)
        {
            let _ = waiter.send(status);
        }
    }
}

impl std::fmt::Debug for Admin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admin")
            .field("is_server", &self.is_server)
            .field(
                "remote_services",
                &self.remote_services.lock().expect("remote services lock").len(),
            )
            .finish_non_exhaustive()
    }
}
