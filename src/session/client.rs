//! Client session: attempts with backoff.
//!
//! Each attempt resolves and connects a carrier, runs the handshake,
//! fiberizes the socket into a fresh demux, and starts the admin client
//! (which immediately connects the reserved control fiber and drives
//! the user services). Demux closure reports `Disconnected` and, policy
//! permitting, schedules the next attempt `reconnect_delay` later. A
//! session that reached `Running` resets the attempt budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::admin::{Admin, UserServiceCallback};
use crate::carrier::{CarrierConnector, CarrierHandshake, ConnectError, HandshakeSide};
use crate::config::ServicesConfig;
use crate::constants::MAX_MTU;
use crate::fiber::FiberDemux;
use crate::services::{ServiceManager, ServiceRegistry};
use crate::session::{Status, StatusCallback};
use crate::user_services::UserService;

/// Reconnection policy of a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How many carrier connection attempts to make before the final
    /// stop. A session that reached `Running` resets the budget.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub reconnect_delay: Duration,
    /// Never reconnect, whatever the budget says.
    pub no_reconnection: bool,
    /// Frame MTU handed to the demux.
    pub mtu: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            reconnect_delay: Duration::from_secs(10),
            no_reconnection: false,
            mtu: MAX_MTU,
        }
    }
}

/// How one session attempt ended.
enum Outcome {
    /// No point retrying (unresolvable endpoint, or stop requested).
    Fatal,
    /// The attempt failed before running; retry against the budget.
    Failed,
    /// The session ran and then disconnected; the budget resets.
    Ran,
}

struct ActiveSession {
    demux: Arc<FiberDemux>,
    manager: Arc<ServiceManager>,
    admin: Arc<Admin>,
}

/// A client session with its reconnection loop.
pub struct Client {
    connector: Arc<dyn CarrierConnector>,
    handshake: CarrierHandshake,
    config: ClientConfig,
    services_config: ServicesConfig,
    user_services: Vec<Arc<dyn UserService>>,
    on_status: StatusCallback,
    on_user_service: UserServiceCallback,
    active: Mutex<Option<ActiveSession>>,
    stopped_tx: watch::Sender<bool>,
    ever_running: AtomicBool,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Construct a client session. Nothing connects until
    /// [`run`](Self::run).
    #[allow(clippy::too_many_arguments, reason = "assembled once, in main")]
    pub fn new(
        connector: Arc<dyn CarrierConnector>,
        handshake: CarrierHandshake,
        config: ClientConfig,
        services_config: ServicesConfig,
        user_services: Vec<Arc<dyn UserService>>,
        on_status: StatusCallback,
        on_user_service: UserServiceCallback,
    ) -> Arc<Self> {
        let (stopped_tx, _) = watch::channel(false);
        Arc::new(Self {
            connector,
            handshake,
            config,
            services_config,
            user_services,
            on_status,
            on_user_service,
            active: Mutex::new(None),
            stopped_tx,
            ever_running: AtomicBool::new(false),
            run_task: Mutex::new(None),
        })
    }

    /// Start attempt 1. Returns immediately; observe progress through
    /// the status callback and [`wait_stop`](Self::wait_stop).
    pub fn run(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let task = tokio::spawn(async move { client.run_loop().await });
        *self.run_task.lock().expect("run task lock") = Some(task);
    }

    /// Whether any attempt reached `Running` (drives the exit code).
    pub fn reached_running(&self) -> bool {
        self.ever_running.load(Ordering::Acquire)
    }

    /// Block until the session posted its final stop.
    pub async fn wait_stop(&self) {
        let mut rx = self.stopped_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Stop the session: cancel the reconnect loop, tear down the user
    /// services, close the demux, stop the managed services, and wake
    /// every waiter. Idempotent.
    pub async fn stop(&self) {
        if self.stopped_tx.send_replace(true) {
            return;
        }
        info!("[session] stop");
        self.teardown_active().await;
    }

    fn is_stopped(&self) -> bool {
        *self.stopped_tx.borrow()
    }

    fn notify(&self, status: Status) {
        debug!("[session] status: {status}");
        if status == Status::Running {
            self.ever_running.store(true, Ordering::Release);
        }
        (self.on_status)(status);
    }

    async fn teardown_active(&self) {
        let active = self.active.lock().expect("active session lock").take();
        if let Some(active) = active {
            // Remote stops need the control fiber, so they go first.
            active.admin.shutdown_user_services().await;
            active.demux.close();
            active.manager.stop_all().await;
        }
    }

    async fn run_loop(self: Arc<Self>) {
        self.notify(Status::Initialized);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.is_stopped() || attempt > self.config.max_attempts {
                break;
            }
            info!(
                "[session] connection attempt {attempt}/{} to {}",
                self.config.max_attempts,
                self.connector.endpoint()
            );
            match self.run_one_session().await {
                Outcome::Fatal => break,
                Outcome::Ran => {
                    if self.config.no_reconnection {
                        break;
                    }
                    attempt = 0;
                }
                Outcome::Failed => {
                    if self.config.no_reconnection {
                        break;
                    }
                }
            }
            if attempt >= self.config.max_attempts {
                break;
            }
            info!(
                "[session] waiting {:?} before reconnection",
                self.config.reconnect_delay
            );
            let mut stopped = self.stopped_tx.subscribe();
            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = stopped.wait_for(|s| *s) => break,
            }
        }
        self.stop().await;
    }

    async fn run_one_session(&self) -> Outcome {
        let carrier = match self.connector.connect().await {
            Ok(carrier) => carrier,
            Err(ConnectError::NotResolvable(e)) => {
                warn!("[session] endpoint not resolvable: {e}");
                self.notify(Status::EndpointNotResolvable);
                return Outcome::Fatal;
            }
            Err(ConnectError::Unreachable(e)) => {
                warn!("[session] server unreachable: {e}");
                self.notify(Status::ServerUnreachable);
                return Outcome::Failed;
            }
        };

        let carrier = match (self.handshake)(carrier, HandshakeSide::Client).await {
            Ok(carrier) => carrier,
            Err(e) => {
                warn!("[session] carrier handshake failed: {e}");
                self.notify(Status::ServerNotSupported);
                return Outcome::Failed;
            }
        };

        let demux = FiberDemux::fiberize(carrier, self.config.mtu);
        self.notify(Status::Connected);

        let registry = ServiceRegistry::for_config(&self.services_config);
        let manager = ServiceManager::new(Arc::clone(&demux), registry);
        let admin = Admin::client(
            Arc::clone(&manager),
            self.user_services.clone(),
            Arc::clone(&self.on_user_service),
        );
        if let Err(e) = admin.start_client().await {
            warn!("[session] control fiber setup failed: {e}");
            demux.close();
            manager.stop_all().await;
            self.notify(Status::Disconnected);
            return Outcome::Failed;
        }

        *self.active.lock().expect("active session lock") = Some(ActiveSession {
            demux: Arc::clone(&demux),
            manager: Arc::clone(&manager),
            admin,
        });
        self.notify(Status::Running);

        let mut closed = demux.closed();
        let mut stopped = self.stopped_tx.subscribe();
        tokio::select! {
            _ = closed.wait_for(|c| *c) => {}
            _ = stopped.wait_for(|s| *s) => {}
        }

        self.teardown_active().await;
        self.notify(Status::Disconnected);
        if self.is_stopped() {
            Outcome::Fatal
        } else {
            Outcome::Ran
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.connector.endpoint())
            .field("max_attempts", &self.config.max_attempts)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
