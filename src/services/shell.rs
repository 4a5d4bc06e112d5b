//! Process/shell microservice (factory id 10).
//!
//! Accepts fibers on `local_port` and attaches each one to a freshly
//! spawned process (configured binary and arguments, `/bin/sh` by
//! default): fiber bytes feed stdin, stdout and stderr feed the fiber.
//! Disabled unless `shell.enable` is set; spawn parameters come from
//! the configuration, never from the peer.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::admin::command::{CreateServiceRequest, Parameters};
use crate::config::ShellConfig;
use crate::error::{Error, Result};
use crate::fiber::{FiberDemux, FiberListener, FiberPort, StreamFiber};
use crate::services::{
    require_port_param, run_sessions_abort, Microservice, ServiceConstructor, SHELL_FACTORY_ID,
};

/// Shell server over accepted fibers.
pub struct ShellServer {
    demux: Arc<FiberDemux>,
    local_port: FiberPort,
    shell: ShellConfig,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ShellServer {
    /// Build from a parameter bag: `{ local_port }`.
    pub fn from_params(
        demux: &Arc<FiberDemux>,
        params: Parameters,
        shell: ShellConfig,
    ) -> Result<Arc<Self>> {
        let local_port = require_port_param(&params, "local_port")?;
        Ok(Arc::new(Self {
            demux: Arc::clone(demux),
            local_port,
            shell,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    /// The create request a user-service adapter sends for this service.
    pub fn create_request(local_port: FiberPort) -> CreateServiceRequest {
        CreateServiceRequest::new(SHELL_FACTORY_ID)
            .with_param("local_port", local_port.to_string())
    }
}

/// Registry constructor closing over the configured spawn parameters.
pub fn constructor(shell: ShellConfig) -> ServiceConstructor {
    Box::new(move |demux, params| {
        Ok(ShellServer::from_params(demux, params, shell.clone())? as Arc<dyn Microservice>)
    })
}

#[async_trait]
impl Microservice for ShellServer {
    fn service_type_id(&self) -> u32 {
        SHELL_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let listener = FiberListener::bind(&self.demux, self.local_port)?;
        info!(
            "[microservice:shell] serving {} on fiber port {}",
            self.shell.path, self.local_port
        );
        let shell = self.shell.clone();
        let tasks = Arc::clone(&self.tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let fiber = match listener.accept().await {
                    Ok(fiber) => fiber,
                    Err(e) => {
                        debug!("[microservice:shell] accept ended: {e}");
                        break;
                    }
                };
                let shell = shell.clone();
                let session = tokio::spawn(async move {
                    if let Err(e) = run_shell_session(fiber, &shell).await {
                        warn!("[microservice:shell] session failed: {e}");
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
        debug!("[microservice:shell] stopped");
    }
}

impl std::fmt::Debug for ShellServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellServer")
            .field("local_port", &self.local_port)
            .field("path", &self.shell.path)
            .finish()
    }
}

async fn run_shell_session(fiber: StreamFiber, shell: &ShellConfig) -> Result<()> {
    let mut child = Command::new(&shell.path)
        .args(&shell.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            warn!("[microservice:shell] cannot spawn {}: {e}", shell.path);
            Error::ServiceNotStarted
        })?;
    debug!("[microservice:shell] spawned {}", shell.path);

    let mut stdin = child.stdin.take().ok_or(Error::ServiceNotStarted)?;
    let mut stdout = child.stdout.take().ok_or(Error::ServiceNotStarted)?;
    let mut stderr = child.stderr.take().ok_or(Error::ServiceNotStarted)?;
    let fiber = Arc::new(fiber);

    let fiber_to_stdin = {
        let fiber = Arc::clone(&fiber);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match fiber.recv(&mut buf).await {
                    Ok(n) => {
                        if stdin.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = stdin.shutdown().await;
        })
    };

    let stdout_to_fiber = {
        let fiber = Arc::clone(&fiber);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if fiber.send_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let stderr_to_fiber = {
        let fiber = Arc::clone(&fiber);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if fiber.send_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let status = child.wait().await.map_err(|_| Error::Interrupted)?;
    debug!("[microservice:shell] process exited with {status}");
    let _ = tokio::join!(stdout_to_fiber, stderr_to_fiber);
    fiber_to_stdin.abort();
    fiber.close();
    Ok(())
}
