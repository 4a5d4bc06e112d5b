//! File-copy microservices (factory ids 7–9).
//!
//! Three cooperating halves on well-known fiber ports in the reserved
//! band:
//!
//! - **fiber → file** (id 7) listens on [`FIBER_TO_FILE_PORT`]; each
//!   fiber carries one transfer: a length-prefixed destination path
//!   followed by the file contents, terminated by the fiber closing.
//! - **file → fiber** (id 8) listens on [`FILE_TO_FIBER_PORT`]; each
//!   fiber carries one request: a length-prefixed source path, answered
//!   with the file contents and a close.
//! - **file enquirer** (id 9) is the one-shot requesting side: it
//!   connects to the peer's file-to-fiber port and stores the received
//!   contents locally.
//!
//! The whole family is disabled unless `file_copy.enable` is set.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::admin::command::{CreateServiceRequest, Parameters};
use crate::constants::{FIBER_TO_FILE_PORT, FILE_TO_FIBER_PORT};
use crate::error::{Error, Result};
use crate::fiber::{FiberDemux, FiberListener, FiberReader, StreamFiber};
use crate::services::{
    require_param, run_sessions_abort, Microservice, ServiceConstructor, FIBER_TO_FILE_FACTORY_ID,
    FILE_ENQUIRER_FACTORY_ID, FILE_TO_FIBER_FACTORY_ID,
};

/// Longest path accepted in a transfer header.
const MAX_PATH_LEN: u32 = 4096;

async fn read_path(reader: &mut FiberReader) -> Result<String> {
    let len = reader.read_u32_le().await?;
    if len > MAX_PATH_LEN {
        return Err(Error::ProtocolError("file path too long".into()));
    }
    let bytes = reader.read_exact(len as usize).await?;
    String::from_utf8(bytes).map_err(|_| Error::ProtocolError("file path not utf-8".into()))
}

fn encode_path(path: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + path.len());
    buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf
}

// ----------------------------------------------------------------------
// fiber -> file (7)
// ----------------------------------------------------------------------

/// Receives files pushed by the peer and writes them to disk.
pub struct FiberToFile {
    demux: Arc<FiberDemux>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FiberToFile {
    fn new(demux: &Arc<FiberDemux>) -> Arc<Self> {
        Arc::new(Self {
            demux: Arc::clone(demux),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The create request a user-service adapter sends for this service.
    pub fn create_request() -> CreateServiceRequest {
        CreateServiceRequest::new(FIBER_TO_FILE_FACTORY_ID)
    }
}

/// Registry constructor for the fiber-to-file half.
pub fn fiber_to_file_constructor() -> ServiceConstructor {
    Box::new(|demux, _params| Ok(FiberToFile::new(demux) as Arc<dyn Microservice>))
}

#[async_trait]
impl Microservice for FiberToFile {
    fn service_type_id(&self) -> u32 {
        FIBER_TO_FILE_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let listener = FiberListener::bind(&self.demux, FIBER_TO_FILE_PORT)?;
        info!("[microservice:fiber_to_file] listening on fiber port {FIBER_TO_FILE_PORT}");
        let tasks = Arc::clone(&self.tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let fiber = match listener.accept().await {
                    Ok(fiber) => fiber,
                    Err(e) => {
                        debug!("[microservice:fiber_to_file] accept ended: {e}");
                        break;
                    }
                };
                let session = tokio::spawn(async move {
                    if let Err(e) = receive_file(fiber).await {
                        warn!("[microservice:fiber_to_file] transfer failed: {e}");
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
        debug!("[microservice:fiber_to_file] stopped");
    }
}

impl std::fmt::Debug for FiberToFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberToFile").finish()
    }
}

async fn receive_file(fiber: StreamFiber) -> Result<()> {
    let fiber = Arc::new(fiber);
    let mut reader = FiberReader::new(Arc::clone(&fiber));
    let path = read_path(&mut reader).await?;
    debug!("[microservice:fiber_to_file] receiving into {path}");

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|_| Error::ServiceNotStarted)?;
    let (fiber, residual) = reader.into_parts();
    if !residual.is_empty() {
        file.write_all(&residual)
            .await
            .map_err(|_| Error::Interrupted)?;
    }
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match fiber.recv(&mut buf).await {
            Ok(n) => file
                .write_all(&buf[..n])
                .await
                .map_err(|_| Error::Interrupted)?,
            // The sender closing the fiber marks end of file.
            Err(Error::ConnectionReset | Error::Interrupted | Error::ConnectionAborted) => break,
            Err(e) => return Err(e),
        }
    }
    file.flush().await.map_err(|_| Error::Interrupted)?;
    debug!("[microservice:fiber_to_file] stored {path}");
    Ok(())
}

// ----------------------------------------------------------------------
// file -> fiber (8)
// ----------------------------------------------------------------------

/// Serves file contents requested by the peer.
pub struct FileToFiber {
    demux: Arc<FiberDemux>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FileToFiber {
    fn new(demux: &Arc<FiberDemux>) -> Arc<Self> {
        Arc::new(Self {
            demux: Arc::clone(demux),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The create request a user-service adapter sends for this service.
    pub fn create_request() -> CreateServiceRequest {
        CreateServiceRequest::new(FILE_TO_FIBER_FACTORY_ID)
    }
}

/// Registry constructor for the file-to-fiber half.
pub fn file_to_fiber_constructor() -> ServiceConstructor {
    Box::new(|demux, _params| Ok(FileToFiber::new(demux) as Arc<dyn Microservice>))
}

#[async_trait]
impl Microservice for FileToFiber {
    fn service_type_id(&self) -> u32 {
        FILE_TO_FIBER_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let listener = FiberListener::bind(&self.demux, FILE_TO_FIBER_PORT)?;
        info!("[microservice:file_to_fiber] listening on fiber port {FILE_TO_FIBER_PORT}");
        let tasks = Arc::clone(&self.tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let fiber = match listener.accept().await {
                    Ok(fiber) => fiber,
                    Err(e) => {
                        debug!("[microservice:file_to_fiber] accept ended: {e}");
                        break;
                    }
                };
                let session = tokio::spawn(async move {
                    if let Err(e) = serve_file(fiber).await {
                        warn!("[microservice:file_to_fiber] transfer failed: {e}");
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
        debug!("[microservice:file_to_fiber] stopped");
    }
}

impl std::fmt::Debug for FileToFiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileToFiber").finish()
    }
}

async fn serve_file(fiber: StreamFiber) -> Result<()> {
    let fiber = Arc::new(fiber);
    let mut reader = FiberReader::new(Arc::clone(&fiber));
    let path = read_path(&mut reader).await?;
    debug!("[microservice:file_to_fiber] serving {path}");

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| Error::ServiceNotStarted)?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|_| Error::Interrupted)?;
        if n == 0 {
            break;
        }
        fiber.send_all(&buf[..n]).await?;
    }
    fiber.close();
    Ok(())
}

// ----------------------------------------------------------------------
// file enquirer (9)
// ----------------------------------------------------------------------

/// One-shot requester: pulls `remote_path` from the peer's
/// file-to-fiber service into `local_path`.
pub struct FileEnquirer {
    demux: Arc<FiberDemux>,
    remote_path: String,
    local_path: String,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FileEnquirer {
    /// Build from a parameter bag: `{ remote_path, local_path }`.
    pub fn from_params(demux: &Arc<FiberDemux>, params: Parameters) -> Result<Arc<Self>> {
        let remote_path = require_param(&params, "remote_path")?.to_owned();
        let local_path = require_param(&params, "local_path")?.to_owned();
        Ok(Arc::new(Self {
            demux: Arc::clone(demux),
            remote_path,
            local_path,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    /// The create request for an enquiry.
    pub fn create_request(remote_path: &str, local_path: &str) -> CreateServiceRequest {
        CreateServiceRequest::new(FILE_ENQUIRER_FACTORY_ID)
            .with_param("remote_path", remote_path)
            .with_param("local_path", local_path)
    }
}

/// Registry constructor for the enquirer.
pub fn file_enquirer_constructor() -> ServiceConstructor {
    Box::new(|demux, params| Ok(FileEnquirer::from_params(demux, params)? as Arc<dyn Microservice>))
}

#[async_trait]
impl Microservice for FileEnquirer {
    fn service_type_id(&self) -> u32 {
        FILE_ENQUIRER_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let demux = Arc::clone(&self.demux);
        let remote_path = self.remote_path.clone();
        let local_path = self.local_path.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = fetch_file(&demux, &remote_path, &local_path).await {
                warn!("[microservice:file_enquirer] fetch of {remote_path} failed: {e}");
            }
        });
        self.tasks.lock().expect("session tasks lock").push(task);
        Ok(())
    }

    async fn stop(&self) {
        run_sessions_abort(&self.tasks);
        debug!("[microservice:file_enquirer] stopped");
    }
}

impl std::fmt::Debug for FileEnquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEnquirer")
            .field("remote_path", &self.remote_path)
            .field("local_path", &self.local_path)
            .finish()
    }
}

async fn fetch_file(demux: &Arc<FiberDemux>, remote_path: &str, local_path: &str) -> Result<()> {
    let fiber = Arc::new(StreamFiber::connect(demux, FILE_TO_FIBER_PORT).await?);
    fiber.send_all(&encode_path(remote_path)).await?;

    let mut file = tokio::fs::File::create(local_path)
        .await
        .map_err(|_| Error::ServiceNotStarted)?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match fiber.recv(&mut buf).await {
            Ok(n) => file
                .write_all(&buf[..n])
                .await
                .map_err(|_| Error::Interrupted)?,
            Err(Error::ConnectionReset | Error::Interrupted | Error::ConnectionAborted) => break,
            Err(e) => return Err(e),
        }
    }
    file.flush().await.map_err(|_| Error::Interrupted)?;
    info!("[microservice:file_enquirer] stored {remote_path} as {local_path}");
    Ok(())
}
