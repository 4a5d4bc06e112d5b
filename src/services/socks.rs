//! SOCKS server microservice (factory id 2).
//!
//! Accepts fibers on `local_port` and speaks SOCKS toward each one:
//! SOCKS5 (RFC 1928, NO AUTH, CONNECT, IPv4/domain/IPv6 addresses) and
//! SOCKS4 (CONNECT with a literal IPv4 address). On a granted request
//! the service opens the outbound TCP connection itself and relays
//! bytes both ways. The remote half of a `-D` proxy and the local half
//! of a `-F` reverse proxy are both instances of this service.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::admin::command::{CreateServiceRequest, Parameters};
use crate::error::{Error, Result};
use crate::fiber::{FiberDemux, FiberListener, FiberPort, FiberReader, StreamFiber};
use crate::services::link::run_stream_link;
use crate::services::{
    require_port_param, run_sessions_abort, Microservice, ServiceConstructor, SOCKS_FACTORY_ID,
};

const SOCKS4_VERSION: u8 = 4;
const SOCKS5_VERSION: u8 = 5;
const COMMAND_CONNECT: u8 = 1;

const V5_METHOD_NO_AUTH: u8 = 0x00;
const V5_METHOD_UNACCEPTABLE: u8 = 0xff;
const V5_ATYP_IPV4: u8 = 0x01;
const V5_ATYP_DOMAIN: u8 = 0x03;
const V5_ATYP_IPV6: u8 = 0x04;

const V5_REPLY_SUCCEEDED: u8 = 0x00;
const V5_REPLY_FAILURE: u8 = 0x01;
const V5_REPLY_REFUSED: u8 = 0x05;
const V5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const V5_REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const V4_REPLY_GRANTED: u8 = 0x5a;
const V4_REPLY_REJECTED: u8 = 0x5b;

/// SOCKS4/5 server over accepted fibers.
pub struct SocksServer {
    demux: Arc<FiberDemux>,
    local_port: FiberPort,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SocksServer {
    /// Build from a parameter bag: `{ local_port }`.
    pub fn from_params(demux: &Arc<FiberDemux>, params: Parameters) -> Result<Arc<Self>> {
        let local_port = require_port_param(&params, "local_port")?;
        Ok(Arc::new(Self {
            demux: Arc::clone(demux),
            local_port,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    /// The create request a user-service adapter sends for this service.
    pub fn create_request(local_port: FiberPort) -> CreateServiceRequest {
        CreateServiceRequest::new(SOCKS_FACTORY_ID)
            .with_param("local_port", local_port.to_string())
    }
}

/// Registry constructor.
pub fn constructor() -> ServiceConstructor {
    Box::new(|demux, params| Ok(SocksServer::from_params(demux, params)? as Arc<dyn Microservice>))
}

#[async_trait]
impl Microservice for SocksServer {
    fn service_type_id(&self) -> u32 {
        SOCKS_FACTORY_ID
    }

    async fn start(&self) -> Result<()> {
        let listener = FiberListener::bind(&self.demux, self.local_port).map_err(|e| {
            warn!(
                "[microservice:socks] cannot listen on fiber port {}: {e}",
                self.local_port
            );
            e
        })?;
        info!("[microservice:socks] serving on fiber port {}", self.local_port);

        let tasks = Arc::clone(&self.tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let fiber = match listener.accept().await {
                    Ok(fiber) => fiber,
                    Err(e) => {
                        debug!("[microservice:socks] accept ended: {e}");
                        break;
                    }
                };
                let session = tokio::spawn(async move {
                    if let Err(e) = run_session(fiber).await {
                        debug!("[microservice:socks] session failed: {e}");
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
        debug!("[microservice:socks] stopped");
    }
}

impl std::fmt::Debug for SocksServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocksServer")
            .field("local_port", &self.local_port)
            .finish()
    }
}

async fn run_session(fiber: StreamFiber) -> Result<()> {
    let fiber = Arc::new(fiber);
    let mut reader = FiberReader::new(Arc::clone(&fiber));
    match reader.read_u8().await? {
        SOCKS5_VERSION => run_v5_session(reader).await,
        SOCKS4_VERSION => run_v4_session(reader).await,
        other => {
            fiber.close();
            Err(Error::ProtocolError(format!("unsupported socks version {other}")))
        }
    }
}

async fn run_v5_session(mut reader: FiberReader) -> Result<()> {
    // Method negotiation; only NO AUTH is acceptable (peers are already
    // authenticated by the carrier).
    let nmethods = reader.read_u8().await? as usize;
    let methods = reader.read_exact(nmethods).await?;
    let fiber = Arc::clone(reader.fiber());
    if !methods.contains(&V5_METHOD_NO_AUTH) {
        fiber
            .send_all(&[SOCKS5_VERSION, V5_METHOD_UNACCEPTABLE])
            .await?;
        fiber.close();
        return Err(Error::ProtocolError("no acceptable socks method".into()));
    }
    fiber.send_all(&[SOCKS5_VERSION, V5_METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT.
    let head = reader.read_exact(4).await?;
    let (version, command, atyp) = (head[0], head[1], head[3]);
    if version != SOCKS5_VERSION {
        fiber.close();
        return Err(Error::ProtocolError("bad socks5 request version".into()));
    }
    let target = match atyp {
        V5_ATYP_IPV4 => {
            let addr = reader.read_exact(4).await?;
            Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).to_string()
        }
        V5_ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let name = reader.read_exact(len).await?;
            String::from_utf8(name)
                .map_err(|_| Error::ProtocolError("bad socks5 domain name".into()))?
        }
        V5_ATYP_IPV6 => {
            let addr = reader.read_exact(16).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr);
            Ipv6Addr::from(octets).to_string()
        }
        _ => {
            send_v5_reply(&fiber, V5_REPLY_ADDRESS_NOT_SUPPORTED).await?;
            fiber.close();
            return Err(Error::ProtocolError("bad socks5 address type".into()));
        }
    };
    let port_bytes = reader.read_exact(2).await?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    if command != COMMAND_CONNECT {
        send_v5_reply(&fiber, V5_REPLY_COMMAND_NOT_SUPPORTED).await?;
        fiber.close();
        return Err(Error::ProtocolError("socks5 command not supported".into()));
    }

    debug!("[microservice:socks] v5 connect {target}:{port}");
    match TcpStream::connect((target.as_str(), port)).await {
        Ok(socket) => {
            send_v5_reply(&fiber, V5_REPLY_SUCCEEDED).await?;
            drop(fiber);
            relay(reader, socket).await;
            Ok(())
        }
        Err(e) => {
            let reply = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => V5_REPLY_REFUSED,
                _ => V5_REPLY_FAILURE,
            };
            send_v5_reply(&fiber, reply).await?;
            fiber.close();
            Ok(())
        }
    }
}

async fn send_v5_reply(fiber: &Arc<StreamFiber>, code: u8) -> Result<()> {
    // BND fields are zeroed: the bound endpoint is a fiber, not a socket.
    let reply = [
        SOCKS5_VERSION,
        code,
        0x00,
        V5_ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    fiber.send_all(&reply).await
}

async fn run_v4_session(mut reader: FiberReader) -> Result<()> {
    let head = reader.read_exact(7).await?;
    let command = head[0];
    let port = u16::from_be_bytes([head[1], head[2]]);
    let ip = Ipv4Addr::new(head[3], head[4], head[5], head[6]);
    // Null-terminated user id, ignored.
    while reader.read_u8().await? != 0 {}

    let fiber = Arc::clone(reader.fiber());
    let mut reply = [0u8; 8];
    reply[2..4].copy_from_slice(&port.to_be_bytes());
    reply[4..8].copy_from_slice(&ip.octets());

    if command != COMMAND_CONNECT {
        reply[1] = V4_REPLY_REJECTED;
        fiber.send_all(&reply).await?;
        fiber.close();
        return Err(Error::ProtocolError("socks4 command not supported".into()));
    }

    debug!("[microservice:socks] v4 connect {ip}:{port}");
    match TcpStream::connect((ip, port)).await {
        Ok(socket) => {
            reply[1] = V4_REPLY_GRANTED;
            fiber.send_all(&reply).await?;
            drop(fiber);
            relay(reader, socket).await;
            Ok(())
        }
        Err(_) => {
            reply[1] = V4_REPLY_REJECTED;
            fiber.send_all(&reply).await?;
            fiber.close();
            Ok(())
        }
    }
}

async fn relay(reader: FiberReader, mut socket: TcpStream) {
    use tokio::io::AsyncWriteExt;

    let (fiber, residual) = reader.into_parts();
    // Bytes pipelined behind the handshake belong to the destination.
    if !residual.is_empty() && socket.write_all(&residual).await.is_err() {
        fiber.close();
        return;
    }
    run_stream_link(fiber, socket).await;
}
