//! Control-protocol and forwarding integration tests.
//!
//! A client and a server demux joined by an in-memory duplex carrier,
//! each with its own registry, manager, and admin, the same wiring a
//! real session performs after the carrier handshake.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use funnel::admin::command::CreateServiceRequest;
use funnel::admin::Admin;
use funnel::config::ServicesConfig;
use funnel::constants::{FIBER_TO_FILE_PORT, MAX_MTU};
use funnel::error::{Error, Result};
use funnel::fiber::{FiberDemux, StreamFiber};
use funnel::services::copy::FiberToFile;
use funnel::services::shell::ShellServer;
use funnel::services::socks::SocksServer;
use funnel::services::{ServiceManager, ServiceRegistry};
use funnel::user_services::{DatagramForward, FileCopy, Socks, StreamForward, UserService};

const TICK: Duration = Duration::from_secs(10);

struct Linked {
    client_demux: Arc<FiberDemux>,
    client_admin: Arc<Admin>,
    client_manager: Arc<ServiceManager>,
    server_manager: Arc<ServiceManager>,
    status_rx: mpsc::UnboundedReceiver<(String, Result<()>)>,
}

async fn link(user_services: Vec<Arc<dyn UserService>>) -> Linked {
    link_with_config(user_services, ServicesConfig::default()).await
}

async fn link_with_config(
    user_services: Vec<Arc<dyn UserService>>,
    config: ServicesConfig,
) -> Linked {
    let (a, b) = tokio::io::duplex(1 << 20);
    let client_demux = FiberDemux::fiberize(Box::new(a), MAX_MTU);
    let server_demux = FiberDemux::fiberize(Box::new(b), MAX_MTU);

    let client_manager = ServiceManager::new(
        Arc::clone(&client_demux),
        ServiceRegistry::for_config(&config),
    );
    let server_manager = ServiceManager::new(
        Arc::clone(&server_demux),
        ServiceRegistry::for_config(&config),
    );

    let server_admin = Admin::server(Arc::clone(&server_manager));
    server_admin.start_server().unwrap();

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let client_admin = Admin::client(
        Arc::clone(&client_manager),
        user_services,
        Arc::new(move |name, result| {
            let _ = status_tx.send((name.to_owned(), result));
        }),
    );
    timeout(TICK, client_admin.start_client())
        .await
        .unwrap()
        .unwrap();

    Linked {
        client_demux,
        client_admin,
        client_manager,
        server_manager,
        status_rx,
    }
}

async fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// TCP server answering every connection with an uppercased echo.
async fn spawn_upper_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let upper: Vec<u8> =
                                buf[..n].iter().map(u8::to_ascii_uppercase).collect();
                            if socket.write_all(&upper).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn test_create_then_stop_remote_service() {
    let linked = link(Vec::new()).await;

    let status = timeout(
        TICK,
        linked
            .client_admin
            .create_remote_service(SocksServer::create_request(21080)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.error_code, 0);
    assert!(status.id > 0);
    assert_eq!(linked.server_manager.running_count(), 1);
    assert_eq!(
        linked.client_admin.remote_services().get(&status.id).unwrap().service_id,
        2
    );

    let reply = timeout(
        TICK,
        linked.client_admin.stop_remote_service(status.id),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.error_code, Error::Interrupted.wire_code());
    assert_eq!(linked.server_manager.running_count(), 0);
    assert!(linked.client_admin.remote_services().is_empty());
}

#[tokio::test]
async fn test_create_unknown_service_reports_not_found() {
    let linked = link(Vec::new()).await;
    let status = timeout(
        TICK,
        linked
            .client_admin
            .create_remote_service(CreateServiceRequest::new(999)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.id, 0);
    assert_eq!(status.error_code, Error::ServiceNotFound.wire_code());
    assert_eq!(linked.server_manager.running_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_forward_end_to_end() {
    let destination_port = spawn_upper_echo().await;
    let listen_port = free_tcp_port().await;

    let forward = StreamForward::parse(&format!(
        "127.0.0.1:{listen_port}:127.0.0.1:{destination_port}"
    ))
    .unwrap();
    let mut linked = link(vec![forward as Arc<dyn UserService>]).await;

    let (name, result) = timeout(TICK, linked.status_rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "tcp-forward");
    result.unwrap();
    assert_eq!(linked.client_manager.running_count(), 1);
    assert_eq!(linked.server_manager.running_count(), 1);

    // Application traffic through the funnel.
    let mut socket = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    socket.write_all(b"get / http/1.0\r\n\r\n").await.unwrap();
    let mut reply = vec![0u8; 64];
    let n = timeout(TICK, socket.read(&mut reply)).await.unwrap().unwrap();
    assert!(n > 0);
    assert!(reply[..n].starts_with(b"GET / HTTP/1.0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_datagram_forward_end_to_end() {
    // UDP echo destination.
    let destination = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let destination_port = destination.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = destination.recv_from(&mut buf).await {
            let _ = destination.send_to(&buf[..n], peer).await;
        }
    });

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listen_port = {
        let throwaway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        throwaway.local_addr().unwrap().port()
    };

    let forward = DatagramForward::parse(&format!(
        "127.0.0.1:{listen_port}:127.0.0.1:{destination_port}"
    ))
    .unwrap();
    let mut linked = link(vec![forward as Arc<dyn UserService>]).await;

    let (name, result) = timeout(TICK, linked.status_rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "udp-forward");
    result.unwrap();

    probe
        .send_to(b"dns query", ("127.0.0.1", listen_port))
        .await
        .unwrap();
    let mut buf = [0u8; 2048];
    let (n, _) = timeout(TICK, probe.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"dns query");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_socks_proxy_end_to_end() {
    let destination_port = spawn_upper_echo().await;
    let listen_port = free_tcp_port().await;

    let socks = Socks::parse(&format!("127.0.0.1:{listen_port}")).unwrap();
    let mut linked = link(vec![socks as Arc<dyn UserService>]).await;

    let (name, result) = timeout(TICK, linked.status_rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "socks");
    result.unwrap();

    let mut socket = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    // SOCKS5 greeting: version 5, one method, NO AUTH.
    socket.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    socket.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    // CONNECT 127.0.0.1:destination_port.
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&destination_port.to_be_bytes());
    socket.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    timeout(TICK, socket.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00, "socks reply should grant the connect");

    // Bytes flow both ways through the proxied connection.
    socket.write_all(b"proxied").await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(TICK, socket.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"PROXIED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_copy_fetches_remote_file() {
    let dir = tempfile::tempdir().unwrap();
    let remote_path = dir.path().join("served.txt");
    let local_path = dir.path().join("fetched.txt");
    tokio::fs::write(&remote_path, b"carried across the funnel")
        .await
        .unwrap();

    let mut config = ServicesConfig::default();
    config.file_copy.enable = true;

    let copy = FileCopy::new(
        remote_path.to_str().unwrap(),
        local_path.to_str().unwrap(),
    );
    let mut linked = link_with_config(vec![copy as Arc<dyn UserService>], config).await;

    let (name, result) = timeout(TICK, linked.status_rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "file-copy");
    result.unwrap();

    // The enquirer stores the file in the background; poll for it.
    let mut contents = Vec::new();
    for _ in 0..200 {
        if let Ok(read) = tokio::fs::read(&local_path).await {
            if read == b"carried across the funnel" {
                contents = read;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(contents, b"carried across the funnel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_push_file_into_fiber_to_file_service() {
    let dir = tempfile::tempdir().unwrap();
    let stored_path = dir.path().join("stored.bin");

    let mut config = ServicesConfig::default();
    config.file_copy.enable = true;
    let linked = link_with_config(Vec::new(), config).await;

    // Start the receiving half on the server through the control fiber.
    let status = timeout(
        TICK,
        linked
            .client_admin
            .create_remote_service(FiberToFile::create_request()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.error_code, 0);

    // Push one transfer: length-prefixed path, contents, close.
    let fiber = StreamFiber::connect(&linked.client_demux, FIBER_TO_FILE_PORT)
        .await
        .unwrap();
    let path_bytes = stored_path.to_str().unwrap().as_bytes();
    let mut transfer = Vec::new();
    transfer.extend_from_slice(&(path_bytes.len() as u32).to_le_bytes());
    transfer.extend_from_slice(path_bytes);
    transfer.extend_from_slice(b"pushed payload");
    fiber.send_all(&transfer).await.unwrap();
    fiber.close();

    let mut contents = Vec::new();
    for _ in 0..200 {
        if let Ok(read) = tokio::fs::read(&stored_path).await {
            if read == b"pushed payload" {
                contents = read;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(contents, b"pushed payload");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shell_service_runs_commands() {
    let mut config = ServicesConfig::default();
    config.shell.enable = true;
    let linked = link_with_config(Vec::new(), config).await;

    let status = timeout(
        TICK,
        linked
            .client_admin
            .create_remote_service(ShellServer::create_request(29000)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.error_code, 0);

    let fiber = StreamFiber::connect(&linked.client_demux, 29000)
        .await
        .unwrap();
    fiber.send_all(b"echo funneled\nexit\n").await.unwrap();

    let mut output = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match timeout(TICK, fiber.recv(&mut buf)).await.unwrap() {
            Ok(n) => {
                output.extend_from_slice(&buf[..n]);
                if output.windows(8).any(|w| w == b"funneled") {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    assert!(output.windows(8).any(|w| w == b"funneled"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_remote_create_rolls_adapter_back() {
    // The destination port parameter is fine, but the local listen port
    // collides with an already-bound socket, so the local half fails
    // after the remote side started.
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let blocked_port = blocker.local_addr().unwrap().port();

    let forward = StreamForward::parse(&format!(
        "127.0.0.1:{blocked_port}:127.0.0.1:1"
    ))
    .unwrap();
    let mut linked = link(vec![forward as Arc<dyn UserService>]).await;

    let (name, result) = timeout(TICK, linked.status_rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "tcp-forward");
    assert_eq!(result.unwrap_err(), Error::OperationCanceled);

    // The remote half was stopped again during rollback.
    for _ in 0..100 {
        if linked.server_manager.running_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(linked.server_manager.running_count(), 0);
    assert_eq!(linked.client_manager.running_count(), 0);
}
