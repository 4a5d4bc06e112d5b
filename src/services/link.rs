//! Bidirectional relay between a stream fiber and a TCP socket.
//!
//! One session task per forwarded connection: a reader half pumping
//! fiber payloads into the socket and a writer half pumping socket
//! bytes back into the fiber. Either side ending tears the pair down;
//! closing the fiber resets the peer half, closing the socket write
//! half signals EOF to the local application.

use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::fiber::StreamFiber;

/// Relay until either side closes. Consumes both halves.
pub(crate) async fn run_stream_link(fiber: Arc<StreamFiber>, socket: TcpStream) {
    let id = fiber.id();
    let chunk = fiber.demux().mtu() as usize;
    let (mut tcp_read, mut tcp_write) = socket.into_split();

    let fiber_to_tcp = {
        let fiber = Arc::clone(&fiber);
        async move {
            let mut buf = vec![0u8; chunk];
            loop {
                match fiber.recv(&mut buf).await {
                    Ok(n) => {
                        if tcp_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("[link] fiber {id} read ended: {e}");
                        break;
                    }
                }
            }
            let _ = tcp_write.shutdown().await;
        }
    };

    let tcp_to_fiber = {
        let fiber = Arc::clone(&fiber);
        async move {
            let mut buf = vec![0u8; chunk];
            loop {
                match tcp_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if fiber.send_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            fiber.close();
        }
    };

    tokio::join!(fiber_to_tcp, tcp_to_fiber);
    debug!("[link] session {id} finished");
}
