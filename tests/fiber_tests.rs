//! Fiber multiplexer integration tests.
//!
//! Two demuxes joined by an in-memory duplex pipe stand in for a real
//! carrier; a handful of tests additionally drive one side of the pipe
//! raw to assert exact on-wire behavior (reset replies, clipping).

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Duration};

use funnel::constants::MAX_MTU;
use funnel::error::Error;
use funnel::fiber::frame::read_frame;
use funnel::fiber::{
    DatagramFiber, FiberDemux, FiberId, FiberListener, Flag, Frame, StreamFiber,
};

const TICK: Duration = Duration::from_secs(5);

fn demux_pair() -> (Arc<FiberDemux>, Arc<FiberDemux>) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (
        FiberDemux::fiberize(Box::new(a), MAX_MTU),
        FiberDemux::fiberize(Box::new(b), MAX_MTU),
    )
}

fn demux_with_raw_peer() -> (Arc<FiberDemux>, DuplexStream) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (FiberDemux::fiberize(Box::new(a), MAX_MTU), b)
}

#[tokio::test]
async fn test_connect_accept_echo() {
    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7001).unwrap();

    let server_task = tokio::spawn(async move {
        let fiber = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = fiber.recv(&mut buf).await.unwrap();
        fiber.send_all(&buf[..n]).await.unwrap();
        // Hold the fiber open until the peer tears it down.
        let _ = fiber.recv(&mut buf).await;
    });

    let fiber = timeout(TICK, StreamFiber::connect(&client, 7001))
        .await
        .unwrap()
        .unwrap();
    assert!(fiber.is_connected());
    assert_eq!(fiber.id().remote_port, 7001);

    timeout(TICK, fiber.send_all(b"ping")).await.unwrap().unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(TICK, fiber.recv(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");

    fiber.close();
    timeout(TICK, server_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_to_non_listening_port_is_refused() {
    let (client, _server) = demux_pair();
    let err = timeout(TICK, StreamFiber::connect(&client, 4242))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err, Error::ConnectionRefused);
}

#[tokio::test]
async fn test_bytes_arrive_in_submission_order() {
    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7002).unwrap();

    let server_task = tokio::spawn(async move {
        let fiber = listener.accept().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        while collected.len() < 26 {
            let n = fiber.recv(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..n]);
        }
        collected
    });

    let fiber = StreamFiber::connect(&client, 7002).await.unwrap();
    for chunk in b"abcdefghijklmnopqrstuvwxyz".chunks(5) {
        fiber.send_all(chunk).await.unwrap();
    }

    let collected = timeout(TICK, server_task).await.unwrap().unwrap();
    assert_eq!(collected, b"abcdefghijklmnopqrstuvwxyz");
}

#[tokio::test]
async fn test_overlapping_reads_fill_in_turn() {
    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7003).unwrap();

    let server_task = tokio::spawn(async move {
        let fiber = Arc::new(listener.accept().await.unwrap());
        let first = {
            let fiber = Arc::clone(&fiber);
            tokio::spawn(async move {
                let mut buf = [0u8; 3];
                let n = fiber.recv(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        // The second read is posted only once the first is queued.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let fiber = Arc::clone(&fiber);
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = fiber.recv(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        (first, second, fiber)
    });

    let fiber = StreamFiber::connect(&client, 7003).await.unwrap();
    let (first, second, server_fiber) = timeout(TICK, server_task).await.unwrap().unwrap();
    fiber.send_all(b"abc").await.unwrap();
    fiber.send_all(b"defgh").await.unwrap();

    assert_eq!(timeout(TICK, first).await.unwrap().unwrap(), b"abc");
    assert_eq!(timeout(TICK, second).await.unwrap().unwrap(), b"defgh");
    drop(server_fiber);
}

#[tokio::test]
async fn test_stream_payload_clipped_to_mtu() {
    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7004).unwrap();

    let server_task = tokio::spawn(async move {
        let fiber = listener.accept().await.unwrap();
        let mut buf = vec![0u8; MAX_MTU as usize + 1024];
        let mut total = 0;
        // One clipped frame carries exactly the MTU.
        while total < MAX_MTU as usize {
            total += fiber.recv(&mut buf).await.unwrap();
        }
        total
    });

    let fiber = StreamFiber::connect(&client, 7004).await.unwrap();
    let oversize = vec![0x42u8; MAX_MTU as usize + 1];
    let mut sent = 0;
    while sent == 0 {
        sent = fiber.send(&oversize).await.unwrap();
    }
    assert_eq!(sent, MAX_MTU as usize);

    assert_eq!(
        timeout(TICK, server_task).await.unwrap().unwrap(),
        MAX_MTU as usize
    );
}

#[tokio::test]
async fn test_oversize_datagram_rejected() {
    let (client, server) = demux_pair();
    let receiver = DatagramFiber::bind(&server, 7005).unwrap();

    let sender = DatagramFiber::unbound(&client);
    let err = sender
        .send_to(&vec![0u8; MAX_MTU as usize + 1], 7005)
        .await
        .unwrap_err();
    assert_eq!(err, Error::MessageTooLong);

    // At the MTU exactly the datagram goes through.
    let mut sent = 0;
    while sent == 0 {
        sent = sender
            .send_to(&vec![0x33u8; MAX_MTU as usize], 7005)
            .await
            .unwrap();
    }
    let mut buf = vec![0u8; MAX_MTU as usize];
    let (n, from) = timeout(TICK, receiver.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, MAX_MTU as usize);
    assert_eq!(from, sender.id().local_port);
}

#[tokio::test]
async fn test_datagram_round_trip_with_sender_port() {
    let (client, server) = demux_pair();
    let receiver = DatagramFiber::bind(&server, 7006).unwrap();

    let sender = DatagramFiber::unbound(&client);
    sender.send_to(b"query", 7006).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = timeout(TICK, receiver.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"query");

    receiver.send_to(b"reply", from).await.unwrap();
    let (n, reply_from) = timeout(TICK, sender.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"reply");
    assert_eq!(reply_from, 7006);
}

#[tokio::test]
async fn test_peer_close_resets_connected_fiber() {
    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7007).unwrap();

    let client_fiber = {
        let connect = StreamFiber::connect(&client, 7007);
        tokio::pin!(connect);
        let accept = listener.accept();
        let (connected, accepted) = tokio::join!(&mut connect, accept);
        let server_fiber = accepted.unwrap();
        let client_fiber = connected.unwrap();

        // Server posts a read, then the client closes.
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            server_fiber.recv(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        client_fiber.close();

        let result = timeout(TICK, read_task).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(Error::ConnectionReset | Error::Interrupted)
        ));
        client_fiber
    };
    // Closing again is a no-op.
    client_fiber.close();
    client_fiber.close();
}

#[tokio::test]
async fn test_push_for_unbound_fiber_draws_one_rst() {
    let (_demux, mut raw) = demux_with_raw_peer();

    let push = Frame::new(FiberId::new(77, 88), Flag::Push, b"stray".to_vec());
    raw.write_all(&push.encode()).await.unwrap();

    let reply = timeout(TICK, read_frame(&mut raw, MAX_MTU))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.header.flag, Flag::Rst);
    // The reset targets the returning id of the stray frame.
    assert_eq!(reply.header.id, FiberId::new(88, 77));
    assert!(reply.payload.is_empty());
}

#[tokio::test]
async fn test_syn_for_non_listening_port_draws_rst() {
    let (_demux, mut raw) = demux_with_raw_peer();

    let syn = Frame::control(FiberId::new(500, 9999), Flag::Syn);
    raw.write_all(&syn.encode()).await.unwrap();

    let reply = timeout(TICK, read_frame(&mut raw, MAX_MTU))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.header.flag, Flag::Rst);
    assert_eq!(reply.header.id, FiberId::new(9999, 500));
}

#[tokio::test]
async fn test_malformed_frame_closes_demux() {
    let (demux, mut raw) = demux_with_raw_peer();

    // Two flag bits set at once is a protocol error.
    let mut bytes = Frame::control(FiberId::new(1, 2), Flag::Syn).encode();
    bytes[9] = 0x03;
    raw.write_all(&bytes).await.unwrap();

    let mut closed = demux.closed();
    timeout(TICK, closed.wait_for(|c| *c)).await.unwrap().unwrap();
    assert!(demux.is_closing());
}

#[tokio::test]
async fn test_demux_close_cancels_pending_connect() {
    let (client, server) = demux_pair();

    let connect = tokio::spawn({
        let client = Arc::clone(&client);
        async move { StreamFiber::connect(&client, 60001).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Drop the server demux entirely: the carrier dies, the client demux
    // closes, the connect resolves with an abort-class error.
    server.close();
    let result = timeout(TICK, connect).await.unwrap().unwrap();
    match result {
        Err(
            Error::ConnectionAborted
            | Error::ConnectionReset
            | Error::ConnectionRefused
            | Error::BrokenPipe,
        ) => {}
        other => panic!("expected abort-class error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_after_close_is_not_connected() {
    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7010).unwrap();

    let accept_task = tokio::spawn(async move { listener.accept().await });
    let fiber = StreamFiber::connect(&client, 7010).await.unwrap();
    let _server_fiber = timeout(TICK, accept_task).await.unwrap().unwrap();

    fiber.close();
    assert_eq!(fiber.send(b"late").await.unwrap_err(), Error::NotConnected);
    let mut buf = [0u8; 8];
    assert_eq!(fiber.recv(&mut buf).await.unwrap_err(), Error::NotConnected);
}

#[tokio::test]
async fn test_accepted_fiber_state_is_connected() {
    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7011).unwrap();

    let accept_task = tokio::spawn(async move { listener.accept().await });
    let client_fiber = StreamFiber::connect(&client, 7011).await.unwrap();
    let server_fiber = timeout(TICK, accept_task).await.unwrap().unwrap().unwrap();

    assert!(server_fiber.is_connected());
    assert_eq!(server_fiber.id().local_port, 7011);
    assert_eq!(
        server_fiber.id().remote_port,
        client_fiber.id().local_port
    );
    drop(client_fiber);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flow_control_thresholds_and_total_delivery() {
    const TOTAL: usize = 70 * 1024 * 1024;
    const CHUNK: usize = 60 * 1024;

    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7012).unwrap();

    let accept_task = tokio::spawn(async move { listener.accept().await });
    let fiber = StreamFiber::connect(&client, 7012).await.unwrap();
    let server_fiber = accept_task.await.unwrap().unwrap();

    // Reader: sleeps long enough for the sender to overrun the high
    // water mark, then drains everything.
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 1024 * 1024];
        // Open the receive window, then stall.
        let mut received = server_fiber.recv(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        while received < TOTAL {
            let n = server_fiber.recv(&mut buf).await.unwrap();
            assert!(buf[..n].iter().all(|&b| b == 0x5a));
            received += n;
        }
        received
    });

    let payload = vec![0x5au8; CHUNK];
    let mut sent = 0usize;
    let mut throttled = 0usize;
    while sent < TOTAL {
        let n = fiber.send(&payload[..CHUNK.min(TOTAL - sent)]).await.unwrap();
        if n == 0 {
            // Zero is the throttle retry hint, never EOF.
            throttled += 1;
        }
        sent += n;
    }

    let received = timeout(Duration::from_secs(60), reader)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, TOTAL);
    assert!(
        throttled > 0,
        "sender never observed a zero-byte completion while the peer was above high water"
    );
}

#[tokio::test]
async fn test_fiber_state_machine_via_facade() {
    let (client, server) = demux_pair();
    let listener = FiberListener::bind(&server, 7013).unwrap();
    let accept_task = tokio::spawn(async move {
        let fiber = listener.accept().await.unwrap();
        let mut buf = [0u8; 8];
        let _ = fiber.recv(&mut buf).await;
        fiber
    });

    let fiber = StreamFiber::connect(&client, 7013).await.unwrap();
    assert!(fiber.is_connected());
    fiber.close();
    assert!(!fiber.is_connected());

    let server_fiber = timeout(TICK, accept_task).await.unwrap().unwrap();
    // Give the reset exchange a moment to finish on the server side.
    for _ in 0..100 {
        if !server_fiber.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!server_fiber.is_connected());
}
