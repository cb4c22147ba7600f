//! End-to-end conformance scenarios across the three transports.
//!
//! Every test runs a real hub against raw transport clients so the bytes on
//! the wire are exactly what a foreign peer would see.

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use tether_core::{
    Error, EventPayload, EventType, Flags, Hub, Limits, Message, Options, Protocol, Reply, State,
    HEAD_SIZE,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn options(heartbeat: u32) -> Options {
    Options {
        heartbeat,
        ..Options::default()
    }
}

fn client_protocol() -> Protocol {
    Protocol::new(Limits::default(), false)
}

fn build_frame(
    protocol: &Protocol,
    flags: Flags,
    index: u32,
    path: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut msg = Message::new();
    msg.marshal_bytes(tether_core::MAGIC_PATH_JSON, flags, index, path, body, protocol)
        .expect("marshal");
    let mut wire = Vec::new();
    msg.to_bytes(&mut wire, true, protocol).expect("serialize");
    wire
}

async fn read_frame(stream: &mut TcpStream, protocol: &Protocol) -> Message {
    let mut head = [0u8; HEAD_SIZE];
    stream.read_exact(&mut head).await.expect("read head");
    let mut msg = Message::new();
    msg.parse_head(&head, protocol).expect("parse head");
    msg.read_body(stream, protocol).await.expect("read body");
    msg
}

#[tokio::test]
async fn tcp_ping_gets_a_correlated_ack() {
    init_tracing();
    let hub = Hub::new(options(0));
    hub.registry().register("/ping", |_ctx| Reply::json(&"pong"));
    let addr = hub.listen("tcp://127.0.0.1:0").await.expect("listen");

    let protocol = client_protocol();
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = build_frame(&protocol, Flags::NEED_ACK, 7, "/ping", b"\"hi\"");
    stream.write_all(&request).await.expect("send");

    let reply = read_frame(&mut stream, &protocol).await;
    assert!(reply.flags().contains(Flags::IS_ACK));
    assert_eq!(reply.index(), 7);
    let (path, _) = reply.path(&protocol).expect("path");
    assert_eq!(path, "/ping");
    let body: String = reply.unmarshal(&protocol).expect("body");
    assert_eq!(body, "pong");

    hub.stop().await;
}

#[tokio::test]
async fn echo_replies_arrive_in_request_order() {
    init_tracing();
    let hub = Hub::new(options(0));
    hub.registry()
        .register("/echo", |ctx| Some(Reply::Bytes(ctx.body().ok()?.to_vec())));
    let addr = hub.listen("tcp://127.0.0.1:0").await.expect("listen");

    let protocol = client_protocol();
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    for index in 1u32..=3 {
        let body = format!("\"msg-{index}\"");
        let frame = build_frame(&protocol, Flags::NEED_ACK, index, "/echo", body.as_bytes());
        stream.write_all(&frame).await.expect("send");
    }
    for index in 1u32..=3 {
        let reply = read_frame(&mut stream, &protocol).await;
        assert_eq!(reply.index(), index, "replies must preserve send order");
        let body: String = reply.unmarshal(&protocol).expect("body");
        assert_eq!(body, format!("msg-{index}"));
    }

    hub.stop().await;
}

#[tokio::test]
async fn zero_index_requests_get_no_automatic_ack() {
    init_tracing();
    let hub = Hub::new(options(0));
    hub.registry().register("/ping", |_ctx| Reply::json(&"pong"));
    let addr = hub.listen("tcp://127.0.0.1:0").await.expect("listen");

    let protocol = client_protocol();
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = build_frame(&protocol, Flags::NEED_ACK, 0, "/ping", b"\"hi\"");
    stream.write_all(&request).await.expect("send");

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await;
    assert!(read.is_err(), "uncorrelated requests must not be acked");

    hub.stop().await;
}

#[tokio::test]
async fn unknown_magic_requests_receive_no_ack() {
    init_tracing();
    let hub = Hub::new(options(0));
    hub.registry().register("/ping", |_ctx| Reply::json(&"pong"));
    let addr = hub.listen("tcp://127.0.0.1:0").await.expect("listen");

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    // Unregistered magic byte: the server must reject the head and degrade
    // only this socket, without crashing.
    let mut garbage = vec![0x55u8, 0, 0, 0, 0, 4, 0, 0, 0, 1];
    garbage.extend_from_slice(b"\"x\"x");
    stream.write_all(&garbage).await.expect("send");

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    // Either the server closed on us (Ok(0)) or nothing arrives.
    if let Ok(Ok(n)) = read {
        assert_eq!(n, 0, "no reply bytes expected for an illegal head");
    }

    hub.stop().await;
}

#[tokio::test]
async fn oversized_bodies_compress_on_the_wire_and_survive() {
    init_tracing();
    let mut hub_options = options(0);
    hub_options.protocol = Arc::new(Protocol::new(
        Limits {
            auto_compress_size: 64,
            ..Limits::default()
        },
        true,
    ));
    let hub = Hub::new(hub_options);
    hub.registry()
        .register("/echo", |ctx| Some(Reply::Bytes(ctx.body().ok()?.to_vec())));
    let addr = hub.listen("tcp://127.0.0.1:0").await.expect("listen");

    let protocol = Protocol::new(
        Limits {
            auto_compress_size: 64,
            ..Limits::default()
        },
        false,
    );
    let payload = vec![42u8; 1024];
    let frame = build_frame(&protocol, Flags::NEED_ACK, 5, "/echo", &payload);
    // Our own request is compressed on the wire.
    assert!(Flags::from_bits_truncate(frame[1]).contains(Flags::COMPRESSED));
    assert!(frame.len() < HEAD_SIZE + payload.len());

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(&frame).await.expect("send");

    // Peek the raw reply head: the peer must also have compressed.
    let mut head = [0u8; HEAD_SIZE];
    stream.read_exact(&mut head).await.expect("read head");
    assert!(
        Flags::from_bits_truncate(head[1]).contains(Flags::COMPRESSED),
        "reply must carry the compressed flag on the wire"
    );
    let mut reply = Message::new();
    reply.parse_head(&head, &protocol).expect("parse head");
    reply.read_body(&mut stream, &protocol).await.expect("read body");
    assert!(!reply.flags().contains(Flags::COMPRESSED));
    assert_eq!(reply.body(&protocol).expect("body"), payload.as_slice());

    hub.stop().await;
}

#[tokio::test]
async fn idle_sockets_disconnect_within_one_sweep_of_the_deadline() {
    init_tracing();
    let mut hub_options = options(1);
    hub_options.socket_connect_time = 3;
    let hub = Hub::new(hub_options);
    let (disconnected_tx, disconnected_rx) = std_mpsc::channel();
    hub.on(EventType::Disconnect, move |_socket, _| {
        let _ = disconnected_tx.send(Instant::now());
        true
    });
    let addr = hub.listen("tcp://127.0.0.1:0").await.expect("listen");

    let started = Instant::now();
    let stream = TcpStream::connect(addr).await.expect("connect");
    // Stay idle; the sweep must kill the server-side socket at t=4±1.
    let deadline = Instant::now() + Duration::from_secs(8);
    let fired = tokio::task::spawn_blocking(move || {
        disconnected_rx.recv_timeout(deadline - Instant::now())
    })
    .await
    .expect("join")
    .expect("disconnect event");
    let elapsed = fired - started;
    assert!(
        elapsed >= Duration::from_secs(3) && elapsed <= Duration::from_secs(6),
        "disconnect after {elapsed:?}, expected about 4s"
    );
    drop(stream);
    hub.stop().await;
}

#[tokio::test]
async fn dialing_a_closed_port_retries_then_fails() {
    init_tracing();
    // Grab a port and close it again so the dial target refuses.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
        probe.local_addr().expect("probe addr").port()
    };
    let mut hub_options = options(0);
    hub_options.client_reconnect_max = 3;
    hub_options.client_reconnect_time = 100;
    let hub = Hub::new(hub_options);

    let started = Instant::now();
    let result = hub.connect(&format!("tcp://127.0.0.1:{port}")).await;
    let elapsed = started.elapsed();
    match result {
        Err(Error::DialFailed { attempts, .. }) => assert_eq!(attempts, 3),
        Err(other) => panic!("expected DialFailed, got {other}"),
        Ok(_) => panic!("dial unexpectedly succeeded"),
    }
    assert!(
        elapsed >= Duration::from_millis(200),
        "three attempts must be paced, got {elapsed:?}"
    );
}

#[tokio::test]
async fn udp_peers_get_distinct_sockets_and_both_receive_broadcasts() {
    init_tracing();
    let hub = Hub::new(options(0));
    let (connected_tx, connected_rx) = std_mpsc::channel();
    hub.on(EventType::Connected, move |socket, _| {
        let _ = connected_tx.send(socket.id());
        true
    });
    let addr = hub.listen("udp://127.0.0.1:0").await.expect("listen");

    let protocol = client_protocol();
    let hello = build_frame(&protocol, Flags::empty(), 0, "/hello", b"\"one\"");
    let peer_a = UdpSocket::bind("127.0.0.1:0").await.expect("bind a");
    let peer_b = UdpSocket::bind("127.0.0.1:0").await.expect("bind b");
    peer_a.send_to(&hello, addr).await.expect("send a");
    peer_b.send_to(&hello, addr).await.expect("send b");

    let first = connected_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("first connect");
    let second = connected_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("second connect");
    assert_ne!(first, second, "each udp peer gets its own socket id");

    let delivered = hub.broadcast("/news", &"flash", |_| true).await;
    assert_eq!(delivered, 2);

    for peer in [&peer_a, &peer_b] {
        let mut buf = vec![0u8; 65535];
        let received = tokio::time::timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .expect("broadcast timeout")
            .expect("recv");
        let mut msg = Message::new();
        msg.reset(&buf[..received], &protocol).expect("reset");
        assert!(msg.flags().contains(Flags::BROADCAST));
        let (path, _) = msg.path(&protocol).expect("path");
        assert_eq!(path, "/news");
        let body: String = msg.unmarshal(&protocol).expect("body");
        assert_eq!(body, "flash");
    }

    hub.stop().await;
}

#[tokio::test]
async fn websocket_binary_frames_round_trip() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsFrame;

    init_tracing();
    let hub = Hub::new(options(0));
    hub.registry().register("/ping", |_ctx| Reply::json(&"pong"));
    let addr = hub.listen("ws://127.0.0.1:0").await.expect("listen");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("upgrade");
    let protocol = client_protocol();
    let frame = build_frame(&protocol, Flags::NEED_ACK, 9, "/ping", b"\"hi\"");
    ws.send(WsFrame::binary(frame)).await.expect("send");

    let reply = loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("reply timeout")
            .expect("stream open")
            .expect("frame");
        match frame {
            WsFrame::Binary(payload) => break payload,
            WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    };
    let mut msg = Message::new();
    msg.reset(&reply, &protocol).expect("reset");
    assert!(msg.flags().contains(Flags::IS_ACK));
    assert_eq!(msg.index(), 9);
    let body: String = msg.unmarshal(&protocol).expect("body");
    assert_eq!(body, "pong");

    hub.stop().await;
}

#[tokio::test]
async fn wss_without_a_tls_acceptor_is_a_config_error() {
    init_tracing();
    let hub = Hub::new(options(0));
    assert!(matches!(
        hub.listen("wss://127.0.0.1:0").await,
        Err(Error::TlsRequired)
    ));
}

#[tokio::test]
async fn full_write_channel_blocks_until_the_peer_drains() {
    init_tracing();
    // A server that accepts but reads nothing until told to.
    let server = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = server.local_addr().expect("addr");
    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.expect("accept");
        let _ = drain_rx.await;
        let mut sink = vec![0u8; 64 * 1024];
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    });

    let mut hub_options = options(0);
    hub_options.write_chan_size = 1;
    let hub = Hub::new(hub_options);
    let socket = hub.connect(&format!("tcp://{addr}")).await.expect("connect");
    let protocol = hub.protocol().clone();

    let payload = vec![7u8; 512 * 1024];
    let build = |protocol: &Protocol| {
        let mut msg = protocol.acquire();
        msg.marshal_bytes(
            tether_core::MAGIC_PATH_JSON,
            Flags::empty(),
            0,
            "/bulk",
            &payload,
            protocol,
        )
        .expect("marshal");
        msg
    };
    // Enough pending bytes to exhaust the kernel buffers and the channel.
    for _ in 0..16 {
        let _ = socket.write_async(build(&protocol));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let blocked = tokio::time::timeout(
        Duration::from_millis(500),
        socket.write(build(&protocol)),
    )
    .await;
    assert!(
        blocked.is_err(),
        "write must block while the channel is full"
    );

    drain_tx.send(()).expect("signal drain");
    let unblocked = tokio::time::timeout(
        Duration::from_secs(10),
        socket.write(build(&protocol)),
    )
    .await;
    assert!(
        unblocked.is_ok(),
        "write must unblock once the write task drains"
    );

    hub.stop().await;
}

#[tokio::test]
async fn client_sockets_redial_after_a_server_side_disconnect() {
    init_tracing();
    // Server kills idle sockets fast; every kill should trigger exactly one
    // client redial that re-enters Connected with the same socket id.
    let mut server_options = options(1);
    server_options.socket_connect_time = 1;
    let server = Hub::new(server_options);
    let (connected_tx, connected_rx) = std_mpsc::channel();
    server.on(EventType::Connected, move |socket, _| {
        let _ = connected_tx.send(socket.id());
        true
    });
    let addr = server.listen("tcp://127.0.0.1:0").await.expect("listen");

    let client = Hub::new(options(0));
    let socket = client
        .connect(&format!("tcp://{addr}"))
        .await
        .expect("connect");
    let client_id = socket.id();

    let first = connected_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("initial accept");
    let second = connected_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("redial accept");
    assert_ne!(first, second, "the redial produces a fresh server socket");

    // Give the client a moment to finish re-entering Connected.
    let mut state = socket.state();
    for _ in 0..50 {
        if state == State::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        state = socket.state();
    }
    assert_eq!(state, State::Connected);
    assert!(
        client.get(client_id).is_some(),
        "the client socket keeps its id across the redial"
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn second_login_replaces_the_first_socket() {
    init_tracing();
    let hub = Hub::new(options(0));
    let (events_tx, events_rx) = std_mpsc::channel();
    {
        let events_tx = events_tx.clone();
        hub.on(EventType::Replaced, move |socket, payload| {
            let ip = match payload {
                Some(EventPayload::Address(ip)) => ip.to_string(),
                _ => String::new(),
            };
            let _ = events_tx.send(("replaced", socket.id(), ip));
            true
        });
    }
    {
        let events_tx = events_tx.clone();
        hub.on(EventType::Reconnected, move |socket, _| {
            let _ = events_tx.send(("reconnected", socket.id(), String::new()));
            true
        });
    }
    let (connected_tx, connected_rx) = std_mpsc::channel();
    hub.on(EventType::Connected, move |socket, _| {
        let _ = connected_tx.send(socket.id());
        true
    });
    let addr = hub.listen("tcp://127.0.0.1:0").await.expect("listen");

    let _first_conn = TcpStream::connect(addr).await.expect("first connect");
    let _second_conn = TcpStream::connect(addr).await.expect("second connect");
    let first_id = connected_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("first");
    let second_id = connected_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("second");
    let first = hub.get(first_id).expect("first socket");
    let second = hub.get(second_id).expect("second socket");

    let session = hub.sessions().verify("user-1", &first, None);
    assert!(first.verified());
    assert_eq!(session.socket().map(|s| s.id()), Some(first_id));

    hub.sessions().verify("user-1", &second, None);
    let (kind, id, _ip) = events_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("replaced event");
    assert_eq!((kind, id), ("replaced", first_id));
    let (kind, id, _) = events_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("reconnected event");
    assert_eq!((kind, id), ("reconnected", second_id));

    // The replaced socket lost its data (no logout path) and is closing.
    assert!(!first.verified());
    assert_eq!(first.state(), State::Closing);
    assert!(second.verified());
    assert_eq!(
        hub.sessions().get("user-1").and_then(|s| s.socket()).map(|s| s.id()),
        Some(second_id)
    );

    hub.stop().await;
}
