//! Integration tests for lanspeed

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use lanspeed::client::{Client, ClientConfig, ClientEvent, ClientState};
use lanspeed::discover::{self, BroadcastConfig, DiscoveryError, Endpoint};
use lanspeed::protocol::Transport;
use lanspeed::serve::{Server, ServerConfig};
use lanspeed::tcp::{self, TcpConfig};
use lanspeed::udp::{self, UdpConfig};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// Use different discovery ports for each test to avoid conflicts
static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn get_test_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn loopback_broadcast(port: u16) -> BroadcastConfig {
    BroadcastConfig {
        target: SocketAddr::new(LOCALHOST, port),
        interval: Duration::from_millis(50),
    }
}

fn quick_udp() -> UdpConfig {
    UdpConfig {
        idle_window: Duration::from_millis(300),
        ..UdpConfig::default()
    }
}

/// Start a loopback server; keep the returned sender alive to keep it running.
async fn start_test_server(broadcast: Option<BroadcastConfig>) -> (Endpoint, watch::Sender<bool>) {
    let config = ServerConfig {
        bind_ip: LOCALHOST,
        broadcast,
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.unwrap();
    let endpoint = server.endpoint(LOCALHOST);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = server.run(cancel_rx).await;
    });
    (endpoint, cancel_tx)
}

/// A receiver whose sender is already gone, so it never signals
fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn test_stream_transfer_exact_size() {
    let (endpoint, _server) = start_test_server(None).await;

    let record = timeout(
        Duration::from_secs(10),
        tcp::request_stream_transfer(&endpoint, 2048, &TcpConfig::default(), no_cancel()),
    )
    .await
    .expect("transfer should finish")
    .unwrap();

    assert_eq!(record.transport, Transport::Stream);
    assert_eq!(record.bytes, 2048);
    assert!(record.complete);
    assert!(record.duration_secs > 0.0);
    assert!(record.throughput > 0.0);
}

#[tokio::test]
async fn test_stream_transfer_larger_than_buffer() {
    let (endpoint, _server) = start_test_server(None).await;
    let size = 3 * 1024 * 1024 + 17;

    let record = timeout(
        Duration::from_secs(20),
        tcp::request_stream_transfer(&endpoint, size, &TcpConfig::default(), no_cancel()),
    )
    .await
    .expect("transfer should finish")
    .unwrap();

    assert_eq!(record.bytes, size);
    assert!(record.complete);
}

#[tokio::test]
async fn test_datagram_transfer_segments() {
    let (endpoint, _server) = start_test_server(None).await;

    let record = timeout(
        Duration::from_secs(10),
        udp::request_datagram_transfer(&endpoint, 4096, &quick_udp(), no_cancel()),
    )
    .await
    .expect("transfer should finish")
    .unwrap();

    assert_eq!(record.transport, Transport::Datagram);
    assert_eq!(record.total_segments, Some(4));
    // Loopback may still drop under load; what did arrive must be consistent
    let received = record.segments_received.unwrap();
    assert!(received <= 4);
    assert_eq!(record.bytes, received * 1024);
    let loss = record.loss.unwrap();
    assert!((0.0..=1.0).contains(&loss));
}

#[tokio::test]
async fn test_datagram_zero_size_completes_immediately() {
    let (endpoint, _server) = start_test_server(None).await;

    let record = timeout(
        Duration::from_secs(1),
        udp::request_datagram_transfer(&endpoint, 0, &UdpConfig::default(), no_cancel()),
    )
    .await
    .expect("zero-size transfer should not wait for the idle window")
    .unwrap();

    assert_eq!(record.bytes, 0);
    assert!(record.complete);
}

#[tokio::test]
async fn test_datagram_silent_server_ends_after_idle_window() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint {
        ip: LOCALHOST,
        udp_port: silent.local_addr().unwrap().port(),
        tcp_port: 1,
    };

    let record = timeout(
        Duration::from_secs(5),
        udp::request_datagram_transfer(&endpoint, 4096, &quick_udp(), no_cancel()),
    )
    .await
    .expect("idle window should end the transfer")
    .unwrap();

    assert_eq!(record.bytes, 0);
    assert_eq!(record.total_segments, None);
    assert_eq!(record.loss, None);
    assert!(!record.complete);
}

#[tokio::test]
async fn test_invalid_size_token_closes_without_data() {
    let (endpoint, _server) = start_test_server(None).await;

    for token in ["abc\n", "-5\n", "\n"] {
        let mut stream = TcpStream::connect(endpoint.tcp_addr()).await.unwrap();
        stream.write_all(token.as_bytes()).await.unwrap();

        let mut received = Vec::new();
        let result = timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
            .await
            .expect("server should close the connection");
        // A reset is as good as a close here
        if result.is_ok() {
            assert!(received.is_empty(), "no data expected for {:?}", token);
        }
    }
}

#[tokio::test]
async fn test_early_close_yields_partial_record() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut token = [0u8; 16];
        let _ = stream.read(&mut token).await.unwrap();
        stream.write_all(&[0u8; 1000]).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let endpoint = Endpoint {
        ip: LOCALHOST,
        udp_port: 1,
        tcp_port: port,
    };
    let record = timeout(
        Duration::from_secs(5),
        tcp::request_stream_transfer(&endpoint, 2048, &TcpConfig::default(), no_cancel()),
    )
    .await
    .expect("transfer should finish")
    .unwrap();

    assert_eq!(record.bytes, 1000);
    assert!(!record.complete);
}

#[tokio::test]
async fn test_connection_refused_is_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let endpoint = Endpoint {
        ip: LOCALHOST,
        udp_port: 1,
        tcp_port: port,
    };
    let result =
        tcp::request_stream_transfer(&endpoint, 1024, &TcpConfig::default(), no_cancel()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_discover_zero_timeout() {
    let port = get_test_port();
    let result = discover::discover_on(port, Duration::ZERO).await;
    assert!(matches!(result, Err(DiscoveryError::Timeout(_))));
}

#[tokio::test]
async fn test_broadcaster_is_discovered() {
    let port = get_test_port();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let handle = discover::start_broadcaster(loopback_broadcast(port), 4001, 4002, cancel_rx)
        .await
        .unwrap();

    // The same Offer is repeated, so two listeners see the same endpoint
    for _ in 0..2 {
        let endpoint = timeout(Duration::from_secs(5), discover::discover_on(port, Duration::from_secs(3)))
            .await
            .expect("discovery should finish")
            .unwrap();
        assert_eq!(endpoint.ip, LOCALHOST);
        assert_eq!(endpoint.udp_port, 4001);
        assert_eq!(endpoint.tcp_port, 4002);
    }

    cancel_tx.send(true).unwrap();
    let result = timeout(Duration::from_secs(2), handle)
        .await
        .expect("broadcaster should stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_client_round_has_one_record_per_session() {
    let port = get_test_port();
    let (_endpoint, _server) = start_test_server(Some(loopback_broadcast(port))).await;

    let client = Client::new(ClientConfig {
        size: 8192,
        stream_sessions: 2,
        datagram_sessions: 3,
        discovery_port: port,
        discovery_timeout: Duration::from_secs(5),
        rounds: Some(1),
        udp: quick_udp(),
        ..ClientConfig::default()
    });

    let summaries = timeout(Duration::from_secs(20), client.run(None))
        .await
        .expect("round should finish")
        .unwrap();

    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.records.len(), 5);
    assert_eq!(summary.stream.sessions, 2);
    assert_eq!(summary.datagram.sessions, 3);
    assert_eq!(summary.stream.bytes, 2 * 8192);
    assert_eq!(summary.stream.failed, 0);
    assert!(summary.records_for(Transport::Datagram).all(|r| r.total_segments == Some(8)));
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test]
async fn test_client_reports_rounds_without_keeping_them() {
    let port = get_test_port();
    let (_endpoint, _server) = start_test_server(Some(loopback_broadcast(port))).await;

    let client = Client::new(ClientConfig {
        size: 4096,
        stream_sessions: 1,
        datagram_sessions: 1,
        discovery_port: port,
        discovery_timeout: Duration::from_secs(5),
        rounds: Some(2),
        keep_summaries: false,
        udp: quick_udp(),
        ..ClientConfig::default()
    });
    let (tx, mut rx) = mpsc::channel(256);

    let summaries = timeout(Duration::from_secs(30), client.run(Some(tx)))
        .await
        .expect("rounds should finish")
        .unwrap();
    assert!(summaries.is_empty());

    let mut rounds = 0;
    while let Ok(event) = rx.try_recv() {
        if let ClientEvent::Round(summary) = event {
            assert_eq!(summary.records.len(), 2);
            rounds += 1;
        }
    }
    assert_eq!(rounds, 2);
}

#[tokio::test]
async fn test_server_keeps_serving_after_bad_request() {
    let (endpoint, _server) = start_test_server(None).await;

    let mut bad = TcpStream::connect(endpoint.tcp_addr()).await.unwrap();
    bad.write_all(b"not-a-number\n").await.unwrap();
    drop(bad);

    let junk = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    junk.send_to(b"junk", endpoint.udp_addr()).await.unwrap();

    let record = timeout(
        Duration::from_secs(10),
        tcp::request_stream_transfer(&endpoint, 1024, &TcpConfig::default(), no_cancel()),
    )
    .await
    .expect("transfer should finish")
    .unwrap();
    assert_eq!(record.bytes, 1024);
}
