//! End-to-end proxy tests over real loopback sockets.
//!
//! Each test spins up the bridge with an OS-chosen listening port, plays
//! the analyzer and/or LIS role over raw `tokio::net::TcpStream`s, and
//! asserts on the exact frames each peer observes.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mllp_bridge::{hl7, Bridge, Hl7Settings, MllpCodec, Mode, ProxyDirection};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn oru(control_id: &str) -> Bytes {
    Bytes::from(format!(
        "MSH|^~\\&|ANA|F1|LIS|F2|20240101 00:00:00||ORU^R01|{control_id}|P|2.3.1\rPID|1\r"
    ))
}

fn proxy_settings(client_port: u16, direction: ProxyDirection) -> Hl7Settings {
    Hl7Settings {
        port: 0,
        client_host: "127.0.0.1".to_string(),
        client_port,
        mode: Mode::Proxy,
        proxy_direction: direction,
        ..Hl7Settings::default()
    }
}

type MllpStream = Framed<TcpStream, MllpCodec>;

async fn connect_framed(addr: std::net::SocketAddr) -> MllpStream {
    let stream = timeout(WAIT, TcpStream::connect(addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    Framed::new(stream, MllpCodec::new())
}

async fn accept_framed(listener: &TcpListener) -> MllpStream {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed");
    Framed::new(stream, MllpCodec::new())
}

async fn recv_frame(transport: &mut MllpStream) -> Bytes {
    timeout(WAIT, transport.next())
        .await
        .expect("frame timed out")
        .expect("stream ended")
        .expect("decode failed")
}

/// Asserts that nothing arrives on the transport for a little while.
async fn expect_silence(transport: &mut MllpStream) {
    match timeout(Duration::from_millis(400), transport.next()).await {
        Err(_) => {}
        Ok(None) => panic!("stream closed unexpectedly"),
        Ok(Some(frame)) => panic!("unexpected frame: {:?}", frame),
    }
}

/// Reads one raw MLLP frame byte-by-byte, trailer included.
async fn read_raw_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        timeout(WAIT, stream.read_exact(&mut byte))
            .await
            .expect("raw read timed out")
            .expect("raw read failed");
        buf.push(byte[0]);
        if buf.len() >= 2 && buf[buf.len() - 2..] == [0x1C, 0x0D] {
            return buf;
        }
    }
}

// ---------------------------------------------------------------------------
// Default direction (analyzer listens-in, LIS dialed out)
// ---------------------------------------------------------------------------

/// Happy path: the analyzer gets a well-formed local ACK as the very next
/// bytes on its stream, and the LIS receives the original record re-framed.
#[tokio::test]
async fn forwards_and_acks_locally() {
    let lis_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lis_port = lis_listener.local_addr().unwrap().port();

    let bridge = Bridge::spawn(proxy_settings(lis_port, ProxyDirection::ListenerToClient))
        .await
        .unwrap();
    let mut lis = accept_framed(&lis_listener).await;

    let mut analyzer = TcpStream::connect(bridge.local_addr()).await.unwrap();
    let mut framed = Vec::new();
    framed.push(0x0B);
    framed.extend_from_slice(&oru("123"));
    framed.extend_from_slice(&[0x1C, 0x0D]);
    analyzer.write_all(&framed).await.unwrap();

    // the ACK is the next thing on the analyzer's wire, MLLP-framed
    let raw_ack = read_raw_frame(&mut analyzer).await;
    assert_eq!(raw_ack[0], 0x0B);
    let ack = &raw_ack[1..raw_ack.len() - 2];
    assert_eq!(hl7::message_type(ack).as_deref(), Some("ACK^R01"));
    assert_eq!(hl7::control_id(ack), "123");
    let text = std::str::from_utf8(ack).unwrap();
    assert!(text.starts_with("MSH|^~\\&|LIS|F2|ANA|F1|"));
    assert!(text.contains("\rMSA|AA|123\r"));

    // the LIS sees the original payload, untouched
    assert_eq!(recv_frame(&mut lis).await, oru("123"));

    bridge.shutdown().await;
}

/// LIS outage: records are ACKed to the analyzer immediately, buffered,
/// and replayed in FIFO order once the LIS link comes back. The proxy
/// never writes ACKs to the LIS.
#[tokio::test]
async fn buffers_fifo_across_lis_outage() {
    // reserve a port for the LIS, then leave it dark for now
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lis_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let bridge = Bridge::spawn(proxy_settings(lis_addr.port(), ProxyDirection::ListenerToClient))
        .await
        .unwrap();

    let mut analyzer = connect_framed(bridge.local_addr()).await;
    for id in ["1", "2", "3"] {
        analyzer.send(oru(id)).await.unwrap();
        let ack = recv_frame(&mut analyzer).await;
        assert_eq!(hl7::control_id(&ack), id);
    }

    // LIS comes up; the dial loop finds it within its retry delay
    let lis_listener = TcpListener::bind(lis_addr).await.unwrap();
    let mut lis = accept_framed(&lis_listener).await;
    for id in ["1", "2", "3"] {
        let frame = recv_frame(&mut lis).await;
        assert_eq!(frame, oru(id), "replay out of order");
    }
    expect_silence(&mut lis).await;

    bridge.shutdown().await;
}

/// An ACK arriving from the LIS is consumed by the proxy; nothing derived
/// from it reaches the analyzer.
#[tokio::test]
async fn acks_from_peer_are_not_forwarded() {
    let lis_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lis_port = lis_listener.local_addr().unwrap().port();

    let bridge = Bridge::spawn(proxy_settings(lis_port, ProxyDirection::ListenerToClient))
        .await
        .unwrap();
    let mut lis = accept_framed(&lis_listener).await;
    let mut analyzer = connect_framed(bridge.local_addr()).await;

    let lis_ack =
        Bytes::from_static(b"MSH|^~\\&|LIS|F2|ANA|F1|ts||ACK^R01|55|P|2.3.1\rMSA|AA|55\r");
    lis.send(lis_ack).await.unwrap();
    // a real application record sent afterwards must be the first thing
    // the analyzer sees
    lis.send(oru("77")).await.unwrap();

    let first = recv_frame(&mut analyzer).await;
    assert_eq!(hl7::control_id(&first), "77");
    assert_eq!(hl7::message_type(&first).as_deref(), Some("ORU^R01"));

    // and the LIS gets a local ACK for its application record
    let ack = recv_frame(&mut lis).await;
    assert_eq!(hl7::message_type(&ack).as_deref(), Some("ACK^R01"));
    assert_eq!(hl7::control_id(&ack), "77");

    bridge.shutdown().await;
}

/// Garbage between records does not break framing; both records cross.
#[tokio::test]
async fn resyncs_after_garbage() {
    let lis_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lis_port = lis_listener.local_addr().unwrap().port();

    let bridge = Bridge::spawn(proxy_settings(lis_port, ProxyDirection::ListenerToClient))
        .await
        .unwrap();
    let mut lis = accept_framed(&lis_listener).await;

    let mut analyzer = TcpStream::connect(bridge.local_addr()).await.unwrap();
    let mut wire = vec![0xFF, 0xFF];
    wire.push(0x0B);
    wire.extend_from_slice(&oru("A"));
    wire.extend_from_slice(&[0x1C, 0x0D]);
    wire.push(0x00);
    wire.push(0x0B);
    wire.extend_from_slice(&oru("B"));
    wire.extend_from_slice(&[0x1C, 0x0D]);
    analyzer.write_all(&wire).await.unwrap();

    assert_eq!(recv_frame(&mut lis).await, oru("A"));
    assert_eq!(recv_frame(&mut lis).await, oru("B"));

    bridge.shutdown().await;
}

/// Starting and immediately stopping the proxy leaves no open sockets.
#[tokio::test]
async fn shutdown_releases_the_listening_port() {
    let bridge = Bridge::spawn(proxy_settings(1, ProxyDirection::ListenerToClient))
        .await
        .unwrap();
    let addr = bridge.local_addr();
    bridge.shutdown().await;

    assert!(
        TcpStream::connect(addr).await.is_err(),
        "listening socket still accepting after shutdown"
    );
}

// ---------------------------------------------------------------------------
// Reversed direction (LIS listens-in, analyzer dialed out)
// ---------------------------------------------------------------------------

/// With the LIS down, analyzer records are buffered and the analyzer hears
/// nothing. Once the LIS connects, the record is delivered first and only
/// then is the analyzer acknowledged.
#[tokio::test]
async fn reversed_direction_acks_only_after_delivery() {
    // we play the analyzer: the proxy dials us
    let analyzer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let analyzer_port = analyzer_listener.local_addr().unwrap().port();

    let bridge = Bridge::spawn(proxy_settings(analyzer_port, ProxyDirection::ClientToListener))
        .await
        .unwrap();
    let mut analyzer = accept_framed(&analyzer_listener).await;

    analyzer.send(oru("C")).await.unwrap();
    expect_silence(&mut analyzer).await; // no ACK while the LIS is down

    let mut lis = connect_framed(bridge.local_addr()).await;
    assert_eq!(recv_frame(&mut lis).await, oru("C"));

    let ack = recv_frame(&mut analyzer).await;
    assert_eq!(hl7::message_type(&ack).as_deref(), Some("ACK^R01"));
    assert_eq!(hl7::control_id(&ack), "C");

    bridge.shutdown().await;
}

/// With both links up in the reversed direction, the dialed analyzer is
/// still acknowledged (after the forward), and the listening LIS is
/// acknowledged on receipt.
#[tokio::test]
async fn reversed_direction_with_both_links_up() {
    let analyzer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let analyzer_port = analyzer_listener.local_addr().unwrap().port();

    let bridge = Bridge::spawn(proxy_settings(analyzer_port, ProxyDirection::ClientToListener))
        .await
        .unwrap();
    let mut analyzer = accept_framed(&analyzer_listener).await;
    let mut lis = connect_framed(bridge.local_addr()).await;

    analyzer.send(oru("D")).await.unwrap();
    assert_eq!(recv_frame(&mut lis).await, oru("D"));
    let ack = recv_frame(&mut analyzer).await;
    assert_eq!(hl7::control_id(&ack), "D");

    // LIS-originated traffic is ACKed on receipt and forwarded
    lis.send(oru("E")).await.unwrap();
    let lis_ack = recv_frame(&mut lis).await;
    assert_eq!(hl7::message_type(&lis_ack).as_deref(), Some("ACK^R01"));
    assert_eq!(hl7::control_id(&lis_ack), "E");
    assert_eq!(recv_frame(&mut analyzer).await, oru("E"));

    bridge.shutdown().await;
}
