
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use harness::{roundtrip, EchoBackend, RelayHandle};
use pppxy::ProtocolVersion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn v1_header_precedes_client_bytes() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let relay = RelayHandle::spawn("127.0.0.1:0", backend.addr, ProtocolVersion::V1)
        .await
        .unwrap();

    let (client_addr, echoed) = roundtrip(relay.addr, b"abc").await.unwrap();
    assert_eq!(echoed, b"abc");

    let headers = backend.wait_for_headers(1).await;
    let expected = format!(
        "PROXY TCP4 127.0.0.1 127.0.0.1 {} {}\r\n",
        client_addr.port(),
        relay.addr.port()
    );
    assert_eq!(headers[0].raw, expected.as_bytes());
    assert_eq!(headers[0].src_addr, Some(client_addr));
    assert_eq!(headers[0].dst_addr, Some(relay.addr));
}

#[tokio::test]
async fn v2_header_describes_client_and_relay() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let relay = RelayHandle::spawn("127.0.0.1:0", backend.addr, ProtocolVersion::V2)
        .await
        .unwrap();

    let (client_addr, echoed) = roundtrip(relay.addr, b"hello").await.unwrap();
    assert_eq!(echoed, b"hello");

    let headers = backend.wait_for_headers(1).await;
    let header = &headers[0];
    assert_eq!(header.version, 2);
    assert_eq!(header.raw.len(), 28);
    assert_eq!(header.raw[12], 0x21);
    assert_eq!(header.raw[13], 0x11);
    assert_eq!(header.src_addr, Some(client_addr));
    assert_eq!(header.dst_addr, Some(relay.addr));
}

#[tokio::test]
async fn v2_header_over_ipv6() {
    let Ok(backend) = EchoBackend::spawn("[::1]:0").await else {
        // No IPv6 loopback on this host
        return;
    };
    let relay = RelayHandle::spawn("[::1]:0", backend.addr, ProtocolVersion::V2)
        .await
        .unwrap();

    let (client_addr, _) = roundtrip(relay.addr, b"v6").await.unwrap();

    let headers = backend.wait_for_headers(1).await;
    assert_eq!(headers[0].raw.len(), 52);
    assert_eq!(headers[0].raw[13], 0x21);
    assert_eq!(headers[0].src_addr, Some(client_addr));
    assert_eq!(headers[0].dst_addr, Some(relay.addr));
}

#[tokio::test]
async fn large_payload_relayed_both_ways() {
    const SIZE: usize = 1 << 20;

    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let relay = RelayHandle::spawn("127.0.0.1:0", backend.addr, ProtocolVersion::V2)
        .await
        .unwrap();

    let payload: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    let stream = TcpStream::connect(relay.addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let sent = payload.clone();
    let writer_task = tokio::spawn(async move {
        writer.write_all(&sent).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let mut received = Vec::with_capacity(SIZE);
    tokio::time::timeout(Duration::from_secs(10), reader.read_to_end(&mut received))
        .await
        .expect("relay stalled")
        .unwrap();
    writer_task.await.unwrap();

    assert_eq!(received.len(), SIZE);
    assert!(received == payload);

    let stats = relay.instance.stats();
    harness::wait_until(|| {
        stats
            .bytes_from_backend
            .load(std::sync::atomic::Ordering::Relaxed)
            == SIZE as u64
    })
    .await;
    assert_eq!(
        stats
            .bytes_to_backend
            .load(std::sync::atomic::Ordering::Relaxed),
        SIZE as u64
    );
}

#[tokio::test]
async fn client_half_close_keeps_return_path_open() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let relay = RelayHandle::spawn("127.0.0.1:0", backend.addr, ProtocolVersion::V1)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream.write_all(b"first").await.unwrap();

    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"first");

    stream.write_all(b"last").await.unwrap();
    stream.shutdown().await.unwrap();

    // The backend only sees EOF after our half-close, then echoes and closes
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("backend side never closed")
        .unwrap();
    assert_eq!(rest, b"last");
}

#[tokio::test]
async fn each_connection_gets_its_own_header() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let relay = RelayHandle::spawn("127.0.0.1:0", backend.addr, ProtocolVersion::V1)
        .await
        .unwrap();

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let (client_addr, echoed) = roundtrip(relay.addr, &[i; 4]).await.unwrap();
        assert_eq!(echoed, [i; 4]);
        clients.push(client_addr);
    }

    let headers = backend.wait_for_headers(3).await;
    assert_eq!(backend.connection_count(), 3);
    for client_addr in clients {
        assert!(headers.iter().any(|h| h.src_addr == Some(client_addr)));
    }
}

#[tokio::test]
async fn port_only_listen_accepts_both_families() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let relay = RelayHandle::spawn(":0", backend.addr, ProtocolVersion::V1)
        .await
        .unwrap();
    if relay.addr.is_ipv4() {
        // No IPv6 on this host; bound the IPv4 wildcard instead
        return;
    }

    let port = relay.addr.port();
    let v6_target = SocketAddr::from((Ipv6Addr::LOCALHOST, port));
    let (v6_client, echoed) = roundtrip(v6_target, b"six").await.unwrap();
    assert_eq!(echoed, b"six");
    let headers = backend.wait_for_headers(1).await;
    assert_eq!(headers[0].src_addr, Some(v6_client));
    assert_eq!(headers[0].dst_addr, Some(v6_target));
    assert!(headers[0].raw.starts_with(b"PROXY TCP6 ::1 ::1 "));

    // IPv4 clients arrive as mapped addresses and are reported as TCP4
    let v4_target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let (v4_client, echoed) = roundtrip(v4_target, b"four").await.unwrap();
    assert_eq!(echoed, b"four");
    let headers = backend.wait_for_headers(2).await;
    assert_eq!(headers[1].src_addr, Some(v4_client));
    assert_eq!(headers[1].dst_addr, Some(v4_target));
    assert!(headers[1].raw.starts_with(b"PROXY TCP4 127.0.0.1 127.0.0.1 "));
}
