
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{roundtrip, wait_until, EchoBackend, RelayHandle};
use pppxy::{InstanceGroup, ProtocolVersion, ProxyConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn close_stops_pending_accept() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let relay = RelayHandle::spawn("127.0.0.1:0", backend.addr, ProtocolVersion::V2)
        .await
        .unwrap();

    // Let the accept loop park on accept
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(2), relay.instance.close())
        .await
        .expect("close hung")
        .unwrap();

    let served = tokio::time::timeout(Duration::from_secs(2), relay.task)
        .await
        .expect("accept loop did not stop")
        .unwrap();
    assert!(served.is_ok());

    assert!(TcpStream::connect(relay.addr).await.is_err());
    assert!(relay.instance.close().await.is_ok());
}

#[tokio::test]
async fn backend_dial_failure_then_recovery() {
    let temp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = temp_listener.local_addr().unwrap();
    drop(temp_listener);

    let relay = RelayHandle::spawn("127.0.0.1:0", dead_addr, ProtocolVersion::V1)
        .await
        .unwrap();

    // Nothing listens on the backend port: the client is dropped without data
    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
        .await
        .expect("client was not dropped");
    assert!(read.is_err() || buf.is_empty());

    let stats = relay.instance.stats();
    wait_until(|| stats.dial_failures.load(Ordering::Relaxed) == 1).await;

    // Bring the backend up on the same port; the next client gets through
    let backend = EchoBackend::serve(TcpListener::bind(dead_addr).await.unwrap());
    let (_, echoed) = roundtrip(relay.addr, b"recovered").await.unwrap();
    assert_eq!(echoed, b"recovered");
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(stats.dial_failures.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn group_shutdown_leaves_open_connections_running() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.addr.to_string();

    let mut group = InstanceGroup::new(vec![
        ProxyConfig::new("127.0.0.1:0", backend_addr.clone(), ProtocolVersion::V1),
        ProxyConfig::new("127.0.0.1:0", backend_addr, ProtocolVersion::V2),
    ]);
    assert!(group.start().await.is_empty());

    let addrs: Vec<_> = group
        .instances()
        .iter()
        .map(|instance| instance.local_addr().unwrap())
        .collect();

    let mut open = Vec::new();
    for addr in &addrs {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        open.push(stream);
    }

    assert!(group.shutdown().await.is_empty());

    for addr in &addrs {
        assert!(TcpStream::connect(addr).await.is_err());
    }

    for mut stream in open {
        stream.write_all(b"still").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still");
    }

    let headers = backend.wait_for_headers(2).await;
    let mut versions: Vec<_> = headers.iter().map(|h| h.version).collect();
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn group_reports_bind_failure_per_instance() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_addr = taken.local_addr().unwrap().to_string();

    let mut group = InstanceGroup::new(vec![
        ProxyConfig::new("127.0.0.1:0", backend.addr.to_string(), ProtocolVersion::V2),
        ProxyConfig::new(taken_addr.clone(), backend.addr.to_string(), ProtocolVersion::V2),
    ]);

    let failures = group.start().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, taken_addr);

    // The healthy instance still relays
    let healthy = group.instances()[0].local_addr().unwrap();
    let (_, echoed) = roundtrip(healthy, b"ok").await.unwrap();
    assert_eq!(echoed, b"ok");

    assert!(group.shutdown().await.is_empty());
}

#[tokio::test]
async fn dial_failure_leaves_concurrent_connection_running() {
    let backend = EchoBackend::spawn("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.addr;
    let relay = RelayHandle::spawn("127.0.0.1:0", backend_addr, ProtocolVersion::V2)
        .await
        .unwrap();

    let mut held = TcpStream::connect(relay.addr).await.unwrap();
    held.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    held.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one");

    // Stop accepting on the backend; the established echo keeps running
    drop(backend);
    wait_until_refused(backend_addr).await;

    let mut rejected = TcpStream::connect(relay.addr).await.unwrap();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), rejected.read_to_end(&mut rest))
        .await
        .expect("client was not dropped");
    assert!(read.is_err() || rest.is_empty());

    let stats = relay.instance.stats();
    wait_until(|| stats.dial_failures.load(Ordering::Relaxed) == 1).await;

    // The first client was never disturbed
    held.write_all(b"two").await.unwrap();
    held.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");
    wait_until(|| stats.connections_active.load(Ordering::Relaxed) == 1).await;

    held.shutdown().await.unwrap();
    let mut tail = Vec::new();
    held.read_to_end(&mut tail).await.unwrap();
    assert!(tail.is_empty());
}

async fn wait_until_refused(addr: std::net::SocketAddr) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backend listener still accepting");
}
