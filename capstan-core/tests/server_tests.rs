//! End-to-end tests for the socket server over real TCP connections.

use bytes::Bytes;
use capstan_core::{Connect, Listener, SocketServer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn wait_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Poll until `predicate` holds or the timeout elapses.
async fn wait_for(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        wait_ms(5).await;
    }
    predicate()
}

#[tokio::test]
async fn test_accept_and_echo() {
    let server = SocketServer::new();
    let acceptor = server.listen("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    server.when_accepted().subscribe(|conn: Arc<Connect>| async move {
        let writer = conn.transport().clone();
        conn.transport().incoming().subscribe(move |data: Bytes| {
            let writer = writer.clone();
            async move { writer.write(data).await }
        });
        Ok(())
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| server.connections_count() == 1, Duration::from_secs(1)).await);
    // Let the accepted pipeline finish wiring the echo stage.
    wait_ms(50).await;
    client.write_all(b"PING").await.unwrap();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");
    assert_eq!(server.connections_count(), 1);

    let conn = server.connections().pop().unwrap();
    assert!(conn.peer_name().starts_with("127.0.0.1:"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_ceiling_with_pending_backlog() {
    let server = SocketServer::new();
    server.set_max_connections(3);
    let acceptor = server.listen("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let sock1 = TcpStream::connect(addr).await.unwrap();
    let sock2 = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| server.connections_count() == 2, Duration::from_secs(1)).await);
    assert!(server.is_listening());

    let sock3 = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| server.connections_count() == 3, Duration::from_secs(1)).await);
    assert!(!server.is_listening());

    // A fourth connect succeeds at the TCP level (kernel backlog) but is
    // never admitted while the ceiling holds.
    let sock4 = TcpStream::connect(addr).await.unwrap();
    wait_ms(100).await;
    assert_eq!(server.connections_count(), 3);

    // One disconnect frees a berth; the pending connection is admitted and
    // the registry settles back at the ceiling with accepts disabled again.
    drop(sock1);
    wait_ms(150).await;
    assert_eq!(server.connections_count(), 3);
    assert!(!server.is_listening());

    // A fifth connect waits in the backlog until the ceiling is raised.
    let sock5 = TcpStream::connect(addr).await.unwrap();
    wait_ms(100).await;
    assert_eq!(server.connections_count(), 3);

    server.set_max_connections(4);
    assert!(wait_for(|| server.connections_count() == 4, Duration::from_secs(1)).await);

    server.shutdown().await;
    drop((sock2, sock3, sock4, sock5));
}

#[tokio::test]
async fn test_idle_and_request_timeout_interplay() {
    let server = SocketServer::new();
    server.set_idle_timeout(0.1);
    server.set_request_timeout(0.2);
    assert_eq!(server.idle_timeout(), 0.1);
    assert_eq!(server.request_timeout(), 0.2);

    let acceptor = server.listen("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let events: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        server.when_idle_timeout().subscribe(move |_conn| {
            let events = events.clone();
            async move {
                events.lock().push(("idle", Instant::now()));
                Ok(())
            }
        });
    }
    {
        let events = events.clone();
        server.when_request_timeout().subscribe(move |_conn| {
            let events = events.clone();
            async move {
                events.lock().push(("request", Instant::now()));
                Ok(())
            }
        });
    }

    // External timer driving the expiry sweep.
    let driver = tokio::spawn({
        let server = server.clone();
        async move {
            loop {
                wait_ms(10).await;
                let _ = server.inspect().await;
            }
        }
    });

    let tolerance = Duration::from_millis(100);

    // Idle timeout fires ~0.1s after accept.
    let accepted_at = Instant::now();
    let _client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| events.lock().len() >= 1, Duration::from_secs(1)).await);
    {
        let events = events.lock();
        let (kind, at) = events[0];
        assert_eq!(kind, "idle");
        let elapsed = at - accepted_at;
        assert!(elapsed >= Duration::from_millis(90), "fired early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(100) + tolerance, "fired late: {elapsed:?}");
    }
    assert_eq!(server.connections_count(), 1);

    // Reserving arms the request timeout from this instant.
    let conn = server.connections().pop().unwrap();
    let reserved_at = Instant::now();
    server.reserve(&conn);
    assert!(wait_for(|| events.lock().len() >= 2, Duration::from_secs(1)).await);
    {
        let events = events.lock();
        let (kind, at) = events[1];
        assert_eq!(kind, "request");
        let elapsed = at - reserved_at;
        assert!(elapsed >= Duration::from_millis(190), "fired early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(200) + tolerance, "fired late: {elapsed:?}");
    }
    assert_eq!(server.connections_count(), 1);

    // Releasing re-arms the idle timeout from the release instant, not from
    // the original accept.
    let released_at = Instant::now();
    server.release(&conn);
    assert!(wait_for(|| events.lock().len() >= 3, Duration::from_secs(1)).await);
    {
        let events = events.lock();
        let (kind, at) = events[2];
        assert_eq!(kind, "idle");
        let elapsed = at - released_at;
        assert!(elapsed >= Duration::from_millis(90), "fired early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(100) + tolerance, "fired late: {elapsed:?}");
    }

    driver.abort();
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_event_over_tcp() {
    let server = SocketServer::new();
    let acceptor = server.listen("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let disconnected = Arc::new(Mutex::new(Vec::new()));
    {
        let disconnected = disconnected.clone();
        server.when_disconnected().subscribe(move |conn: Arc<Connect>| {
            let disconnected = disconnected.clone();
            async move {
                disconnected.lock().push(conn.peer_name().to_string());
                Ok(())
            }
        });
    }

    let client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| server.connections_count() == 1, Duration::from_secs(1)).await);
    let peer = server.connections().pop().unwrap().peer_name().to_string();

    drop(client);
    assert!(wait_for(|| server.connections_count() == 0, Duration::from_secs(1)).await);
    wait_ms(50).await;
    assert_eq!(disconnected.lock().as_slice(), &[peer]);

    server.shutdown().await;
}
