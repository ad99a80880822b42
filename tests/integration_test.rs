//! Integration tests for the capstan root package re-exports.

use capstan::{Connect, InspectStats, Listener, ServerConfig, SocketServer};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn test_config_reexport() {
    let config = ServerConfig::new().max_connections(8).idle_timeout(1.5);
    assert_eq!(config.max_connections, 8);
    assert_eq!(config.idle_timeout, 1.5);
}

#[tokio::test]
async fn test_server_over_tcp() {
    let server = SocketServer::with_config(ServerConfig::new().idle_timeout(30.0));
    let acceptor = server.listen("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let accepted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let accepted = accepted.clone();
        server.when_accepted().subscribe(move |conn: Arc<Connect>| {
            let accepted = accepted.clone();
            async move {
                accepted.lock().unwrap().push(conn.peer_name().to_string());
                Ok(())
            }
        });
    }

    let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(1);
    while server.connections_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Let the accepted pipeline finish before checking its effects.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(server.connections_count(), 1);
    assert_eq!(accepted.lock().unwrap().len(), 1);

    let stats = server.inspect().await.unwrap();
    assert_eq!(stats, InspectStats { slots: 1, peers: 1 });

    server.shutdown().await;
}
